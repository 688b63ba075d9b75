//! EnvelopedData ([RFC 5652 § 6]).
//!
//! A fresh content-encryption key is generated for every encode and
//! transported to each recipient in a `KeyTransRecipientInfo`. Other
//! RecipientInfo choices found while decoding are kept as raw DER.
//!
//! [RFC 5652 § 6]: https://datatracker.ietf.org/doc/html/rfc5652#section-6

use alloc::vec::Vec;
use der::asn1::{OctetString, OctetStringRef};
use der::{Decode, Encode, EncodeValue, FixedTag, Length, Reader, Tag, TagNumber, Writer};
use rand_core::CryptoRngCore;
use spki::AlgorithmIdentifierOwned;
use zeroize::Zeroizing;

use crate::asn1::{self, Tlv, CONTEXT_0_CONSTRUCTED, CONTEXT_1_CONSTRUCTED, SET};
use crate::attr::AttributeCollection;
use crate::content_info::ContentInfo;
use crate::errors::{Error, Result};
use crate::keys::{KeyCallbacks, KeyIdentifier};
use crate::registry::ContentEncryptionAlgorithm;
use crate::sort;

/// Per-recipient information.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecipientInfo {
    /// `KeyTransRecipientInfo`
    KeyTransport {
        /// Recipient identifier.
        rid: KeyIdentifier,
        /// Key-encryption algorithm.
        key_encryption_algorithm: AlgorithmIdentifierOwned,
        /// Encrypted content-encryption key.
        encrypted_key: Vec<u8>,
    },
    /// Any other choice, as its complete DER encoding.
    Other(Vec<u8>),
}

impl RecipientInfo {
    /// Structure version of the RecipientInfo, where known.
    pub fn version(&self) -> Option<u8> {
        match self {
            Self::KeyTransport { rid, .. } if rid.is_subject_key_identifier() => Some(2),
            Self::KeyTransport { .. } => Some(0),
            Self::Other(_) => None,
        }
    }

}

/// Borrowed `KeyTransRecipientInfo` fields, for encoding.
struct KeyTrans<'a> {
    version: u8,
    rid: &'a KeyIdentifier,
    key_encryption_algorithm: &'a AlgorithmIdentifierOwned,
    encrypted_key: OctetStringRef<'a>,
}

impl EncodeValue for KeyTrans<'_> {
    fn value_len(&self) -> der::Result<Length> {
        self.version.encoded_len()?
            + self.rid.encoded_len()?
            + self.key_encryption_algorithm.encoded_len()?
            + self.encrypted_key.encoded_len()?
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.version.encode(writer)?;
        self.rid.encode(writer)?;
        self.key_encryption_algorithm.encode(writer)?;
        self.encrypted_key.encode(writer)
    }
}

impl FixedTag for KeyTrans<'_> {
    const TAG: Tag = Tag::Sequence;
}

impl RecipientInfo {
    fn key_trans(&self) -> der::Result<KeyTrans<'_>> {
        match self {
            Self::KeyTransport {
                rid,
                key_encryption_algorithm,
                encrypted_key,
            } => Ok(KeyTrans {
                version: self.version().unwrap_or(0),
                rid,
                key_encryption_algorithm,
                encrypted_key: OctetStringRef::new(encrypted_key)?,
            }),
            Self::Other(_) => Err(Tag::Sequence.value_error()),
        }
    }
}

impl Encode for RecipientInfo {
    fn encoded_len(&self) -> der::Result<Length> {
        match self {
            Self::Other(raw) => Length::try_from(raw.len()),
            _ => self.key_trans()?.encoded_len(),
        }
    }

    fn encode(&self, writer: &mut impl Writer) -> der::Result<()> {
        match self {
            Self::Other(raw) => writer.write(raw),
            _ => self.key_trans()?.encode(writer),
        }
    }
}

impl<'a> Decode<'a> for RecipientInfo {
    fn decode<R: Reader<'a>>(reader: &mut R) -> der::Result<Self> {
        if reader.peek_tag()? != Tag::Sequence {
            return Ok(Self::Other(reader.tlv_bytes()?.to_vec()));
        }
        reader.sequence(|reader| {
            let _version: u8 = reader.decode()?;
            Ok(Self::KeyTransport {
                rid: reader.decode()?,
                key_encryption_algorithm: reader.decode()?,
                encrypted_key: OctetString::decode(reader)?.into_bytes(),
            })
        })
    }
}

/// Content encrypted for a set of recipients.
#[derive(Debug)]
pub struct EnvelopedData {
    recipients: Vec<KeyIdentifier>,
    recipient_infos: Vec<RecipientInfo>,
    content_encryption: ContentEncryptionAlgorithm,
    content_info: ContentInfo,
    originator_info: Option<Vec<u8>>,
    unprotected_attrs: AttributeCollection,
    bulk_key: Option<Zeroizing<Vec<u8>>>,
}

impl EnvelopedData {
    /// EnvelopedData encrypting `content_info` with `content_encryption`.
    pub fn new(content_info: ContentInfo, content_encryption: ContentEncryptionAlgorithm) -> Self {
        Self {
            recipients: Vec::new(),
            recipient_infos: Vec::new(),
            content_encryption,
            content_info,
            originator_info: None,
            unprotected_attrs: AttributeCollection::new(),
            bulk_key: None,
        }
    }

    /// Encrypt for the recipient `id`. Its key-wrapping key is requested
    /// from the key callbacks when encoding starts.
    pub fn add_recipient(&mut self, id: KeyIdentifier) {
        self.recipients.push(id);
    }

    /// Recipients added for encoding.
    pub fn recipients(&self) -> &[KeyIdentifier] {
        &self.recipients
    }

    /// RecipientInfos, once encoded or decoded.
    pub fn recipient_infos(&self) -> &[RecipientInfo] {
        &self.recipient_infos
    }

    /// Content-encryption algorithm used when encoding.
    pub fn content_encryption(&self) -> ContentEncryptionAlgorithm {
        self.content_encryption
    }

    /// Set the `originatorInfo` field, as the complete DER encoding of the
    /// `[0] IMPLICIT OriginatorInfo`.
    pub fn set_originator_info(&mut self, der: Vec<u8>) {
        self.originator_info = Some(der);
    }

    /// `originatorInfo`, as DER.
    pub fn originator_info(&self) -> Option<&[u8]> {
        self.originator_info.as_deref()
    }

    /// Unprotected attributes.
    pub fn unprotected_attributes(&self) -> &AttributeCollection {
        &self.unprotected_attrs
    }

    /// Mutable unprotected attributes.
    pub fn unprotected_attributes_mut(&mut self) -> &mut AttributeCollection {
        &mut self.unprotected_attrs
    }

    /// Encrypted content.
    pub fn content_info(&self) -> &ContentInfo {
        &self.content_info
    }

    /// Mutable encrypted content.
    pub fn content_info_mut(&mut self) -> &mut ContentInfo {
        &mut self.content_info
    }

    /// Structure version ([RFC 5652 § 6.1]).
    ///
    /// [RFC 5652 § 6.1]: https://datatracker.ietf.org/doc/html/rfc5652#section-6.1
    pub fn version(&self) -> u8 {
        let other_tag = |ri: &RecipientInfo| match ri {
            RecipientInfo::Other(raw) => raw.first().copied(),
            RecipientInfo::KeyTransport { .. } => None,
        };
        if self
            .recipient_infos
            .iter()
            .any(|ri| matches!(other_tag(ri), Some(0xa3) | Some(0xa4)))
        {
            3
        } else if self.originator_info.is_some()
            || !self.unprotected_attrs.is_empty()
            || self.recipient_infos.iter().any(|ri| ri.version() != Some(0))
        {
            2
        } else {
            0
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(ContentInfo::data(Vec::new()), ContentEncryptionAlgorithm::Aes256Cbc)
    }

    pub(crate) fn set_content_encryption(&mut self, alg: ContentEncryptionAlgorithm) {
        self.content_encryption = alg;
    }

    /// Generate the content-encryption key and wrap it for every recipient.
    pub(crate) fn prepare_encode(
        &mut self,
        keys: &dyn KeyCallbacks,
        rng: &mut dyn CryptoRngCore,
    ) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(Error::InvalidState("EnvelopedData has no recipients"));
        }

        let mut key = Zeroizing::new(vec![0u8; self.content_encryption.key_size()]);
        rng.fill_bytes(&mut key);

        let mut infos = Vec::with_capacity(self.recipients.len());
        for rid in &self.recipients {
            let wrapper = keys.recipient(rid).ok_or(Error::MissingRecipientKey)?;
            infos.push(RecipientInfo::KeyTransport {
                rid: rid.clone(),
                key_encryption_algorithm: wrapper.key_encryption_algorithm(),
                encrypted_key: wrapper.wrap_key(rng, &key)?,
            });
        }
        sort::sort_by_encoding(&mut infos, |info| Ok(info.to_der()?))?;
        self.unprotected_attrs.reorder()?;

        self.recipient_infos = infos;
        self.bulk_key = Some(key);
        Ok(())
    }

    /// Hand over the generated key, leaving none behind.
    pub(crate) fn take_bulk_key(&mut self) -> Option<Zeroizing<Vec<u8>>> {
        self.bulk_key.take()
    }

    /// Recover the content-encryption key through the first recipient the
    /// key callbacks hold a key for.
    pub(crate) fn unwrap_bulk_key(
        &self,
        keys: &dyn KeyCallbacks,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        for info in &self.recipient_infos {
            if let RecipientInfo::KeyTransport {
                rid,
                key_encryption_algorithm,
                encrypted_key,
            } = info
            {
                if let Some(unwrapper) = keys.unwrapper(rid) {
                    return unwrapper
                        .unwrap_key(key_encryption_algorithm, encrypted_key)
                        .map(Some);
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn encode_prefix(&self) -> Result<Vec<u8>> {
        let mut out = asn1::encode_version(self.version())?;
        if let Some(originator) = &self.originator_info {
            out.extend_from_slice(originator);
        }
        out.extend(asn1::encode_set_of(&self.recipient_infos)?);
        Ok(out)
    }

    pub(crate) fn encode_suffix(&self) -> Result<Vec<u8>> {
        if self.unprotected_attrs.is_empty() {
            return Ok(Vec::new());
        }
        self.unprotected_attrs.encode_implicit(TagNumber::N1)
    }

    pub(crate) fn decode_prefix_field(&mut self, index: usize, tlv: &Tlv<'_>) -> Result<()> {
        match (index, tlv.tag) {
            (0, asn1::INTEGER) => asn1::decode_version(tlv).map(drop),
            (1, CONTEXT_0_CONSTRUCTED) => {
                self.originator_info = Some(tlv.raw.to_vec());
                Ok(())
            }
            (1, SET) | (2, SET) => {
                self.recipient_infos = asn1::decode_set_of(tlv.raw)?;
                Ok(())
            }
            _ => Err(Error::MalformedEncoding("unexpected EnvelopedData field")),
        }
    }

    pub(crate) fn decode_suffix_field(&mut self, tlv: &Tlv<'_>) -> Result<()> {
        if tlv.tag != CONTEXT_1_CONSTRUCTED {
            return Err(Error::MalformedEncoding("unexpected EnvelopedData field"));
        }
        self.unprotected_attrs = AttributeCollection::decode_all(tlv.value)?;
        Ok(())
    }
}
