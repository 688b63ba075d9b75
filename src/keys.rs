//! Key capability interfaces.
//!
//! The engines never hold key material themselves. Whenever a signature,
//! key wrap or bulk key is needed they ask the caller's [`KeyCallbacks`],
//! use what comes back for that one operation and drop the reference.

#[cfg(feature = "rsa")]
mod pkcs1v15;

use alloc::boxed::Box;
use alloc::vec::Vec;
use const_oid::ObjectIdentifier;
use der::asn1::{Any, ContextSpecific, Int, OctetString, OctetStringRef};
use der::{
    Decode, DecodeValue, Encode, EncodeValue, Header, Length, Reader, Sequence, Tag, TagMode,
    TagNumber, Tagged, Writer,
};
use rand_core::CryptoRngCore;
use spki::AlgorithmIdentifierOwned;
use zeroize::Zeroizing;

use crate::errors::{Error, Result};

/// Certificate issuer name and serial number ([RFC 5652 § 10.2.4]).
///
/// The issuer `Name` is kept as an opaque `SEQUENCE`.
///
/// [RFC 5652 § 10.2.4]: https://datatracker.ietf.org/doc/html/rfc5652#section-10.2.4
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IssuerAndSerialNumber {
    /// Issuer distinguished name.
    pub issuer: Any,
    /// Certificate serial number.
    pub serial_number: Int,
}

impl IssuerAndSerialNumber {
    /// Build from the DER encoding of the issuer name and the big-endian
    /// serial number.
    pub fn new(issuer_der: &[u8], serial_number: &[u8]) -> Result<Self> {
        let issuer = Any::from_der(issuer_der)?;
        if issuer.tag() != Tag::Sequence {
            return Err(Error::InvalidArgument("issuer name must be a SEQUENCE"));
        }
        Ok(Self {
            issuer,
            serial_number: Int::new(serial_number)?,
        })
    }
}

impl EncodeValue for IssuerAndSerialNumber {
    fn value_len(&self) -> der::Result<Length> {
        self.issuer.encoded_len()? + self.serial_number.encoded_len()?
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.issuer.encode(writer)?;
        self.serial_number.encode(writer)
    }
}

impl<'a> DecodeValue<'a> for IssuerAndSerialNumber {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        reader.read_nested(header.length, |reader| {
            let issuer = Any::decode(reader)?;
            issuer.tag().assert_eq(Tag::Sequence)?;
            Ok(Self {
                issuer,
                serial_number: reader.decode()?,
            })
        })
    }
}

impl<'a> Sequence<'a> for IssuerAndSerialNumber {}

/// Identifies the certificate of a signer or recipient.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyIdentifier {
    /// Issuer name and serial number.
    IssuerAndSerialNumber(IssuerAndSerialNumber),
    /// Subject key identifier octets, carried as `[0] IMPLICIT`.
    SubjectKeyIdentifier(Vec<u8>),
}

impl KeyIdentifier {
    /// Whether this is the subject-key-identifier choice, which raises the
    /// structure version to 3 (SignerInfo) or 2 (KeyTransRecipientInfo).
    pub fn is_subject_key_identifier(&self) -> bool {
        matches!(self, Self::SubjectKeyIdentifier(_))
    }
}

impl<'a> Decode<'a> for KeyIdentifier {
    fn decode<R: Reader<'a>>(reader: &mut R) -> der::Result<Self> {
        if reader.peek_tag()? == Tag::Sequence {
            return Ok(Self::IssuerAndSerialNumber(reader.decode()?));
        }
        match ContextSpecific::<OctetString>::decode_implicit(reader, TagNumber::N0)? {
            Some(field) => Ok(Self::SubjectKeyIdentifier(field.value.into_bytes())),
            None => Err(reader.peek_tag()?.unexpected_error(Some(Tag::Sequence))),
        }
    }
}

impl Encode for KeyIdentifier {
    fn encoded_len(&self) -> der::Result<Length> {
        match self {
            Self::IssuerAndSerialNumber(ias) => ias.encoded_len(),
            Self::SubjectKeyIdentifier(ski) => subject_key_identifier(ski)?.encoded_len(),
        }
    }

    fn encode(&self, writer: &mut impl Writer) -> der::Result<()> {
        match self {
            Self::IssuerAndSerialNumber(ias) => ias.encode(writer),
            Self::SubjectKeyIdentifier(ski) => subject_key_identifier(ski)?.encode(writer),
        }
    }
}

fn subject_key_identifier(ski: &[u8]) -> der::Result<ContextSpecific<OctetStringRef<'_>>> {
    Ok(ContextSpecific {
        tag_number: TagNumber::N0,
        tag_mode: TagMode::Implicit,
        value: OctetStringRef::new(ski)?,
    })
}

/// Produces signatures over digests.
pub trait ContentSigner {
    /// Signature algorithm written into the SignerInfo.
    fn signature_algorithm(&self) -> AlgorithmIdentifierOwned;

    /// Sign `digest`, computed with `digest_algorithm`.
    fn sign_digest(&self, digest_algorithm: &ObjectIdentifier, digest: &[u8]) -> Result<Vec<u8>>;
}

/// Checks signatures over digests.
pub trait SignatureVerifier {
    /// Verify `signature` over `digest`, computed with `digest_algorithm`.
    fn verify_digest(
        &self,
        digest_algorithm: &ObjectIdentifier,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()>;
}

/// Encrypts a content-encryption key for one recipient.
pub trait KeyWrapper {
    /// Key-encryption algorithm written into the RecipientInfo.
    fn key_encryption_algorithm(&self) -> AlgorithmIdentifierOwned;

    /// Wrap `key`.
    fn wrap_key(&self, rng: &mut dyn CryptoRngCore, key: &[u8]) -> Result<Vec<u8>>;
}

/// Recovers a content-encryption key from a RecipientInfo.
pub trait KeyUnwrapper {
    /// Unwrap `wrapped`, which was encrypted with `algorithm`.
    fn unwrap_key(
        &self,
        algorithm: &AlgorithmIdentifierOwned,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>>;
}

/// Source of key material for the encoder and decoder.
///
/// Every method defaults to "no key", so implementors only provide what
/// their messages need.
pub trait KeyCallbacks {
    /// Symmetric key for EncryptedData content encrypted with `algorithm`.
    fn bulk_key(&self, algorithm: &ObjectIdentifier) -> Option<Zeroizing<Vec<u8>>> {
        let _ = algorithm;
        None
    }

    /// Signing key for the signer `id`.
    fn signer(&self, id: &KeyIdentifier) -> Option<&dyn ContentSigner> {
        let _ = id;
        None
    }

    /// Key-wrapping key for the recipient `id`.
    fn recipient(&self, id: &KeyIdentifier) -> Option<&dyn KeyWrapper> {
        let _ = id;
        None
    }

    /// Key-unwrapping key for the recipient `id`.
    fn unwrapper(&self, id: &KeyIdentifier) -> Option<&dyn KeyUnwrapper> {
        let _ = id;
        None
    }
}

/// Key callbacks that never supply a key.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoKeys;

impl KeyCallbacks for NoKeys {}

/// Key callbacks backed by keys registered up front.
#[derive(Default)]
pub struct KeyRing {
    bulk_key: Option<Zeroizing<Vec<u8>>>,
    signers: Vec<(KeyIdentifier, Box<dyn ContentSigner>)>,
    recipients: Vec<(KeyIdentifier, Box<dyn KeyWrapper>)>,
    unwrappers: Vec<(KeyIdentifier, Box<dyn KeyUnwrapper>)>,
}

impl KeyRing {
    /// Empty key ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `key` as the EncryptedData bulk key.
    pub fn with_bulk_key(mut self, key: &[u8]) -> Self {
        self.bulk_key = Some(Zeroizing::new(key.to_vec()));
        self
    }

    /// Register a signing key.
    pub fn with_signer(mut self, id: KeyIdentifier, signer: impl ContentSigner + 'static) -> Self {
        self.signers.push((id, Box::new(signer)));
        self
    }

    /// Register a recipient's key-wrapping key.
    pub fn with_recipient(mut self, id: KeyIdentifier, wrapper: impl KeyWrapper + 'static) -> Self {
        self.recipients.push((id, Box::new(wrapper)));
        self
    }

    /// Register a key-unwrapping key.
    pub fn with_unwrapper(
        mut self,
        id: KeyIdentifier,
        unwrapper: impl KeyUnwrapper + 'static,
    ) -> Self {
        self.unwrappers.push((id, Box::new(unwrapper)));
        self
    }
}

impl KeyCallbacks for KeyRing {
    fn bulk_key(&self, _algorithm: &ObjectIdentifier) -> Option<Zeroizing<Vec<u8>>> {
        self.bulk_key.clone()
    }

    fn signer(&self, id: &KeyIdentifier) -> Option<&dyn ContentSigner> {
        self.signers
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, signer)| signer.as_ref())
    }

    fn recipient(&self, id: &KeyIdentifier) -> Option<&dyn KeyWrapper> {
        self.recipients
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, wrapper)| wrapper.as_ref())
    }

    fn unwrapper(&self, id: &KeyIdentifier) -> Option<&dyn KeyUnwrapper> {
        self.unwrappers
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, unwrapper)| unwrapper.as_ref())
    }
}

impl core::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyRing")
            .field("bulk_key", &self.bulk_key.as_ref().map(|_| "<redacted>"))
            .field("signers", &self.signers.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .field("recipients", &self.recipients.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .field("unwrappers", &self.unwrappers.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    struct FixedSigner(u8);

    impl ContentSigner for FixedSigner {
        fn signature_algorithm(&self) -> AlgorithmIdentifierOwned {
            AlgorithmIdentifierOwned {
                oid: crate::oid::RSA_ENCRYPTION,
                parameters: None,
            }
        }

        fn sign_digest(&self, _: &ObjectIdentifier, digest: &[u8]) -> Result<Vec<u8>> {
            Ok(digest.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[test]
    fn key_identifier_choices() {
        let ski = KeyIdentifier::SubjectKeyIdentifier(vec![1, 2, 3]);
        let der = ski.to_der().unwrap();
        assert_eq!(der, [0x80, 3, 1, 2, 3]);
        assert_eq!(KeyIdentifier::from_der(&der).unwrap(), ski);
        assert!(ski.is_subject_key_identifier());

        let ias = IssuerAndSerialNumber::new(&[0x30, 0x00], &[7]).unwrap();
        let ias = KeyIdentifier::IssuerAndSerialNumber(ias);
        let der = ias.to_der().unwrap();
        assert_eq!(der, hex!("3005 3000 020107"));
        assert_eq!(KeyIdentifier::from_der(&der).unwrap(), ias);
        assert!(!ias.is_subject_key_identifier());
    }

    #[test]
    fn malformed_key_identifiers_are_rejected() {
        // constructed [0], wrong CHOICE tag, issuer not a SEQUENCE
        assert!(KeyIdentifier::from_der(&hex!("a003 040101")).is_err());
        assert!(KeyIdentifier::from_der(&hex!("0401 01")).is_err());
        assert!(KeyIdentifier::from_der(&hex!("3005 0500 020107")).is_err());
        assert!(IssuerAndSerialNumber::new(&[0x05, 0x00], &[7]).is_err());
    }

    #[test]
    fn key_ring_lookup() {
        let id = KeyIdentifier::SubjectKeyIdentifier(vec![7]);
        let other = KeyIdentifier::SubjectKeyIdentifier(vec![8]);
        let ring = KeyRing::new()
            .with_bulk_key(&[1; 16])
            .with_signer(id.clone(), FixedSigner(0xff));

        let signer = ring.signer(&id).unwrap();
        assert_eq!(
            signer.sign_digest(&crate::oid::ID_SHA_256, &[0x0f]).unwrap(),
            [0xf0]
        );
        assert!(ring.signer(&other).is_none());
        assert!(ring.recipient(&id).is_none());
        assert_eq!(
            ring.bulk_key(&crate::oid::ID_AES_128_CBC).as_deref().map(Vec::as_slice),
            Some(&[1u8; 16][..])
        );
        assert!(NoKeys.bulk_key(&crate::oid::ID_AES_128_CBC).is_none());
    }
}
