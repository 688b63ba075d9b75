//! EncryptedData ([RFC 5652 § 8]): content encrypted under a key the
//! caller manages, supplied through [`KeyCallbacks::bulk_key`].
//!
//! [RFC 5652 § 8]: https://datatracker.ietf.org/doc/html/rfc5652#section-8
//! [`KeyCallbacks::bulk_key`]: crate::KeyCallbacks::bulk_key

use alloc::vec::Vec;
use der::TagNumber;

use crate::asn1::{self, Tlv, CONTEXT_1_CONSTRUCTED};
use crate::attr::AttributeCollection;
use crate::content_info::ContentInfo;
use crate::errors::{Error, Result};
use crate::registry::ContentEncryptionAlgorithm;

/// Content encrypted under a caller-managed key.
#[derive(Debug)]
pub struct EncryptedData {
    content_encryption: ContentEncryptionAlgorithm,
    content_info: ContentInfo,
    unprotected_attrs: AttributeCollection,
}

impl EncryptedData {
    /// EncryptedData encrypting `content_info` with `content_encryption`.
    pub fn new(content_info: ContentInfo, content_encryption: ContentEncryptionAlgorithm) -> Self {
        Self {
            content_encryption,
            content_info,
            unprotected_attrs: AttributeCollection::new(),
        }
    }

    /// Content-encryption algorithm used when encoding.
    pub fn content_encryption(&self) -> ContentEncryptionAlgorithm {
        self.content_encryption
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

    /// Structure version: 2 with unprotected attributes, else 0.
    pub fn version(&self) -> u8 {
        if self.unprotected_attrs.is_empty() {
            0
        } else {
            2
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(ContentInfo::data(Vec::new()), ContentEncryptionAlgorithm::Aes256Cbc)
    }

    pub(crate) fn set_content_encryption(&mut self, alg: ContentEncryptionAlgorithm) {
        self.content_encryption = alg;
    }

    pub(crate) fn encode_prefix(&mut self) -> Result<Vec<u8>> {
        self.unprotected_attrs.reorder()?;
        asn1::encode_version(self.version())
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
            _ => Err(Error::MalformedEncoding("unexpected EncryptedData field")),
        }
    }

    pub(crate) fn decode_suffix_field(&mut self, tlv: &Tlv<'_>) -> Result<()> {
        if tlv.tag != CONTEXT_1_CONSTRUCTED {
            return Err(Error::MalformedEncoding("unexpected EncryptedData field"));
        }
        self.unprotected_attrs = AttributeCollection::decode_all(tlv.value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::Parser;
    use crate::attr::Attribute;
    use hex_literal::hex;

    #[test]
    fn unprotected_attributes_raise_version() {
        let mut encrypted = EncryptedData::empty();
        assert_eq!(encrypted.encode_prefix().unwrap(), hex!("020100"));
        assert!(encrypted.encode_suffix().unwrap().is_empty());

        encrypted
            .unprotected_attributes_mut()
            .add(Attribute::message_digest(&[0xab]));
        assert_eq!(encrypted.encode_prefix().unwrap(), hex!("020102"));
        let suffix = encrypted.encode_suffix().unwrap();
        assert_eq!(suffix, hex!("a112 3010 06092a864886f70d010904 3103 0401ab"));

        let mut decoded = EncryptedData::empty();
        decoded
            .decode_suffix_field(&Parser::new(&suffix).next_tlv().unwrap().unwrap())
            .unwrap();
        assert_eq!(decoded.version(), 2);
        assert_eq!(decoded.unprotected_attributes(), encrypted.unprotected_attributes());
    }
}
