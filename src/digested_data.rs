//! DigestedData ([RFC 5652 § 7]).
//!
//! [RFC 5652 § 7]: https://datatracker.ietf.org/doc/html/rfc5652#section-7

use alloc::vec::Vec;
use der::asn1::OctetStringRef;
use der::Encode;
use spki::AlgorithmIdentifierOwned;
use subtle::ConstantTimeEq;

use crate::asn1::{self, Tlv, OCTET_STRING, SEQUENCE};
use crate::content_info::ContentInfo;
use crate::digest_context::DigestAccumulator;
use crate::errors::{Error, Result};
use crate::oid;
use crate::registry::{AlgorithmRegistry, DigestAlgorithm};

/// Content plus a digest of it.
#[derive(Debug)]
pub struct DigestedData {
    digest_algorithm: AlgorithmIdentifierOwned,
    content_info: ContentInfo,
    digest: Vec<u8>,
    computed_digest: Option<Vec<u8>>,
}

impl DigestedData {
    /// DigestedData over `content_info`.
    pub fn new(content_info: ContentInfo, digest: DigestAlgorithm) -> Self {
        Self {
            digest_algorithm: digest.algorithm_identifier(),
            content_info,
            digest: Vec::new(),
            computed_digest: None,
        }
    }

    /// Digest algorithm.
    pub fn digest_algorithm(&self) -> &AlgorithmIdentifierOwned {
        &self.digest_algorithm
    }

    /// The digest carried in the message.
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// The digest computed over the decoded content, if the algorithm is
    /// supported.
    pub fn computed_digest(&self) -> Option<&[u8]> {
        self.computed_digest.as_deref()
    }

    /// Whether the carried digest matches the computed one.
    ///
    /// `None` when no digest could be computed. The decoder never fails a
    /// message over a mismatch; acting on it is up to the caller.
    pub fn digest_matches(&self) -> Option<bool> {
        self.computed_digest
            .as_ref()
            .map(|computed| bool::from(computed.ct_eq(&self.digest)))
    }

    /// Digested content.
    pub fn content_info(&self) -> &ContentInfo {
        &self.content_info
    }

    /// Mutable digested content.
    pub fn content_info_mut(&mut self) -> &mut ContentInfo {
        &mut self.content_info
    }

    /// Structure version: 0 for Data content, else 2.
    pub fn version(&self) -> u8 {
        if self.content_info.content_type() == oid::ID_DATA {
            0
        } else {
            2
        }
    }

    pub(crate) fn empty() -> Self {
        Self::new(ContentInfo::data(Vec::new()), DigestAlgorithm::Sha256)
    }

    pub(crate) fn start_digest(&self, registry: &AlgorithmRegistry) -> DigestAccumulator {
        DigestAccumulator::start(core::slice::from_ref(&self.digest_algorithm), registry)
    }

    /// Store the digest produced while encoding.
    pub(crate) fn finish_encode(&mut self, digests: DigestAccumulator) -> Result<()> {
        if digests.is_empty() {
            return Err(Error::UnsupportedAlgorithm(self.digest_algorithm.oid));
        }
        self.digest = digests.finish_single()?;
        Ok(())
    }

    /// Store the digest computed while decoding.
    pub(crate) fn finish_decode(&mut self, digests: DigestAccumulator) {
        self.computed_digest = digests.finish_single().ok();
    }

    pub(crate) fn encode_prefix(&self) -> Result<Vec<u8>> {
        let mut out = asn1::encode_version(self.version())?;
        out.extend(asn1::encode_algorithm(&self.digest_algorithm)?);
        Ok(out)
    }

    pub(crate) fn encode_suffix(&self) -> Result<Vec<u8>> {
        Ok(OctetStringRef::new(&self.digest)?.to_der()?)
    }

    pub(crate) fn decode_prefix_field(&mut self, index: usize, tlv: &Tlv<'_>) -> Result<()> {
        match (index, tlv.tag) {
            (0, asn1::INTEGER) => asn1::decode_version(tlv).map(drop),
            (1, SEQUENCE) => {
                self.digest_algorithm = asn1::decode_algorithm(tlv.raw)?;
                Ok(())
            }
            _ => Err(Error::MalformedEncoding("unexpected DigestedData field")),
        }
    }

    pub(crate) fn decode_suffix_field(&mut self, tlv: &Tlv<'_>) -> Result<()> {
        if tlv.tag != OCTET_STRING {
            return Err(Error::MalformedEncoding("unexpected DigestedData field"));
        }
        self.digest = tlv.value.to_vec();
        Ok(())
    }
}
