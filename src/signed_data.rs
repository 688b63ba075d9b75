//! SignedData ([RFC 5652 § 5]).
//!
//! [RFC 5652 § 5]: https://datatracker.ietf.org/doc/html/rfc5652#section-5

use alloc::vec::Vec;
use const_oid::ObjectIdentifier;
use der::asn1::{Any, ContextSpecific, OctetString, OctetStringRef};
use der::{
    DateTime, Decode, DecodeValue, Encode, EncodeValue, Header, Length, Reader, Sequence, Tag,
    TagMode, TagNumber, Writer,
};
use spki::AlgorithmIdentifierOwned;
use subtle::ConstantTimeEq;

use crate::asn1::{self, Tlv, CONTEXT_0_CONSTRUCTED, CONTEXT_1_CONSTRUCTED, SET};
use crate::attr::{Attribute, AttributeCollection};
use crate::content_info::ContentInfo;
use crate::digest_context::DigestAccumulator;
use crate::errors::{Error, Result};
use crate::keys::{ContentSigner, KeyCallbacks, KeyIdentifier, SignatureVerifier};
use crate::oid;
use crate::registry::{AlgorithmRegistry, DigestAlgorithm};
use crate::sort;

/// Per-signer information.
#[derive(Clone, Debug)]
pub struct SignerInfo {
    sid: KeyIdentifier,
    digest_algorithm: AlgorithmIdentifierOwned,
    signed_attrs: AttributeCollection,
    signed_attrs_der: Option<Vec<u8>>,
    signature_algorithm: Option<AlgorithmIdentifierOwned>,
    signature: Vec<u8>,
    unsigned_attrs: AttributeCollection,
    content_digest: Option<Vec<u8>>,
}

impl SignerInfo {
    /// Signer identified by `sid`, digesting with `digest`.
    pub fn new(sid: KeyIdentifier, digest: DigestAlgorithm) -> Self {
        Self {
            sid,
            digest_algorithm: digest.algorithm_identifier(),
            signed_attrs: AttributeCollection::new(),
            signed_attrs_der: None,
            signature_algorithm: None,
            signature: Vec::new(),
            unsigned_attrs: AttributeCollection::new(),
            content_digest: None,
        }
    }

    /// Add a `signing-time` signed attribute.
    pub fn add_signing_time(&mut self, time: DateTime) -> Result<()> {
        let attr = Attribute::signing_time(time)?;
        if let Some(value) = attr.value() {
            self.signed_attrs.set_value(oid::ID_SIGNING_TIME, value.to_vec());
        }
        Ok(())
    }

    /// Signer identifier.
    pub fn sid(&self) -> &KeyIdentifier {
        &self.sid
    }

    /// Digest algorithm.
    pub fn digest_algorithm(&self) -> &AlgorithmIdentifierOwned {
        &self.digest_algorithm
    }

    /// Signed attributes.
    pub fn signed_attributes(&self) -> &AttributeCollection {
        &self.signed_attrs
    }

    /// Mutable signed attributes. `content-type` and `message-digest` are
    /// (re)set when the signer signs.
    pub fn signed_attributes_mut(&mut self) -> &mut AttributeCollection {
        self.signed_attrs_der = None;
        &mut self.signed_attrs
    }

    /// Unsigned attributes.
    pub fn unsigned_attributes(&self) -> &AttributeCollection {
        &self.unsigned_attrs
    }

    /// Mutable unsigned attributes.
    pub fn unsigned_attributes_mut(&mut self) -> &mut AttributeCollection {
        &mut self.unsigned_attrs
    }

    /// Signature algorithm, once signed or decoded.
    pub fn signature_algorithm(&self) -> Option<&AlgorithmIdentifierOwned> {
        self.signature_algorithm.as_ref()
    }

    /// Signature octets.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Digest of the content under this signer's digest algorithm, once the
    /// content has been encoded or decoded.
    pub fn content_digest(&self) -> Option<&[u8]> {
        self.content_digest.as_deref()
    }

    /// Structure version: 3 with a subject key identifier, else 1.
    pub fn version(&self) -> u8 {
        if self.sid.is_subject_key_identifier() {
            3
        } else {
            1
        }
    }

    fn sign(
        &mut self,
        content_type: &ObjectIdentifier,
        digest: &[u8],
        signer: &dyn ContentSigner,
        registry: &AlgorithmRegistry,
    ) -> Result<()> {
        let alg = registry
            .digest(&self.digest_algorithm.oid)
            .ok_or(Error::UnsupportedAlgorithm(self.digest_algorithm.oid))?;

        self.signed_attrs
            .set_value(oid::ID_CONTENT_TYPE, content_type.as_bytes().to_vec());
        self.signed_attrs
            .set_value(oid::ID_MESSAGE_DIGEST, digest.to_vec());
        self.signed_attrs.reorder()?;
        self.unsigned_attrs.reorder()?;

        let encoded = self.signed_attrs.encode_all()?;
        self.signature = signer.sign_digest(&self.digest_algorithm.oid, &alg.digest(&encoded))?;
        self.signature_algorithm = Some(signer.signature_algorithm());
        self.signed_attrs_der = Some(encoded);
        self.content_digest = Some(digest.to_vec());

        tracing::debug!(digest = %self.digest_algorithm.oid, "signed");
        Ok(())
    }

    /// Check the attributes and signature against `content_digest`.
    fn verify(
        &self,
        content_type: &ObjectIdentifier,
        content_digest: &[u8],
        verifier: &dyn SignatureVerifier,
        registry: &AlgorithmRegistry,
    ) -> Result<()> {
        let digest_oid = self.digest_algorithm.oid;
        if self.signed_attrs.is_empty() {
            return verifier.verify_digest(&digest_oid, content_digest, &self.signature);
        }

        let claimed = self
            .signed_attrs
            .message_digest()
            .ok_or_else(|| Error::CryptoFailure("missing message-digest attribute".into()))?;
        if !bool::from(claimed.ct_eq(content_digest)) {
            return Err(Error::CryptoFailure("message digest mismatch".into()));
        }
        if self.signed_attrs.content_type()? != Some(*content_type) {
            return Err(Error::CryptoFailure("content-type attribute mismatch".into()));
        }

        let alg = registry
            .digest(&digest_oid)
            .ok_or(Error::UnsupportedAlgorithm(digest_oid))?;
        let encoded = match &self.signed_attrs_der {
            Some(der) => der.clone(),
            None => self.signed_attrs.encode_all()?,
        };
        verifier.verify_digest(&digest_oid, &alg.digest(&encoded), &self.signature)
    }

    /// `[0] IMPLICIT` signed attributes, verbatim when they were signed or
    /// decoded.
    fn signed_attrs_field(&self) -> der::Result<Option<ContextSpecific<Any>>> {
        if self.signed_attrs.is_empty() {
            return Ok(None);
        }
        let set = match &self.signed_attrs_der {
            Some(der) => Any::from_der(der)?,
            None => Any::encode_from(&self.signed_attrs)?,
        };
        Ok(Some(ContextSpecific {
            tag_number: TagNumber::N0,
            tag_mode: TagMode::Implicit,
            value: set,
        }))
    }

    fn signature_algorithm_field(&self) -> der::Result<&AlgorithmIdentifierOwned> {
        self.signature_algorithm
            .as_ref()
            .ok_or_else(|| Tag::Sequence.value_error())
    }

    fn unsigned_attrs_field(
        &self,
    ) -> Option<der::asn1::ContextSpecificRef<'_, AttributeCollection>> {
        (!self.unsigned_attrs.is_empty()).then(|| self.unsigned_attrs.implicit(TagNumber::N1))
    }
}

// SignerInfo ::= SEQUENCE {
//   version, sid, digestAlgorithm, signedAttrs [0] IMPLICIT OPTIONAL,
//   signatureAlgorithm, signature, unsignedAttrs [1] IMPLICIT OPTIONAL }
impl EncodeValue for SignerInfo {
    fn value_len(&self) -> der::Result<Length> {
        [
            self.version().encoded_len()?,
            self.sid.encoded_len()?,
            self.digest_algorithm.encoded_len()?,
            self.signed_attrs_field()?.encoded_len()?,
            self.signature_algorithm_field()?.encoded_len()?,
            OctetStringRef::new(&self.signature)?.encoded_len()?,
            self.unsigned_attrs_field().encoded_len()?,
        ]
        .into_iter()
        .try_fold(Length::ZERO, |acc, len| acc + len)
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.version().encode(writer)?;
        self.sid.encode(writer)?;
        self.digest_algorithm.encode(writer)?;
        self.signed_attrs_field()?.encode(writer)?;
        self.signature_algorithm_field()?.encode(writer)?;
        OctetStringRef::new(&self.signature)?.encode(writer)?;
        self.unsigned_attrs_field().encode(writer)
    }
}

impl<'a> DecodeValue<'a> for SignerInfo {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        reader.read_nested(header.length, |reader| {
            let _version: u8 = reader.decode()?;
            let sid = reader.decode()?;
            let digest_algorithm = reader.decode()?;

            let (signed_attrs, signed_attrs_der) =
                match ContextSpecific::<Any>::decode_implicit(reader, TagNumber::N0)? {
                    Some(field) => {
                        // signatures cover the attributes as received, re-tagged as a SET
                        let der = Any::new(Tag::Set, field.value.value())?.to_der()?;
                        (AttributeCollection::from_der(&der)?, Some(der))
                    }
                    None => (AttributeCollection::new(), None),
                };

            let signature_algorithm = reader.decode()?;
            let signature = OctetString::decode(reader)?.into_bytes();
            let unsigned_attrs =
                AttributeCollection::decode_implicit(reader, TagNumber::N1)?.unwrap_or_default();

            Ok(Self {
                sid,
                digest_algorithm,
                signed_attrs,
                signed_attrs_der,
                signature_algorithm: Some(signature_algorithm),
                signature,
                unsigned_attrs,
                content_digest: None,
            })
        })
    }
}

impl<'a> Sequence<'a> for SignerInfo {}

/// Signed content with any number of signers.
#[derive(Debug)]
pub struct SignedData {
    digest_algorithms: Vec<AlgorithmIdentifierOwned>,
    /// Digests aligned with `digest_algorithms`; empty where not computed.
    digests: Option<Vec<Vec<u8>>>,
    content_info: ContentInfo,
    certificates: Vec<Vec<u8>>,
    crls: Vec<Vec<u8>>,
    signer_infos: Vec<SignerInfo>,
}

impl SignedData {
    /// SignedData over `content_info`.
    pub fn new(content_info: ContentInfo) -> Self {
        Self {
            digest_algorithms: Vec::new(),
            digests: None,
            content_info,
            certificates: Vec::new(),
            crls: Vec::new(),
            signer_infos: Vec::new(),
        }
    }

    /// Add a digest algorithm if not already present.
    pub fn add_digest_algorithm(&mut self, alg: AlgorithmIdentifierOwned) {
        if self.digest_algorithms.iter().any(|known| known.oid == alg.oid) {
            return;
        }
        self.digest_algorithms.push(alg);
        if let Some(digests) = self.digests.as_mut() {
            digests.push(Vec::new());
        }
    }

    /// Digest algorithms.
    pub fn digest_algorithms(&self) -> &[AlgorithmIdentifierOwned] {
        &self.digest_algorithms
    }

    /// Supply content digests up front, for detached content that is not
    /// streamed through the encoder, or to verify detached content after
    /// decoding.
    pub fn set_digests(
        &mut self,
        algorithms: &[AlgorithmIdentifierOwned],
        digests: &[Vec<u8>],
    ) -> Result<()> {
        if algorithms.len() != digests.len() {
            return Err(Error::InvalidArgument("digest count differs from algorithm count"));
        }
        for alg in algorithms {
            self.add_digest_algorithm(alg.clone());
        }

        let mut aligned = self
            .digests
            .take()
            .unwrap_or_else(|| vec![Vec::new(); self.digest_algorithms.len()]);
        for (alg, digest) in algorithms.iter().zip(digests) {
            if let Some(i) = self.digest_algorithms.iter().position(|a| a.oid == alg.oid) {
                aligned[i] = digest.clone();
            }
        }
        self.digests = Some(aligned);

        for signer in self.signer_infos.iter_mut() {
            if let Some(digest) = algorithms
                .iter()
                .zip(digests)
                .find(|(alg, _)| alg.oid == signer.digest_algorithm.oid)
                .map(|(_, digest)| digest.clone())
            {
                signer.content_digest = Some(digest);
            }
        }
        Ok(())
    }

    /// Content digests aligned with [`digest_algorithms`][Self::digest_algorithms].
    pub fn digests(&self) -> Option<&[Vec<u8>]> {
        self.digests.as_deref()
    }

    /// Digest computed with the algorithm `oid`.
    pub fn digest_for(&self, oid: &ObjectIdentifier) -> Option<&[u8]> {
        let i = self.digest_algorithms.iter().position(|a| a.oid == *oid)?;
        self.digests
            .as_ref()
            .and_then(|d| d.get(i))
            .filter(|d| !d.is_empty())
            .map(Vec::as_slice)
    }

    /// Add a certificate (any `CertificateChoices` DER encoding).
    pub fn add_certificate(&mut self, der: Vec<u8>) {
        self.certificates.push(der);
    }

    /// Certificates as DER encodings.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// Add a CRL (any `RevocationInfoChoice` DER encoding).
    pub fn add_crl(&mut self, der: Vec<u8>) {
        self.crls.push(der);
    }

    /// CRLs as DER encodings.
    pub fn crls(&self) -> &[Vec<u8>] {
        &self.crls
    }

    /// Add a signer. Its digest algorithm is added to the digest algorithms.
    pub fn add_signer(&mut self, signer: SignerInfo) {
        self.add_digest_algorithm(signer.digest_algorithm.clone());
        self.signer_infos.push(signer);
    }

    /// Signers.
    pub fn signer_infos(&self) -> &[SignerInfo] {
        &self.signer_infos
    }

    /// Mutable signers.
    pub fn signer_infos_mut(&mut self) -> &mut [SignerInfo] {
        &mut self.signer_infos
    }

    /// Encapsulated content.
    pub fn content_info(&self) -> &ContentInfo {
        &self.content_info
    }

    /// Mutable encapsulated content.
    pub fn content_info_mut(&mut self) -> &mut ContentInfo {
        &mut self.content_info
    }

    /// Structure version ([RFC 5652 § 5.1]).
    ///
    /// [RFC 5652 § 5.1]: https://datatracker.ietf.org/doc/html/rfc5652#section-5.1
    pub fn version(&self) -> u8 {
        let cert_tags = || self.certificates.iter().filter_map(|c| c.first().copied());
        let other_cert = cert_tags().any(|t| t == 0xa3);
        let other_crl = self.crls.iter().any(|c| c.first() == Some(&0xa1));
        if other_cert || other_crl {
            5
        } else if cert_tags().any(|t| t == 0xa2) {
            4
        } else if cert_tags().any(|t| t == 0xa1)
            || self.signer_infos.iter().any(|s| s.version() == 3)
            || self.content_info.content_type() != oid::ID_DATA
        {
            3
        } else {
            1
        }
    }

    /// Verify signer `index` against the content digest computed while
    /// decoding (or supplied with [`set_digests`][Self::set_digests]).
    pub fn verify_signer(
        &self,
        index: usize,
        verifier: &dyn SignatureVerifier,
        registry: &AlgorithmRegistry,
    ) -> Result<()> {
        let signer = self
            .signer_infos
            .get(index)
            .ok_or(Error::InvalidArgument("no signer at that index"))?;
        let digest = signer
            .content_digest
            .as_deref()
            .or_else(|| self.digest_for(&signer.digest_algorithm.oid))
            .ok_or(Error::MissingDigestAlgorithm(signer.digest_algorithm.oid))?;
        signer.verify(&self.content_info.content_type(), digest, verifier, registry)
    }

    pub(crate) fn empty() -> Self {
        Self::new(ContentInfo::data(Vec::new()))
    }

    /// Put the digest algorithms in `SET OF` order, keeping supplied digests
    /// aligned.
    pub(crate) fn prepare_encode(&mut self) -> Result<()> {
        for signer in &self.signer_infos {
            if !self
                .digest_algorithms
                .iter()
                .any(|a| a.oid == signer.digest_algorithm.oid)
            {
                return Err(Error::InvalidState("signer digest algorithm not registered"));
            }
        }
        match self.digests.as_mut() {
            Some(digests) => sort::sort_by_encoding_with(
                &mut self.digest_algorithms,
                asn1::encode_algorithm,
                &mut [digests],
            ),
            None => sort::sort_by_encoding(&mut self.digest_algorithms, asn1::encode_algorithm),
        }
    }

    /// Digest accumulator for the content, or `None` when digests were
    /// supplied up front.
    pub(crate) fn start_digests(&self, registry: &AlgorithmRegistry) -> Option<DigestAccumulator> {
        if self.digests.is_some() {
            return None;
        }
        Some(DigestAccumulator::start(&self.digest_algorithms, registry))
    }

    /// Record digests computed over the content.
    pub(crate) fn store_digests(&mut self, computed: Vec<(AlgorithmIdentifierOwned, Vec<u8>)>) {
        let mut aligned = vec![Vec::new(); self.digest_algorithms.len()];
        for (alg, digest) in computed {
            if let Some(i) = self.digest_algorithms.iter().position(|a| a.oid == alg.oid) {
                aligned[i] = digest;
            }
        }
        self.digests = Some(aligned);
    }

    /// Sign with every signer and put the SignerInfos in `SET OF` order.
    pub(crate) fn sign_all(
        &mut self,
        keys: &dyn KeyCallbacks,
        registry: &AlgorithmRegistry,
    ) -> Result<()> {
        let content_type = self.content_info.content_type();
        for i in 0..self.signer_infos.len() {
            let digest_oid = self.signer_infos[i].digest_algorithm.oid;
            let digest = self
                .digest_for(&digest_oid)
                .ok_or(Error::MissingDigestAlgorithm(digest_oid))?
                .to_vec();
            let key = keys
                .signer(&self.signer_infos[i].sid)
                .ok_or(Error::MissingSigningKey)?;
            self.signer_infos[i].sign(&content_type, &digest, key, registry)?;
        }
        sort::sort_by_encoding(&mut self.signer_infos, |signer| Ok(signer.to_der()?))
    }

    /// Fields before the encapsulated content: version and digest algorithms.
    pub(crate) fn encode_prefix(&self) -> Result<Vec<u8>> {
        let mut out = asn1::encode_version(self.version())?;
        out.extend(asn1::encode_set_of(&self.digest_algorithms)?);
        Ok(out)
    }

    /// Fields after the encapsulated content: certificates, CRLs, signers.
    pub(crate) fn encode_suffix(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if !self.certificates.is_empty() {
            let mut certs = self.certificates.clone();
            sort::sort_encodings(&mut certs);
            asn1::write_tlv(&mut out, CONTEXT_0_CONSTRUCTED, &certs.concat())?;
        }
        if !self.crls.is_empty() {
            let mut crls = self.crls.clone();
            sort::sort_encodings(&mut crls);
            asn1::write_tlv(&mut out, CONTEXT_1_CONSTRUCTED, &crls.concat())?;
        }
        if self.signer_infos.iter().any(|s| s.signature_algorithm.is_none()) {
            return Err(Error::InvalidState("signer has not signed"));
        }
        out.extend(asn1::encode_set_of(&self.signer_infos)?);
        Ok(out)
    }

    /// Decode field `index` before the encapsulated content.
    pub(crate) fn decode_prefix_field(&mut self, index: usize, tlv: &Tlv<'_>) -> Result<()> {
        match (index, tlv.tag) {
            (0, asn1::INTEGER) => asn1::decode_version(tlv).map(drop),
            (1, SET) => {
                for alg in asn1::decode_set_of::<AlgorithmIdentifierOwned>(tlv.raw)? {
                    self.add_digest_algorithm(alg);
                }
                Ok(())
            }
            _ => Err(Error::MalformedEncoding("unexpected SignedData field")),
        }
    }

    /// Decode a field after the encapsulated content.
    pub(crate) fn decode_suffix_field(&mut self, tlv: &Tlv<'_>) -> Result<()> {
        match tlv.tag {
            CONTEXT_0_CONSTRUCTED => {
                for cert in tlv.parser() {
                    self.certificates.push(cert?.raw.to_vec());
                }
            }
            CONTEXT_1_CONSTRUCTED => {
                for crl in tlv.parser() {
                    self.crls.push(crl?.raw.to_vec());
                }
            }
            SET => {
                self.signer_infos
                    .extend(asn1::decode_set_of::<SignerInfo>(tlv.raw)?);
            }
            _ => return Err(Error::MalformedEncoding("unexpected SignedData field")),
        }
        Ok(())
    }

    /// Hand each signer the digest computed with its algorithm.
    pub(crate) fn attach_digests(&mut self) {
        for i in 0..self.signer_infos.len() {
            let oid = self.signer_infos[i].digest_algorithm.oid;
            let digest = self.digest_for(&oid).map(<[u8]>::to_vec);
            self.signer_infos[i].content_digest = digest;
        }
    }
}
