//! Immutable registry mapping algorithm OIDs to the digest and cipher
//! implementations the engines can run.
//!
//! A registry is constructed once and owned by an [`Encoder`][crate::Encoder]
//! or [`Decoder`][crate::Decoder]; nothing in the crate consults global state
//! to resolve an algorithm.

use alloc::boxed::Box;
use alloc::vec::Vec;
use const_oid::ObjectIdentifier;
use digest::DynDigest;
use spki::AlgorithmIdentifierOwned;

use crate::oid;

/// Digest algorithms usable for SignedData and DigestedData.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-1 ([RFC 3174](https://datatracker.ietf.org/doc/html/rfc3174)).
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl DigestAlgorithm {
    /// Object identifier of this algorithm.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::Sha1 => oid::ID_SHA_1,
            Self::Sha224 => oid::ID_SHA_224,
            Self::Sha256 => oid::ID_SHA_256,
            Self::Sha384 => oid::ID_SHA_384,
            Self::Sha512 => oid::ID_SHA_512,
        }
    }

    /// Length in bytes of a digest.
    pub fn output_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Algorithm identifier with absent parameters, as recommended by
    /// [RFC 5754 § 2](https://datatracker.ietf.org/doc/html/rfc5754#section-2).
    pub fn algorithm_identifier(self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }

    /// Fresh running hash state.
    pub fn new_hasher(self) -> Box<dyn DynDigest> {
        match self {
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha224 => Box::new(sha2::Sha224::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha384 => Box::new(sha2::Sha384::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    /// One-shot digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.new_hasher();
        hasher.update(data);
        hasher.finalize().into_vec()
    }
}

/// Content-encryption algorithms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContentEncryptionAlgorithm {
    /// AES-128 in CBC mode ([RFC 3565](https://datatracker.ietf.org/doc/html/rfc3565)).
    Aes128Cbc,
    /// AES-192 in CBC mode.
    Aes192Cbc,
    /// AES-256 in CBC mode.
    Aes256Cbc,
}

impl ContentEncryptionAlgorithm {
    /// Object identifier of this algorithm.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::Aes128Cbc => oid::ID_AES_128_CBC,
            Self::Aes192Cbc => oid::ID_AES_192_CBC,
            Self::Aes256Cbc => oid::ID_AES_256_CBC,
        }
    }

    /// Key length in bytes.
    pub fn key_size(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes192Cbc => 24,
            Self::Aes256Cbc => 32,
        }
    }

    /// Cipher block size in bytes, which is also the IV size.
    pub fn block_size(self) -> usize {
        16
    }

    /// Algorithm identifier without parameters. The IV is filled in when an
    /// encryption context is started.
    pub fn algorithm_identifier(self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }
}

/// OID → algorithm lookup tables.
#[derive(Clone, Debug)]
pub struct AlgorithmRegistry {
    digests: Vec<(ObjectIdentifier, DigestAlgorithm)>,
    ciphers: Vec<(ObjectIdentifier, ContentEncryptionAlgorithm)>,
}

impl AlgorithmRegistry {
    /// Registry that knows no algorithms.
    pub fn empty() -> Self {
        Self {
            digests: Vec::new(),
            ciphers: Vec::new(),
        }
    }

    /// Add a digest algorithm.
    pub fn with_digest(mut self, alg: DigestAlgorithm) -> Self {
        if self.digest(&alg.oid()).is_none() {
            self.digests.push((alg.oid(), alg));
        }
        self
    }

    /// Add a content-encryption algorithm.
    pub fn with_cipher(mut self, alg: ContentEncryptionAlgorithm) -> Self {
        if self.cipher(&alg.oid()).is_none() {
            self.ciphers.push((alg.oid(), alg));
        }
        self
    }

    /// Look up a digest algorithm by OID.
    pub fn digest(&self, oid: &ObjectIdentifier) -> Option<DigestAlgorithm> {
        self.digests
            .iter()
            .find(|(known, _)| known == oid)
            .map(|(_, alg)| *alg)
    }

    /// Look up a content-encryption algorithm by OID.
    pub fn cipher(&self, oid: &ObjectIdentifier) -> Option<ContentEncryptionAlgorithm> {
        self.ciphers
            .iter()
            .find(|(known, _)| known == oid)
            .map(|(_, alg)| *alg)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::empty()
            .with_digest(DigestAlgorithm::Sha1)
            .with_digest(DigestAlgorithm::Sha224)
            .with_digest(DigestAlgorithm::Sha256)
            .with_digest(DigestAlgorithm::Sha384)
            .with_digest(DigestAlgorithm::Sha512)
            .with_cipher(ContentEncryptionAlgorithm::Aes128Cbc)
            .with_cipher(ContentEncryptionAlgorithm::Aes192Cbc)
            .with_cipher(ContentEncryptionAlgorithm::Aes256Cbc)
    }
}
