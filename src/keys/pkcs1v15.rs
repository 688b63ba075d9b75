//! RSA PKCS#1 v1.5 signatures and key transport ([RFC 3370 § 3.2, § 4.2.1]).
//!
//! CMS identifies both with `rsaEncryption` and NULL parameters; the hash
//! algorithm comes from the SignerInfo's digest algorithm.
//!
//! [RFC 3370 § 3.2, § 4.2.1]: https://datatracker.ietf.org/doc/html/rfc3370

use alloc::string::ToString;
use alloc::vec::Vec;
use ::rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use const_oid::ObjectIdentifier;
use der::asn1::Null;
use der::{Any, AnyRef};
use rand_core::CryptoRngCore;
use spki::AlgorithmIdentifierOwned;
use zeroize::Zeroizing;

use super::{ContentSigner, KeyUnwrapper, KeyWrapper, SignatureVerifier};
use crate::errors::{Error, Result};
use crate::oid;

fn rsa_encryption() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: oid::RSA_ENCRYPTION,
        parameters: Some(Any::from(AnyRef::from(Null))),
    }
}

fn signature_scheme(digest_algorithm: &ObjectIdentifier) -> Result<Pkcs1v15Sign> {
    let scheme = match *digest_algorithm {
        oid::ID_SHA_1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        oid::ID_SHA_224 => Pkcs1v15Sign::new::<sha2::Sha224>(),
        oid::ID_SHA_256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        oid::ID_SHA_384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        oid::ID_SHA_512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        other => return Err(Error::UnsupportedAlgorithm(other)),
    };
    Ok(scheme)
}

fn crypto_failure(err: ::rsa::Error) -> Error {
    Error::CryptoFailure(err.to_string())
}

impl ContentSigner for RsaPrivateKey {
    fn signature_algorithm(&self) -> AlgorithmIdentifierOwned {
        rsa_encryption()
    }

    fn sign_digest(&self, digest_algorithm: &ObjectIdentifier, digest: &[u8]) -> Result<Vec<u8>> {
        self.sign(signature_scheme(digest_algorithm)?, digest)
            .map_err(crypto_failure)
    }
}

impl SignatureVerifier for RsaPublicKey {
    fn verify_digest(
        &self,
        digest_algorithm: &ObjectIdentifier,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        self.verify(signature_scheme(digest_algorithm)?, digest, signature)
            .map_err(crypto_failure)
    }
}

impl KeyWrapper for RsaPublicKey {
    fn key_encryption_algorithm(&self) -> AlgorithmIdentifierOwned {
        rsa_encryption()
    }

    fn wrap_key(&self, mut rng: &mut dyn CryptoRngCore, key: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(&mut rng, Pkcs1v15Encrypt, key)
            .map_err(crypto_failure)
    }
}

impl KeyUnwrapper for RsaPrivateKey {
    fn unwrap_key(
        &self,
        algorithm: &AlgorithmIdentifierOwned,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        if algorithm.oid != oid::RSA_ENCRYPTION {
            return Err(Error::UnsupportedAlgorithm(algorithm.oid));
        }
        self.decrypt(Pkcs1v15Encrypt, wrapped)
            .map(Zeroizing::new)
            .map_err(crypto_failure)
    }
}
