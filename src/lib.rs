#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![doc = include_str!("../README.md")]
#![doc(html_logo_url = "https://raw.githubusercontent.com/RustCrypto/meta/master/logo_small.png")]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Wire format
//!
//! Every part of an encoding that wraps streamed content is written with
//! indefinite lengths, and content octets are written as a constructed
//! OCTET STRING of [`SEGMENT_LEN`]-octet segments. Everything else (algorithm
//! identifiers, `SET OF` fields, SignerInfos, RecipientInfos, attributes) is
//! DER, with `SET OF` elements in canonical order.
//!
//! The decoder accepts definite and indefinite lengths, and primitive or
//! constructed content OCTET STRINGs.
//!
//! # Keys
//!
//! The engines never own key material. Signing keys, recipient keys and
//! EncryptedData bulk keys are looked up through [`KeyCallbacks`] when a level
//! needs them. [`KeyRing`] is a ready-made implementation; with the `rsa`
//! feature, [`rsa::RsaPrivateKey`] and [`rsa::RsaPublicKey`] implement the
//! signing, verification and key transport traits.

extern crate alloc;

pub mod asn1;
pub mod attr;
pub mod errors;
pub mod keys;
pub mod oid;
pub mod registry;
pub mod sort;

mod cipher_context;
mod content_info;
mod decoder;
mod digest_context;
mod digested_data;
mod encoder;
mod encrypted_data;
mod enveloped_data;
mod message;
mod signed_data;

pub use const_oid::ObjectIdentifier;
pub use der;
pub use rand_core;
#[cfg(feature = "rsa")]
pub use rsa;
pub use spki;

pub use crate::{
    attr::{Attribute, AttributeCollection},
    cipher_context::{CipherContext, Direction},
    content_info::{Content, ContentInfo, ContentType},
    decoder::{decode, Decoder},
    digest_context::DigestAccumulator,
    digested_data::DigestedData,
    encoder::{encode, Encoder, SEGMENT_LEN},
    encrypted_data::EncryptedData,
    enveloped_data::{EnvelopedData, RecipientInfo},
    errors::{Error, Result},
    keys::{
        ContentSigner, IssuerAndSerialNumber, KeyCallbacks, KeyIdentifier, KeyRing, KeyUnwrapper,
        KeyWrapper, NoKeys, SignatureVerifier,
    },
    message::Message,
    registry::{AlgorithmRegistry, ContentEncryptionAlgorithm, DigestAlgorithm},
    signed_data::{SignedData, SignerInfo},
};
