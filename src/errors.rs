//! Error types.

use const_oid::ObjectIdentifier;

/// Alias for [`core::result::Result`] with the `cms-stream` crate's [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types.
///
/// Errors are `Clone` so that an encoder or decoder can record the first
/// failure and hand it back from every subsequent call.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The input violates BER/DER framing or the CMS structure.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(&'static str),

    /// Content type OID is not one of the known CMS content types.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(ObjectIdentifier),

    /// Algorithm OID is not present in the algorithm registry.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),

    /// No content-encryption key was supplied by the key callbacks.
    #[error("missing bulk key")]
    MissingBulkKey,

    /// No signing key was supplied for a signer.
    #[error("missing signing key")]
    MissingSigningKey,

    /// No key was supplied for any recipient.
    #[error("missing recipient key")]
    MissingRecipientKey,

    /// No digest was computed for the algorithm a signer references.
    #[error("missing digest for algorithm {0}")]
    MissingDigestAlgorithm(ObjectIdentifier),

    /// Block cipher padding is invalid.
    #[error("bad padding")]
    BadPadding,

    /// A signature, key wrap or primitive operation failed.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// ASN.1 error from the `der` crate.
    #[error("ASN.1 error: {0}")]
    Asn1(der::Error),

    /// The operation is not valid in the engine's current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Error {
        Error::Asn1(err)
    }
}

impl From<const_oid::Error> for Error {
    fn from(_: const_oid::Error) -> Error {
        Error::MalformedEncoding("invalid object identifier")
    }
}
