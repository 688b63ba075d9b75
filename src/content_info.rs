//! The recursive `ContentInfo` node ([RFC 5652 § 3]).
//!
//! [RFC 5652 § 3]: https://datatracker.ietf.org/doc/html/rfc5652#section-3

use alloc::boxed::Box;
use alloc::vec::Vec;
use const_oid::ObjectIdentifier;
use spki::AlgorithmIdentifierOwned;

use crate::cipher_context::CipherContext;
use crate::digest_context::DigestAccumulator;
use crate::digested_data::DigestedData;
use crate::encrypted_data::EncryptedData;
use crate::enveloped_data::EnvelopedData;
use crate::errors::{Error, Result};
use crate::oid;
use crate::signed_data::SignedData;

/// The content kinds the engines understand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContentType {
    /// `id-data`
    Data,
    /// `id-signedData`
    SignedData,
    /// `id-envelopedData`
    EnvelopedData,
    /// `id-digestedData`
    DigestedData,
    /// `id-encryptedData`
    EncryptedData,
    /// Anything else, carried as opaque octets.
    Unknown,
}

impl ContentType {
    /// Classify a content type OID.
    pub fn from_oid(oid: &ObjectIdentifier) -> Self {
        match *oid {
            oid::ID_DATA => Self::Data,
            oid::ID_SIGNED_DATA => Self::SignedData,
            oid::ID_ENVELOPED_DATA => Self::EnvelopedData,
            oid::ID_DIGESTED_DATA => Self::DigestedData,
            oid::ID_ENCRYPTED_DATA => Self::EncryptedData,
            _ => Self::Unknown,
        }
    }

    /// Whether content of this type wraps another `ContentInfo`.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Self::SignedData | Self::EnvelopedData | Self::DigestedData | Self::EncryptedData
        )
    }
}

/// Points in the walk of one composite level where kind-specific work runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Waypoint {
    /// The nested content type is known.
    AfterContentType,
    /// The nested content octets are about to flow.
    BeforeContent,
    /// The nested content octets are complete.
    AfterContent,
    /// The whole level, trailing fields included, is complete.
    AfterEnd,
}

/// Content of one nesting level.
#[derive(Debug)]
pub enum Content {
    /// Plain octets.
    Data(Vec<u8>),
    /// Signed content.
    Signed(Box<SignedData>),
    /// Content encrypted for a set of recipients.
    Enveloped(Box<EnvelopedData>),
    /// Digested content.
    Digested(Box<DigestedData>),
    /// Content encrypted under a caller-managed key.
    Encrypted(Box<EncryptedData>),
    /// Content of an unrecognized type, kept as opaque octets.
    Unknown(Vec<u8>),
}

impl Content {
    /// Empty content of the given kind, filled in while decoding.
    pub(crate) fn empty(kind: ContentType) -> Self {
        match kind {
            ContentType::Data => Self::Data(Vec::new()),
            ContentType::SignedData => Self::Signed(Box::new(SignedData::empty())),
            ContentType::EnvelopedData => Self::Enveloped(Box::new(EnvelopedData::empty())),
            ContentType::DigestedData => Self::Digested(Box::new(DigestedData::empty())),
            ContentType::EncryptedData => Self::Encrypted(Box::new(EncryptedData::empty())),
            ContentType::Unknown => Self::Unknown(Vec::new()),
        }
    }

    fn kind(&self) -> ContentType {
        match self {
            Self::Data(_) => ContentType::Data,
            Self::Signed(_) => ContentType::SignedData,
            Self::Enveloped(_) => ContentType::EnvelopedData,
            Self::Digested(_) => ContentType::DigestedData,
            Self::Encrypted(_) => ContentType::EncryptedData,
            Self::Unknown(_) => ContentType::Unknown,
        }
    }
}

/// One level of a CMS message.
///
/// Composite content owns the next `ContentInfo` down, so a message is a
/// chain of these nodes ending in Data (or opaque) content. The digest and
/// cipher contexts are only populated while the node's octets are being
/// streamed through an encoder or decoder.
#[derive(Debug)]
pub struct ContentInfo {
    content_type: ObjectIdentifier,
    content: Content,
    detached: bool,
    pub(crate) content_enc_alg: Option<AlgorithmIdentifierOwned>,
    pub(crate) digest_context: Option<DigestAccumulator>,
    pub(crate) cipher_context: Option<CipherContext>,
    pub(crate) decode_error: Option<Error>,
}

impl ContentInfo {
    /// Node with the given content type and content.
    ///
    /// Fails if `content_type` names a known kind other than the one
    /// `content` holds, or if unknown content is labelled with a known type.
    pub fn new(content_type: ObjectIdentifier, content: Content) -> Result<Self> {
        let mut info = Self::data(Vec::new());
        info.set_content(content_type, content)?;
        Ok(info)
    }

    /// Data node with embedded octets.
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_parts(oid::ID_DATA, Content::Data(bytes.into()))
    }

    /// Data node whose octets travel outside the message.
    pub fn detached_data() -> Self {
        let mut info = Self::data(Vec::new());
        info.detached = true;
        info
    }

    /// SignedData node.
    pub fn signed(signed: SignedData) -> Self {
        Self::from_parts(oid::ID_SIGNED_DATA, Content::Signed(Box::new(signed)))
    }

    /// EnvelopedData node.
    pub fn enveloped(enveloped: EnvelopedData) -> Self {
        Self::from_parts(oid::ID_ENVELOPED_DATA, Content::Enveloped(Box::new(enveloped)))
    }

    /// DigestedData node.
    pub fn digested(digested: DigestedData) -> Self {
        Self::from_parts(oid::ID_DIGESTED_DATA, Content::Digested(Box::new(digested)))
    }

    /// EncryptedData node.
    pub fn encrypted(encrypted: EncryptedData) -> Self {
        Self::from_parts(oid::ID_ENCRYPTED_DATA, Content::Encrypted(Box::new(encrypted)))
    }

    /// Node of an unrecognized type carrying `encoding` verbatim.
    pub fn unknown(content_type: ObjectIdentifier, encoding: Vec<u8>) -> Result<Self> {
        Self::new(content_type, Content::Unknown(encoding))
    }

    pub(crate) fn from_parts(content_type: ObjectIdentifier, content: Content) -> Self {
        Self {
            content_type,
            content,
            detached: false,
            content_enc_alg: None,
            digest_context: None,
            cipher_context: None,
            decode_error: None,
        }
    }

    /// Install new content.
    pub fn set_content(&mut self, content_type: ObjectIdentifier, content: Content) -> Result<()> {
        if ContentType::from_oid(&content_type) != content.kind() {
            return Err(Error::InvalidArgument("content does not match its content type"));
        }
        self.content_type = content_type;
        self.content = content;
        Ok(())
    }

    /// Content type OID.
    pub fn content_type(&self) -> ObjectIdentifier {
        self.content_type
    }

    /// Classified content type.
    pub fn kind(&self) -> ContentType {
        self.content.kind()
    }

    /// Content of this level.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Mutable content of this level.
    pub fn content_mut(&mut self) -> &mut Content {
        &mut self.content
    }

    /// Whether the content octets are carried outside the message.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Mark the content as detached (or embedded).
    pub fn set_detached(&mut self, detached: bool) {
        self.detached = detached;
    }

    /// Content-encryption algorithm, when this node is the encrypted content
    /// of an EnvelopedData or EncryptedData.
    pub fn content_encryption_algorithm(&self) -> Option<&AlgorithmIdentifierOwned> {
        self.content_enc_alg.as_ref()
    }

    /// Error that stopped this subtree from being decoded, such as a missing
    /// decryption key. Outer levels may still be complete.
    pub fn decode_error(&self) -> Option<&Error> {
        self.decode_error.as_ref()
    }

    /// Nested `ContentInfo` of composite content.
    pub fn child_content_info(&self) -> Option<&ContentInfo> {
        match &self.content {
            Content::Signed(signed) => Some(signed.content_info()),
            Content::Enveloped(enveloped) => Some(enveloped.content_info()),
            Content::Digested(digested) => Some(digested.content_info()),
            Content::Encrypted(encrypted) => Some(encrypted.content_info()),
            Content::Data(_) | Content::Unknown(_) => None,
        }
    }

    /// Mutable nested `ContentInfo` of composite content.
    pub fn child_content_info_mut(&mut self) -> Option<&mut ContentInfo> {
        match &mut self.content {
            Content::Signed(signed) => Some(signed.content_info_mut()),
            Content::Enveloped(enveloped) => Some(enveloped.content_info_mut()),
            Content::Digested(digested) => Some(digested.content_info_mut()),
            Content::Encrypted(encrypted) => Some(encrypted.content_info_mut()),
            Content::Data(_) | Content::Unknown(_) => None,
        }
    }

    /// Octets of the innermost Data content, following nested levels down.
    ///
    /// `None` when the innermost content is opaque or detached.
    pub fn inner_content(&self) -> Option<&[u8]> {
        let mut node = self;
        while let Some(child) = node.child_content_info() {
            node = child;
        }
        match &node.content {
            Content::Data(bytes) if !node.detached => Some(bytes.as_slice()),
            _ => None,
        }
    }

    /// Node `depth` levels below this one.
    pub fn level(&self, depth: usize) -> Option<&ContentInfo> {
        let mut node = self;
        for _ in 0..depth {
            node = node.child_content_info()?;
        }
        Some(node)
    }

    /// Mutable node `depth` levels below this one.
    pub fn level_mut(&mut self, depth: usize) -> Option<&mut ContentInfo> {
        let mut node = self;
        for _ in 0..depth {
            node = node.child_content_info_mut()?;
        }
        Some(node)
    }

    /// Octets held by Data or opaque content.
    pub(crate) fn octets_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.content {
            Content::Data(bytes) | Content::Unknown(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Drop any transient digest or cipher state.
    pub(crate) fn release_contexts(&mut self) {
        if let Some(digests) = self.digest_context.take() {
            digests.cancel();
        }
        self.cipher_context = None;
    }

    /// Drop the transient state of this node and every node below it,
    /// innermost first.
    pub(crate) fn release_all_contexts(&mut self) {
        if let Some(child) = self.child_content_info_mut() {
            child.release_all_contexts();
        }
        self.release_contexts();
    }
}
