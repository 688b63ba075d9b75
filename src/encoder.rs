//! Streaming CMS encoder.
//!
//! The encoder walks a [`Message`] and writes its BER encoding to a sink
//! while the innermost content is supplied through repeated
//! [`update`][Encoder::update] calls. Every composite level is driven by its
//! own `LevelEncoder`; a level's output becomes the content octets of the
//! level above it, so each chunk is digested and encrypted exactly once, by
//! the level whose kind calls for it.
//!
//! Streamed parts use indefinite lengths and content octets are cut into
//! fixed-size segments, which makes the output independent of how the caller
//! chunks its input.

use alloc::boxed::Box;
use alloc::vec::Vec;
use rand_core::CryptoRngCore;

use crate::asn1::{
    self, CONSTRUCTED_OCTET_STRING, CONTEXT_0_CONSTRUCTED, OCTET_STRING, SEQUENCE,
};
use crate::cipher_context::CipherContext;
use crate::content_info::{Content, ContentInfo, ContentType, Waypoint};
use crate::errors::{Error, Result};
use crate::keys::KeyCallbacks;
use crate::message::Message;
use crate::registry::AlgorithmRegistry;

/// Size of the primitive OCTET STRING segments content is cut into.
pub const SEGMENT_LEN: usize = 1024;

/// Collects content octets into fixed-size primitive OCTET STRINGs.
#[derive(Debug, Default)]
struct Segmenter {
    buf: Vec<u8>,
}

impl Segmenter {
    fn push(&mut self, mut data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        while !data.is_empty() {
            let n = (SEGMENT_LEN - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buf.len() == SEGMENT_LEN {
                self.flush(out)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if !self.buf.is_empty() {
            asn1::write_tlv(out, OCTET_STRING, &self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

/// Borrowed engine inputs shared by every level.
struct Context<'c> {
    keys: &'c dyn KeyCallbacks,
    rng: &'c mut dyn CryptoRngCore,
    registry: &'c AlgorithmRegistry,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EncodeState {
    AwaitingType,
    AwaitingContent,
    StreamingContent,
    Finalizing,
    Done,
}

/// Nested `ContentInfo` of a composite node.
fn inner(node: &mut ContentInfo) -> Result<&mut ContentInfo> {
    node.child_content_info_mut()
        .ok_or(Error::InvalidState("level is not composite"))
}

/// Encoder for the body of one composite level.
///
/// Every call receives the level's own node, which sits `depth` levels
/// below the root; the nested node carries the digest and cipher contexts
/// while content streams. A child encoder is handed that nested node in
/// turn, so no call walks the tree from the root.
#[derive(Debug)]
struct LevelEncoder {
    depth: usize,
    kind: ContentType,
    state: EncodeState,
    detached: bool,
    segmenter: Segmenter,
    child: Option<Box<LevelEncoder>>,
}

impl LevelEncoder {
    fn new(depth: usize, kind: ContentType) -> Self {
        tracing::debug!(depth, ?kind, "creating level encoder");
        Self {
            depth,
            kind,
            state: EncodeState::AwaitingType,
            detached: false,
            segmenter: Segmenter::default(),
            child: None,
        }
    }

    /// Write everything up to the first content octet, including the
    /// headers of nested levels and any content already held by the message.
    ///
    /// On failure, the contexts of this level and of every nested level
    /// started so far are released before the error is returned.
    fn start(
        &mut self,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if self.state != EncodeState::AwaitingType {
            return Err(Error::InvalidState("level already started"));
        }
        let result = self.start_levels(node, cx, out);
        if result.is_err() {
            self.cancel(node);
        }
        result
    }

    fn start_levels(
        &mut self,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        self.waypoint(Waypoint::AfterContentType, node, cx, out)?;
        self.state = EncodeState::AwaitingContent;
        self.waypoint(Waypoint::BeforeContent, node, cx, out)?;
        self.state = EncodeState::StreamingContent;

        let nested = inner(node)?;
        let kind = nested.kind();
        if kind.is_composite() {
            let mut produced = Vec::new();
            let child = self
                .child
                .insert(Box::new(LevelEncoder::new(self.depth + 1, kind)));
            child.start(nested, cx, &mut produced)?;
            return self.process(node, &produced, out);
        }

        let stored = nested.octets_mut().map(core::mem::take).unwrap_or_default();
        let result = self.process(node, &stored, out);
        if let Some(octets) = inner(node)?.octets_mut() {
            *octets = stored;
        }
        result
    }

    fn update(&mut self, node: &mut ContentInfo, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.state != EncodeState::StreamingContent {
            return Err(Error::InvalidState("level is not streaming content"));
        }
        match self.child.as_mut() {
            Some(child) => {
                let mut produced = Vec::new();
                child.update(inner(node)?, data, &mut produced)?;
                self.process(node, &produced, out)
            }
            None => self.process(node, data, out),
        }
    }

    /// Digest, encrypt and segment content octets of this level.
    fn process(&mut self, node: &mut ContentInfo, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let nested = inner(node)?;
        if let Some(digests) = nested.digest_context.as_mut() {
            digests.update(data);
        }
        let encrypted;
        let bytes = match nested.cipher_context.as_mut() {
            Some(cipher) => {
                encrypted = cipher.encrypt(data, false)?;
                encrypted.as_slice()
            }
            None => data,
        };
        if !self.detached {
            self.segmenter.push(bytes, out)?;
        }
        Ok(())
    }

    fn finish(
        &mut self,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if self.state != EncodeState::StreamingContent {
            return Err(Error::InvalidState("level is not streaming content"));
        }
        if let Some(child) = self.child.as_mut() {
            let mut produced = Vec::new();
            child.finish(inner(node)?, cx, &mut produced)?;
            self.process(node, &produced, out)?;
            self.child = None;
        }
        self.state = EncodeState::Finalizing;

        if let Some(mut cipher) = inner(node)?.cipher_context.take() {
            let tail = cipher.encrypt(&[], true)?;
            if !self.detached {
                self.segmenter.push(&tail, out)?;
            }
        }
        if !self.detached {
            self.segmenter.flush(out)?;
            if matches!(self.kind, ContentType::SignedData | ContentType::DigestedData) {
                asn1::write_eoc(out);
            }
            asn1::write_eoc(out);
        }
        asn1::write_eoc(out);

        self.waypoint(Waypoint::AfterContent, node, cx, out)?;
        asn1::write_eoc(out);
        self.waypoint(Waypoint::AfterEnd, node, cx, out)?;
        self.state = EncodeState::Done;
        Ok(())
    }

    /// Release every context, innermost level first.
    fn cancel(&mut self, node: &mut ContentInfo) {
        if let Some(nested) = node.child_content_info_mut() {
            if let Some(mut child) = self.child.take() {
                child.cancel(nested);
            }
            nested.release_contexts();
        }
        self.child = None;
        self.state = EncodeState::Done;
    }

    fn waypoint(
        &mut self,
        waypoint: Waypoint,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        tracing::trace!(depth = self.depth, kind = ?self.kind, ?waypoint, "encode");
        match waypoint {
            Waypoint::AfterContentType => self.write_prefix(node, cx, out),
            Waypoint::BeforeContent => self.open_content(node, cx, out),
            Waypoint::AfterContent => self.write_suffix(node, cx, out),
            Waypoint::AfterEnd => {
                inner(node)?.release_contexts();
                Ok(())
            }
        }
    }

    /// Prepare the level's metadata and write its leading fields.
    fn write_prefix(
        &mut self,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let prefix = match node.content_mut() {
            Content::Signed(signed) => {
                signed.prepare_encode()?;
                signed.encode_prefix()?
            }
            Content::Enveloped(enveloped) => {
                enveloped.prepare_encode(cx.keys, &mut *cx.rng)?;
                enveloped.encode_prefix()?
            }
            Content::Digested(digested) => digested.encode_prefix()?,
            Content::Encrypted(encrypted) => encrypted.encode_prefix()?,
            Content::Data(_) | Content::Unknown(_) => {
                return Err(Error::InvalidState("level is not composite"))
            }
        };
        asn1::write_indefinite(out, SEQUENCE);
        out.extend(prefix);
        Ok(())
    }

    /// Start the digest or cipher for the nested content and write the
    /// headers leading up to its octets.
    fn open_content(
        &mut self,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match node.content_mut() {
            Content::Signed(signed) => {
                let digests = signed.start_digests(cx.registry);
                signed.content_info_mut().digest_context = digests;
            }
            Content::Digested(digested) => {
                let digests = digested.start_digest(cx.registry);
                digested.content_info_mut().digest_context = Some(digests);
            }
            Content::Enveloped(enveloped) => {
                let key = enveloped
                    .take_bulk_key()
                    .ok_or(Error::InvalidState("content-encryption key was not generated"))?;
                let (cipher, alg_id) =
                    CipherContext::start_encrypt(&key, enveloped.content_encryption(), &mut *cx.rng)?;
                let inner = enveloped.content_info_mut();
                inner.cipher_context = Some(cipher);
                inner.content_enc_alg = Some(alg_id);
            }
            Content::Encrypted(encrypted) => {
                let alg = encrypted.content_encryption();
                let key = cx.keys.bulk_key(&alg.oid()).ok_or(Error::MissingBulkKey)?;
                if key.len() != alg.key_size() {
                    return Err(Error::InvalidArgument("bulk key length does not fit the algorithm"));
                }
                let (cipher, alg_id) = CipherContext::start_encrypt(&key, alg, &mut *cx.rng)?;
                let inner = encrypted.content_info_mut();
                inner.cipher_context = Some(cipher);
                inner.content_enc_alg = Some(alg_id);
            }
            Content::Data(_) | Content::Unknown(_) => {
                return Err(Error::InvalidState("level is not composite"))
            }
        }

        let nested = inner(node)?;
        self.detached = nested.is_detached();
        asn1::write_indefinite(out, SEQUENCE);
        out.extend(asn1::encode_oid(&nested.content_type())?);
        match self.kind {
            ContentType::EnvelopedData | ContentType::EncryptedData => {
                let alg = nested
                    .content_enc_alg
                    .as_ref()
                    .ok_or(Error::InvalidState("content encryption was not started"))?;
                out.extend(asn1::encode_algorithm(alg)?);
                if !self.detached {
                    asn1::write_indefinite(out, CONTEXT_0_CONSTRUCTED);
                }
            }
            _ => {
                if !self.detached {
                    asn1::write_indefinite(out, CONTEXT_0_CONSTRUCTED);
                    asn1::write_indefinite(out, CONSTRUCTED_OCTET_STRING);
                }
            }
        }
        Ok(())
    }

    /// Finish digests, sign, and write the trailing fields.
    fn write_suffix(
        &mut self,
        node: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let suffix = match node.content_mut() {
            Content::Signed(signed) => {
                if let Some(digests) = signed.content_info_mut().digest_context.take() {
                    signed.store_digests(digests.finish());
                }
                signed.sign_all(cx.keys, cx.registry)?;
                signed.encode_suffix()?
            }
            Content::Digested(digested) => {
                let digests = digested
                    .content_info_mut()
                    .digest_context
                    .take()
                    .ok_or(Error::InvalidState("digest was not started"))?;
                digested.finish_encode(digests)?;
                digested.encode_suffix()?
            }
            Content::Enveloped(enveloped) => enveloped.encode_suffix()?,
            Content::Encrypted(encrypted) => encrypted.encode_suffix()?,
            Content::Data(_) | Content::Unknown(_) => {
                return Err(Error::InvalidState("level is not composite"))
            }
        };
        out.extend(suffix);
        Ok(())
    }
}

/// What the encoder does with the root `ContentInfo`.
#[derive(Debug)]
enum RootEncoder {
    Idle,
    Composite(Box<LevelEncoder>),
    Data { segmenter: Segmenter, detached: bool },
    Opaque,
    Done,
}

impl RootEncoder {
    /// Write the `ContentInfo` header and whatever precedes streamed content.
    fn start(root: &mut ContentInfo, cx: &mut Context<'_>, out: &mut Vec<u8>) -> Result<Self> {
        asn1::write_indefinite(out, SEQUENCE);
        out.extend(asn1::encode_oid(&root.content_type())?);

        let kind = root.kind();
        if kind.is_composite() {
            asn1::write_indefinite(out, CONTEXT_0_CONSTRUCTED);
            let mut level = Box::new(LevelEncoder::new(0, kind));
            // a failed start has already released the contexts it created
            level.start(root, cx, out)?;
            return Ok(Self::Composite(level));
        }

        let detached = root.is_detached();
        let stored = root.octets_mut().map(|octets| octets.as_slice()).unwrap_or_default();
        match kind {
            ContentType::Unknown => {
                asn1::write_indefinite(out, CONTEXT_0_CONSTRUCTED);
                out.extend_from_slice(stored);
                Ok(Self::Opaque)
            }
            _ => {
                let mut segmenter = Segmenter::default();
                if !detached {
                    asn1::write_indefinite(out, CONTEXT_0_CONSTRUCTED);
                    asn1::write_indefinite(out, CONSTRUCTED_OCTET_STRING);
                    segmenter.push(stored, out)?;
                }
                Ok(Self::Data {
                    segmenter,
                    detached,
                })
            }
        }
    }

    fn update(&mut self, root: &mut ContentInfo, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Composite(level) => level.update(root, data, out),
            Self::Data {
                segmenter,
                detached,
            } => {
                if !*detached {
                    segmenter.push(data, out)?;
                }
                Ok(())
            }
            Self::Opaque => {
                out.extend_from_slice(data);
                Ok(())
            }
            Self::Idle | Self::Done => Err(Error::InvalidState("encoder is not streaming")),
        }
    }

    fn finish(
        &mut self,
        root: &mut ContentInfo,
        cx: &mut Context<'_>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        match core::mem::replace(self, Self::Done) {
            Self::Composite(mut level) => {
                level.finish(root, cx, out)?;
                asn1::write_eoc(out);
            }
            Self::Data {
                mut segmenter,
                detached,
            } => {
                if !detached {
                    segmenter.flush(out)?;
                    asn1::write_eoc(out);
                    asn1::write_eoc(out);
                }
            }
            Self::Opaque => asn1::write_eoc(out),
            Self::Idle | Self::Done => return Err(Error::InvalidState("encoder is not streaming")),
        }
        asn1::write_eoc(out);
        Ok(())
    }

    fn cancel(&mut self, root: &mut ContentInfo) {
        if let Self::Composite(level) = self {
            level.cancel(root);
        }
        *self = Self::Done;
    }
}

/// Streaming encoder for one [`Message`].
///
/// Nothing is written until the first [`update`][Self::update] or
/// [`finish`][Self::finish]; at that point every level is prepared (keys
/// generated and wrapped, digests and ciphers started) and the headers up to
/// the first content octet are written to the sink. Content octets already
/// held by the innermost Data node are emitted before anything passed to
/// `update`.
///
/// The first error is sticky: every later call returns it, and output
/// produced by the failing call is not passed to the sink.
pub struct Encoder<'a> {
    message: Message,
    keys: &'a dyn KeyCallbacks,
    rng: &'a mut dyn CryptoRngCore,
    registry: AlgorithmRegistry,
    sink: Box<dyn FnMut(&[u8]) + 'a>,
    root: RootEncoder,
    error: Option<Error>,
}

impl<'a> Encoder<'a> {
    /// Encoder writing `message` to `sink`.
    ///
    /// `keys` supplies signing keys, recipient key-wrapping keys and
    /// EncryptedData bulk keys; `rng` supplies content-encryption keys and
    /// IVs.
    pub fn new(
        message: Message,
        keys: &'a dyn KeyCallbacks,
        rng: &'a mut dyn CryptoRngCore,
        sink: impl FnMut(&[u8]) + 'a,
    ) -> Self {
        Self {
            message,
            keys,
            rng,
            registry: AlgorithmRegistry::default(),
            sink: Box::new(sink),
            root: RootEncoder::Idle,
            error: None,
        }
    }

    /// Use `registry` instead of the default algorithm registry.
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The message being encoded.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Encode the next chunk of innermost content.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        self.run(|root_encoder, root, cx, out| {
            if matches!(root_encoder, RootEncoder::Idle) {
                *root_encoder = RootEncoder::start(root, cx, out)?;
            }
            root_encoder.update(root, data, out)
        })
    }

    /// Complete the encoding and return the message, now carrying the
    /// computed digests, signatures and recipient information.
    pub fn finish(mut self) -> Result<Message> {
        self.run(|root_encoder, root, cx, out| {
            if matches!(root_encoder, RootEncoder::Idle) {
                *root_encoder = RootEncoder::start(root, cx, out)?;
            }
            root_encoder.finish(root, cx, out)
        })?;
        tracing::debug!("encoding finished");
        Ok(self.message)
    }

    /// Abandon the encoding, releasing every digest and cipher context.
    pub fn cancel(mut self) -> Message {
        self.root.cancel(self.message.root_mut());
        self.message
    }

    fn run(
        &mut self,
        step: impl FnOnce(&mut RootEncoder, &mut ContentInfo, &mut Context<'_>, &mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let mut cx = Context {
            keys: self.keys,
            rng: &mut *self.rng,
            registry: &self.registry,
        };
        let mut out = Vec::new();
        match step(&mut self.root, self.message.root_mut(), &mut cx, &mut out) {
            Ok(()) => {
                if !out.is_empty() {
                    (self.sink)(&out);
                }
                Ok(())
            }
            Err(err) => {
                tracing::debug!(error = %err, "encoding failed");
                self.root.cancel(self.message.root_mut());
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl core::fmt::Debug for Encoder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Encoder")
            .field("message", &self.message)
            .field("root", &self.root)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Encode `message` in one call, with `content` as the innermost content.
pub fn encode(
    message: Message,
    content: &[u8],
    keys: &dyn KeyCallbacks,
    rng: &mut dyn CryptoRngCore,
) -> Result<(Vec<u8>, Message)> {
    let mut der = Vec::new();
    let mut encoder = Encoder::new(message, keys, rng, |bytes: &[u8]| der.extend_from_slice(bytes));
    encoder.update(content)?;
    let message = encoder.finish()?;
    Ok((der, message))
}
