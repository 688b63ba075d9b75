//! Streaming CMS decoder.
//!
//! Bytes are pushed through [`Decoder::update`] in chunks of any size. The
//! root `ContentInfo` is parsed from one [`Tokenizer`]; the body of each
//! composite level is handled by a `LevelDecoder`. When a level's nested
//! content is itself composite, the level's content octets are decrypted,
//! digested (as plaintext) and then pushed into a child decoder with its own
//! tokenizer.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::asn1::{
    self, Header, Parser, Token, Tokenizer, CONSTRUCTED_OCTET_STRING, CONTEXT_0,
    CONTEXT_0_CONSTRUCTED, OBJECT_IDENTIFIER, OCTET_STRING, SEQUENCE,
};
use crate::cipher_context::CipherContext;
use crate::content_info::{Content, ContentInfo, ContentType, Waypoint};
use crate::digest_context::DigestAccumulator;
use crate::errors::{Error, Result};
use crate::keys::KeyCallbacks;
use crate::message::Message;
use crate::registry::AlgorithmRegistry;

/// Borrowed engine inputs shared by every level.
struct Context<'c, 's> {
    keys: &'c dyn KeyCallbacks,
    registry: &'c AlgorithmRegistry,
    sink: Option<&'c mut (dyn FnMut(&[u8]) + 's)>,
}

/// Nested `ContentInfo` of a composite node.
fn inner(node: &mut ContentInfo) -> Result<&mut ContentInfo> {
    node.child_content_info_mut()
        .ok_or(Error::InvalidState("level is not composite"))
}

/// Parse the single TLV of a captured element.
fn with_element<T>(raw: &[u8], f: impl FnOnce(&asn1::Tlv<'_>) -> Result<T>) -> Result<T> {
    let mut parser = Parser::new(raw);
    let tlv = parser
        .next_tlv()?
        .ok_or(Error::MalformedEncoding("empty element"))?;
    parser.finish()?;
    f(&tlv)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DecodeState {
    /// Awaiting the header of the level's SEQUENCE.
    Body,
    /// `n` leading fields decoded; awaiting the next header.
    Prefix(usize),
    PrefixElement(usize),
    InnerType,
    InnerTypeElement,
    ContentAlgorithm,
    ContentAlgorithmElement,
    /// Awaiting the `[0]` content or the end of the nested `ContentInfo`.
    ContentStart,
    /// Inside `[0] EXPLICIT`, awaiting the OCTET STRING.
    ExplicitContent,
    Content,
    ExplicitEnd,
    InnerEnd,
    Suffix,
    SuffixElement,
    Done,
}

/// Decoder for the body of one composite level.
///
/// Calls receive the level's own node; the child decoder is handed the
/// nested node.
#[derive(Debug)]
struct LevelDecoder {
    depth: usize,
    kind: ContentType,
    state: DecodeState,
    child: Option<Box<ChildDecoder>>,
}

impl LevelDecoder {
    fn new(depth: usize, kind: ContentType) -> Self {
        tracing::debug!(depth, ?kind, "creating level decoder");
        Self {
            depth,
            kind,
            state: DecodeState::Body,
            child: None,
        }
    }

    fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Number of leading fields before the nested `ContentInfo`.
    fn prefix_len(&self) -> usize {
        match self.kind {
            ContentType::EncryptedData => 1,
            _ => 2,
        }
    }

    fn is_encrypting(&self) -> bool {
        matches!(self.kind, ContentType::EnvelopedData | ContentType::EncryptedData)
    }

    fn token(
        &mut self,
        token: Token,
        tokenizer: &mut Tokenizer,
        node: &mut ContentInfo,
        cx: &mut Context<'_, '_>,
    ) -> Result<()> {
        use DecodeState as S;

        self.state = match (self.state, token) {
            (S::Body, Token::Header(h)) if h.tag == SEQUENCE => {
                tokenizer.enter()?;
                S::Prefix(0)
            }
            (S::Prefix(n), Token::Header(h)) if h.tag == SEQUENCE && n >= self.prefix_len() => {
                tokenizer.enter()?;
                S::InnerType
            }
            (S::Prefix(n), Token::Header(_)) => {
                tokenizer.capture()?;
                S::PrefixElement(n)
            }
            (S::PrefixElement(n), Token::Element(raw)) => {
                with_element(&raw, |tlv| match node.content_mut() {
                    Content::Signed(signed) => signed.decode_prefix_field(n, tlv),
                    Content::Enveloped(enveloped) => enveloped.decode_prefix_field(n, tlv),
                    Content::Digested(digested) => digested.decode_prefix_field(n, tlv),
                    Content::Encrypted(encrypted) => encrypted.decode_prefix_field(n, tlv),
                    Content::Data(_) | Content::Unknown(_) => {
                        Err(Error::InvalidState("level is not composite"))
                    }
                })?;
                S::Prefix(n + 1)
            }
            (S::InnerType, Token::Header(h)) if h.tag == OBJECT_IDENTIFIER => {
                tokenizer.capture()?;
                S::InnerTypeElement
            }
            (S::InnerTypeElement, Token::Element(raw)) => {
                let oid = with_element(&raw, asn1::decode_oid)?;
                let kind = ContentType::from_oid(&oid);
                *inner(node)? = ContentInfo::from_parts(oid, Content::empty(kind));
                self.waypoint(Waypoint::AfterContentType, node, cx)?;
                if self.is_encrypting() {
                    S::ContentAlgorithm
                } else {
                    S::ContentStart
                }
            }
            (S::ContentAlgorithm, Token::Header(h)) if h.tag == SEQUENCE => {
                tokenizer.capture()?;
                S::ContentAlgorithmElement
            }
            (S::ContentAlgorithmElement, Token::Element(raw)) => {
                let alg = asn1::decode_algorithm(&raw)?;
                if let Some(cipher) = cx.registry.cipher(&alg.oid) {
                    match node.content_mut() {
                        Content::Enveloped(enveloped) => enveloped.set_content_encryption(cipher),
                        Content::Encrypted(encrypted) => encrypted.set_content_encryption(cipher),
                        _ => {}
                    }
                }
                inner(node)?.content_enc_alg = Some(alg);
                S::ContentStart
            }
            (S::ContentStart, Token::Header(h)) if self.opens_content(&h) => {
                self.waypoint(Waypoint::BeforeContent, node, cx)?;
                if self.is_encrypting() {
                    tokenizer.stream()?;
                    S::Content
                } else {
                    tokenizer.enter()?;
                    S::ExplicitContent
                }
            }
            (S::ContentStart, Token::End) => {
                inner(node)?.set_detached(true);
                self.waypoint(Waypoint::AfterContent, node, cx)?;
                S::Suffix
            }
            (S::ExplicitContent, Token::Header(h))
                if h.tag == OCTET_STRING || h.tag == CONSTRUCTED_OCTET_STRING =>
            {
                tokenizer.stream()?;
                S::Content
            }
            (S::Content, Token::Content(bytes)) => {
                self.content(bytes, node, cx)?;
                S::Content
            }
            (S::Content, Token::End) => {
                self.waypoint(Waypoint::AfterContent, node, cx)?;
                if self.is_encrypting() {
                    S::InnerEnd
                } else {
                    S::ExplicitEnd
                }
            }
            (S::ExplicitEnd, Token::End) => S::InnerEnd,
            (S::InnerEnd, Token::End) => S::Suffix,
            (S::Suffix, Token::Header(_)) => {
                tokenizer.capture()?;
                S::SuffixElement
            }
            (S::SuffixElement, Token::Element(raw)) => {
                with_element(&raw, |tlv| match node.content_mut() {
                    Content::Signed(signed) => signed.decode_suffix_field(tlv),
                    Content::Enveloped(enveloped) => enveloped.decode_suffix_field(tlv),
                    Content::Digested(digested) => digested.decode_suffix_field(tlv),
                    Content::Encrypted(encrypted) => encrypted.decode_suffix_field(tlv),
                    Content::Data(_) | Content::Unknown(_) => {
                        Err(Error::InvalidState("level is not composite"))
                    }
                })?;
                S::Suffix
            }
            (S::Suffix, Token::End) => {
                self.waypoint(Waypoint::AfterEnd, node, cx)?;
                S::Done
            }
            (state, _) => {
                tracing::debug!(depth = self.depth, ?state, "unexpected token");
                return Err(Error::MalformedEncoding("unexpected element in content body"));
            }
        };
        Ok(())
    }

    /// Whether `header` introduces the nested content octets.
    fn opens_content(&self, header: &Header) -> bool {
        if self.is_encrypting() {
            header.tag == CONTEXT_0 || header.tag == CONTEXT_0_CONSTRUCTED
        } else {
            header.tag == CONTEXT_0_CONSTRUCTED
        }
    }

    /// Decrypt content octets and pass them on.
    fn content(
        &mut self,
        bytes: Vec<u8>,
        node: &mut ContentInfo,
        cx: &mut Context<'_, '_>,
    ) -> Result<()> {
        let nested = inner(node)?;
        if nested.decode_error.is_some() {
            return Ok(());
        }
        let plain = match nested.cipher_context.as_mut() {
            Some(cipher) => cipher.decrypt(&bytes, false)?,
            None => bytes,
        };
        self.deliver(&plain, nested, cx)
    }

    /// Digest plaintext and hand it to the child decoder, the sink or the
    /// Data node. `nested` is this level's nested node.
    fn deliver(
        &mut self,
        plain: &[u8],
        nested: &mut ContentInfo,
        cx: &mut Context<'_, '_>,
    ) -> Result<()> {
        if plain.is_empty() {
            return Ok(());
        }
        if let Some(digests) = nested.digest_context.as_mut() {
            digests.update(plain);
        }
        if let Some(child) = self.child.as_mut() {
            return child.push(plain, nested, cx);
        }
        match cx.sink.as_deref_mut() {
            Some(sink) => sink(plain),
            None => {
                if let Some(octets) = nested.octets_mut() {
                    octets.extend_from_slice(plain);
                }
            }
        }
        Ok(())
    }

    fn waypoint(
        &mut self,
        waypoint: Waypoint,
        node: &mut ContentInfo,
        cx: &mut Context<'_, '_>,
    ) -> Result<()> {
        tracing::trace!(depth = self.depth, kind = ?self.kind, ?waypoint, "decode");
        match waypoint {
            Waypoint::AfterContentType => Ok(()),
            Waypoint::BeforeContent => self.before_content(node, cx),
            Waypoint::AfterContent => self.after_content(node, cx),
            Waypoint::AfterEnd => self.after_end(node),
        }
    }

    /// Start digesting or decrypting, and create the child decoder.
    fn before_content(&mut self, node: &mut ContentInfo, cx: &mut Context<'_, '_>) -> Result<()> {
        match node.content_mut() {
            Content::Signed(signed) => {
                let digests = DigestAccumulator::start(signed.digest_algorithms(), cx.registry);
                signed.content_info_mut().digest_context = Some(digests);
            }
            Content::Digested(digested) => {
                let digests = digested.start_digest(cx.registry);
                digested.content_info_mut().digest_context = Some(digests);
            }
            Content::Enveloped(enveloped) => {
                let key = enveloped.unwrap_bulk_key(cx.keys)?;
                start_decrypt(enveloped.content_info_mut(), key, Error::MissingRecipientKey, cx)?;
            }
            Content::Encrypted(encrypted) => {
                let inner = encrypted.content_info_mut();
                let oid = inner
                    .content_enc_alg
                    .as_ref()
                    .map(|alg| alg.oid)
                    .ok_or(Error::MalformedEncoding("missing content-encryption algorithm"))?;
                let key = cx.keys.bulk_key(&oid);
                start_decrypt(inner, key, Error::MissingBulkKey, cx)?;
            }
            Content::Data(_) | Content::Unknown(_) => {
                return Err(Error::InvalidState("level is not composite"))
            }
        }

        let nested = inner(node)?;
        if nested.kind().is_composite() && nested.decode_error.is_none() {
            self.child = Some(Box::new(ChildDecoder::new(self.depth + 1, nested.kind())));
        }
        Ok(())
    }

    /// Flush the cipher, finish the child and store the computed digests.
    fn after_content(&mut self, node: &mut ContentInfo, cx: &mut Context<'_, '_>) -> Result<()> {
        let nested = inner(node)?;
        if let Some(mut cipher) = nested.cipher_context.take() {
            let tail = cipher.decrypt(&[], true)?;
            self.deliver(&tail, nested, cx)?;
        }
        if let Some(child) = self.child.as_mut() {
            child.finish()?;
            self.child = None;
        }

        match node.content_mut() {
            Content::Signed(signed) => {
                if let Some(digests) = signed.content_info_mut().digest_context.take() {
                    signed.store_digests(digests.finish());
                }
            }
            Content::Digested(digested) => {
                if let Some(digests) = digested.content_info_mut().digest_context.take() {
                    digested.finish_decode(digests);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn after_end(&mut self, node: &mut ContentInfo) -> Result<()> {
        match node.content_mut() {
            Content::Signed(signed) => signed.attach_digests(),
            Content::Digested(digested) => {
                if digested.digest_matches() == Some(false) {
                    tracing::debug!(depth = self.depth, "DigestedData digest mismatch");
                }
            }
            _ => {}
        }
        inner(node)?.release_contexts();
        Ok(())
    }

    /// Release every context, innermost level first.
    fn cancel(&mut self, node: &mut ContentInfo) {
        if let Some(nested) = node.child_content_info_mut() {
            if let Some(mut child) = self.child.take() {
                child.level.cancel(nested);
            }
            nested.release_contexts();
        }
        self.child = None;
        self.state = DecodeState::Done;
    }
}

/// Install a decryption context on `inner`, or record that its key is
/// unavailable so the subtree is skipped.
fn start_decrypt(
    inner: &mut ContentInfo,
    key: Option<zeroize::Zeroizing<Vec<u8>>>,
    missing: Error,
    cx: &Context<'_, '_>,
) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => {
            tracing::warn!(error = %missing, "leaving encrypted content undecoded");
            inner.decode_error = Some(missing);
            return Ok(());
        }
    };
    let alg = inner
        .content_enc_alg
        .as_ref()
        .ok_or(Error::MalformedEncoding("missing content-encryption algorithm"))?;
    inner.cipher_context = Some(CipherContext::start_decrypt(&key, alg, cx.registry)?);
    Ok(())
}

/// Decoder for nested content, fed with the plaintext octets of its parent.
#[derive(Debug)]
struct ChildDecoder {
    tokenizer: Tokenizer,
    level: LevelDecoder,
}

impl ChildDecoder {
    fn new(depth: usize, kind: ContentType) -> Self {
        Self {
            tokenizer: Tokenizer::new(),
            level: LevelDecoder::new(depth, kind),
        }
    }

    fn push(
        &mut self,
        data: &[u8],
        node: &mut ContentInfo,
        cx: &mut Context<'_, '_>,
    ) -> Result<()> {
        self.tokenizer.push(data);
        while let Some(token) = self.tokenizer.next_token()? {
            self.level.token(token, &mut self.tokenizer, node, cx)?;
        }
        if self.tokenizer.is_done() && self.tokenizer.has_unconsumed_input() {
            return Err(Error::MalformedEncoding("trailing data after nested content"));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.tokenizer.is_done() || !self.level.is_done() {
            return Err(Error::MalformedEncoding("nested content is truncated"));
        }
        Ok(())
    }
}

/// Position in the root `ContentInfo`.
#[derive(Debug)]
enum RootState {
    Start,
    ContentType,
    ContentTypeElement,
    /// Awaiting `[0]`, or the end of a `ContentInfo` without content.
    Explicit,
    Body(LevelDecoder),
    DataHeader,
    Data,
    DataEnd,
    Opaque,
    OpaqueElement,
    Closing,
    Done,
}

/// Streaming decoder producing a [`Message`].
///
/// Data content is passed to the sink when one is installed with
/// [`with_sink`][Self::with_sink], and otherwise accumulated in the Data
/// node of the decoded message.
///
/// An EnvelopedData or EncryptedData level whose key the callbacks cannot
/// supply is not an error: its encrypted octets are skipped, the nested
/// `ContentInfo` records the reason in
/// [`decode_error`][ContentInfo::decode_error], and the rest of the message
/// decodes normally. Any other failure is sticky.
pub struct Decoder<'a> {
    keys: &'a dyn KeyCallbacks,
    registry: AlgorithmRegistry,
    sink: Option<Box<dyn FnMut(&[u8]) + 'a>>,
    tokenizer: Tokenizer,
    state: RootState,
    root: ContentInfo,
    error: Option<Error>,
}

impl<'a> Decoder<'a> {
    /// Decoder using `keys` for decryption keys.
    pub fn new(keys: &'a dyn KeyCallbacks) -> Self {
        Self {
            keys,
            registry: AlgorithmRegistry::default(),
            sink: None,
            tokenizer: Tokenizer::new(),
            state: RootState::Start,
            root: ContentInfo::data(Vec::new()),
            error: None,
        }
    }

    /// Stream Data content to `sink` instead of accumulating it.
    pub fn with_sink(mut self, sink: impl FnMut(&[u8]) + 'a) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Use `registry` instead of the default algorithm registry.
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Decode the next chunk of the encoding.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let result = self.consume(data);
        if let Err(err) = &result {
            tracing::debug!(error = %err, "decoding failed");
            self.release();
            self.error = Some(err.clone());
        }
        result
    }

    /// Complete decoding and return the message.
    ///
    /// Fails unless exactly one complete `ContentInfo` was supplied.
    pub fn finish(mut self) -> Result<Message> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if !matches!(self.state, RootState::Done) || !self.tokenizer.is_done() {
            self.release();
            return Err(Error::MalformedEncoding("encoding is truncated"));
        }
        tracing::debug!(content_type = %self.root.content_type(), "decoding finished");
        Ok(Message::new(self.root))
    }

    /// Abandon decoding, releasing every digest and cipher context.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Drop every digest and cipher context, innermost level first.
    fn release(&mut self) {
        if let RootState::Body(level) = &mut self.state {
            level.cancel(&mut self.root);
        }
        self.root.release_all_contexts();
        self.state = RootState::Done;
    }

    fn consume(&mut self, data: &[u8]) -> Result<()> {
        if self.tokenizer.is_done() && !data.is_empty() {
            return Err(Error::MalformedEncoding("trailing data after ContentInfo"));
        }
        self.tokenizer.push(data);

        let mut cx = Context {
            keys: self.keys,
            registry: &self.registry,
            sink: self.sink.as_deref_mut(),
        };
        while let Some(token) = self.tokenizer.next_token()? {
            let state = core::mem::replace(&mut self.state, RootState::Done);
            self.state = root_token(state, token, &mut self.tokenizer, &mut self.root, &mut cx)?;
        }

        if self.tokenizer.is_done() && self.tokenizer.has_unconsumed_input() {
            return Err(Error::MalformedEncoding("trailing data after ContentInfo"));
        }
        Ok(())
    }
}

/// Advance the root `ContentInfo` state machine by one token.
fn root_token(
    state: RootState,
    token: Token,
    tokenizer: &mut Tokenizer,
    root: &mut ContentInfo,
    cx: &mut Context<'_, '_>,
) -> Result<RootState> {
    use RootState as S;

    Ok(match (state, token) {
        (S::Start, Token::Header(h)) if h.tag == SEQUENCE => {
            tokenizer.enter()?;
            S::ContentType
        }
        (S::ContentType, Token::Header(h)) if h.tag == OBJECT_IDENTIFIER => {
            tokenizer.capture()?;
            S::ContentTypeElement
        }
        (S::ContentTypeElement, Token::Element(raw)) => {
            let oid = with_element(&raw, asn1::decode_oid)?;
            let kind = ContentType::from_oid(&oid);
            if kind == ContentType::Unknown {
                tracing::debug!(%oid, "passing through content of unknown type");
            }
            *root = ContentInfo::from_parts(oid, Content::empty(kind));
            S::Explicit
        }
        (S::Explicit, Token::Header(h)) if h.tag == CONTEXT_0_CONSTRUCTED => {
            tokenizer.enter()?;
            match root.kind() {
                kind if kind.is_composite() => S::Body(LevelDecoder::new(0, kind)),
                ContentType::Unknown => S::Opaque,
                _ => S::DataHeader,
            }
        }
        (S::Explicit, Token::End) => {
            root.set_detached(true);
            S::Done
        }
        (S::Body(level), Token::End) if level.is_done() => S::Closing,
        (S::Body(mut level), token) => {
            level.token(token, tokenizer, root, cx)?;
            S::Body(level)
        }
        (S::DataHeader, Token::Header(h))
            if h.tag == OCTET_STRING || h.tag == CONSTRUCTED_OCTET_STRING =>
        {
            tokenizer.stream()?;
            S::Data
        }
        (S::Data, Token::Content(bytes)) => {
            match cx.sink.as_deref_mut() {
                Some(sink) => sink(&bytes),
                None => {
                    if let Some(octets) = root.octets_mut() {
                        octets.extend_from_slice(&bytes);
                    }
                }
            }
            S::Data
        }
        (S::Data, Token::End) => S::DataEnd,
        (S::DataEnd, Token::End) => S::Closing,
        (S::Opaque, Token::Header(_)) => {
            tokenizer.capture()?;
            S::OpaqueElement
        }
        (S::OpaqueElement, Token::Element(raw)) => {
            if let Some(octets) = root.octets_mut() {
                octets.extend_from_slice(&raw);
            }
            S::Opaque
        }
        (S::Opaque, Token::End) => S::Closing,
        (S::Closing, Token::End) => S::Done,
        _ => return Err(Error::MalformedEncoding("unexpected element in ContentInfo")),
    })
}

impl core::fmt::Debug for Decoder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Decoder")
            .field("state", &self.state)
            .field("root", &self.root)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Decode a complete encoding in one call.
pub fn decode(encoding: &[u8], keys: &dyn KeyCallbacks) -> Result<Message> {
    let mut decoder = Decoder::new(keys);
    decoder.update(encoding)?;
    decoder.finish()
}
