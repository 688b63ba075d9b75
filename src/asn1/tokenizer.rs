//! Push tokenizer for BER streams.
//!
//! Bytes are pushed in arbitrary chunks and tokens are pulled back out. Each
//! [`Token::Header`] must be answered with exactly one directive before the
//! next token is requested:
//!
//! - [`Tokenizer::enter`] descends into a constructed encoding; its children
//!   follow and a [`Token::End`] closes it.
//! - [`Tokenizer::capture`] buffers the whole encoding and returns it as a
//!   single [`Token::Element`].
//! - [`Tokenizer::stream`] delivers the value octets of a string type as
//!   [`Token::Content`] chunks followed by [`Token::End`], flattening
//!   constructed (segmented) encodings on the way.

use alloc::vec::Vec;

use super::{element_len, Header, CONSTRUCTED_OCTET_STRING, MAX_DEPTH, OCTET_STRING};
use crate::errors::{Error, Result};

/// Consumed input is compacted away once this many bytes have accumulated.
const COMPACT_THRESHOLD: usize = 4096;

/// Unit of tokenizer output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token {
    /// Identifier and length of the next element. A directive is required.
    Header(Header),
    /// A complete captured element, header included.
    Element(Vec<u8>),
    /// Value octets of a streamed element.
    Content(Vec<u8>),
    /// A streamed or entered element is complete.
    End,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FrameKind {
    Constructed,
    Stream { root: bool },
}

#[derive(Clone, Copy, Debug)]
struct Frame {
    remaining: Option<usize>,
    kind: FrameKind,
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    Scan,
    Pending(Header),
    Capture,
    Primitive { remaining: usize, root: bool },
}

/// Incremental BER tokenizer for a single top-level element.
#[derive(Debug)]
pub struct Tokenizer {
    buf: Vec<u8>,
    pos: usize,
    frames: Vec<Frame>,
    mode: Mode,
    done: bool,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    /// Tokenizer expecting one top-level element.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            frames: Vec::new(),
            mode: Mode::Scan,
            done: false,
        }
    }

    /// Append input.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Whether the top-level element has been completely consumed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether input has been pushed that no token has consumed yet.
    pub fn has_unconsumed_input(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Number of open constructed encodings.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pull the next token, or `None` if more input is needed.
    pub fn next_token(&mut self) -> Result<Option<Token>> {
        loop {
            match self.mode {
                Mode::Pending(_) => {
                    return Err(Error::InvalidState("a directive is required after a header"))
                }
                Mode::Capture => {
                    return match element_len(self.available())? {
                        Some(total) => {
                            let raw = self.available()[..total].to_vec();
                            self.consume(total)?;
                            self.mode = Mode::Scan;
                            self.element_closed();
                            Ok(Some(Token::Element(raw)))
                        }
                        None => Ok(None),
                    };
                }
                Mode::Primitive { remaining: 0, root } => {
                    self.mode = Mode::Scan;
                    if root {
                        self.element_closed();
                        return Ok(Some(Token::End));
                    }
                    continue;
                }
                Mode::Primitive { remaining, root } => {
                    let n = remaining.min(self.available().len());
                    if n == 0 {
                        return Ok(None);
                    }
                    let chunk = self.available()[..n].to_vec();
                    self.consume(n)?;
                    self.mode = Mode::Primitive {
                        remaining: remaining - n,
                        root,
                    };
                    return Ok(Some(Token::Content(chunk)));
                }
                Mode::Scan => {}
            }

            if let Some(frame) = self.frames.last().copied() {
                if frame.remaining == Some(0) {
                    self.frames.pop();
                    self.element_closed();
                    match frame.kind {
                        FrameKind::Stream { root: false } => continue,
                        _ => return Ok(Some(Token::End)),
                    }
                }
            }
            if self.done {
                return Ok(None);
            }

            let header = match Header::parse(self.available())? {
                Some(header) => header,
                None => return Ok(None),
            };

            if header.is_eoc() {
                let frame = match self.frames.pop() {
                    Some(frame) if frame.remaining.is_none() => frame,
                    _ => return Err(Error::MalformedEncoding("unexpected end-of-contents")),
                };
                self.consume(2)?;
                self.element_closed();
                match frame.kind {
                    FrameKind::Stream { root: false } => continue,
                    _ => return Ok(Some(Token::End)),
                }
            }

            self.check_fits(&header)?;

            let in_stream = matches!(
                self.frames.last(),
                Some(Frame {
                    kind: FrameKind::Stream { .. },
                    ..
                })
            );
            if !in_stream {
                self.mode = Mode::Pending(header);
                return Ok(Some(Token::Header(header)));
            }

            self.consume(header.header_len)?;
            match (header.tag, header.length) {
                (OCTET_STRING, Some(len)) => {
                    self.mode = Mode::Primitive {
                        remaining: len,
                        root: false,
                    }
                }
                (CONSTRUCTED_OCTET_STRING, length) => {
                    self.push_frame(length, FrameKind::Stream { root: false })?
                }
                _ => {
                    return Err(Error::MalformedEncoding(
                        "unexpected element inside segmented content",
                    ))
                }
            }
        }
    }

    /// Descend into the constructed element whose header was just returned.
    pub fn enter(&mut self) -> Result<()> {
        let header = self.take_pending()?;
        if !header.is_constructed() {
            return Err(Error::MalformedEncoding("expected a constructed encoding"));
        }
        self.consume(header.header_len)?;
        self.push_frame(header.length, FrameKind::Constructed)
    }

    /// Deliver the element whose header was just returned as one
    /// [`Token::Element`].
    pub fn capture(&mut self) -> Result<()> {
        self.take_pending()?;
        self.mode = Mode::Capture;
        Ok(())
    }

    /// Stream the value octets of the element whose header was just returned.
    pub fn stream(&mut self) -> Result<()> {
        let header = self.take_pending()?;
        self.consume(header.header_len)?;
        match header.length {
            Some(len) if !header.is_constructed() => {
                self.mode = Mode::Primitive {
                    remaining: len,
                    root: true,
                };
                Ok(())
            }
            length => self.push_frame(length, FrameKind::Stream { root: true }),
        }
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn take_pending(&mut self) -> Result<Header> {
        match self.mode {
            Mode::Pending(header) => {
                self.mode = Mode::Scan;
                Ok(header)
            }
            _ => Err(Error::InvalidState("no header awaiting a directive")),
        }
    }

    fn push_frame(&mut self, remaining: Option<usize>, kind: FrameKind) -> Result<()> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(Error::MalformedEncoding("nesting too deep"));
        }
        self.frames.push(Frame { remaining, kind });
        Ok(())
    }

    fn check_fits(&self, header: &Header) -> Result<()> {
        let parent = self.frames.iter().rev().find_map(|f| f.remaining);
        match (parent, header.length) {
            (Some(room), Some(len)) if header.header_len.saturating_add(len) > room => {
                Err(Error::MalformedEncoding("element overruns its container"))
            }
            _ => Ok(()),
        }
    }

    fn element_closed(&mut self) {
        if self.frames.is_empty() {
            self.done = true;
        }
    }

    fn consume(&mut self, n: usize) -> Result<()> {
        for frame in self.frames.iter_mut() {
            if let Some(remaining) = frame.remaining.as_mut() {
                *remaining = remaining
                    .checked_sub(n)
                    .ok_or(Error::MalformedEncoding("element overruns its container"))?;
            }
        }

        self.pos += n;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::{OBJECT_IDENTIFIER, SEQUENCE};
    use hex_literal::hex;

    /// Drive `input` through a tokenizer in chunks of `chunk` bytes, entering
    /// sequences, capturing OIDs and integers and streaming everything else.
    fn tokens(input: &[u8], chunk: usize) -> Result<Vec<Token>> {
        let mut tokenizer = Tokenizer::new();
        let mut out = Vec::new();
        for piece in input.chunks(chunk) {
            tokenizer.push(piece);
            while let Some(token) = tokenizer.next_token()? {
                if let Token::Header(header) = &token {
                    match header.tag {
                        SEQUENCE | 0xa0 => tokenizer.enter()?,
                        OBJECT_IDENTIFIER | 0x02 => tokenizer.capture()?,
                        _ => tokenizer.stream()?,
                    }
                }
                out.push(token);
            }
        }
        assert!(tokenizer.is_done());
        Ok(out)
    }

    fn merged_content(tokens: &[Token]) -> Vec<u8> {
        tokens
            .iter()
            .filter_map(|t| match t {
                Token::Content(c) => Some(c.as_slice()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    #[test]
    fn indefinite_structure_is_chunking_independent() {
        // SEQUENCE { OID 1.2, [0] { OCTET STRING (constructed) { "ab", "", "cde" } } }
        let ber = hex!("3080 06012a a080 2480 04026162 0400 0403636465 0000 0000 0000");

        let whole = tokens(&ber, ber.len()).unwrap();
        for chunk in 1..ber.len() {
            let pieces = tokens(&ber, chunk).unwrap();
            assert_eq!(merged_content(&pieces), b"abcde");
            let structure: Vec<_> = pieces
                .iter()
                .filter(|t| !matches!(t, Token::Content(_)))
                .collect();
            let expected: Vec<_> = whole
                .iter()
                .filter(|t| !matches!(t, Token::Content(_)))
                .collect();
            assert_eq!(structure, expected);
        }

        // every element is announced by its header before the directive
        assert!(matches!(&whole[1], Token::Header(h) if h.tag == OBJECT_IDENTIFIER));
        assert_eq!(whole[2], Token::Element(hex!("06012a").to_vec()));
        assert_eq!(
            whole.iter().filter(|t| **t == Token::End).count(),
            3,
            "stream, [0] and SEQUENCE each end once"
        );
    }

    #[test]
    fn definite_structure() {
        let der = hex!("300b 06012a a006 0404 01020304");
        let toks = tokens(&der, 3).unwrap();
        assert_eq!(merged_content(&toks), [1, 2, 3, 4]);
        assert_eq!(toks.last(), Some(&Token::End));
    }

    #[test]
    fn empty_primitive_stream_ends_immediately() {
        let toks = tokens(&hex!("3002 0400"), 1).unwrap();
        assert_eq!(
            toks,
            [
                Token::Header(Header {
                    tag: SEQUENCE,
                    length: Some(2),
                    header_len: 2
                }),
                Token::Header(Header {
                    tag: OCTET_STRING,
                    length: Some(0),
                    header_len: 2
                }),
                Token::End,
                Token::End,
            ]
        );
    }

    #[test]
    fn overrun_is_malformed() {
        assert!(tokens(&hex!("3003 0403aabbcc"), 8).is_err());
        assert!(tokens(&hex!("3003 3080 0000 00"), 8).is_err());
    }

    #[test]
    fn stray_end_of_contents_is_malformed() {
        assert!(tokens(&hex!("3002 0000"), 4).is_err());
    }

    #[test]
    fn foreign_element_inside_segments_is_malformed() {
        assert!(tokens(&hex!("3080 2480 020101 0000 0000"), 11).is_err());
    }

    #[test]
    fn directive_is_required() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.push(&hex!("3000"));
        assert!(matches!(tokenizer.next_token(), Ok(Some(Token::Header(_)))));
        assert!(tokenizer.next_token().is_err());
        assert!(tokenizer.enter().is_ok());
        assert!(tokenizer.enter().is_err());
    }

    #[test]
    fn trailing_input_is_visible() {
        let mut tokenizer = Tokenizer::new();
        tokenizer.push(&hex!("0400 ff"));
        assert!(matches!(tokenizer.next_token(), Ok(Some(Token::Header(_)))));
        tokenizer.stream().unwrap();
        assert_eq!(tokenizer.next_token().unwrap(), Some(Token::End));
        assert!(tokenizer.is_done());
        assert!(tokenizer.has_unconsumed_input());
        assert_eq!(tokenizer.next_token().unwrap(), None);
    }
}
