//! BER/DER plumbing: tag constants, header parsing and writing, a slice
//! parser for metadata and the push [`Tokenizer`] the engines are built on.
//!
//! Only low tag numbers (single identifier octet) are supported, which covers
//! every structure CMS defines.

mod parser;
mod tokenizer;

pub use self::parser::{Parser, Tlv};
pub use self::tokenizer::{Token, Tokenizer};

use alloc::vec::Vec;
use const_oid::ObjectIdentifier;
use der::asn1::AnyRef;
use der::{Decode, Encode, Reader, SliceReader, Tag};
use spki::AlgorithmIdentifierOwned;

use crate::errors::{Error, Result};

pub(crate) const EOC: u8 = 0x00;
pub(crate) const INTEGER: u8 = 0x02;
pub(crate) const OCTET_STRING: u8 = 0x04;
pub(crate) const OBJECT_IDENTIFIER: u8 = 0x06;
pub(crate) const CONSTRUCTED_OCTET_STRING: u8 = 0x24;
pub(crate) const SEQUENCE: u8 = 0x30;
pub(crate) const SET: u8 = 0x31;
pub(crate) const CONTEXT_0: u8 = 0x80;
pub(crate) const CONTEXT_0_CONSTRUCTED: u8 = 0xa0;
pub(crate) const CONTEXT_1_CONSTRUCTED: u8 = 0xa1;

const CONSTRUCTED: u8 = 0x20;
const HIGH_TAG_NUMBER: u8 = 0x1f;

/// Longest length field accepted, in octets.
const MAX_LENGTH_OCTETS: usize = 4;

/// Identifier and length octets of one encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    /// Identifier octet.
    pub tag: u8,
    /// Content length, `None` for the indefinite form.
    pub length: Option<usize>,
    /// Number of octets the identifier and length occupy.
    pub header_len: usize,
}

impl Header {
    /// Whether the encoding is constructed.
    pub fn is_constructed(&self) -> bool {
        self.tag & CONSTRUCTED != 0
    }

    /// Whether this is an end-of-contents marker.
    pub fn is_eoc(&self) -> bool {
        self.tag == EOC
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` is too short to hold the whole header.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let (tag, first) = match buf {
            [tag, first, ..] => (*tag, *first),
            _ => return Ok(None),
        };
        if tag & HIGH_TAG_NUMBER == HIGH_TAG_NUMBER {
            return Err(Error::MalformedEncoding("high tag numbers are not supported"));
        }

        let header = if first < 0x80 {
            Self {
                tag,
                length: Some(first as usize),
                header_len: 2,
            }
        } else if first == 0x80 {
            if tag & CONSTRUCTED == 0 {
                return Err(Error::MalformedEncoding("indefinite length on a primitive encoding"));
            }
            Self {
                tag,
                length: None,
                header_len: 2,
            }
        } else {
            let n = (first & 0x7f) as usize;
            if n > MAX_LENGTH_OCTETS {
                return Err(Error::MalformedEncoding("length field too long"));
            }
            if buf.len() < 2 + n {
                return Ok(None);
            }
            let length = buf[2..2 + n]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            Self {
                tag,
                length: Some(length),
                header_len: 2 + n,
            }
        };

        if header.is_eoc() && header.length != Some(0) {
            return Err(Error::MalformedEncoding("end-of-contents with non-zero length"));
        }
        Ok(Some(header))
    }
}

/// Maximum nesting of constructed encodings accepted anywhere.
pub(crate) const MAX_DEPTH: usize = 64;

/// Total length of the element at the front of `buf`, following
/// indefinite-length encodings down to their end-of-contents markers.
///
/// Returns `Ok(None)` when the element is not complete yet.
pub fn element_len(buf: &[u8]) -> Result<Option<usize>> {
    element_len_at(buf, 0)
}

fn element_len_at(buf: &[u8], depth: usize) -> Result<Option<usize>> {
    if depth > MAX_DEPTH {
        return Err(Error::MalformedEncoding("nesting too deep"));
    }
    let header = match Header::parse(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };

    match header.length {
        Some(len) => {
            let total = header
                .header_len
                .checked_add(len)
                .ok_or(Error::MalformedEncoding("length overflow"))?;
            Ok((buf.len() >= total).then_some(total))
        }
        None => {
            let mut offset = header.header_len;
            loop {
                match Header::parse(&buf[offset..])? {
                    None => return Ok(None),
                    Some(inner) if inner.is_eoc() => return Ok(Some(offset + 2)),
                    Some(_) => match element_len_at(&buf[offset..], depth + 1)? {
                        Some(n) => offset += n,
                        None => return Ok(None),
                    },
                }
            }
        }
    }
}

/// Append an indefinite-length header for a constructed encoding.
pub fn write_indefinite(out: &mut Vec<u8>, tag: u8) {
    out.push(tag | CONSTRUCTED);
    out.push(0x80);
}

/// Append an end-of-contents marker.
pub fn write_eoc(out: &mut Vec<u8>) {
    out.extend_from_slice(&[EOC, 0x00]);
}

/// Append a complete definite-length TLV.
pub fn write_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<()> {
    der::Header::new(Tag::try_from(tag)?, value.len())?.encode_to_vec(out)?;
    out.extend_from_slice(value);
    Ok(())
}

/// Encode a complete definite-length TLV.
pub fn tlv(tag: u8, value: &[u8]) -> Result<Vec<u8>> {
    Ok(AnyRef::new(Tag::try_from(tag)?, value)?.to_der()?)
}

/// Encode an OBJECT IDENTIFIER.
pub fn encode_oid(oid: &ObjectIdentifier) -> Result<Vec<u8>> {
    Ok(oid.to_der()?)
}

/// Encode a version field.
pub fn encode_version(version: u8) -> Result<Vec<u8>> {
    Ok(version.to_der()?)
}

/// Decode a version field from its complete TLV.
pub fn decode_version(tlv: &Tlv<'_>) -> Result<u8> {
    Ok(u8::from_der(tlv.raw)?)
}

/// Encode an algorithm identifier as DER.
pub fn encode_algorithm(alg: &AlgorithmIdentifierOwned) -> Result<Vec<u8>> {
    Ok(alg.to_der()?)
}

/// Decode an algorithm identifier from a complete DER TLV.
pub fn decode_algorithm(der: &[u8]) -> Result<AlgorithmIdentifierOwned> {
    Ok(AlgorithmIdentifierOwned::from_der(der)?)
}

/// Encode items as a `SET OF`, in the order given.
pub fn encode_set_of<T: Encode>(items: &[T]) -> Result<Vec<u8>> {
    let mut contents = Vec::new();
    for item in items {
        item.encode_to_vec(&mut contents)?;
    }
    tlv(SET, &contents)
}

/// Decode the elements of a complete `SET OF` TLV, in wire order.
pub fn decode_set_of<'a, T: Decode<'a>>(der: &'a [u8]) -> Result<Vec<T>> {
    let mut reader = SliceReader::new(der)?;
    let header = der::Header::decode(&mut reader)?;
    header.tag.assert_eq(Tag::Set)?;
    let items = reader.read_nested(header.length, |reader| {
        let mut items = Vec::new();
        while !reader.is_finished() {
            items.push(reader.decode()?);
        }
        Ok(items)
    })?;
    Ok(reader.finish(items)?)
}

/// Object identifier from its contents octets.
///
/// `ObjectIdentifier::from_bytes` refuses two-octet encodings such as
/// `1.2.3`, which `ObjectIdentifier::new` accepts, so those are rebuilt from
/// their arcs. The result must encode back to exactly `bytes`.
pub fn oid_from_contents(bytes: &[u8]) -> const_oid::Result<ObjectIdentifier> {
    if bytes.len() != 2 {
        return ObjectIdentifier::from_bytes(bytes);
    }

    let mut arcs = Vec::with_capacity(3);
    let mut acc: u32 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        acc = (acc << 7) | u32::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (acc / 40).min(2);
                arcs.push(first);
                arcs.push(acc - first * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        } else if i + 1 == bytes.len() {
            return Err(const_oid::Error::Base128);
        }
    }

    let oid = ObjectIdentifier::from_arcs(arcs)?;
    if oid.as_bytes() != bytes {
        return Err(const_oid::Error::Base128);
    }
    Ok(oid)
}

/// Decode an OBJECT IDENTIFIER TLV.
pub fn decode_oid(tlv: &Tlv<'_>) -> Result<ObjectIdentifier> {
    if tlv.tag != OBJECT_IDENTIFIER {
        return Err(Error::MalformedEncoding("expected OBJECT IDENTIFIER"));
    }
    Ok(oid_from_contents(tlv.value)?)
}

/// Read an OBJECT IDENTIFIER field with the same rules as [`decode_oid`].
pub(crate) fn read_oid<'a, R: Reader<'a>>(reader: &mut R) -> der::Result<ObjectIdentifier> {
    let header = der::Header::decode(reader)?;
    header.tag.assert_eq(Tag::ObjectIdentifier)?;
    Ok(oid_from_contents(reader.read_slice(header.length)?)?)
}
