//! Slice parser for complete encodings.

use super::{element_len, Header};
use crate::errors::{Error, Result};

/// One complete element borrowed from the input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tlv<'a> {
    /// Identifier octet.
    pub tag: u8,
    /// Content octets, without an indefinite-length end-of-contents marker.
    pub value: &'a [u8],
    /// The whole encoding, header included.
    pub raw: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Parser over the content octets of this element.
    pub fn parser(&self) -> Parser<'a> {
        Parser::new(self.value)
    }
}

/// Reads consecutive elements from a byte slice.
///
/// Definite and indefinite lengths are both accepted, so captured BER
/// metadata can be read without re-encoding.
#[derive(Clone, Debug)]
pub struct Parser<'a> {
    input: &'a [u8],
}

impl<'a> Parser<'a> {
    /// Parse `input`.
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Whether all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Tag of the next element, if any.
    pub fn peek_tag(&self) -> Option<u8> {
        self.input.first().copied()
    }

    /// Read the next element, `None` at the end of input.
    pub fn next_tlv(&mut self) -> Result<Option<Tlv<'a>>> {
        if self.input.is_empty() {
            return Ok(None);
        }
        let header = Header::parse(self.input)?.ok_or(Error::MalformedEncoding("truncated header"))?;
        if header.is_eoc() {
            return Err(Error::MalformedEncoding("unexpected end-of-contents"));
        }
        let total = element_len(self.input)?.ok_or(Error::MalformedEncoding("truncated element"))?;

        let (raw, rest) = self.input.split_at(total);
        let value = match header.length {
            Some(_) => &raw[header.header_len..],
            None => &raw[header.header_len..total - 2],
        };
        self.input = rest;
        Ok(Some(Tlv {
            tag: header.tag,
            value,
            raw,
        }))
    }

    /// Read the next element and require its tag to be `tag`.
    pub fn expect(&mut self, tag: u8) -> Result<Tlv<'a>> {
        match self.next_tlv()? {
            Some(tlv) if tlv.tag == tag => Ok(tlv),
            Some(_) => Err(Error::MalformedEncoding("unexpected tag")),
            None => Err(Error::MalformedEncoding("missing element")),
        }
    }

    /// Read the next element only if its tag is `tag`.
    pub fn optional(&mut self, tag: u8) -> Result<Option<Tlv<'a>>> {
        if self.peek_tag() == Some(tag) {
            self.next_tlv()
        } else {
            Ok(None)
        }
    }

    /// Fail if any input is left.
    pub fn finish(self) -> Result<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(Error::MalformedEncoding("trailing data"))
        }
    }
}

impl<'a> Iterator for Parser<'a> {
    type Item = Result<Tlv<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_tlv() {
            Ok(Some(tlv)) => Some(Ok(tlv)),
            Ok(None) => None,
            Err(err) => {
                self.input = &[];
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn reads_definite_and_indefinite_elements() {
        let input = hex!("020101 3080 0400 0000 a003 050100");
        let mut parser = Parser::new(&input);

        let int = parser.expect(0x02).unwrap();
        assert_eq!(int.value, &[1]);

        let seq = parser.expect(0x30).unwrap();
        assert_eq!(seq.value, &hex!("0400"));
        assert_eq!(seq.raw.len(), 6);

        assert_eq!(parser.optional(0xa1).unwrap(), None);
        let tagged = parser.optional(0xa0).unwrap().unwrap();
        assert_eq!(tagged.parser().expect(0x05).unwrap().value, &[0]);
        parser.finish().unwrap();
    }

    #[test]
    fn truncation_and_trailing_data() {
        assert!(Parser::new(&hex!("0403aa")).next_tlv().is_err());
        assert!(Parser::new(&hex!("0000")).next_tlv().is_err());

        let input = hex!("0500 ff");
        let mut parser = Parser::new(&input);
        parser.expect(0x05).unwrap();
        assert!(parser.finish().is_err());
    }

    #[test]
    fn iterates_elements() {
        let input = hex!("0101ff 0101 00");
        let values: Vec<_> = Parser::new(&input)
            .map(|tlv| tlv.unwrap().value.to_vec())
            .collect();
        assert_eq!(values, [vec![0xff], vec![0x00]]);
    }
}
