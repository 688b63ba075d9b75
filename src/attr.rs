//! Signed and unsigned attributes ([RFC 5652 § 5.3]).
//!
//! An attribute is an OID plus a non-empty set of values. The way each value
//! is encoded is chosen from the attribute's OID: `content-type` values are
//! object identifiers, `message-digest` values are octet strings, and
//! everything else is carried as an opaque, already-encoded `ANY`.
//!
//! [RFC 5652 § 5.3]: https://datatracker.ietf.org/doc/html/rfc5652#section-5.3

use alloc::vec::Vec;
use const_oid::ObjectIdentifier;
use der::asn1::{
    Any, AnyRef, ContextSpecific, ContextSpecificRef, GeneralizedTime, OctetString,
    OctetStringRef, UtcTime,
};
use der::{
    DateTime, Decode, DecodeValue, Encode, EncodeValue, FixedTag, Header, Length, Reader,
    Sequence, SliceReader, Tag, TagMode, TagNumber, Writer,
};

use crate::asn1;
use crate::errors::Result;
use crate::oid;
use crate::sort;

/// How the values of an attribute are encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ValueKind {
    ObjectIdentifier,
    OctetString,
    Any,
}

impl ValueKind {
    fn for_oid(oid: &ObjectIdentifier) -> Self {
        match *oid {
            oid::ID_CONTENT_TYPE => Self::ObjectIdentifier,
            oid::ID_MESSAGE_DIGEST => Self::OctetString,
            _ => Self::Any,
        }
    }

    fn encode(self, value: &[u8]) -> der::Result<Vec<u8>> {
        match self {
            Self::ObjectIdentifier => AnyRef::new(Tag::ObjectIdentifier, value)?.to_der(),
            Self::OctetString => OctetStringRef::new(value)?.to_der(),
            Self::Any => Ok(value.to_vec()),
        }
    }

    fn decode<'a, R: Reader<'a>>(self, reader: &mut R) -> der::Result<Vec<u8>> {
        match self {
            Self::ObjectIdentifier => Ok(asn1::read_oid(reader)?.as_bytes().to_vec()),
            Self::OctetString => Ok(OctetString::decode(reader)?.into_bytes()),
            Self::Any => Ok(reader.tlv_bytes()?.to_vec()),
        }
    }
}

/// One attribute.
///
/// Values are stored unencoded (the OID arcs of a content type, the octets of
/// a message digest, a complete TLV for anything else) unless the attribute
/// was built with [`Attribute::from_encoded`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    oid: ObjectIdentifier,
    encoded: bool,
    values: Vec<Vec<u8>>,
}

impl Attribute {
    /// New attribute with an optional first value.
    pub fn new(oid: ObjectIdentifier, value: Option<Vec<u8>>) -> Self {
        Self {
            oid,
            encoded: false,
            values: value.into_iter().collect(),
        }
    }

    /// Attribute whose values are already complete DER encodings.
    pub fn from_encoded(oid: ObjectIdentifier, values: Vec<Vec<u8>>) -> Self {
        Self {
            oid,
            encoded: true,
            values,
        }
    }

    /// `content-type` attribute.
    pub fn content_type(content_type: &ObjectIdentifier) -> Self {
        Self::new(oid::ID_CONTENT_TYPE, Some(content_type.as_bytes().to_vec()))
    }

    /// `message-digest` attribute.
    pub fn message_digest(digest: &[u8]) -> Self {
        Self::new(oid::ID_MESSAGE_DIGEST, Some(digest.to_vec()))
    }

    /// `signing-time` attribute.
    ///
    /// Dates through 2049 are encoded as `UTCTime`, later ones as
    /// `GeneralizedTime` ([RFC 5652 § 11.3]).
    ///
    /// [RFC 5652 § 11.3]: https://datatracker.ietf.org/doc/html/rfc5652#section-11.3
    pub fn signing_time(time: DateTime) -> Result<Self> {
        let value = match UtcTime::from_date_time(time) {
            Ok(utc) => utc.to_der()?,
            Err(_) => GeneralizedTime::from_date_time(time).to_der()?,
        };
        Ok(Self::new(oid::ID_SIGNING_TIME, Some(value)))
    }

    /// `signing-time` attribute for the given system time.
    pub fn signing_time_from_system_time(time: std::time::SystemTime) -> Result<Self> {
        Self::signing_time(DateTime::from_system_time(time)?)
    }

    /// Attribute type.
    pub fn oid(&self) -> ObjectIdentifier {
        self.oid
    }

    /// Whether the values are stored as complete DER encodings.
    pub fn is_encoded(&self) -> bool {
        self.encoded
    }

    /// All values.
    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    /// First value, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.values.first().map(Vec::as_slice)
    }

    /// Append another value.
    pub fn add_value(&mut self, value: Vec<u8>) {
        self.values.push(value);
    }

    /// Value encodings in canonical `SET OF` order.
    fn encoded_values(&self) -> der::Result<Vec<u8>> {
        if self.values.is_empty() {
            return Err(Tag::Set.value_error());
        }

        let kind = ValueKind::for_oid(&self.oid);
        let mut values = if self.encoded {
            self.values.clone()
        } else {
            self.values
                .iter()
                .map(|v| kind.encode(v))
                .collect::<der::Result<Vec<_>>>()?
        };
        sort::sort_encodings(&mut values);
        Ok(values.concat())
    }
}

// Attribute ::= SEQUENCE { attrType OBJECT IDENTIFIER, attrValues SET OF ANY }
impl EncodeValue for Attribute {
    fn value_len(&self) -> der::Result<Length> {
        let values = Any::new(Tag::Set, self.encoded_values()?)?;
        self.oid.encoded_len()? + values.encoded_len()?
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.oid.encode(writer)?;
        Any::new(Tag::Set, self.encoded_values()?)?.encode(writer)
    }
}

impl<'a> DecodeValue<'a> for Attribute {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        reader.read_nested(header.length, |reader| {
            let oid = asn1::read_oid(reader)?;
            let set = Header::decode(reader)?;
            set.tag.assert_eq(Tag::Set)?;

            let kind = ValueKind::for_oid(&oid);
            let values = reader.read_nested(set.length, |reader| {
                let mut values = Vec::new();
                while !reader.is_finished() {
                    values.push(kind.decode(reader)?);
                }
                Ok(values)
            })?;
            if values.is_empty() {
                return Err(Tag::Set.value_error());
            }

            Ok(Self {
                oid,
                encoded: false,
                values,
            })
        })
    }
}

impl<'a> Sequence<'a> for Attribute {}

/// Ordered collection of attributes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttributeCollection {
    attrs: Vec<Attribute>,
}

impl AttributeCollection {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Attributes in their current order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    /// Append an attribute. Duplicates are allowed.
    pub fn add(&mut self, attr: Attribute) {
        self.attrs.push(attr);
    }

    /// Find the attribute of type `oid`.
    ///
    /// With `require_unique`, an OID present more than once is treated as
    /// not found.
    pub fn find_by_oid(&self, oid: &ObjectIdentifier, require_unique: bool) -> Option<&Attribute> {
        let mut matches = self.attrs.iter().filter(|a| a.oid == *oid);
        let first = matches.next()?;
        if require_unique && matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Replace the values of the attribute of type `oid` with `value`, or
    /// append a new attribute if there is none.
    pub fn set_value(&mut self, oid: ObjectIdentifier, value: Vec<u8>) {
        match self.attrs.iter_mut().find(|a| a.oid == oid) {
            Some(attr) => {
                attr.values = vec![value];
                attr.encoded = false;
            }
            None => self.attrs.push(Attribute::new(oid, Some(value))),
        }
    }

    /// Put the attributes in canonical `SET OF` order.
    pub fn reorder(&mut self) -> Result<()> {
        sort::sort_by_encoding(&mut self.attrs, |attr| Ok(attr.to_der()?))
    }

    /// Encode as `SET OF Attribute`.
    ///
    /// Encoding does not sort: call [`reorder`][Self::reorder] first to get
    /// a DER encoding.
    pub fn encode_all(&self) -> Result<Vec<u8>> {
        Ok(self.to_der()?)
    }

    /// Decode the contents octets of a `SET OF Attribute`, whatever tag the
    /// set itself was carried under.
    pub fn decode_all(contents: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(contents)?;
        let attrs = decode_attrs(&mut reader)?;
        Ok(reader.finish(Self { attrs })?)
    }

    /// The collection as an `IMPLICIT [n]` field.
    pub(crate) fn implicit(&self, tag_number: TagNumber) -> ContextSpecificRef<'_, Self> {
        ContextSpecificRef {
            tag_number,
            tag_mode: TagMode::Implicit,
            value: self,
        }
    }

    /// Encode as an `IMPLICIT [n]` field.
    pub(crate) fn encode_implicit(&self, tag_number: TagNumber) -> Result<Vec<u8>> {
        Ok(self.implicit(tag_number).to_der()?)
    }

    /// Read an optional `IMPLICIT [n]` field.
    pub(crate) fn decode_implicit<'a, R: Reader<'a>>(
        reader: &mut R,
        tag_number: TagNumber,
    ) -> der::Result<Option<Self>> {
        Ok(ContextSpecific::<Self>::decode_implicit(reader, tag_number)?.map(|field| field.value))
    }

    /// Value of the unique `content-type` attribute.
    pub fn content_type(&self) -> Result<Option<ObjectIdentifier>> {
        match self
            .find_by_oid(&oid::ID_CONTENT_TYPE, true)
            .and_then(Attribute::value)
        {
            Some(arcs) => Ok(Some(asn1::oid_from_contents(arcs)?)),
            None => Ok(None),
        }
    }

    /// Value of the unique `message-digest` attribute.
    pub fn message_digest(&self) -> Option<&[u8]> {
        self.find_by_oid(&oid::ID_MESSAGE_DIGEST, true)
            .and_then(Attribute::value)
    }
}

fn decode_attrs<'a, R: Reader<'a>>(reader: &mut R) -> der::Result<Vec<Attribute>> {
    let mut attrs = Vec::new();
    while !reader.is_finished() {
        attrs.push(reader.decode()?);
    }
    Ok(attrs)
}

impl EncodeValue for AttributeCollection {
    fn value_len(&self) -> der::Result<Length> {
        self.attrs
            .iter()
            .try_fold(Length::ZERO, |len, attr| len + attr.encoded_len()?)
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.attrs.iter().try_for_each(|attr| attr.encode(writer))
    }
}

impl<'a> DecodeValue<'a> for AttributeCollection {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        let attrs = reader.read_nested(header.length, |reader| decode_attrs(reader))?;
        Ok(Self { attrs })
    }
}

impl FixedTag for AttributeCollection {
    const TAG: Tag = Tag::Set;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const OTHER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.3.4");

    #[test]
    fn set_value_keeps_one_attribute() {
        let mut attrs = AttributeCollection::new();
        attrs.set_value(oid::ID_MESSAGE_DIGEST, vec![1]);
        attrs.set_value(oid::ID_MESSAGE_DIGEST, vec![2]);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.message_digest(), Some(&[2u8][..]));
    }

    #[test]
    fn add_allows_duplicates_and_unique_lookup_fails() {
        let mut attrs = AttributeCollection::new();
        attrs.add(Attribute::message_digest(&[1]));
        attrs.add(Attribute::message_digest(&[2]));
        assert!(attrs.find_by_oid(&oid::ID_MESSAGE_DIGEST, true).is_none());
        assert_eq!(
            attrs
                .find_by_oid(&oid::ID_MESSAGE_DIGEST, false)
                .and_then(Attribute::value),
            Some(&[1u8][..])
        );
        assert_eq!(attrs.message_digest(), None);
    }

    #[test]
    fn typed_values_encode_by_oid() {
        let attr = Attribute::content_type(&oid::ID_DATA);
        assert_eq!(
            attr.to_der().unwrap(),
            hex!("3018 06092a864886f70d010903 310b 06092a864886f70d010701")
        );

        let attr = Attribute::message_digest(&[0xaa, 0xbb]);
        assert_eq!(
            attr.to_der().unwrap(),
            hex!("3011 06092a864886f70d010904 3104 0402aabb")
        );

        let raw = Attribute::new(OTHER, Some(hex!("0500").to_vec()));
        assert_eq!(raw.to_der().unwrap(), hex!("3009 06032a0304 3102 0500"));
    }

    #[test]
    fn decode_restores_values() {
        let mut attrs = AttributeCollection::new();
        attrs.add(Attribute::content_type(&oid::ID_SIGNED_DATA));
        attrs.add(Attribute::message_digest(&[9; 32]));
        let mut multi = Attribute::new(OTHER, Some(hex!("020102").to_vec()));
        multi.add_value(hex!("020101").to_vec());
        attrs.add(multi);

        let encoded = attrs.encode_all().unwrap();
        let decoded = AttributeCollection::from_der(&encoded).unwrap();
        assert_eq!(decoded, AttributeCollection::decode_all(&encoded[2..]).unwrap());

        assert_eq!(decoded.content_type().unwrap(), Some(oid::ID_SIGNED_DATA));
        assert_eq!(decoded.message_digest(), Some(&[9u8; 32][..]));
        let other = decoded.find_by_oid(&OTHER, true).unwrap();
        // values come back in SET OF order
        assert_eq!(other.values(), [hex!("020101").to_vec(), hex!("020102").to_vec()]);
    }

    #[test]
    fn reorder_sorts_by_encoding() {
        let mut attrs = AttributeCollection::new();
        attrs.add(Attribute::message_digest(&[0; 32]));
        attrs.add(Attribute::content_type(&oid::ID_DATA));
        attrs.add(Attribute::new(OTHER, Some(hex!("0500").to_vec())));
        attrs.reorder().unwrap();

        let oids: Vec<_> = attrs.iter().map(Attribute::oid).collect();
        assert_eq!(oids, [OTHER, oid::ID_CONTENT_TYPE, oid::ID_MESSAGE_DIGEST]);

        // already sorted input is left alone
        let before = attrs.clone();
        attrs.reorder().unwrap();
        assert_eq!(attrs, before);
    }

    #[test]
    fn signing_time_uses_utc_time() {
        let time = DateTime::new(2024, 1, 2, 3, 4, 5).unwrap();
        let attr = Attribute::signing_time(time).unwrap();
        assert_eq!(attr.value().unwrap(), b"\x17\x0d240102030405Z");

        let late = DateTime::new(2051, 1, 1, 0, 0, 0).unwrap();
        let attr = Attribute::signing_time(late).unwrap();
        assert_eq!(attr.value().unwrap()[0], 0x18);
    }

    #[test]
    fn empty_attribute_cannot_be_encoded() {
        assert!(Attribute::new(OTHER, None).to_der().is_err());
        assert!(Attribute::from_der(&hex!("3007 06032a0304 3100")).is_err());
    }

    #[test]
    fn short_oid_attribute_round_trips() {
        let short = ObjectIdentifier::new_unwrap("1.2.3");
        let attr = Attribute::new(short, Some(hex!("0500").to_vec()));
        let der = attr.to_der().unwrap();
        assert_eq!(der, hex!("3008 06022a03 3102 0500"));
        assert_eq!(Attribute::from_der(&der).unwrap(), attr);

        let mut attrs = AttributeCollection::new();
        attrs.add(Attribute::content_type(&short));
        let decoded = AttributeCollection::from_der(&attrs.encode_all().unwrap()).unwrap();
        assert_eq!(decoded.content_type().unwrap(), Some(short));
    }

    #[test]
    fn implicit_field_uses_context_tag() {
        let mut attrs = AttributeCollection::new();
        attrs.add(Attribute::new(OTHER, Some(hex!("0500").to_vec())));
        let field = attrs.encode_implicit(TagNumber::N1).unwrap();
        assert_eq!(field, hex!("a10b 3009 06032a0304 3102 0500"));

        let mut reader = SliceReader::new(&field).unwrap();
        assert_eq!(
            AttributeCollection::decode_implicit(&mut reader, TagNumber::N0).unwrap(),
            None
        );
        let decoded = AttributeCollection::decode_implicit(&mut reader, TagNumber::N1).unwrap();
        assert_eq!(decoded, Some(attrs));
        assert!(reader.is_finished());
    }
}
