//! Encode/decode round trips over every content kind.

#![cfg(feature = "rsa")]

use cms_stream::der::{DateTime, Decode};
use cms_stream::rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use cms_stream::{
    asn1, decode, encode, oid, AlgorithmRegistry, CipherContext, Content, ContentEncryptionAlgorithm,
    ContentInfo, ContentType, Decoder, DigestAlgorithm, DigestedData, Encoder, EncryptedData,
    EnvelopedData, Error, IssuerAndSerialNumber, KeyIdentifier, KeyRing, Message, NoKeys,
    SignedData, SignerInfo,
};
use hex_literal::hex;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

const CONTENT: &[u8] = b"Streaming CMS content that spans more than one block of AES.";

/// Wycheproof 1024-bit test key.
fn private_key() -> RsaPrivateKey {
    let hex = |s: &str| BigUint::parse_bytes(s.as_bytes(), 16).unwrap();
    RsaPrivateKey::from_components(
        hex("d0941e63a980fa92fb25ed4c7b3307f827023034ae7f1a7491f0699ca7607285e62ad8e994bac21b8b6e305e334f4874067d28e304230dca7f0e85f7ce595770b6e054c9f844ba86c0696eeba0769d8d4a347e8fe85c724ac1c44994af18a39e719f721f1bc50c46a39e6c075fcd1649f01f22608ce7dc6955502258336987d9"),
        BigUint::from(65537u32),
        hex("5ff4a47e690ea338573e3d8b3fea5c32378ff4296855a51017cba86a9f3de9b1dc0fbe36c76b9bbd1c4a170a5f448c2a8489b3f3ac858be4aacb3daaa14dccc183622eedd3ae6f0427a2a298b51b97818a5430f13705f42d8b25476f939c935e389e30d9ade5d0180920135f5aef0c5fecd15f00b83b51dab8ba930d88826801"),
        vec![
            hex("e882d12d5f0be26a80359f13c08210bdcbf759dfee695313efa8886919659b064e3c656a267af6275ed1af89a5dfe9e25b31a02bafbd59445b7507a22989a681"),
            hex("e5a65cfa668bd857d59135a78c18c8adb7c222368e9d74abad8e83299f7ac3c2ad7aa44ddb05deea6d9b20dbaf09a8615284a17c72d3723240334685ea7e2559"),
        ],
    )
    .unwrap()
}

/// issuerAndSerialNumber for "CN=CA", serial 1.
fn issuer_and_serial() -> KeyIdentifier {
    KeyIdentifier::IssuerAndSerialNumber(
        IssuerAndSerialNumber::from_der(&hex!("3012 300d 310b 3009 0603550403 0c024341 020101"))
            .unwrap(),
    )
}

fn subject_key_id() -> KeyIdentifier {
    KeyIdentifier::SubjectKeyIdentifier(hex!("0102030405060708").to_vec())
}

fn keys() -> KeyRing {
    let private = private_key();
    let public = RsaPublicKey::from(&private);
    KeyRing::new()
        .with_signer(issuer_and_serial(), private.clone())
        .with_signer(subject_key_id(), private.clone())
        .with_recipient(issuer_and_serial(), public)
        .with_unwrapper(issuer_and_serial(), private)
        .with_bulk_key(&[0x24; 32])
}

fn rng() -> ChaCha8Rng {
    ChaCha8Rng::from_seed([9; 32])
}

fn signed(inner: ContentInfo) -> SignedData {
    let mut signed = SignedData::new(inner);
    let mut first = SignerInfo::new(issuer_and_serial(), DigestAlgorithm::Sha256);
    first
        .add_signing_time(DateTime::new(2024, 1, 2, 3, 4, 5).unwrap())
        .unwrap();
    signed.add_signer(first);
    signed.add_signer(SignerInfo::new(subject_key_id(), DigestAlgorithm::Sha1));
    signed
}

fn enveloped(inner: ContentInfo) -> EnvelopedData {
    let mut enveloped = EnvelopedData::new(inner, ContentEncryptionAlgorithm::Aes128Cbc);
    enveloped.add_recipient(issuer_and_serial());
    enveloped
}

fn signed_at(message: &Message, depth: usize) -> &SignedData {
    match message.content_level(depth).map(ContentInfo::content) {
        Some(Content::Signed(signed)) => signed,
        other => panic!("expected SignedData at level {depth}, got {other:?}"),
    }
}

fn verify_all(signed: &SignedData) {
    let public = RsaPublicKey::from(&private_key());
    let registry = AlgorithmRegistry::default();
    assert_eq!(signed.signer_infos().len(), 2);
    for i in 0..signed.signer_infos().len() {
        signed.verify_signer(i, &public, &registry).unwrap();
    }
}

fn decode_chunked(encoding: &[u8], keys: &KeyRing, chunk: usize) -> Message {
    let mut decoder = Decoder::new(keys);
    for piece in encoding.chunks(chunk) {
        decoder.update(piece).unwrap();
    }
    decoder.finish().unwrap()
}

#[test]
fn data() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::data(Vec::new())),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    for chunk in [1, 5, der.len()] {
        let message = decode_chunked(&der, &keys, chunk);
        assert_eq!(message.content(), Some(CONTENT));
        assert_eq!(message.content_level_count(), 1);
    }
}

#[test]
fn signed_data() {
    let keys = keys();
    let (der, encoded) = encode(
        Message::new(ContentInfo::signed(signed(ContentInfo::data(Vec::new())))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();
    verify_all(signed_at(&encoded, 0));

    let message = decode_chunked(&der, &keys, 17);
    assert!(message.is_signed());
    assert_eq!(message.content(), Some(CONTENT));

    let signed = signed_at(&message, 0);
    assert_eq!(signed.version(), 3);
    assert_eq!(signed.digest_algorithms().len(), 2);
    assert_eq!(
        signed.digest_for(&oid::ID_SHA_256),
        Some(DigestAlgorithm::Sha256.digest(CONTENT).as_slice())
    );
    verify_all(signed);

    let timed = signed
        .signer_infos()
        .iter()
        .find(|s| s.sid() == &issuer_and_serial())
        .unwrap();
    assert!(timed
        .signed_attributes()
        .find_by_oid(&oid::ID_SIGNING_TIME, true)
        .is_some());
    assert_eq!(timed.signed_attributes().content_type().unwrap(), Some(oid::ID_DATA));
}

#[test]
fn tampered_content_fails_verification() {
    let keys = keys();
    let (mut der, _) = encode(
        Message::new(ContentInfo::signed(signed(ContentInfo::data(Vec::new())))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    let at = der
        .windows(CONTENT.len())
        .position(|w| w == CONTENT)
        .unwrap();
    der[at] ^= 0x20;

    let message = decode(&der, &keys).unwrap();
    let signed = signed_at(&message, 0);
    let public = RsaPublicKey::from(&private_key());
    for i in 0..signed.signer_infos().len() {
        assert!(signed
            .verify_signer(i, &public, &AlgorithmRegistry::default())
            .is_err());
    }
}

#[test]
fn enveloped_data() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::enveloped(enveloped(ContentInfo::data(Vec::new())))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();
    assert!(der.windows(CONTENT.len()).all(|w| w != CONTENT));

    let message = decode_chunked(&der, &keys, 3);
    assert!(message.is_encrypted());
    assert_eq!(message.content(), Some(CONTENT));

    let inner = message.content_level(1).unwrap();
    assert_eq!(
        inner.content_encryption_algorithm().map(|alg| alg.oid),
        Some(oid::ID_AES_128_CBC)
    );
    match message.root().content() {
        Content::Enveloped(enveloped) => {
            assert_eq!(enveloped.version(), 0);
            assert_eq!(
                enveloped.content_encryption(),
                ContentEncryptionAlgorithm::Aes128Cbc
            );
            assert_eq!(enveloped.recipient_infos().len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn signed_enveloped_data() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::signed(signed(ContentInfo::enveloped(enveloped(
            ContentInfo::data(Vec::new()),
        ))))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    let message = decode_chunked(&der, &keys, 64);
    assert_eq!(message.content_level_count(), 3);
    assert_eq!(message.content(), Some(CONTENT));
    verify_all(signed_at(&message, 0));
}

#[test]
fn missing_recipient_key_is_local_to_the_subtree() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::signed(signed(ContentInfo::enveloped(enveloped(
            ContentInfo::data(Vec::new()),
        ))))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    let message = decode(&der, &NoKeys).unwrap();
    let undecrypted = message.content_level(2).unwrap();
    assert_eq!(undecrypted.decode_error(), Some(&Error::MissingRecipientKey));
    assert!(message.is_content_empty(1));

    // the outer signatures cover the encrypted octets and still verify
    verify_all(signed_at(&message, 0));
}

#[test]
fn missing_recipient_key_on_encode() {
    let mut enveloped = EnvelopedData::new(
        ContentInfo::data(Vec::new()),
        ContentEncryptionAlgorithm::Aes256Cbc,
    );
    enveloped.add_recipient(subject_key_id());
    let result = encode(
        Message::new(ContentInfo::enveloped(enveloped)),
        CONTENT,
        &keys(),
        &mut rng(),
    );
    assert_eq!(result.unwrap_err(), Error::MissingRecipientKey);
}

#[test]
fn encrypted_data() {
    let keys = keys();
    let mut encrypted = EncryptedData::new(
        ContentInfo::data(CONTENT.to_vec()),
        ContentEncryptionAlgorithm::Aes256Cbc,
    );
    encrypted
        .unprotected_attributes_mut()
        .set_value(oid::ID_CONTENT_TYPE, oid::ID_DATA.as_bytes().to_vec());
    let (der, _) = encode(
        Message::new(ContentInfo::encrypted(encrypted)),
        b"",
        &keys,
        &mut rng(),
    )
    .unwrap();

    let message = decode(&der, &keys).unwrap();
    assert_eq!(message.content(), Some(CONTENT));
    match message.root().content() {
        Content::Encrypted(encrypted) => {
            assert_eq!(encrypted.version(), 2);
            assert_eq!(
                encrypted.content_encryption(),
                ContentEncryptionAlgorithm::Aes256Cbc
            );
            assert_eq!(encrypted.unprotected_attributes().len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    let message = decode(&der, &NoKeys).unwrap();
    assert_eq!(
        message.content_level(1).unwrap().decode_error(),
        Some(&Error::MissingBulkKey)
    );
}

#[test]
fn bad_padding_is_fatal() {
    let key = [0x24; 16];
    let keys = KeyRing::new().with_bulk_key(&key);

    // one block whose plaintext ends in a zero pad length
    let (mut cipher, alg) = CipherContext::start_encrypt(
        &key,
        ContentEncryptionAlgorithm::Aes128Cbc,
        &mut rng(),
    )
    .unwrap();
    let ciphertext = cipher.encrypt(&[0u8; 16], false).unwrap();
    assert_eq!(ciphertext.len(), 16);

    let tlv = |tag, value: &[u8]| asn1::tlv(tag, value).unwrap();
    let mut encrypted_content_info = asn1::encode_oid(&oid::ID_DATA).unwrap();
    encrypted_content_info.extend(asn1::encode_algorithm(&alg).unwrap());
    encrypted_content_info.extend(tlv(0x80, &ciphertext));
    let mut body = asn1::encode_version(0).unwrap();
    body.extend(tlv(0x30, &encrypted_content_info));
    let mut info = asn1::encode_oid(&oid::ID_ENCRYPTED_DATA).unwrap();
    info.extend(tlv(0xa0, &tlv(0x30, &body)));
    let der = tlv(0x30, &info);

    assert_eq!(decode(&der, &keys).unwrap_err(), Error::BadPadding);
}

#[test]
fn digested_data() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::digested(DigestedData::new(
            ContentInfo::data(Vec::new()),
            DigestAlgorithm::Sha384,
        ))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    let message = decode_chunked(&der, &keys, 11);
    match message.root().content() {
        Content::Digested(digested) => {
            assert_eq!(digested.digest_matches(), Some(true));
            assert_eq!(digested.digest(), DigestAlgorithm::Sha384.digest(CONTENT));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn detached_signature() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::signed(signed(ContentInfo::detached_data()))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();
    assert!(der.windows(CONTENT.len()).all(|w| w != CONTENT));

    let mut message = decode(&der, &keys).unwrap();
    assert!(message.content_level(1).unwrap().is_detached());
    assert_eq!(message.content(), None);

    let public = RsaPublicKey::from(&private_key());
    let registry = AlgorithmRegistry::default();
    match message.root_mut().content_mut() {
        Content::Signed(signed) => {
            assert!(signed.verify_signer(0, &public, &registry).is_err());
            let algorithms = signed.digest_algorithms().to_vec();
            let digests: Vec<_> = algorithms
                .iter()
                .map(|alg| registry.digest(&alg.oid).unwrap().digest(CONTENT))
                .collect();
            signed.set_digests(&algorithms, &digests).unwrap();
            verify_all(signed);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn detached_signature_from_supplied_digests() {
    let keys = keys();
    let mut detached = SignedData::new(ContentInfo::detached_data());
    detached.add_signer(SignerInfo::new(issuer_and_serial(), DigestAlgorithm::Sha256));
    detached
        .set_digests(
            &[DigestAlgorithm::Sha256.algorithm_identifier()],
            &[DigestAlgorithm::Sha256.digest(CONTENT)],
        )
        .unwrap();

    // no content is streamed at all
    let (der, _) = encode(
        Message::new(ContentInfo::signed(detached)),
        b"",
        &keys,
        &mut rng(),
    )
    .unwrap();

    let mut message = decode(&der, &keys).unwrap();
    if let Content::Signed(signed) = message.root_mut().content_mut() {
        signed
            .set_digests(
                &[DigestAlgorithm::Sha256.algorithm_identifier()],
                &[DigestAlgorithm::Sha256.digest(CONTENT)],
            )
            .unwrap();
        signed
            .verify_signer(
                0,
                &RsaPublicKey::from(&private_key()),
                &AlgorithmRegistry::default(),
            )
            .unwrap();
    } else {
        panic!("expected SignedData");
    }
}

#[test]
fn five_levels_deep() {
    let keys = keys();
    let data = ContentInfo::data(Vec::new());
    let digested = ContentInfo::digested(DigestedData::new(data, DigestAlgorithm::Sha512));
    let inner_signed = ContentInfo::signed(signed(digested));
    let enveloped = ContentInfo::enveloped(enveloped(inner_signed));
    let root = ContentInfo::signed(signed(enveloped));

    let mut der = Vec::new();
    let mut rng = rng();
    let mut encoder = Encoder::new(Message::new(root), &keys, &mut rng, |b: &[u8]| {
        der.extend_from_slice(b)
    });
    for piece in CONTENT.chunks(7) {
        encoder.update(piece).unwrap();
    }
    encoder.finish().unwrap();

    let message = decode_chunked(&der, &keys, 29);
    assert_eq!(message.content_level_count(), 5);
    assert_eq!(
        (0..5)
            .map(|n| message.content_level(n).unwrap().kind())
            .collect::<Vec<_>>(),
        [
            ContentType::SignedData,
            ContentType::EnvelopedData,
            ContentType::SignedData,
            ContentType::DigestedData,
            ContentType::Data,
        ]
    );
    assert_eq!(message.root().inner_content(), Some(CONTENT));
    verify_all(signed_at(&message, 0));
    verify_all(signed_at(&message, 2));
    match message.content_level(3).unwrap().content() {
        Content::Digested(digested) => assert_eq!(digested.digest_matches(), Some(true)),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn decoded_messages_encode_again() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::digested(DigestedData::new(
            ContentInfo::data(Vec::new()),
            DigestAlgorithm::Sha256,
        ))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    // the decoded Data node holds the content, so nothing more is streamed
    let decoded = decode(&der, &keys).unwrap();
    let (again, _) = encode(decoded, b"", &keys, &mut rng()).unwrap();
    assert_eq!(again, der);
}

#[test]
fn sink_receives_nested_content() {
    let keys = keys();
    let (der, _) = encode(
        Message::new(ContentInfo::signed(signed(ContentInfo::enveloped(enveloped(
            ContentInfo::data(Vec::new()),
        ))))),
        CONTENT,
        &keys,
        &mut rng(),
    )
    .unwrap();

    let mut seen = Vec::new();
    let mut decoder = Decoder::new(&keys).with_sink(|b: &[u8]| seen.extend_from_slice(b));
    decoder.update(&der).unwrap();
    let message = decoder.finish().unwrap();
    assert_eq!(seen, CONTENT);
    assert_eq!(message.content(), Some(&b""[..]));
}
