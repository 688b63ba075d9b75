//! Streaming block-cipher context with PKCS#7 padding.
//!
//! The context absorbs input of any length, buffers partial blocks between
//! calls and only emits whole blocks. On decryption the last whole block is
//! held back until the final call, because it may carry the padding.

use aes::{Aes128, Aes192, Aes256};
use alloc::vec::Vec;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use der::{Decode, Tagged};
use rand_core::CryptoRngCore;
use spki::AlgorithmIdentifierOwned;
use zeroize::Zeroizing;

use crate::asn1;
use crate::errors::{Error, Result};
use crate::registry::{AlgorithmRegistry, ContentEncryptionAlgorithm};

/// Direction of a [`CipherContext`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

enum BlockMode {
    Aes128Enc(cbc::Encryptor<Aes128>),
    Aes192Enc(cbc::Encryptor<Aes192>),
    Aes256Enc(cbc::Encryptor<Aes256>),
    Aes128Dec(cbc::Decryptor<Aes128>),
    Aes192Dec(cbc::Decryptor<Aes192>),
    Aes256Dec(cbc::Decryptor<Aes256>),
}

impl BlockMode {
    fn new(
        alg: ContentEncryptionAlgorithm,
        direction: Direction,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Self> {
        if key.len() != alg.key_size() {
            return Err(Error::InvalidArgument("content-encryption key has wrong length"));
        }
        if iv.len() != alg.block_size() {
            return Err(Error::MalformedEncoding("IV length does not match block size"));
        }

        let invalid = |_| Error::CryptoFailure("cipher rejected key or IV".into());
        let mode = match (alg, direction) {
            (ContentEncryptionAlgorithm::Aes128Cbc, Direction::Encrypt) => {
                Self::Aes128Enc(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (ContentEncryptionAlgorithm::Aes192Cbc, Direction::Encrypt) => {
                Self::Aes192Enc(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (ContentEncryptionAlgorithm::Aes256Cbc, Direction::Encrypt) => {
                Self::Aes256Enc(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (ContentEncryptionAlgorithm::Aes128Cbc, Direction::Decrypt) => {
                Self::Aes128Dec(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (ContentEncryptionAlgorithm::Aes192Cbc, Direction::Decrypt) => {
                Self::Aes192Dec(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (ContentEncryptionAlgorithm::Aes256Cbc, Direction::Decrypt) => {
                Self::Aes256Dec(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
        };
        Ok(mode)
    }

    /// Transform `blocks` in place. `blocks.len()` is a multiple of the block size.
    fn process(&mut self, blocks: &mut [u8]) {
        match self {
            Self::Aes128Enc(c) => encrypt_blocks(c, blocks),
            Self::Aes192Enc(c) => encrypt_blocks(c, blocks),
            Self::Aes256Enc(c) => encrypt_blocks(c, blocks),
            Self::Aes128Dec(c) => decrypt_blocks(c, blocks),
            Self::Aes192Dec(c) => decrypt_blocks(c, blocks),
            Self::Aes256Dec(c) => decrypt_blocks(c, blocks),
        }
    }
}

fn encrypt_blocks<C: BlockEncryptMut>(cipher: &mut C, blocks: &mut [u8]) {
    for block in blocks.chunks_exact_mut(C::block_size()) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks<C: BlockDecryptMut>(cipher: &mut C, blocks: &mut [u8]) {
    for block in blocks.chunks_exact_mut(C::block_size()) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// One open content-encryption transform.
pub struct CipherContext {
    mode: BlockMode,
    direction: Direction,
    block_size: usize,
    pending: Zeroizing<Vec<u8>>,
    finished: bool,
}

impl CipherContext {
    /// Start encrypting with `key`.
    ///
    /// A fresh IV is drawn from `rng`; the returned algorithm identifier
    /// carries it as its `OCTET STRING` parameter and is what gets serialized
    /// into the message.
    pub fn start_encrypt(
        key: &[u8],
        alg: ContentEncryptionAlgorithm,
        rng: &mut dyn CryptoRngCore,
    ) -> Result<(Self, AlgorithmIdentifierOwned)> {
        let mut iv = vec![0u8; alg.block_size()];
        rng.fill_bytes(&mut iv);

        let params = asn1::tlv(asn1::OCTET_STRING, &iv)?;
        let alg_id = AlgorithmIdentifierOwned {
            oid: alg.oid(),
            parameters: Some(der::Any::from_der(&params)?),
        };

        Ok((Self::new(alg, Direction::Encrypt, key, &iv)?, alg_id))
    }

    /// Start decrypting with `key`, taking the algorithm and IV from `alg_id`.
    pub fn start_decrypt(
        key: &[u8],
        alg_id: &AlgorithmIdentifierOwned,
        registry: &AlgorithmRegistry,
    ) -> Result<Self> {
        let alg = registry
            .cipher(&alg_id.oid)
            .ok_or(Error::UnsupportedAlgorithm(alg_id.oid))?;
        let params = alg_id
            .parameters
            .as_ref()
            .ok_or(Error::MalformedEncoding("missing IV parameter"))?;
        if params.tag() != der::Tag::OctetString {
            return Err(Error::MalformedEncoding("IV parameter is not an OCTET STRING"));
        }

        Self::new(alg, Direction::Decrypt, key, params.value())
    }

    pub(crate) fn new(
        alg: ContentEncryptionAlgorithm,
        direction: Direction,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Self> {
        Ok(Self {
            mode: BlockMode::new(alg, direction, key, iv)?,
            direction,
            block_size: alg.block_size(),
            pending: Zeroizing::new(Vec::with_capacity(alg.block_size())),
            finished: false,
        })
    }

    /// Direction of this context.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Upper bound on the output of the next [`encrypt`][Self::encrypt] call.
    pub fn encrypt_length(&self, input_len: usize, final_: bool) -> usize {
        let total = round_up(self.pending.len() + input_len, self.block_size);
        if final_ {
            total + self.block_size
        } else {
            total
        }
    }

    /// Upper bound on the output of the next [`decrypt`][Self::decrypt] call.
    pub fn decrypt_length(&self, input_len: usize, _final: bool) -> usize {
        round_up(self.pending.len() + input_len, self.block_size)
    }

    /// Encrypt `input`, returning every whole block now available.
    ///
    /// With `final_` set, the buffered tail is padded and flushed. Padding is
    /// always added, a full block of it for block-aligned input.
    pub fn encrypt(&mut self, input: &[u8], final_: bool) -> Result<Vec<u8>> {
        self.check(Direction::Encrypt)?;

        let bs = self.block_size;
        let mut buf = Zeroizing::new(Vec::with_capacity(self.encrypt_length(input.len(), final_)));
        buf.extend_from_slice(&self.pending);
        buf.extend_from_slice(input);
        self.pending.clear();

        if final_ {
            let pad = bs - buf.len() % bs;
            let new_len = buf.len() + pad;
            buf.resize(new_len, pad as u8);
            self.finished = true;
        } else {
            let whole = buf.len() - buf.len() % bs;
            self.pending.extend_from_slice(&buf[whole..]);
            buf.truncate(whole);
        }

        self.mode.process(&mut buf);
        Ok(core::mem::take(&mut *buf))
    }

    /// Decrypt `input`, returning the plaintext now known not to be padding.
    ///
    /// With `final_` set, the padding is checked and stripped. A pad length of
    /// zero, one larger than the block size, or pad bytes that disagree with it
    /// yield [`Error::BadPadding`].
    pub fn decrypt(&mut self, input: &[u8], final_: bool) -> Result<Vec<u8>> {
        self.check(Direction::Decrypt)?;

        let bs = self.block_size;
        let mut buf = Zeroizing::new(Vec::with_capacity(self.decrypt_length(input.len(), final_)));
        buf.extend_from_slice(&self.pending);
        buf.extend_from_slice(input);
        self.pending.clear();

        if !final_ {
            let mut whole = buf.len() - buf.len() % bs;
            if whole == buf.len() && whole > 0 {
                whole -= bs;
            }
            self.pending.extend_from_slice(&buf[whole..]);
            buf.truncate(whole);
            self.mode.process(&mut buf);
            return Ok(core::mem::take(&mut *buf));
        }

        self.finished = true;
        if buf.is_empty() || buf.len() % bs != 0 {
            return Err(Error::BadPadding);
        }
        self.mode.process(&mut buf);

        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > bs {
            return Err(Error::BadPadding);
        }
        let body = buf.len() - pad;
        if buf[body..].iter().any(|b| *b as usize != pad) {
            return Err(Error::BadPadding);
        }

        buf.truncate(body);
        Ok(core::mem::take(&mut *buf))
    }

    fn check(&self, direction: Direction) -> Result<()> {
        if self.direction != direction {
            return Err(Error::InvalidState("cipher context used in the wrong direction"));
        }
        if self.finished {
            return Err(Error::InvalidState("cipher context already finalized"));
        }
        Ok(())
    }
}

impl core::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CipherContext")
            .field("direction", &self.direction)
            .field("block_size", &self.block_size)
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

fn round_up(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size) * block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    // NIST SP 800-38A F.2.1
    const KEY: [u8; 16] = hex!("2b7e151628aed2a6abf7158809cf4f3c");
    const IV: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");
    const PLAINTEXT: [u8; 64] = hex!(
        "6bc1bee22e409f96e93d7e117393172a"
        "ae2d8a571e03ac9c9eb76fac45af8e51"
        "30c81c46a35ce411e5fbc1191a0a52ef"
        "f69f2445df4f9b17ad2b417be66c3710"
    );
    const CIPHERTEXT: [u8; 64] = hex!(
        "7649abac8119b246cee98e9b12e9197d"
        "5086cb9b507219ee95db113a917678b2"
        "73bed6b8e3c1743b7116e69e22229516"
        "3ff1caa1681fac09120eca307586e1a7"
    );

    fn encryptor() -> CipherContext {
        CipherContext::new(
            ContentEncryptionAlgorithm::Aes128Cbc,
            Direction::Encrypt,
            &KEY,
            &IV,
        )
        .unwrap()
    }

    fn decryptor() -> CipherContext {
        CipherContext::new(
            ContentEncryptionAlgorithm::Aes128Cbc,
            Direction::Decrypt,
            &KEY,
            &IV,
        )
        .unwrap()
    }

    #[test]
    fn encrypt_matches_nist_vector_in_small_chunks() {
        let mut ctx = encryptor();
        let mut out = Vec::new();
        for chunk in PLAINTEXT.chunks(7) {
            out.extend(ctx.encrypt(chunk, false).unwrap());
        }
        // encryption emits every whole block, nothing is held back
        assert_eq!(out.len(), 64);
        out.extend(ctx.encrypt(&[], true).unwrap());

        // block-aligned input still gets a full padding block
        assert_eq!(out.len(), 80);
        assert_eq!(&out[..64], &CIPHERTEXT[..]);
    }

    #[test]
    fn decrypt_holds_back_last_block() {
        let mut enc = encryptor();
        let ciphertext = enc.encrypt(&PLAINTEXT, true).unwrap();

        let mut dec = decryptor();
        let first = dec.decrypt(&ciphertext[..64], false).unwrap();
        assert_eq!(first, &PLAINTEXT[..48]);
        let rest = dec.decrypt(&ciphertext[64..], true).unwrap();
        assert_eq!(rest, &PLAINTEXT[48..]);
    }

    #[test]
    fn length_predictions_bound_output() {
        let mut ctx = encryptor();
        for len in [0usize, 1, 15, 16, 17, 33] {
            let predicted = ctx.encrypt_length(len, false);
            let out = ctx.encrypt(&vec![0u8; len], false).unwrap();
            assert!(predicted >= out.len());
        }
        let predicted = ctx.encrypt_length(5, true);
        let out = ctx.encrypt(&[1, 2, 3, 4, 5], true).unwrap();
        assert!(predicted >= out.len());
    }

    fn decrypt_forged(last: u8) -> Result<Vec<u8>> {
        let mut block = [7u8; 16];
        block[15] = last;
        let mut enc = CipherContext::new(
            ContentEncryptionAlgorithm::Aes128Cbc,
            Direction::Encrypt,
            &KEY,
            &IV,
        )
        .unwrap();
        // encrypt without our padding to forge the pad byte
        let mut forged = block.to_vec();
        enc.mode.process(&mut forged);

        let mut dec = decryptor();
        dec.decrypt(&forged, true)
    }

    #[test]
    fn bad_padding_is_reported() {
        assert_eq!(decrypt_forged(0), Err(Error::BadPadding));
        assert_eq!(decrypt_forged(17), Err(Error::BadPadding));
        assert_eq!(decrypt_forged(0xff), Err(Error::BadPadding));
        // pad byte claims 3 but the preceding bytes are 7
        assert_eq!(decrypt_forged(3), Err(Error::BadPadding));
        assert_eq!(decrypt_forged(1).unwrap(), vec![7u8; 15]);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let mut dec = decryptor();
        assert_eq!(dec.decrypt(&CIPHERTEXT[..20], true), Err(Error::BadPadding));

        let mut dec = decryptor();
        assert_eq!(dec.decrypt(&[], true), Err(Error::BadPadding));
    }

    #[test]
    fn start_encrypt_embeds_iv() {
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let registry = AlgorithmRegistry::default();
        let key = [9u8; 32];

        let (mut enc, alg_id) =
            CipherContext::start_encrypt(&key, ContentEncryptionAlgorithm::Aes256Cbc, &mut rng)
                .unwrap();
        assert_eq!(alg_id.oid, ContentEncryptionAlgorithm::Aes256Cbc.oid());
        assert_eq!(alg_id.parameters.as_ref().unwrap().value().len(), 16);

        let ciphertext = enc.encrypt(b"attack at dawn", true).unwrap();
        let mut dec = CipherContext::start_decrypt(&key, &alg_id, &registry).unwrap();
        assert_eq!(dec.decrypt(&ciphertext, true).unwrap(), b"attack at dawn");
    }

    #[test]
    fn wrong_direction_and_reuse_fail() {
        let mut enc = encryptor();
        assert!(enc.decrypt(&[0u8; 16], false).is_err());
        enc.encrypt(b"x", true).unwrap();
        assert!(enc.encrypt(b"y", false).is_err());
    }
}
