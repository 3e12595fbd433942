//! Credential hashing, session key derivation and the KLAP record cipher.
//!
//! # Key schedule
//!
//! Both ends derive the same material from `H = local_seed || remote_seed
//! || auth_hash` after the handshake:
//!
//! - `key     = SHA256("lsk" || H)[..16]`: AES-128 key
//! - `iv_seed = SHA256("iv"  || H)[..12]`: leading 12 bytes of every IV
//! - `sig_key = SHA256("ldk" || H)[..28]`: signature prefix
//! - `seq0    = SHA256("iv"  || H)[28..32]`: signed big-endian i32
//!
//! The first request is sent with `seq0 + 1`. The sequence number that
//! appears in the request URL, in the last 4 bytes of the IV and inside the
//! signature is always the same value.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::constants::{AES_BLOCK_SIZE, IV_SEED_SIZE, KEY_SIZE, SIGNATURE_SIZE, SIG_KEY_SIZE};
use crate::error::TapoError;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// SHA-256 over a sequence of byte segments, fed in order.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-1 over a sequence of byte segments, fed in order.
pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Long-term shared secret: `SHA256(SHA1(username) || SHA1(password))`.
///
/// The plaintext credentials are not retained anywhere past this call.
pub fn auth_hash(username: &str, password: &str) -> [u8; 32] {
    let user = sha1(&[username.as_bytes()]);
    let pass = sha1(&[password.as_bytes()]);
    sha256(&[&user, &pass])
}

/// Pad `data` to a multiple of the AES block size per PKCS#7.
///
/// The pad length is always in `1..=16`; input already on a block boundary
/// gains a full block of padding.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = AES_BLOCK_SIZE - data.len() % AES_BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + pad);
    padded.extend_from_slice(data);
    padded.extend(std::iter::repeat(pad as u8).take(pad));
    padded
}

/// Strip PKCS#7 padding.
///
/// Rejects a trailing length byte of zero, one larger than the block size
/// or the buffer, and padding bytes that are not uniformly replicated.
pub fn pkcs7_unpad(data: &[u8]) -> Result<&[u8], TapoError> {
    let Some(&last) = data.last() else {
        return Err(TapoError::Malformed("empty padded buffer".into()));
    };
    let pad = last as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > data.len() {
        return Err(TapoError::Malformed(format!("invalid padding length {pad}")));
    }
    let (body, tail) = data.split_at(data.len() - pad);
    if tail.iter().any(|&b| b != last) {
        return Err(TapoError::Malformed("corrupt padding".into()));
    }
    Ok(body)
}

/// Session key schedule. Every field is a pure function of
/// `(local_seed, remote_seed, auth_hash)`, so both ends arrive at the same
/// material independently.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub key: [u8; KEY_SIZE],
    pub iv_seed: [u8; IV_SEED_SIZE],
    pub sig_key: [u8; SIG_KEY_SIZE],
    /// Starting sequence number, signed big-endian interpretation
    pub initial_seq: i32,
}

impl KeyMaterial {
    pub fn derive(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> Self {
        let key_data = sha256(&[b"lsk", local_seed, remote_seed, auth_hash]);
        let iv_data = sha256(&[b"iv", local_seed, remote_seed, auth_hash]);
        let sig_data = sha256(&[b"ldk", local_seed, remote_seed, auth_hash]);

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&key_data[..KEY_SIZE]);
        let mut iv_seed = [0u8; IV_SEED_SIZE];
        iv_seed.copy_from_slice(&iv_data[..IV_SEED_SIZE]);
        let mut sig_key = [0u8; SIG_KEY_SIZE];
        sig_key.copy_from_slice(&sig_data[..SIG_KEY_SIZE]);

        // The tail of the IV digest doubles as the starting sequence number
        let initial_seq = i32::from_be_bytes([iv_data[28], iv_data[29], iv_data[30], iv_data[31]]);

        Self {
            key,
            iv_seed,
            sig_key,
            initial_seq,
        }
    }
}

/// Stateful record cipher for one KLAP session.
///
/// Owns the derived keys and the monotonically increasing sequence
/// counter. Encrypting advances the counter; decrypting verifies against
/// the sequence number the request was sent with.
#[derive(Debug)]
pub struct KlapCipher {
    keys: KeyMaterial,
    seq: i32,
}

impl KlapCipher {
    pub fn new(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> Self {
        let keys = KeyMaterial::derive(local_seed, remote_seed, auth_hash);
        let seq = keys.initial_seq;
        Self { keys, seq }
    }

    /// Sequence number used by the most recent `encrypt`.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Set the sequence counter (for tests and protocol research).
    pub fn set_seq(&mut self, seq: i32) {
        self.seq = seq;
    }

    fn iv_for(&self, seq: i32) -> [u8; AES_BLOCK_SIZE] {
        let mut iv = [0u8; AES_BLOCK_SIZE];
        iv[..IV_SEED_SIZE].copy_from_slice(&self.keys.iv_seed);
        iv[IV_SEED_SIZE..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    fn signature(&self, seq: i32, ciphertext: &[u8]) -> [u8; 32] {
        sha256(&[&self.keys.sig_key, &seq.to_be_bytes(), ciphertext])
    }

    /// Encrypt and sign one request.
    ///
    /// Returns `signature || ciphertext` and the sequence number the frame
    /// is bound to. Refuses to send once the counter would overflow.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, i32), TapoError> {
        let seq = self.seq.checked_add(1).ok_or(TapoError::SequenceExhausted)?;
        self.seq = seq;

        let padded = pkcs7_pad(plaintext);
        let iv = self.iv_for(seq);
        let ciphertext = Aes128CbcEnc::new(&self.keys.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded);

        let mut frame = Vec::with_capacity(SIGNATURE_SIZE + ciphertext.len());
        frame.extend_from_slice(&self.signature(seq, &ciphertext));
        frame.extend_from_slice(&ciphertext);
        Ok((frame, seq))
    }

    /// Verify and decrypt the response to the request sent with `seq`.
    ///
    /// The signature comparison is constant-time. A mismatch is
    /// session-fatal ([`TapoError::SignatureInvalid`]).
    pub fn decrypt(&self, seq: i32, payload: &[u8]) -> Result<Vec<u8>, TapoError> {
        if payload.len() < SIGNATURE_SIZE {
            return Err(TapoError::Malformed(format!(
                "response body too short: {} bytes",
                payload.len()
            )));
        }
        let (signature, ciphertext) = payload.split_at(SIGNATURE_SIZE);
        if ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(TapoError::Malformed("ciphertext not block-aligned".into()));
        }

        let expected = self.signature(seq, ciphertext);
        if !bool::from(signature.ct_eq(&expected)) {
            return Err(TapoError::SignatureInvalid);
        }

        let iv = self.iv_for(seq);
        let plaintext = Aes128CbcDec::new(&self.keys.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| TapoError::Malformed("ciphertext not block-aligned".into()))?;
        Ok(pkcs7_unpad(&plaintext)?.to_vec())
    }
}
