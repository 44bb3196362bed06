//! Per-message key derivation and AES-256-CBC for the gateway envelope.
//!
//! Every session that completed key negotiation holds a 32-byte shared
//! secret. Each message derives its own keys from it:
//!
//!   auth    = secret || sha256(secret) || secret || sha256(secret)   (128 B)
//!   msg_key = sha256(auth[88..120] || plaintext)[8..24]
//!   a       = sha256(msg_key || auth[0..36])
//!   b       = sha256(auth[40..76] || msg_key)
//!   key     = a[0..8]  || b[8..24] || a[24..32]
//!   iv      = b[0..8]  || a[8..24] || b[24..32]
//!
//! The cipher uses the first 16 bytes of the derived IV. The message key
//! travels in the clear in the envelope header and binds the ciphertext to
//! its plaintext: decryption recomputes it and rejects a mismatch.
//!
//! All functions are pure. Key material zeroizes on drop.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::MSG_KEY_LEN;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Shared secret length.
pub const SHARE_KEY_LEN: usize = 32;

/// AES block size.
pub const BLOCK_LEN: usize = 16;

const AUTH_KEY_LEN: usize = 128;

pub type MsgKey = [u8; MSG_KEY_LEN];

// ── Key material ──────────────────────────────────────────────────────────────

/// The negotiated 32-byte shared secret of a session.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ShareKey([u8; SHARE_KEY_LEN]);

impl ShareKey {
    pub fn new(bytes: [u8; SHARE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SHARE_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::ShareKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SHARE_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for ShareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShareKey(..)")
    }
}

/// AES key and IV derived for one message.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AesKeyIv {
    pub key: [u8; 32],
    pub iv: [u8; 32],
}

// ── Derivation ────────────────────────────────────────────────────────────────

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

/// Expand the shared secret into the 128-byte auth key.
pub fn derive_auth_key(secret: &ShareKey) -> Zeroizing<[u8; AUTH_KEY_LEN]> {
    let digest = Zeroizing::new(sha256(&[secret.as_bytes()]));
    let mut auth = Zeroizing::new([0u8; AUTH_KEY_LEN]);
    for (i, chunk) in auth.chunks_exact_mut(SHARE_KEY_LEN).enumerate() {
        if i % 2 == 0 {
            chunk.copy_from_slice(secret.as_bytes());
        } else {
            chunk.copy_from_slice(&digest[..]);
        }
    }
    auth
}

/// Message key for `plaintext` under `secret`.
pub fn derive_msg_key(secret: &ShareKey, plaintext: &[u8]) -> MsgKey {
    let auth = derive_auth_key(secret);
    let digest = sha256(&[&auth[88..120], plaintext]);
    let mut msg_key = [0u8; MSG_KEY_LEN];
    msg_key.copy_from_slice(&digest[8..24]);
    msg_key
}

/// AES key and IV for one message.
pub fn derive_aes_key(secret: &ShareKey, msg_key: &MsgKey) -> AesKeyIv {
    let auth = derive_auth_key(secret);
    let a = Zeroizing::new(sha256(&[msg_key, &auth[0..36]]));
    let b = Zeroizing::new(sha256(&[&auth[40..76], msg_key]));

    let mut out = AesKeyIv {
        key: [0u8; 32],
        iv: [0u8; 32],
    };
    out.key[..8].copy_from_slice(&a[..8]);
    out.key[8..24].copy_from_slice(&b[8..24]);
    out.key[24..].copy_from_slice(&a[24..]);

    out.iv[..8].copy_from_slice(&b[..8]);
    out.iv[8..24].copy_from_slice(&a[8..24]);
    out.iv[24..].copy_from_slice(&b[24..]);
    out
}

/// Slice entry point for callers holding unchecked buffers.
pub fn derive_aes_key_from_slices(secret: &[u8], msg_key: &[u8]) -> Result<AesKeyIv, CryptoError> {
    let secret = ShareKey::from_slice(secret)?;
    let msg_key: MsgKey = msg_key
        .try_into()
        .map_err(|_| CryptoError::MsgKeyLength(msg_key.len()))?;
    Ok(derive_aes_key(&secret, &msg_key))
}

// ── AES-CBC ───────────────────────────────────────────────────────────────────

fn cipher_iv(iv: &[u8; 32]) -> [u8; BLOCK_LEN] {
    let mut out = [0u8; BLOCK_LEN];
    out.copy_from_slice(&iv[..BLOCK_LEN]);
    out
}

/// AES-256-CBC with PKCS#7 padding. Output is always a non-empty multiple
/// of the block size.
pub fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256CbcEnc::new(&(*key).into(), &cipher_iv(iv).into());
    cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn aes_cbc_decrypt(key: &[u8; 32], iv: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::NotBlockAligned(ciphertext.len()));
    }
    let cipher = Aes256CbcDec::new(&(*key).into(), &cipher_iv(iv).into());
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

// ── Envelope body ─────────────────────────────────────────────────────────────

/// Encrypt a message body. Returns the message key to put in the envelope
/// header and the ciphertext.
pub fn encrypt(secret: &ShareKey, plaintext: &[u8]) -> (MsgKey, Vec<u8>) {
    let msg_key = derive_msg_key(secret, plaintext);
    let keys = derive_aes_key(secret, &msg_key);
    (msg_key, aes_cbc_encrypt(&keys.key, &keys.iv, plaintext))
}

/// Decrypt a message body and verify it against its message key.
pub fn decrypt(secret: &ShareKey, msg_key: &MsgKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let keys = derive_aes_key(secret, msg_key);
    let plaintext = aes_cbc_decrypt(&keys.key, &keys.iv, ciphertext)?;
    if derive_msg_key(secret, &plaintext) != *msg_key {
        return Err(CryptoError::MsgKeyMismatch);
    }
    Ok(plaintext)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("shared secret must be {SHARE_KEY_LEN} bytes, got {0}")]
    ShareKeyLength(usize),

    #[error("message key must be {MSG_KEY_LEN} bytes, got {0}")]
    MsgKeyLength(usize),

    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    NotBlockAligned(usize),

    #[error("invalid padding")]
    BadPadding,

    #[error("message key does not match decrypted content")]
    MsgKeyMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
