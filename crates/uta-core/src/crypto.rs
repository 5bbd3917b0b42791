//! Sealing and signing of database payloads.
//!
//! Envelope layout:
//!   [ magic "UTADIARY" (8) | format version u32 LE (4) | nonce (24) | ciphertext + tag ]
//!
//! The 12-byte prefix is bound as associated data, so swapping the version
//! or magic also breaks authentication. Text variants wrap the envelope in
//! standard base64 for storage through the text-only filesystem contract.

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer};
use zeroize::Zeroizing;

use crate::error::{DiaryError, Result};
use crate::keyring::KeyRing;

pub const ENVELOPE_MAGIC: &[u8; 8] = b"UTADIARY";
pub const ENVELOPE_VERSION: u32 = 1;
const HEADER_LEN: usize = 12;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

fn header() -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[..8].copy_from_slice(ENVELOPE_MAGIC);
    buf[8..].copy_from_slice(&ENVELOPE_VERSION.to_le_bytes());
    buf
}

/// Encrypt a serialized document with the ring's encryption key.
pub fn encrypt(plaintext: &[u8], key_ring: &KeyRing) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(&key_ring.keys().encryption_key)
        .map_err(|_| DiaryError::Encryption)?;
    // Fresh nonce per commit; XChaCha's 192-bit nonce makes random reuse negligible.
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let header = header();
    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|_| DiaryError::Encryption)?;

    let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope produced by [`encrypt`]. Any malformed, tampered or
/// foreign-key input fails with [`DiaryError::Integrity`].
pub fn decrypt(envelope: &[u8], key_ring: &KeyRing) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
        return Err(DiaryError::Integrity);
    }
    let (prefix, rest) = envelope.split_at(HEADER_LEN);
    if prefix != &header()[..] {
        return Err(DiaryError::Integrity);
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(&key_ring.keys().encryption_key)
        .map_err(|_| DiaryError::Integrity)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: prefix,
            },
        )
        .map_err(|_| DiaryError::Integrity)?;
    Ok(Zeroizing::new(plaintext))
}

/// [`encrypt`], base64-encoded.
pub fn seal_text(plaintext: &[u8], key_ring: &KeyRing) -> Result<String> {
    Ok(general_purpose::STANDARD.encode(encrypt(plaintext, key_ring)?))
}

/// Inverse of [`seal_text`].
pub fn open_text(sealed: &str, key_ring: &KeyRing) -> Result<Zeroizing<Vec<u8>>> {
    let envelope = general_purpose::STANDARD
        .decode(sealed.trim())
        .map_err(|_| DiaryError::Integrity)?;
    decrypt(&envelope, key_ring)
}

/// Ed25519 signature over `bytes`, hex-encoded.
pub fn sign(bytes: &[u8], key_ring: &KeyRing) -> String {
    let signature: Signature = key_ring.signing_key().sign(bytes);
    hex::encode(signature.to_bytes())
}

pub fn verify(bytes: &[u8], signature_hex: &str, key_ring: &KeyRing) -> Result<()> {
    let raw = hex::decode(signature_hex).map_err(|_| DiaryError::Integrity)?;
    let raw: [u8; 64] = raw.try_into().map_err(|_| DiaryError::Integrity)?;
    let signature = Signature::from_bytes(&raw);
    key_ring
        .verifying_key()
        .verify_strict(bytes, &signature)
        .map_err(|_| DiaryError::Integrity)
}
