//! Passphrase-derived key material.
//!
//! A [`KeyRing`] is created once per unlocked session from the user's
//! passphrase and a non-secret salt. It lives only in process memory: nothing
//! in here implements `Serialize`, the `Debug` output is redacted, and every
//! secret is zeroized on drop. Deriving again with the same inputs yields the
//! same keys, which is what lets a reinstalled app reopen an old database.
//!
//! Derivation: Argon2id(passphrase, salt) → `parent_key`, then HKDF-SHA256
//! over `parent_key` with distinct info labels → `encryption_key` and
//! `signing_key`.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::{DiaryError, Result};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const MIN_SALT_LEN: usize = 8;

const ENCRYPTION_INFO: &[u8] = b"uta-diary-encryption-v1";
const SIGNING_INFO: &[u8] = b"uta-diary-signing-v1";

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024, // 64 MiB
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// The three secrets derived from a passphrase. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub(crate) parent_key: [u8; KEY_LEN],
    pub(crate) encryption_key: [u8; KEY_LEN],
    pub(crate) signing_key: [u8; KEY_LEN],
}

impl DerivedKeys {
    pub fn new(
        parent_key: [u8; KEY_LEN],
        encryption_key: [u8; KEY_LEN],
        signing_key: [u8; KEY_LEN],
    ) -> Self {
        Self {
            parent_key,
            encryption_key,
            signing_key,
        }
    }

    /// Derive a further 32-byte sub-key from the parent key.
    pub(crate) fn subkey(&self, info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let hk = Hkdf::<Sha256>::new(None, &self.parent_key);
        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(info, &mut *out)
            .map_err(|e| DiaryError::KeyDerivation(e.to_string()))?;
        Ok(out)
    }
}

/// KDF capability: turns passphrase + salt into [`DerivedKeys`].
#[async_trait]
pub trait KeyDerivation: Send + Sync {
    async fn derive_keys(&self, passphrase: &str, salt: &[u8]) -> Result<DerivedKeys>;
}

/// Argon2id + HKDF-SHA256, run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Kdf {
    params: KdfParams,
}

impl Argon2Kdf {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl KeyDerivation for Argon2Kdf {
    async fn derive_keys(&self, passphrase: &str, salt: &[u8]) -> Result<DerivedKeys> {
        let params = self.params;
        let passphrase = Zeroizing::new(passphrase.to_owned());
        let salt = salt.to_vec();
        tokio::task::spawn_blocking(move || derive_blocking(&passphrase, &salt, params))
            .await
            .map_err(|e| DiaryError::KeyDerivation(format!("kdf task: {e}")))?
    }
}

fn derive_blocking(passphrase: &str, salt: &[u8], params: KdfParams) -> Result<DerivedKeys> {
    if salt.len() < MIN_SALT_LEN {
        return Err(DiaryError::KeyDerivation(format!(
            "salt must be at least {MIN_SALT_LEN} bytes, got {}",
            salt.len()
        )));
    }
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| DiaryError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut parent = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut *parent)
        .map_err(|e| DiaryError::KeyDerivation(format!("argon2 derive: {e}")))?;

    let hk = Hkdf::<Sha256>::new(Some(salt), &*parent);
    let mut encryption = Zeroizing::new([0u8; KEY_LEN]);
    let mut signing = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(ENCRYPTION_INFO, &mut *encryption)
        .map_err(|e| DiaryError::KeyDerivation(e.to_string()))?;
    hk.expand(SIGNING_INFO, &mut *signing)
        .map_err(|e| DiaryError::KeyDerivation(e.to_string()))?;

    Ok(DerivedKeys::new(*parent, *encryption, *signing))
}

/// Generate a fresh random salt. The salt is not secret; store it next to
/// the database.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

pub struct KeyRing {
    salt: Vec<u8>,
    keys: DerivedKeys,
}

impl KeyRing {
    /// Derive a key ring with the default Argon2id parameters.
    pub async fn create(passphrase: &str, salt: &[u8]) -> Result<Self> {
        Self::create_with(&Argon2Kdf::default(), passphrase, salt).await
    }

    pub async fn create_with(
        kdf: &dyn KeyDerivation,
        passphrase: &str,
        salt: &[u8],
    ) -> Result<Self> {
        let keys = kdf.derive_keys(passphrase, salt).await?;
        Ok(Self {
            salt: salt.to_vec(),
            keys,
        })
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Derive an application sub-key from the parent key, e.g. for
    /// encrypting attachments separately from the database.
    pub fn derive_subkey(&self, info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        self.keys.subkey(info)
    }

    /// Public half of the backup signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }

    pub(crate) fn keys(&self) -> &DerivedKeys {
        &self.keys
    }

    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.keys.signing_key)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("salt", &hex::encode(&self.salt))
            .field("keys", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
pub(crate) async fn test_key_ring(passphrase: &str) -> KeyRing {
    KeyRing::create_with(
        &Argon2Kdf::new(test_params()),
        passphrase,
        b"uta-test-salt-16",
    )
    .await
    .unwrap()
}
