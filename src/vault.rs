//! Credential vault: authenticated encryption for secrets at rest.
//!
//! Tokens are `base64(nonce || tag || ciphertext)` using AES-256-GCM with a
//! 12-byte random nonce. Key material comes from the configured encryption
//! key: a string that base64-decodes to exactly 32 bytes is used verbatim,
//! anything else is treated as a passphrase and stretched with
//! PBKDF2-HMAC-SHA-256 over a per-instance salt persisted next to the
//! database with mode 0600.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::vault::{LEGACY_SALT, NONCE_LEN, PBKDF2_ITERATIONS, SALT_LEN, TAG_LEN};
use crate::errors::{CoreError, CoreResult};

pub struct CredentialVault {
    cipher: Aes256Gcm,
}

/// How the per-instance salt was obtained when the vault was opened.
/// A freshly created salt file signals that legacy ciphertexts (if any)
/// must be migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaltOrigin {
    Existing,
    Created,
    /// Raw 32-byte key configured; no salt file involved.
    RawKey,
}

impl CredentialVault {
    /// Open the vault for `database_path`, creating the salt file when
    /// missing. Returns the vault plus where the salt came from.
    pub fn open(key_material: &str, database_path: &str) -> Result<(Self, SaltOrigin)> {
        if let Some(raw) = decode_raw_key(key_material) {
            info!("Vault using configured 32-byte key verbatim");
            return Ok((Self::from_key(raw), SaltOrigin::RawKey));
        }

        let salt_path = salt_path_for(database_path);
        let (salt, origin) = load_or_create_salt(&salt_path)?;
        let vault = Self::from_passphrase(key_material, &salt);
        Ok((vault, origin))
    }

    /// Vault keyed with the pre-salt-file legacy salt. Only used by the
    /// startup migration to decrypt old tokens.
    pub fn legacy(key_material: &str) -> Self {
        if let Some(raw) = decode_raw_key(key_material) {
            return Self::from_key(raw);
        }
        Self::from_passphrase(key_material, LEGACY_SALT)
    }

    fn from_passphrase(passphrase: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
            passphrase.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            &mut key,
        );
        Self::from_key(key)
    }

    fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> CoreResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        // aes-gcm appends the tag to the ciphertext; the token layout wants
        // nonce || tag || ciphertext.
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CoreError::Internal("encryption failed".into()))?;
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut token = Vec::with_capacity(NONCE_LEN + TAG_LEN + body.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(tag);
        token.extend_from_slice(body);
        Ok(BASE64.encode(token))
    }

    pub fn decrypt(&self, token: &str) -> CoreResult<String> {
        let raw = BASE64
            .decode(token.trim())
            .map_err(|e| CoreError::Validation(format!("malformed credential token: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CoreError::Validation("credential token too short".into()));
        }

        let nonce = &raw[..NONCE_LEN];
        let tag = &raw[NONCE_LEN..NONCE_LEN + TAG_LEN];
        let body = &raw[NONCE_LEN + TAG_LEN..];

        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
            .map_err(|_| CoreError::Validation("credential token failed authentication".into()))?;
        String::from_utf8(plain)
            .map_err(|_| CoreError::Validation("decrypted credential is not UTF-8".into()))
    }
}

fn decode_raw_key(key_material: &str) -> Option<[u8; 32]> {
    let decoded = BASE64.decode(key_material.trim()).ok()?;
    let bytes: [u8; 32] = decoded.try_into().ok()?;
    Some(bytes)
}

fn salt_path_for(database_path: &str) -> PathBuf {
    PathBuf::from(format!("{database_path}.salt"))
}

fn load_or_create_salt(path: &Path) -> Result<(Vec<u8>, SaltOrigin)> {
    if path.exists() {
        let salt = std::fs::read(path)
            .with_context(|| format!("failed to read salt file {:?}", path))?;
        if salt.len() != SALT_LEN {
            anyhow::bail!(
                "salt file {:?} has {} bytes, expected {}",
                path,
                salt.len(),
                SALT_LEN
            );
        }
        return Ok((salt, SaltOrigin::Existing));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }

    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    std::fs::write(path, &salt).with_context(|| format!("failed to write salt file {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            warn!("Could not restrict permissions on {:?}: {}", path, e);
        }
    }

    info!("Created new vault salt at {:?}", path);
    Ok((salt, SaltOrigin::Created))
}
