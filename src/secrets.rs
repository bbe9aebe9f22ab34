//! Per-user provider credentials are stored encrypted with AES-256-GCM.
//!
//! Ciphertext layout is `base64(nonce || sealed)` with the 12-byte nonce first.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("user secret encryption is not configured")]
    Disabled,
    #[error("encrypted secret is not valid base64")]
    Encoding,
    #[error("encrypted secret is too short")]
    Truncated,
    #[error("failed to decrypt secret")]
    Decrypt,
    #[error("failed to encrypt secret")]
    Encrypt,
}

/// Chosen once at startup from `USER_SECRET_ENCRYPTION_KEY`.
#[derive(Clone)]
pub enum SecretCipher {
    Disabled,
    Enabled { key: [u8; 32] },
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretCipher::Disabled => f.write_str("SecretCipher::Disabled"),
            SecretCipher::Enabled { .. } => f.write_str("SecretCipher::Enabled"),
        }
    }
}

impl SecretCipher {
    /// The AES key is the SHA-256 of the passphrase. A blank passphrase disables encryption.
    pub fn from_passphrase(passphrase: Option<&str>) -> Self {
        match passphrase.map(str::trim) {
            Some(p) if !p.is_empty() => {
                let digest = Sha256::digest(p.as_bytes());
                let mut key = [0u8; 32];
                key.copy_from_slice(&digest);
                SecretCipher::Enabled { key }
            }
            _ => SecretCipher::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, SecretCipher::Enabled { .. })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, SecretError> {
        match self {
            SecretCipher::Disabled => Err(SecretError::Disabled),
            SecretCipher::Enabled { key } => UnboundKey::new(&AES_256_GCM, key)
                .map(LessSafeKey::new)
                .map_err(|_| SecretError::Encrypt),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let key = self.sealing_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| SecretError::Encrypt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| SecretError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretError> {
        let key = self.sealing_key()?;
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| SecretError::Encoding)?;
        if raw.len() < NONCE_LEN {
            return Err(SecretError::Truncated);
        }
        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| SecretError::Truncated)?;

        let mut in_out = sealed.to_vec();
        let plain = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plain.to_vec()).map_err(|_| SecretError::Decrypt)
    }
}
