//! Password encryption for the `encrypted` authentication mode.
//!
//! The secret file holds a fixed-length (24 byte) key. A 256-bit AES-GCM key
//! is derived from it with HKDF-SHA256, so the same file works for both
//! directions and a wrong file is detected by the authentication tag rather
//! than producing garbage.
//!
//! Ciphertext format: standard base64 of `nonce (12 bytes) || sealed`, where
//! `sealed` is the AES-256-GCM output with the tag appended.

use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hkdf::{Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::SecretString;

use crate::error::{Error, Result};

/// Required length of the key stored in the secret file.
pub const SECRET_LEN: usize = 24;

const HKDF_SALT: &[u8] = b"mysql-records-password-v1";
const HKDF_INFO: &[u8] = b"password";

/// Read the key from `path`.
///
/// A single trailing newline (`\n` or `\r\n`) is ignored so files written by
/// `echo` work.
pub fn read_secret(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = std::fs::read(path).map_err(|e| Error::SecretUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if bytes.ends_with(b"\r\n") {
        bytes.truncate(bytes.len() - 2);
    } else if bytes.ends_with(b"\n") {
        bytes.truncate(bytes.len() - 1);
    }

    if bytes.len() != SECRET_LEN {
        return Err(Error::SecretUnavailable {
            path: path.to_path_buf(),
            reason: format!("expected a {SECRET_LEN} byte key, found {} bytes", bytes.len()),
        });
    }
    Ok(bytes)
}

/// Symmetric cipher bound to one secret.
pub struct PasswordCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl PasswordCipher {
    /// Derive the cipher key from the raw secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let prk = Salt::new(HKDF_SHA256, HKDF_SALT).extract(secret);
        let info = [HKDF_INFO];
        let okm = prk
            .expand(&info, &AES_256_GCM)
            .map_err(|_| Error::EncryptionFailed("key derivation failed".into()))?;
        Ok(Self {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            rng: SystemRandom::new(),
        })
    }

    /// Read the secret file and derive the cipher key from it.
    pub fn from_secret_file(path: &Path) -> Result<Self> {
        let secret = read_secret(path)?;
        Self::from_secret(&secret)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::EncryptionFailed("random nonce generation failed".into()))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::EncryptionFailed("sealing failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<SecretString> {
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| Error::DecryptionFailed(format!("ciphertext is not valid base64: {e}")))?;

        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(Error::DecryptionFailed("ciphertext is too short".into()));
        }

        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::DecryptionFailed("invalid nonce".into()))?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                Error::DecryptionFailed("wrong key or corrupted ciphertext".into())
            })?;

        let plaintext = String::from_utf8(plaintext.to_vec())
            .map_err(|_| Error::DecryptionFailed("plaintext is not valid UTF-8".into()))?;
        Ok(SecretString::from(plaintext))
    }
}

impl fmt::Debug for PasswordCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt `plaintext` with the key stored at `secret_path`.
pub fn encrypt_password(plaintext: &str, secret_path: &Path) -> Result<String> {
    PasswordCipher::from_secret_file(secret_path)?.encrypt(plaintext)
}

/// Decrypt `ciphertext` with the key stored at `secret_path`.
pub fn decrypt_password(ciphertext: &str, secret_path: &Path) -> Result<SecretString> {
    PasswordCipher::from_secret_file(secret_path)?.decrypt(ciphertext)
}
