use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("credential encryption failed")]
    Encrypt,
    #[error("credential token is not valid base64")]
    Encoding,
    #[error("credential token is too short")]
    Truncated,
    #[error("credential decryption failed: wrong key or tampered data")]
    Authentication,
    #[error("decrypted credential is not valid utf-8")]
    Utf8,
}

/// At-rest protection for stored server credentials.
pub trait CredentialCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, token: &str) -> Result<String, CipherError>;
}

/// AES-256-GCM keyed by SHA-256 of a configured secret. Tokens are
/// base64(nonce || ciphertext || tag) with a fresh random nonce per call.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmCipher(<key>)")
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&sealed);
        Ok(STANDARD.encode(token))
    }

    fn decrypt(&self, token: &str) -> Result<String, CipherError> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|_| CipherError::Encoding)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| CipherError::Authentication)?;
        String::from_utf8(plain).map_err(|_| CipherError::Utf8)
    }
}
