//! Password hashing and field encryption used by computed column rules.
//!
//! Both are consumed by the transformer as opaque functions:
//! `(plaintext, iterations) -> (hash, salt)` and `(plaintext) -> ciphertext`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Output of a password hash, both parts base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedSecret {
    pub hash: String,
    pub salt: String,
}

/// Salted password hashing.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plaintext: &str) -> std::result::Result<HashedSecret, String>;

    /// Check a plaintext against a stored hash and salt.
    fn verify(&self, plaintext: &str, secret: &HashedSecret) -> bool;
}

/// PBKDF2-HMAC-SHA256 with a random salt per call.
pub struct Pbkdf2Hasher {
    iterations: u32,
}

impl Pbkdf2Hasher {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    fn derive(&self, plaintext: &str, salt: &[u8]) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), salt, self.iterations, &mut out);
        out
    }
}

impl PasswordHasher for Pbkdf2Hasher {
    fn hash(&self, plaintext: &str) -> std::result::Result<HashedSecret, String> {
        let salt: [u8; SALT_LEN] = rand::thread_rng().gen();
        let hash = self.derive(plaintext, &salt);
        Ok(HashedSecret {
            hash: BASE64.encode(hash),
            salt: BASE64.encode(salt),
        })
    }

    fn verify(&self, plaintext: &str, secret: &HashedSecret) -> bool {
        match BASE64.decode(&secret.salt) {
            Ok(salt) => BASE64.encode(self.derive(plaintext, &salt)) == secret.hash,
            Err(_) => false,
        }
    }
}

/// Single salted SHA-256 round, for test loads where hashing cost dominates.
pub struct FastHasher;

impl FastHasher {
    fn digest(plaintext: &str, salt: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(plaintext.as_bytes());
        hasher.finalize().to_vec()
    }
}

impl PasswordHasher for FastHasher {
    fn hash(&self, plaintext: &str) -> std::result::Result<HashedSecret, String> {
        let salt: [u8; SALT_LEN] = rand::thread_rng().gen();
        Ok(HashedSecret {
            hash: BASE64.encode(Self::digest(plaintext, &salt)),
            salt: BASE64.encode(salt),
        })
    }

    fn verify(&self, plaintext: &str, secret: &HashedSecret) -> bool {
        match BASE64.decode(&secret.salt) {
            Ok(salt) => BASE64.encode(Self::digest(plaintext, &salt)) == secret.hash,
            Err(_) => false,
        }
    }
}

/// Build the hasher selected by configuration.
pub fn hasher_for(fast_mode: bool, iterations: u32) -> Box<dyn PasswordHasher> {
    if fast_mode {
        Box::new(FastHasher)
    } else {
        Box::new(Pbkdf2Hasher::new(iterations))
    }
}

/// Symmetric field encryption.
pub trait FieldCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> std::result::Result<String, String>;
    fn decrypt(&self, ciphertext: &str) -> std::result::Result<String, String>;
}

/// AES-256-GCM; output is base64 of the 12-byte nonce followed by the ciphertext.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(MigrateError::Config(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| MigrateError::Config(format!("invalid encryption key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(key: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(key.trim())
            .map_err(|e| MigrateError::Config(format!("encryption key is not base64: {}", e)))?;
        Self::new(&bytes)
    }
}

impl FieldCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> std::result::Result<String, String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| format!("encryption failed: {}", e))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, ciphertext: &str) -> std::result::Result<String, String> {
        let combined = BASE64
            .decode(ciphertext)
            .map_err(|e| format!("invalid base64: {}", e))?;
        if combined.len() < NONCE_LEN {
            return Err("ciphertext too short".to_string());
        }
        let nonce = Nonce::from_slice(&combined[..NONCE_LEN]);
        let plain = self
            .cipher
            .decrypt(nonce, &combined[NONCE_LEN..])
            .map_err(|e| format!("decryption failed: {}", e))?;
        String::from_utf8(plain).map_err(|e| format!("invalid utf-8: {}", e))
    }
}

/// Keep the last `visible` characters and replace the rest with `mask_char`.
pub fn mask(value: &str, visible: usize, mask_char: char) -> String {
    let len = value.chars().count();
    let hidden = len.saturating_sub(visible);
    value
        .chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { mask_char } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf2_round_trip_and_random_salt() {
        let hasher = Pbkdf2Hasher::new(1_000);
        let a = hasher.hash("s3cret").unwrap();
        let b = hasher.hash("s3cret").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
        assert!(hasher.verify("s3cret", &a));
        assert!(!hasher.verify("other", &a));
    }

    #[test]
    fn test_fast_hasher_verifies() {
        let secret = FastHasher.hash("pw").unwrap();
        assert!(FastHasher.verify("pw", &secret));
        assert!(!FastHasher.verify("pw2", &secret));
        assert_eq!(BASE64.decode(&secret.salt).unwrap().len(), SALT_LEN);
    }

    #[test]
    fn test_aes_gcm_round_trip() {
        let key = [7u8; 32];
        let cipher = AesGcmCipher::new(&key).unwrap();
        let ct = cipher.encrypt("4111 1111 1111 1111").unwrap();
        assert_ne!(ct, "4111 1111 1111 1111");
        assert_eq!(cipher.decrypt(&ct).unwrap(), "4111 1111 1111 1111");
    }

    #[test]
    fn test_cipher_rejects_short_key() {
        assert!(AesGcmCipher::new(&[1u8; 16]).is_err());
        assert!(AesGcmCipher::from_base64("not base64!").is_err());
        let key = BASE64.encode([9u8; 32]);
        assert!(AesGcmCipher::from_base64(&key).is_ok());
    }

    #[test]
    fn test_mask_keeps_tail() {
        assert_eq!(mask("0612345678", 4, '*'), "******5678");
        assert_eq!(mask("abc", 4, '*'), "abc");
        assert_eq!(mask("", 2, '#'), "");
    }
}
