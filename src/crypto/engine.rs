use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Helper to create an HMAC instance, resolving trait ambiguity.
fn new_hmac(key: &[u8]) -> Result<HmacSha256, ServiceError> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ServiceError::Encryption(format!("HMAC init failed: {e}")))
}

/// AES-256-GCM encryption for stored shop tokens, plus constant-time secret checks.
pub struct CryptoEngine {
    cipher: Aes256Gcm,
    hmac_key: Vec<u8>,
}

impl CryptoEngine {
    /// Create a new CryptoEngine from base64-encoded keys.
    pub fn new(master_key_b64: &str, hmac_secret_b64: &str) -> Result<Self, ServiceError> {
        let master_key = base64::engine::general_purpose::STANDARD
            .decode(master_key_b64)
            .map_err(|e| ServiceError::Config(format!("Invalid MASTER_KEY base64: {e}")))?;

        if master_key.len() != 32 {
            return Err(ServiceError::Config(format!(
                "MASTER_KEY must be 32 bytes, got {}",
                master_key.len()
            )));
        }

        let hmac_key = base64::engine::general_purpose::STANDARD
            .decode(hmac_secret_b64)
            .map_err(|e| ServiceError::Config(format!("Invalid HMAC_SECRET base64: {e}")))?;

        if hmac_key.is_empty() {
            return Err(ServiceError::Config("HMAC_SECRET must not be empty".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&master_key)
            .map_err(|e| ServiceError::Encryption(format!("Failed to init AES cipher: {e}")))?;

        Ok(Self { cipher, hmac_key })
    }

    /// Encrypt plaintext using AES-256-GCM. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, ServiceError> {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ServiceError::Encryption(format!("Encryption failed: {e}")))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt base64(nonce || ciphertext) back to plaintext.
    pub fn decrypt(&self, encrypted_b64: &str) -> Result<String, ServiceError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| ServiceError::Encryption(format!("Invalid base64: {e}")))?;

        if combined.len() < 12 {
            return Err(ServiceError::Encryption("Ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| ServiceError::Encryption(format!("Decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| ServiceError::Encryption(format!("Invalid UTF-8 after decrypt: {e}")))
    }

    /// Exact-match comparison of a caller-supplied secret against the expected one.
    ///
    /// Both sides are MACed first so the comparison time does not leak how many
    /// leading bytes matched. An empty expected secret never matches.
    pub fn secrets_match(&self, provided: &str, expected: &str) -> bool {
        if expected.is_empty() {
            return false;
        }
        let Ok(mut expected_mac) = new_hmac(&self.hmac_key) else {
            return false;
        };
        expected_mac.update(expected.as_bytes());
        let expected_tag = expected_mac.finalize().into_bytes();

        let Ok(mut provided_mac) = new_hmac(&self.hmac_key) else {
            return false;
        };
        provided_mac.update(provided.as_bytes());
        provided_mac.verify_slice(&expected_tag).is_ok()
    }
}

/// Deterministic fingerprint of a refresh token, used as the compare-and-set key
/// since the encrypted column itself is randomised per write.
pub fn fingerprint(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> CryptoEngine {
        let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
        let hmac = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
        CryptoEngine::new(&key, &hmac).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let engine = test_engine();
        let plaintext = "shop-refresh-token-12345";
        let encrypted = engine.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        let decrypted = engine.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_produces_different_ciphertexts() {
        let engine = test_engine();
        let a = engine.encrypt("same-input").unwrap();
        let b = engine.encrypt("same-input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_master_key_rejected() {
        let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 16]);
        let hmac = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
        assert!(matches!(
            CryptoEngine::new(&key, &hmac),
            Err(ServiceError::Config(_))
        ));
    }

    #[test]
    fn test_secrets_match_is_exact() {
        let engine = test_engine();
        assert!(engine.secrets_match("cron-secret", "cron-secret"));
        assert!(!engine.secrets_match("cron-secre", "cron-secret"));
        assert!(!engine.secrets_match("cron-secret ", "cron-secret"));
        assert!(!engine.secrets_match("", ""));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("rt-1"), fingerprint("rt-1"));
        assert_ne!(fingerprint("rt-1"), fingerprint("rt-2"));
        assert_eq!(fingerprint("rt-1").len(), 64);
    }
}
