use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::env;

const NONCE_SIZE: usize = 12;

/// AES-256-GCM encryption for sender SMTP passwords at rest. The nonce
/// is prepended to the ciphertext.
pub struct EncryptionService {
    cipher: Aes256Gcm,
    key_id: String,
}

impl EncryptionService {
    pub fn new() -> Result<Self, String> {
        let key_str = env::var("ENCRYPTION_KEY")
            .map_err(|_| "ENCRYPTION_KEY environment variable not set")?;
        let key_bytes = BASE64
            .decode(&key_str)
            .map_err(|e| format!("Invalid ENCRYPTION_KEY format: {}", e))?;
        let key_id =
            env::var("ENCRYPTION_KEY_ID").unwrap_or_else(|_| "default-key-v1".to_string());
        Self::with_key(&key_bytes, &key_id)
    }

    pub fn with_key(key_bytes: &[u8], key_id: &str) -> Result<Self, String> {
        if key_bytes.len() != 32 {
            return Err("encryption key must be 32 bytes (256 bits)".to_string());
        }
        Ok(Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key_bytes)),
            key_id: key_id.to_string(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, String> {
        use rand::RngCore;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| format!("encryption failed: {}", e))?;

        let mut out = nonce_bytes.to_vec();
        out.extend(ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<String, String> {
        if data.len() < NONCE_SIZE {
            return Err("encrypted data too short".to_string());
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| format!("decryption failed: {}", e))?;
        String::from_utf8(plaintext).map_err(|e| format!("decrypted data is not UTF-8: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let service = EncryptionService::with_key(&[7u8; 32], "test-key").unwrap();
        let encrypted = service.encrypt("smtp-secret").unwrap();
        assert_ne!(encrypted, b"smtp-secret");
        assert_eq!(service.decrypt(&encrypted).unwrap(), "smtp-secret");
        assert_eq!(service.key_id(), "test-key");
    }

    #[test]
    fn test_truncated_data_rejected() {
        let service = EncryptionService::with_key(&[7u8; 32], "test-key").unwrap();
        assert!(service.decrypt(&[1, 2, 3]).is_err());
    }
}
