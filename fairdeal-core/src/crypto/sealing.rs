//! Passphrase sealing for private session material kept at rest.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedData {
    pub version: u32,
    pub encryption_method: String,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub encrypted_data: Vec<u8>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Seal `data` under a key derived from `passphrase`.
pub fn seal(data: &[u8], passphrase: &str) -> Result<SealedData> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(passphrase, &salt);

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(&key);
    let encrypted_data = cipher
        .encrypt(Nonce::from_slice(&nonce), data)
        .map_err(|e| CoreError::encryption(format!("sealing failed: {}", e)))?;

    let checksum = calculate_checksum(&encrypted_data);

    Ok(SealedData {
        version: 1,
        encryption_method: "ChaCha20Poly1305".to_string(),
        salt: salt.to_vec(),
        nonce: nonce.to_vec(),
        encrypted_data,
        checksum,
        created_at: Utc::now(),
    })
}

/// Open sealed data. A wrong passphrase and a corrupted blob both fail.
pub fn open(sealed: &SealedData, passphrase: &str) -> Result<Vec<u8>> {
    if calculate_checksum(&sealed.encrypted_data) != sealed.checksum {
        return Err(CoreError::sealing("checksum verification failed"));
    }
    if sealed.nonce.len() != NONCE_SIZE {
        return Err(CoreError::sealing("bad nonce length"));
    }

    let key = derive_key(passphrase, &sealed.salt);
    let cipher = ChaCha20Poly1305::new(&key);

    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            sealed.encrypted_data.as_ref(),
        )
        .map_err(|_| CoreError::sealing("wrong passphrase or corrupted data"))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Key {
    use pbkdf2::pbkdf2_hmac;

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    *Key::from_slice(&key)
}

fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
