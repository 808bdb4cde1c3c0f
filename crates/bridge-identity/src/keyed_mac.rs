//! Keyed-MAC remote-id derivation: `AES-128-CBC(key, IV=0, mac)`, used when a
//! broker carries `topic_encryption_key` but a device has no usable salt.
//!
//! The zero IV is safe here only because each device's plaintext (its MAC)
//! is unique; this key must not be reused for general-purpose encryption.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use cbc::Encryptor;

type Aes128CbcEnc = Encryptor<Aes128>;

#[derive(Debug)]
pub enum KeyedMacError {
    InvalidHexKey,
    WrongKeyLength(usize),
}

impl std::fmt::Display for KeyedMacError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyedMacError::InvalidHexKey => write!(f, "topic_encryption_key is not valid hex"),
            KeyedMacError::WrongKeyLength(n) => {
                write!(f, "topic_encryption_key must decode to 16 bytes, got {n}")
            }
        }
    }
}

impl std::error::Error for KeyedMacError {}

/// Encrypts `mac`'s ASCII bytes under `key_hex` and returns lowercase hex.
/// For a 12-byte MAC this pads to one AES block under PKCS#7, producing 32
/// hex characters — matching scenario 1 of the testable properties.
pub fn keyed_mac_remote_id(key_hex: &str, mac: &str) -> Result<String, KeyedMacError> {
    let key = hex::decode(key_hex).map_err(|_| KeyedMacError::InvalidHexKey)?;
    if key.len() != 16 {
        return Err(KeyedMacError::WrongKeyLength(key.len()));
    }
    let iv = [0u8; 16];
    let encryptor = Aes128CbcEnc::new(key.as_slice().into(), &iv.into());
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(mac.as_bytes());
    Ok(hex::encode(ciphertext))
}
