//! Symmetric encryption helpers.
//!
//! AES-256-CBC with PKCS#5 padding. Ciphertexts are self-contained: the
//! random IV is prepended to the encrypted data.

mod aes256;
mod pkcs5;

pub use aes256::{decrypt, encrypt, Aes256Key, AES256_IV_SIZE, AES256_KEY_SIZE};
pub use pkcs5::{pad, unpad};

use thiserror::Error;

/// Errors from encryption, decryption and padding operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Input shorter than required, or not block-aligned.
    #[error("truncated data")]
    TruncatedData,

    /// The final padding byte is inconsistent with the block size.
    #[error("invalid padding size {0}")]
    InvalidPaddingSize(usize),

    /// A key was built from data of the wrong length.
    #[error("invalid key size")]
    InvalidKeySize,

    /// A key hex string could not be decoded.
    #[error("invalid hex key: {0}")]
    InvalidHexKey(#[from] hex::FromHexError),
}
