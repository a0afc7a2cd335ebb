//! AES-256-CBC encryption.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{pkcs5, CryptoError};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size, and therefore the IV size.
pub const AES256_IV_SIZE: usize = 16;

/// Key size in bytes.
pub const AES256_KEY_SIZE: usize = 32;

/// A 256 bit AES key.
#[derive(Clone, PartialEq, Eq)]
pub struct Aes256Key([u8; AES256_KEY_SIZE]);

impl Aes256Key {
    /// Decode a key from its 64 character hex form.
    ///
    /// # Errors
    /// Fails if the string is not valid hex or does not decode to 32 bytes.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let data = hex::decode(s)?;

        let bytes: [u8; AES256_KEY_SIZE] =
            data.try_into().map_err(|_| CryptoError::InvalidKeySize)?;

        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; AES256_KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; AES256_KEY_SIZE]> for Aes256Key {
    fn from(bytes: [u8; AES256_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Aes256Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must not leak into logs.
        f.write_str("Aes256Key(..)")
    }
}

/// Encrypt `data` with AES-256-CBC.
///
/// The output is the random IV followed by the ciphertext of the PKCS#5
/// padded input.
pub fn encrypt(data: &[u8], key: &Aes256Key) -> Result<Vec<u8>, CryptoError> {
    let padded = pkcs5::pad(data, AES256_IV_SIZE);

    let mut iv = [0u8; AES256_IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let encryptor = Aes256CbcEnc::new(&key.0.into(), &iv.into());
    let encrypted = encryptor.encrypt_padded_vec_mut::<NoPadding>(&padded);

    let mut output = Vec::with_capacity(AES256_IV_SIZE + encrypted.len());
    output.extend_from_slice(&iv);
    output.extend_from_slice(&encrypted);

    Ok(output)
}

/// Decrypt data produced by [`encrypt`].
///
/// # Errors
/// Fails with [`CryptoError::TruncatedData`] if the input is shorter than
/// the IV or the ciphertext is not block-aligned, and with a padding error
/// if the decrypted data is not correctly padded.
pub fn decrypt(data: &[u8], key: &Aes256Key) -> Result<Vec<u8>, CryptoError> {
    if data.len() < AES256_IV_SIZE {
        return Err(CryptoError::TruncatedData);
    }

    let (iv, encrypted) = data.split_at(AES256_IV_SIZE);

    if encrypted.len() % AES256_IV_SIZE != 0 {
        return Err(CryptoError::TruncatedData);
    }

    let iv: [u8; AES256_IV_SIZE] = iv.try_into().expect("iv slice has the fixed size");

    let decryptor = Aes256CbcDec::new(&key.0.into(), &iv.into());
    let padded = decryptor
        .decrypt_padded_vec_mut::<NoPadding>(encrypted)
        .map_err(|_| CryptoError::TruncatedData)?;

    pkcs5::unpad(&padded, AES256_IV_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_HEX: &str = "28278b7c0a25f01d3cab639633b9487f9ea1e9a2176dc9595a3f01323aa44284";

    #[test]
    fn test_key_hex_round_trip() {
        let key = Aes256Key::from_hex(TEST_KEY_HEX).unwrap();
        assert_eq!(key.to_hex(), TEST_KEY_HEX);
        assert_eq!(key.as_bytes(), &hex::decode(TEST_KEY_HEX).unwrap()[..]);
    }

    #[test]
    fn test_key_invalid() {
        assert!(Aes256Key::from_hex("zz").is_err());
        assert!(Aes256Key::from_hex("28278b7c").is_err());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = Aes256Key::from_hex(TEST_KEY_HEX).unwrap();

        for n in [0usize, 1, 15, 16, 17, 100] {
            let data: Vec<u8> = (0..n as u8).collect();

            let encrypted = encrypt(&data, &key).unwrap();
            assert_eq!(encrypted.len() % AES256_IV_SIZE, 0);
            assert!(encrypted.len() >= AES256_IV_SIZE + AES256_IV_SIZE);

            let decrypted = decrypt(&encrypted, &key).unwrap();
            assert_eq!(decrypted, data);
        }
    }

    #[test]
    fn test_decrypt_truncated() {
        let key = Aes256Key::from_hex(TEST_KEY_HEX).unwrap();

        // Shorter than the IV.
        let err = decrypt(b"foo", &key).unwrap_err();
        assert!(matches!(err, CryptoError::TruncatedData));

        // IV present but ciphertext not block-aligned.
        let mut data = vec![0u8; AES256_IV_SIZE];
        data.extend_from_slice(b"foo");
        assert!(decrypt(&data, &key).is_err());
    }
}
