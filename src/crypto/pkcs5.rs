//! PKCS#5 block padding.

use super::CryptoError;

/// Pad `data` to a multiple of `block_size`.
///
/// Input that is already block-aligned gains a full extra block, so the
/// padding size is always recoverable from the last byte.
pub fn pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let padding_size = block_size - data.len() % block_size;

    let mut padded = Vec::with_capacity(data.len() + padding_size);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding_size, padding_size as u8);

    padded
}

/// Remove PKCS#5 padding from `data`.
///
/// # Errors
/// Fails with [`CryptoError::TruncatedData`] if the input is not a positive
/// multiple of `block_size`, and with [`CryptoError::InvalidPaddingSize`] if
/// the final byte does not describe a valid padding length.
pub fn unpad(data: &[u8], block_size: usize) -> Result<Vec<u8>, CryptoError> {
    let data_size = data.len();

    if data_size == 0 || data_size % block_size != 0 {
        return Err(CryptoError::TruncatedData);
    }

    let padding_size = data[data_size - 1] as usize;
    if padding_size == 0 || padding_size > data_size || padding_size > block_size {
        return Err(CryptoError::InvalidPaddingSize(padding_size));
    }

    Ok(data[..data_size - padding_size].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad() {
        assert_eq!(pad(b"", 4), b"\x04\x04\x04\x04");
        assert_eq!(pad(b"a", 4), b"a\x03\x03\x03");
        assert_eq!(pad(b"ab", 4), b"ab\x02\x02");
        assert_eq!(pad(b"abc", 4), b"abc\x01");
        assert_eq!(pad(b"abcd", 4), b"abcd\x04\x04\x04\x04");
        assert_eq!(pad(b"abcde", 4), b"abcde\x03\x03\x03");
        assert_eq!(pad(b"abcdefgh", 4), b"abcdefgh\x04\x04\x04\x04");
    }

    #[test]
    fn test_unpad() {
        fn assert_unpad(expected: &[u8], data: &[u8]) {
            assert_eq!(unpad(data, 4).unwrap(), expected);
        }

        assert_unpad(b"", b"\x04\x04\x04\x04");
        assert_unpad(b"a", b"a\x03\x03\x03");
        assert_unpad(b"ab", b"ab\x02\x02");
        assert_unpad(b"abc", b"abc\x01");
        assert_unpad(b"abcd", b"abcd\x04\x04\x04\x04");
        assert_unpad(b"abcde", b"abcde\x03\x03\x03");
        assert_unpad(b"abcdefgh", b"abcdefgh\x04\x04\x04\x04");
    }

    #[test]
    fn test_unpad_invalid() {
        // Not block-aligned.
        assert!(unpad(b"abc", 4).is_err());
        assert!(unpad(b"", 4).is_err());

        // Padding byte inconsistent with the block size.
        assert!(unpad(b"abc\x00", 4).is_err());
        assert!(unpad(b"abc\x05", 4).is_err());
    }

    #[test]
    fn test_round_trip() {
        for block_size in [4usize, 8, 16] {
            for n in 0..=3 * block_size {
                let data: Vec<u8> = (0..n as u8).collect();

                let padded = pad(&data, block_size);
                assert_eq!(padded.len() % block_size, 0);
                assert!(padded.len() > data.len());

                assert_eq!(unpad(&padded, block_size).unwrap(), data);
            }
        }
    }
}
