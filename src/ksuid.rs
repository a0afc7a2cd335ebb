//! K-sortable unique identifiers.
//!
//! Used to correlate log records with a single inbound HTTP request. An id
//! is 20 bytes, a 4 byte timestamp followed by 16 random bytes, rendered as
//! a fixed 27 character base62 string. The leading timestamp makes the
//! textual form lexicographically sortable by generation time.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

/// Offset subtracted from the Unix timestamp, extending the range of the
/// 4 byte seconds field well past 2100.
const EPOCH_OFFSET_SECS: u64 = 1_400_000_000;

/// Rendered identifier length.
pub const KSUID_STRING_SIZE: usize = 27;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// A k-sortable unique identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ksuid([u8; 20]);

impl Ksuid {
    /// Generate a new identifier from the current time and random payload.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let timestamp = now.saturating_sub(EPOCH_OFFSET_SECS) as u32;

        let mut payload = [0u8; 16];
        OsRng.fill_bytes(&mut payload);

        Self::from_parts(timestamp, payload)
    }

    fn from_parts(timestamp: u32, payload: [u8; 16]) -> Self {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&timestamp.to_be_bytes());
        bytes[4..].copy_from_slice(&payload);

        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Ksuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Base62 long division over the 20 byte big-endian value, padded to
        // the fixed width so the textual ordering matches the byte ordering.
        let mut digits: Vec<u8> = self.0.to_vec();
        let mut encoded = Vec::with_capacity(KSUID_STRING_SIZE);

        while !digits.is_empty() {
            let mut remainder: u32 = 0;
            let mut quotient = Vec::with_capacity(digits.len());

            for &b in &digits {
                let value = remainder * 256 + u32::from(b);
                let q = (value / 62) as u8;
                remainder = value % 62;

                if !quotient.is_empty() || q != 0 {
                    quotient.push(q);
                }
            }

            encoded.push(BASE62[remainder as usize]);
            digits = quotient;
        }

        while encoded.len() < KSUID_STRING_SIZE {
            encoded.push(b'0');
        }

        encoded.reverse();

        f.write_str(std::str::from_utf8(&encoded).expect("base62 output is ascii"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_size() {
        for _ in 0..100 {
            let id = Ksuid::generate();
            assert_eq!(id.to_string().len(), KSUID_STRING_SIZE);
        }

        // Extremes keep the fixed width.
        assert_eq!(
            Ksuid::from_parts(0, [0; 16]).to_string(),
            "0".repeat(KSUID_STRING_SIZE)
        );
        assert_eq!(
            Ksuid::from_parts(u32::MAX, [0xff; 16]).to_string().len(),
            KSUID_STRING_SIZE
        );
    }

    #[test]
    fn test_uniqueness() {
        let mut seen = std::collections::HashSet::new();

        for _ in 0..1000 {
            assert!(seen.insert(Ksuid::generate().to_string()));
        }
    }

    #[test]
    fn test_sortable_by_timestamp() {
        let earlier = Ksuid::from_parts(1000, [0xff; 16]);
        let later = Ksuid::from_parts(1001, [0x00; 16]);

        assert!(earlier < later);
        assert!(earlier.to_string() < later.to_string());
    }
}
