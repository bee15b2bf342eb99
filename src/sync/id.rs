//! Random identifiers for runs and DLQ items

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

const ID_BYTES: usize = 12;

/// URL-safe Base64 of 12 random bytes (16 characters)
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Fixed length, URL safe, unique
    #[test]
    fn test_generate_id() {
        let a = generate_id();
        let b = generate_id();

        assert_eq!(a.len(), 16);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, b);
    }
}
