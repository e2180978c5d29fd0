use sha2::{Digest, Sha256};

/// Compute SHA-256 content hash as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(content_hash(b"Content A"), content_hash(b"Content B"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
