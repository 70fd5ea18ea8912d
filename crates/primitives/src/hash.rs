use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the "no previous block" sentinel.
pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn hash_to_hex(hash: &Hash256) -> String {
    hex::encode(hash)
}

pub fn hash_from_hex(value: &str) -> Option<Hash256> {
    let bytes = hex::decode(value).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256 of the empty input
        let expected = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(hash_to_hex(&sha256(b"")), expected);
    }

    #[test]
    fn hex_round_trip() {
        let hash = sha256(b"coin");
        let rendered = hash_to_hex(&hash);
        assert_eq!(hash_from_hex(&rendered), Some(hash));
        assert_eq!(hash_from_hex("zz"), None);
        assert_eq!(hash_from_hex("ab"), None);
    }
}
