use sha2::{Digest, Sha256};

/// Generate a bearer token. Returns `(raw_token, sha256_hash)`.
/// Format: `kh_` + 32 random bytes as hex.
pub fn generate_api_token() -> (String, String) {
    let raw = generate_raw("kh_");
    let hash = hash_token(&raw);
    (raw, hash)
}

/// Generate an opaque session id (stored verbatim, sent as a cookie).
pub fn generate_session_id() -> String {
    generate_raw("")
}

/// SHA-256 hash of a token string, returned as lowercase hex.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_raw(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    format!("{prefix}{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_token_format() {
        let (raw, hash) = generate_api_token();
        assert!(raw.starts_with("kh_"));
        assert_eq!(raw.len(), 3 + 64); // "kh_" + 32 bytes hex
        assert_eq!(hash.len(), 64); // sha256 hex
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_token("kh_abc123"), hash_token("kh_abc123"));
    }

    #[test]
    fn different_tokens_different_hashes() {
        let (raw1, hash1) = generate_api_token();
        let (raw2, hash2) = generate_api_token();
        assert_ne!(raw1, raw2);
        assert_ne!(hash1, hash2);
    }
}
