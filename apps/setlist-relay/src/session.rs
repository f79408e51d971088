use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

const TOKEN_BYTES: usize = 32;

/// Identity of one websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Mint a fresh master token: 32 random bytes, base64url without padding.
pub fn mint_master_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex SHA-256 of a token. Rooms keep only this.
pub fn digest_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_token(token: &str, digest: &str) -> bool {
    !token.is_empty() && digest_token(token) == digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn tokens_are_unique_and_url_safe() {
        let first = mint_master_token();
        let second = mint_master_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test_timeout::timeout]
    fn digest_verifies_only_the_issued_token() {
        let token = mint_master_token();
        let digest = digest_token(&token);
        assert_ne!(digest, token);
        assert!(verify_token(&token, &digest));
        assert!(!verify_token("guess", &digest));
        assert!(!verify_token("", &digest_token("")));
    }

    #[test_timeout::timeout]
    fn channel_ids_differ() {
        assert_ne!(ChannelId::new(), ChannelId::new());
    }
}
