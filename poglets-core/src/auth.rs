//! Authentication utilities for secure token handling

use poglets_common::TunnelError;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time comparison of two byte slices
///
/// This prevents timing attacks where an attacker could determine
/// how many bytes match based on comparison time.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Hash a token using SHA-256
#[must_use]
pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Server-side check of the token presented in a handshake.
///
/// An empty configured token disables authentication: every presented
/// token, including an empty one, is accepted.
#[derive(Clone)]
pub struct TokenAuthenticator {
    expected: Option<[u8; 32]>,
}

impl TokenAuthenticator {
    pub fn new(token: &str) -> Self {
        let expected = (!token.is_empty()).then(|| hash_token(token));
        Self { expected }
    }

    pub fn is_enabled(&self) -> bool {
        self.expected.is_some()
    }

    /// Hashing first keeps the comparison length independent of the input.
    pub fn verify(&self, presented: &str) -> bool {
        match &self.expected {
            None => true,
            Some(expected) => constant_time_eq(&hash_token(presented), expected),
        }
    }
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Validate token format
///
/// Returns Ok(()) if token is valid, Err with reason if not
pub fn validate_token_format(token: &str, max_len: usize) -> Result<(), TokenValidationError> {
    if token.len() > max_len {
        return Err(TokenValidationError::TooLong {
            len: token.len(),
            max: max_len,
        });
    }
    if !token.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(TokenValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Token validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenValidationError {
    #[error("token too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("token contains invalid characters")]
    InvalidCharacters,
}

impl From<TokenValidationError> for TunnelError {
    fn from(err: TokenValidationError) -> Self {
        TunnelError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_authenticator_matches_configured_token() {
        let auth = TokenAuthenticator::new("my-secret-token");
        assert!(auth.is_enabled());
        assert!(auth.verify("my-secret-token"));
        assert!(!auth.verify("wrong-token"));
        assert!(!auth.verify(""));
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let auth = TokenAuthenticator::new("");
        assert!(!auth.is_enabled());
        assert!(auth.verify(""));
        assert!(auth.verify("anything"));
    }

    #[test]
    fn test_validate_token_format() {
        assert!(validate_token_format("valid-token-123", 256).is_ok());
        assert!(validate_token_format("", 256).is_ok());
        assert!(validate_token_format("x".repeat(300).as_str(), 256).is_err());
        assert!(validate_token_format("has\nnewline", 256).is_err());
    }
}
