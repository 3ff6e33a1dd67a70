//! Shared-secret check for client registration
//!
//! When the bridge is configured with a client token, every `register`
//! frame must carry the same token. Comparison runs in constant time so
//! response timing does not leak how much of a guess matched.

use std::fmt;

use thiserror::Error;

/// Errors from the shared-secret check
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// A token is required but none was sent
    #[error("authentication token required")]
    Missing,

    /// The token did not match
    #[error("invalid authentication token")]
    Mismatch,
}

/// A configured shared secret
#[derive(Clone)]
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl SharedSecret {
    /// Wrap a secret; empty strings mean "no secret"
    #[must_use]
    pub fn new(secret: &str) -> Option<Self> {
        (!secret.is_empty()).then(|| Self {
            bytes: secret.as_bytes().to_vec(),
        })
    }

    /// Check a provided token
    ///
    /// ```
    /// use bridge_core::auth::SharedSecret;
    ///
    /// let secret = SharedSecret::new("open sesame").unwrap();
    /// assert!(secret.validate("open sesame"));
    /// assert!(!secret.validate("open barley"));
    /// ```
    #[must_use]
    pub fn validate(&self, provided: &str) -> bool {
        constant_time_compare(&self.bytes, provided.as_bytes())
    }

    /// Check an optional token, explaining failures
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Missing`] or [`AuthError::Mismatch`].
    pub fn check(&self, provided: Option<&str>) -> Result<(), AuthError> {
        match provided {
            None => Err(AuthError::Missing),
            Some(token) if self.validate(token) => Ok(()),
            Some(_) => Err(AuthError::Mismatch),
        }
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Compare two byte slices without short-circuiting on the first difference
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_is_none() {
        assert!(SharedSecret::new("").is_none());
    }

    #[test]
    fn test_check_results() {
        let secret = SharedSecret::new("token-123").unwrap();
        assert_eq!(secret.check(Some("token-123")), Ok(()));
        assert_eq!(secret.check(Some("token-124")), Err(AuthError::Mismatch));
        assert_eq!(secret.check(Some("token")), Err(AuthError::Mismatch));
        assert_eq!(secret.check(None), Err(AuthError::Missing));
    }

    #[test]
    fn test_debug_redacts() {
        let secret = SharedSecret::new("hunter2").unwrap();
        assert_eq!(format!("{secret:?}"), "SharedSecret([REDACTED])");
    }
}
