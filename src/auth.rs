//! Caller identity and capability-token extraction.
//!
//! The relay never issues or validates account credentials itself — a
//! fronting identity layer does that and passes the resulting opaque owner
//! principal through as `Authorization: Bearer <principal>`. A missing or
//! malformed header simply means the caller is unauthenticated, in which
//! case tunnel operations authenticate with the per-tunnel capability token
//! carried in the `x-tunnel-token` header instead.

use axum::{extract::FromRequestParts, http::request::Parts};

/// Header carrying the capability token for unauthenticated tunnels.
pub const TUNNEL_TOKEN_HEADER: &str = "x-tunnel-token";

/// The caller's identity as supplied by the fronting identity collaborator.
///
/// `owner_id` is `None` for unauthenticated callers. `token` is whatever the
/// caller presented in `x-tunnel-token`, if anything.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub owner_id: Option<String>,
    pub token: Option<String>,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .filter(|p| !p.is_empty())
            .map(ToString::to_string);

        let token = parts
            .headers
            .get(TUNNEL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.is_empty())
            .map(ToString::to_string);

        Ok(Identity { owner_id, token })
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrex"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
