//! Session authentication.
//!
//! The session pipeline verifies the `AUTH` token through the
//! [`Authenticator`] trait. Two implementations ship with the server: a
//! JWT verifier for real deployments and a constant-time static-token
//! table for tests and closed setups. Anything else (OAuth introspection,
//! mTLS-derived identities) plugs in behind the same trait.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use lattice_core::Principal;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Authentication failure. The session answers with `ERROR{401}` and
/// closes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid credentials: {0}")]
pub struct AuthError(pub String);

/// Verifies bearer tokens into principals.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves a token to the principal it represents.
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

// ---------------------------------------------------------------------------
// Static tokens
// ---------------------------------------------------------------------------

/// Fixed token table with constant-time comparison.
///
/// Every configured token is compared on every attempt so that timing
/// reveals neither a match position nor a near-miss.
pub struct StaticTokenAuthenticator {
    entries: Vec<(Vec<u8>, Principal)>,
}

impl StaticTokenAuthenticator {
    /// Creates a table from `(token, principal)` pairs.
    #[must_use]
    pub fn new(entries: Vec<(String, Principal)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(token, principal)| (token.into_bytes(), principal))
                .collect(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let presented = token.as_bytes();
        let mut matched: Option<&Principal> = None;
        for (expected, principal) in &self.entries {
            let same_len = expected.len() == presented.len();
            let equal = same_len && bool::from(expected.as_slice().ct_eq(presented));
            if equal {
                matched = Some(principal);
            }
        }
        matched
            .cloned()
            .ok_or_else(|| AuthError("unknown token".to_string()))
    }
}

// ---------------------------------------------------------------------------
// JWT
// ---------------------------------------------------------------------------

/// Claims the server understands.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subject: becomes the principal's user id.
    sub: String,
    /// Roles granted to the subject.
    #[serde(default)]
    roles: Vec<String>,
    /// Expiry (seconds since epoch); validated by the library.
    exp: u64,
}

/// Verifies HMAC-signed JWTs.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Creates a verifier for HS256 tokens signed with `secret`.
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError(e.to_string()))?;
        Ok(Principal {
            user_id: data.claims.sub,
            roles: data.claims.roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::*;

    fn principal(id: &str, roles: &[&str]) -> Principal {
        Principal {
            user_id: id.to_string(),
            roles: roles.iter().map(ToString::to_string).collect(),
        }
    }

    // ---- static tokens ----

    #[tokio::test]
    async fn static_token_resolves_principal() {
        let auth = StaticTokenAuthenticator::new(vec![
            ("alpha-token".to_string(), principal("alice", &["admin"])),
            ("beta-token".to_string(), principal("bob", &[])),
        ]);

        let p = auth.authenticate("beta-token").await.unwrap();
        assert_eq!(p.user_id, "bob");

        let p = auth.authenticate("alpha-token").await.unwrap();
        assert_eq!(p.roles, vec!["admin"]);
    }

    #[tokio::test]
    async fn static_token_rejects_unknown_and_near_miss() {
        let auth = StaticTokenAuthenticator::new(vec![(
            "alpha-token".to_string(),
            principal("alice", &[]),
        )]);
        assert!(auth.authenticate("alpha-toke").await.is_err());
        assert!(auth.authenticate("alpha-tokeN").await.is_err());
        assert!(auth.authenticate("").await.is_err());
    }

    // ---- JWT ----

    fn sign(secret: &[u8], claims: &Claims) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[tokio::test]
    async fn jwt_resolves_subject_and_roles() {
        let secret = b"test-secret";
        let token = sign(
            secret,
            &Claims {
                sub: "carol".to_string(),
                roles: vec!["writer".to_string(), "reader".to_string()],
                exp: now_secs() + 600,
            },
        );

        let auth = JwtAuthenticator::hs256(secret);
        let p = auth.authenticate(&token).await.unwrap();
        assert_eq!(p.user_id, "carol");
        assert_eq!(p.roles, vec!["writer", "reader"]);
    }

    #[tokio::test]
    async fn jwt_rejects_bad_signature_and_expiry() {
        let token = sign(
            b"right-secret",
            &Claims {
                sub: "carol".to_string(),
                roles: vec![],
                exp: now_secs() + 600,
            },
        );
        let auth = JwtAuthenticator::hs256(b"wrong-secret");
        assert!(auth.authenticate(&token).await.is_err());

        let expired = sign(
            b"right-secret",
            &Claims {
                sub: "carol".to_string(),
                roles: vec![],
                exp: now_secs().saturating_sub(3600),
            },
        );
        let auth = JwtAuthenticator::hs256(b"right-secret");
        assert!(auth.authenticate(&expired).await.is_err());
    }

    #[tokio::test]
    async fn jwt_rejects_garbage() {
        let auth = JwtAuthenticator::hs256(b"secret");
        assert!(auth.authenticate("not-a-jwt").await.is_err());
    }
}
