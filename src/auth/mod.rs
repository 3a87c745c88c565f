//! # Auth Collaborator (minimal)
//!
//! The authentication manager itself is out of scope (spec.md §1); this
//! crate ships only the narrow slice spec.md §5/§6 name directly: a
//! [`JwtManager`] that signs/verifies tokens and rotates its signing
//! secret while keeping a bounded history of previous secrets so
//! in-flight tokens validate through the grace period (spec.md §5), and a
//! [`Role`] used to gate the inbound API's write operations. Grounded in
//! the teacher's `enterprise::auth::jwt` and `enterprise::auth::rbac`
//! modules, trimmed to this subset — no SSO/SAML/OAuth2/MFA.

use std::collections::VecDeque;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

/// Errors surfaced by the auth collaborator.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token creation failed: {0}")]
    CreationFailed(String),

    #[error("token validation failed: {0}")]
    ValidationFailed(String),

    #[error("insufficient role: need {need:?}, have {have:?}")]
    InsufficientRole { need: Role, have: Role },
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Role hierarchy gating the inbound API's write operations.
/// `Admin > Operator > Viewer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

/// Claims embedded in a signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
}

/// Wraps a signing secret so it is wiped from memory when dropped (on
/// rotation, once evicted past `max_history`).
struct SecretEntry {
    secret: String,
}

impl Drop for SecretEntry {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Signs and verifies JWTs, rotating the signing secret while keeping a
/// bounded history of up to `max_history` previous secrets so tokens
/// issued before a rotation still validate until they expire (spec.md §5:
/// "JWT rotation ... keeps a bounded history (<=3) of previous secrets so
/// in-flight tokens validate through the grace period").
pub struct JwtManager {
    current: RwLock<SecretEntry>,
    previous: RwLock<VecDeque<SecretEntry>>,
    max_history: usize,
    token_ttl_secs: u64,
}

impl JwtManager {
    pub fn new(secret: impl Into<String>, token_ttl_secs: u64, max_history: usize) -> Self {
        Self {
            current: RwLock::new(SecretEntry { secret: secret.into() }),
            previous: RwLock::new(VecDeque::new()),
            max_history,
            token_ttl_secs,
        }
    }

    /// Replaces the signing secret, pushing the old one onto the bounded
    /// history so tokens signed with it keep validating.
    pub fn rotate_secret(&self, new_secret: impl Into<String>) {
        let old = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, SecretEntry { secret: new_secret.into() })
        };
        let mut previous = self.previous.write();
        previous.push_front(old);
        while previous.len() > self.max_history {
            previous.pop_back();
        }
    }

    pub fn sign(&self, subject: &str, role: Role) -> AuthResult<String> {
        let claims = Claims {
            sub: subject.to_string(),
            role,
            exp: chrono::Utc::now().timestamp() + self.token_ttl_secs as i64,
        };
        let secret = self.current.read().secret.clone();
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| AuthError::CreationFailed(e.to_string()))
    }

    /// Verifies against the current secret first, then each previous
    /// secret in rotation order, so a token signed just before a rotation
    /// still validates.
    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        let current_secret = self.current.read().secret.clone();

        if let Ok(data) = decode::<Claims>(token, &DecodingKey::from_secret(current_secret.as_bytes()), &validation) {
            return Ok(data.claims);
        }

        for entry in self.previous.read().iter() {
            if let Ok(data) = decode::<Claims>(token, &DecodingKey::from_secret(entry.secret.as_bytes()), &validation) {
                return Ok(data.claims);
            }
        }

        Err(AuthError::ValidationFailed("no signing secret validated this token".into()))
    }

    /// Checks a verified role against a required minimum, by the
    /// `Viewer < Operator < Admin` ordering.
    pub fn require_role(have: Role, need: Role) -> AuthResult<()> {
        if have >= need {
            Ok(())
        } else {
            Err(AuthError::InsufficientRole { need, have })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let manager = JwtManager::new("secret-1", 3600, 3);
        let token = manager.sign("alice", Role::Operator).unwrap();
        let claims = manager.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, Role::Operator);
    }

    #[test]
    fn rotated_secret_still_validates_old_tokens_within_history() {
        let manager = JwtManager::new("secret-1", 3600, 3);
        let token = manager.sign("alice", Role::Viewer).unwrap();
        manager.rotate_secret("secret-2");
        manager.rotate_secret("secret-3");
        assert!(manager.verify(&token).is_ok());
    }

    #[test]
    fn history_beyond_bound_is_evicted() {
        let manager = JwtManager::new("secret-1", 3600, 2);
        let token = manager.sign("alice", Role::Viewer).unwrap();
        manager.rotate_secret("secret-2");
        manager.rotate_secret("secret-3");
        manager.rotate_secret("secret-4");
        assert!(manager.verify(&token).is_err());
    }

    #[test]
    fn role_ordering_gates_write_operations() {
        assert!(JwtManager::require_role(Role::Admin, Role::Operator).is_ok());
        assert!(JwtManager::require_role(Role::Viewer, Role::Operator).is_err());
    }
}
