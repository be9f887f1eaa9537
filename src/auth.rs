//! Authentication contract. Session issuance lives outside the core; the
//! progress channel and the thin trigger surface only need to validate a
//! bearer token and resolve its user.

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub active: bool,
}

/// Bearer-token validation (external collaborator).
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Resolve a token to its user, or `None` for an unknown token.
    async fn validate(&self, token: &str) -> Option<AuthenticatedUser>;
}

/// Fixed token table for single-node mode and tests.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(
            token.into(),
            AuthenticatedUser {
                user_id: user_id.into(),
                active: true,
            },
        );
        self
    }

    pub fn with_inactive_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            AuthenticatedUser {
                user_id: user_id.into(),
                active: false,
            },
        );
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Option<AuthenticatedUser> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_tokens_resolve_and_unknown_do_not() {
        let validator = StaticTokenValidator::new()
            .with_token("tok-1", "user-1")
            .with_inactive_token("tok-2", "user-2");
        let user = validator.validate("tok-1").await.unwrap();
        assert_eq!(user.user_id, "user-1");
        assert!(user.active);
        assert!(!validator.validate("tok-2").await.unwrap().active);
        assert!(validator.validate("nope").await.is_none());
    }
}
