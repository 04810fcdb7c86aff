//! Token verification.
//!
//! Identity is resolved by a [`TokenVerifier`]; the server only ever asks
//! "which user does this token belong to?".

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

pub trait TokenVerifier: Send + Sync {
    /// Owning user id, or `None` for an unknown token.
    fn verify(&self, token: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid token entry '{0}', expected token=user")]
pub struct TokenSpecError(pub String);

/// Fixed token table, e.g. from `CLASSWATCH_TOKENS="abc=teacher-1,def=engine"`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn parse(spec: &str) -> Result<Self, TokenSpecError> {
        let mut tokens = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, user) = entry
                .split_once('=')
                .map(|(t, u)| (t.trim(), u.trim()))
                .filter(|(t, u)| !t.is_empty() && !u.is_empty())
                .ok_or_else(|| TokenSpecError(entry.to_string()))?;
            tokens.insert(token.to_string(), user.to_string());
        }
        Ok(Self { tokens })
    }

    pub fn with(mut self, token: &str, user_id: &str) -> Self {
        self.tokens.insert(token.to_string(), user_id.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenVerifier for StaticTokens {
    fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// `Authorization: Bearer <token>`, if present and non-empty.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
