use std::collections::HashMap;

use async_trait::async_trait;

use super::principal::Principal;
use crate::error::{AppError, AppResult};
use crate::tprintln;

#[derive(Debug, Clone, Default)]
pub struct SignInRequest {
    /// Custom sign-in token issued out of band. `None` requests anonymous sign-in.
    pub token: Option<String>,
}

/// Yields a durable principal id per session. The real provider lives outside
/// this crate; implementations only need to be stable per underlying identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, req: &SignInRequest) -> AppResult<Principal>;
}

/// Token table resolver with anonymous fallback.
///
/// A presented token must be known; an unknown token is an auth failure and is
/// never silently downgraded to anonymous. Without a token the resolver signs
/// the caller in anonymously (when allowed) and mints a new principal.
pub struct LocalIdentityResolver {
    tokens: HashMap<String, Principal>,
    allow_anonymous: bool,
}

impl LocalIdentityResolver {
    pub fn new(tokens: HashMap<String, Principal>, allow_anonymous: bool) -> Self {
        Self { tokens, allow_anonymous }
    }

    /// Parse `token=principal,token2=principal2` as used by `DATAROOM_AUTH_TOKENS`.
    pub fn parse_token_table(table: &str) -> AppResult<HashMap<String, Principal>> {
        let mut out = HashMap::new();
        for part in table.split(',') {
            let p = part.trim();
            if p.is_empty() { continue; }
            let Some((tok, principal)) = p.split_once('=') else {
                return Err(AppError::configuration(
                    "invalid_auth_tokens".to_string(),
                    format!("expected token=principal, got '{}'", p),
                ));
            };
            let tok = tok.trim();
            if tok.is_empty() {
                return Err(AppError::configuration("invalid_auth_tokens", "empty token in auth token table"));
            }
            let principal = Principal::parse(principal).map_err(|e| AppError::configuration("invalid_auth_tokens".to_string(), e.message().to_string()))?;
            out.insert(tok.to_string(), principal);
        }
        Ok(out)
    }
}

impl Default for LocalIdentityResolver {
    fn default() -> Self { Self::new(HashMap::new(), true) }
}

#[async_trait]
impl IdentityResolver for LocalIdentityResolver {
    async fn resolve(&self, req: &SignInRequest) -> AppResult<Principal> {
        match req.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(tok) => {
                let Some(p) = self.tokens.get(tok) else {
                    return Err(AppError::auth("invalid_token", "Authentication failed: unknown sign-in token"));
                };
                tprintln!("identity.resolve token principal={}", p);
                Ok(p.clone())
            }
            None if self.allow_anonymous => {
                let p = Principal::anonymous();
                tprintln!("identity.resolve anonymous principal={}", p);
                Ok(p)
            }
            None => Err(AppError::auth("token_required", "Authentication failed: a sign-in token is required")),
        }
    }
}
