use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, AppResult};

/// Stable id of an authenticated participant, as handed out by the identity
/// resolver. Used as the key of role records and as document owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    /// Validate an id received from outside the process (headers, config files).
    pub fn parse(id: &str) -> AppResult<Self> {
        let t = id.trim();
        if t.is_empty() {
            return Err(AppError::auth("invalid_principal", "principal id must not be empty"));
        }
        Ok(Self(t.to_string()))
    }

    /// Fresh principal for an anonymous sign-in.
    pub fn anonymous() -> Self { Self(format!("anon-{}", uuid::Uuid::new_v4().simple())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Principal {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for Principal {
    fn from(s: String) -> Self { Self(s) }
}
