//! Record types shared by the role store, the document registry and uploads.
//! Timestamps are epoch milliseconds.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::identity::{Principal, Role};

pub fn now_millis() -> i64 { chrono::Utc::now().timestamp_millis() }

/// One per principal, written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    pub principal: Principal,
    pub role: Role,
    pub assigned_at: i64,
}

impl RoleRecord {
    pub fn new(principal: Principal, role: Role) -> Self { Self { principal, role, assigned_at: now_millis() } }
}

/// Collection-wide singleton naming the principal that won the admin seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminClaim {
    pub principal: Principal,
    pub claimed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4().to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self { Self(s) }
}

/// Opaque reference to document bytes (URL, `blob://` path). Resolved outside
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub name: String,
    pub locator: Locator,
    pub created_at: i64,
    pub owner: Principal,
}

impl DocumentRecord {
    /// Registry order: newest `created_at` first, ties by ascending id.
    pub fn registry_order(a: &DocumentRecord, b: &DocumentRecord) -> Ordering {
        b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
    }
}

/// Caller input for `DocumentRegistry::add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDocument {
    pub name: String,
    pub locator: Locator,
}

impl NewDocument {
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self { name: name.into(), locator: Locator::new(locator) }
    }

    /// Trim both fields and reject blanks.
    pub fn normalized(self) -> AppResult<Self> {
        let name = self.name.trim().to_string();
        let locator = self.locator.as_str().trim().to_string();
        if name.is_empty() || locator.is_empty() {
            return Err(AppError::user("missing_fields", "Please enter both a document name and a locator."));
        }
        Ok(Self { name, locator: Locator(locator) })
    }
}
