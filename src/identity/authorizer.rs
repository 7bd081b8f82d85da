use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, AppResult};

/// The two roles of the data room. Exactly one principal is meant to hold
/// `Admin`; everyone else is a read-only `Investor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Investor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Investor => "investor",
        }
    }

    pub fn is_admin(&self) -> bool { matches!(self, Role::Admin) }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Operations a gateway client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ReadDocuments,
    AddDocument,
    RemoveDocument,
    Upload,
}

impl Action {
    fn verb(&self) -> &'static str {
        match self {
            Action::ReadDocuments => "read documents",
            Action::AddDocument => "add documents",
            Action::RemoveDocument => "delete documents",
            Action::Upload => "upload documents",
        }
    }
}

/// Two-role gate: reads are open to every resolved role, mutations need admin.
pub fn is_allowed(role: Role, action: Action) -> bool {
    match action {
        Action::ReadDocuments => true,
        Action::AddDocument | Action::RemoveDocument | Action::Upload => role.is_admin(),
    }
}

pub fn check_allowed(role: Role, action: Action) -> AppResult<()> {
    if is_allowed(role, action) {
        return Ok(());
    }
    Err(AppError::permission_denied(
        "admin_required".to_string(),
        format!("Permission denied. Only administrators can {}.", action.verb()),
    ))
}
