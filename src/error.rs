//! Unified application error model and mapping helpers.
//! Every component (role bootstrap, registry, uploads, storage backends) reports
//! failures through `AppError`; the gateway maps them to HTTP status codes and
//! WebSocket error frames.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Missing or invalid backend configuration. Fatal at startup.
    #[error("{code}: {message}")]
    Configuration { code: String, message: String },
    /// Identity resolution failed; the user may retry sign-in.
    #[error("{code}: {message}")]
    Auth { code: String, message: String },
    /// Mutation attempted without the admin role. Nothing was changed.
    #[error("{code}: {message}")]
    PermissionDenied { code: String, message: String },
    #[error("{code}: {message}")]
    NotFound { code: String, message: String },
    /// Blob transfer failed; the upload session is discarded.
    #[error("{code}: {message}")]
    Transfer { code: String, message: String },
    /// Backend unreachable or failed mid-operation. Retryable.
    #[error("{code}: {message}")]
    Infrastructure { code: String, message: String },
    #[error("{code}: {message}")]
    UserInput { code: String, message: String },
    #[error("{code}: {message}")]
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Configuration { code, .. }
            | AppError::Auth { code, .. }
            | AppError::PermissionDenied { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Transfer { code, .. }
            | AppError::Infrastructure { code, .. }
            | AppError::UserInput { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Configuration { message, .. }
            | AppError::Auth { message, .. }
            | AppError::PermissionDenied { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Transfer { message, .. }
            | AppError::Infrastructure { message, .. }
            | AppError::UserInput { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn configuration<S: Into<String>>(code: S, msg: S) -> Self { AppError::Configuration { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn permission_denied<S: Into<String>>(code: S, msg: S) -> Self { AppError::PermissionDenied { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn transfer<S: Into<String>>(code: S, msg: S) -> Self { AppError::Transfer { code: code.into(), message: msg.into() } }
    pub fn infrastructure<S: Into<String>>(code: S, msg: S) -> Self { AppError::Infrastructure { code: code.into(), message: msg.into() } }
    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Auth and infrastructure failures may succeed on a later attempt; everything
    /// else is either a caller mistake or a terminal outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Auth { .. } | AppError::Infrastructure { .. })
    }

    pub fn is_permission_denied(&self) -> bool { matches!(self, AppError::PermissionDenied { .. }) }

    pub fn is_not_found(&self) -> bool { matches!(self, AppError::NotFound { .. }) }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Configuration { .. } => 500,
            AppError::Auth { .. } => 401,
            AppError::PermissionDenied { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Transfer { .. } => 502,
            AppError::Infrastructure { .. } => 503,
            AppError::UserInput { .. } => 400,
            AppError::Internal { .. } => 500,
        }
    }

    /// JSON body used by both the HTTP routes and WebSocket error frames.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "error",
            "code": self.code_str(),
            "message": self.message(),
            "retryable": self.is_retryable(),
        })
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal { code: "serde_error".into(), message: err.to_string() }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Infrastructure { code: "io_error".into(), message: err.to_string() }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
