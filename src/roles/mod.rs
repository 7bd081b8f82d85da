//!
//! dataroom roles module
//! ---------------------
//! Persisted principal -> role mapping and the first-admin bootstrap.
//!
//! `RoleStore` is a thin typed view over two backend collections:
//! - `user_roles`: one `RoleRecord` per principal, keyed by principal id, written once.
//! - `admin_claim`: a single `AdminClaim` under key `admin`, created once.
//!
//! `RoleBootstrap` (see `bootstrap`) decides which role a newly seen principal gets.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::identity::{Principal, Role};
use crate::storage::{Backend, CollectionPaths, CreateOutcome};
use crate::types::{now_millis, AdminClaim, RoleRecord};

pub mod bootstrap;

pub use bootstrap::{BootstrapPolicy, RoleBootstrap};

const ADMIN_CLAIM_KEY: &str = "admin";

#[derive(Clone)]
pub struct RoleStore {
    backend: Arc<dyn Backend>,
    paths: CollectionPaths,
}

impl RoleStore {
    pub fn new(backend: Arc<dyn Backend>, paths: CollectionPaths) -> Self { Self { backend, paths } }

    pub fn paths(&self) -> &CollectionPaths { &self.paths }

    pub async fn get(&self, principal: &Principal) -> AppResult<Option<RoleRecord>> {
        let Some(v) = self.backend.get(&self.paths.user_roles(), principal.as_str()).await? else {
            return Ok(None);
        };
        decode_role(principal, v).map(Some)
    }

    /// True if any stored record carries role `admin`.
    pub async fn any_admin(&self) -> AppResult<bool> {
        let rows = self.backend.scan(&self.paths.user_roles()).await?;
        Ok(rows.iter().any(|(_, v)| v.get("role").and_then(Value::as_str) == Some(Role::Admin.as_str())))
    }

    /// Write `record` unless this principal already has one. Returns whether it was written.
    pub async fn create_if_absent(&self, record: &RoleRecord) -> AppResult<bool> {
        let value = serde_json::to_value(record)?;
        let out = self.backend.create_if_absent(&self.paths.user_roles(), record.principal.as_str(), value).await?;
        Ok(out.was_created())
    }

    /// Try to take the admin seat for `principal`; returns whoever holds it afterwards.
    pub async fn claim_admin(&self, principal: &Principal) -> AppResult<Principal> {
        let claim = AdminClaim { principal: principal.clone(), claimed_at: now_millis() };
        match self.backend.create_if_absent(&self.paths.admin_claim(), ADMIN_CLAIM_KEY, serde_json::to_value(&claim)?).await? {
            CreateOutcome::Created { .. } => Ok(principal.clone()),
            CreateOutcome::Exists(v) => {
                let held: AdminClaim = serde_json::from_value(v).map_err(|e| {
                    AppError::internal("admin_claim_corrupt".to_string(), format!("stored admin claim is unreadable: {}", e))
                })?;
                Ok(held.principal)
            }
        }
    }

    /// Current claim holder, if the seat was ever taken.
    pub async fn admin_claim(&self) -> AppResult<Option<AdminClaim>> {
        let Some(v) = self.backend.get(&self.paths.admin_claim(), ADMIN_CLAIM_KEY).await? else { return Ok(None); };
        serde_json::from_value(v)
            .map(Some)
            .map_err(|e| AppError::internal("admin_claim_corrupt".to_string(), format!("stored admin claim is unreadable: {}", e)))
    }
}

fn decode_role(principal: &Principal, v: Value) -> AppResult<RoleRecord> {
    serde_json::from_value(v).map_err(|e| {
        AppError::internal("role_record_corrupt".to_string(), format!("role record for {} is unreadable: {}", principal, e))
    })
}
