use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use super::RoleStore;
use crate::error::{AppError, AppResult};
use crate::identity::{Principal, Role};
use crate::types::RoleRecord;

/// How a principal with no role record is assigned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapPolicy {
    /// Scan for an admin, then take the `admin_claim` record before writing an
    /// admin role. Concurrent first sign-ins yield exactly one admin.
    #[default]
    AdminClaim,
    /// Scan for an admin, then write. The scan and the write are not atomic as a
    /// pair, so overlapping first sign-ins can both become admin.
    ScanThenWrite,
}

impl BootstrapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapPolicy::AdminClaim => "admin_claim",
            BootstrapPolicy::ScanThenWrite => "scan_then_write",
        }
    }
}

impl fmt::Display for BootstrapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for BootstrapPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin_claim" | "claim" => Ok(BootstrapPolicy::AdminClaim),
            "scan_then_write" | "legacy" => Ok(BootstrapPolicy::ScanThenWrite),
            other => Err(AppError::configuration(
                "invalid_bootstrap_policy".to_string(),
                format!("unknown bootstrap policy '{}' (expected admin_claim or scan_then_write)", other),
            )),
        }
    }
}

/// Resolves the role of a principal, creating the record on first sight.
///
/// Errors from the store propagate unchanged; no role is assumed while the
/// store is unreachable, and a failed call can simply be repeated.
#[derive(Clone)]
pub struct RoleBootstrap {
    store: RoleStore,
    policy: BootstrapPolicy,
}

impl RoleBootstrap {
    pub fn new(store: RoleStore, policy: BootstrapPolicy) -> Self { Self { store, policy } }

    pub async fn resolve_role(&self, principal: &Principal) -> AppResult<Role> {
        if let Some(rec) = self.store.get(principal).await? {
            debug!(target: "dataroom::roles", "principal={} known role={}", principal, rec.role);
            return Ok(rec.role);
        }

        let admin_present = self.store.any_admin().await?;
        let mut target = if admin_present { Role::Investor } else { Role::Admin };

        if target == Role::Admin && self.policy == BootstrapPolicy::AdminClaim {
            let holder = self.store.claim_admin(principal).await?;
            if &holder != principal {
                debug!(target: "dataroom::roles", "principal={} lost admin claim to {}", principal, holder);
                target = Role::Investor;
            }
        }

        let written = self.store.create_if_absent(&RoleRecord::new(principal.clone(), target)).await?;

        // A concurrent call for the same principal may have written first; the
        // stored record is authoritative.
        let Some(rec) = self.store.get(principal).await? else {
            warn!(target: "dataroom::roles", "principal={} role record missing after write", principal);
            return Err(AppError::infrastructure(
                "role_not_persisted".to_string(),
                format!("role record for {} was not readable after write", principal),
            ));
        };
        if written {
            info!(target: "dataroom::roles", "principal={} assigned role={} policy={}", principal, rec.role, self.policy);
        }
        Ok(rec.role)
    }

    /// Point read without creating anything.
    pub async fn current_role(&self, principal: &Principal) -> AppResult<Option<Role>> {
        Ok(self.store.get(principal).await?.map(|r| r.role))
    }
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod bootstrap_tests;
