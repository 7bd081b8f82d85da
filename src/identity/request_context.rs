use super::authorizer::{check_allowed, Action, Role};
use super::Principal;
use crate::error::AppResult;

/// Explicit per-call context: who is asking and with which role. Passed to every
/// registry and upload operation instead of any process-wide session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub principal: Principal,
    pub role: Role,
}

impl SessionContext {
    pub fn new(principal: Principal, role: Role) -> Self {
        Self { principal, role }
    }

    pub fn require(&self, action: Action) -> AppResult<()> { check_allowed(self.role, action) }
}
