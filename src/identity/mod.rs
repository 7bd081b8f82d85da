//! Identity, sessions and the two-role authorization gate.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;
mod request_context;
mod authorizer;

pub use principal::Principal;
pub use session::{Session, SessionToken, SessionManager};
pub use provider::{IdentityResolver, LocalIdentityResolver, SignInRequest};
pub use request_context::SessionContext;
pub use authorizer::{Action, Role, check_allowed, is_allowed};
