use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;

use super::authorizer::Role;
use super::principal::Principal;
use super::request_context::SessionContext;
use crate::error::{AppError, AppResult};
use crate::tprintln;

pub type SessionToken = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub token: SessionToken,
    pub csrf: String,
    pub principal: Principal,
    /// Role resolved at sign-in. Roles are write-once, so this never goes stale;
    /// the upload path still re-reads it before registering.
    pub role: Role,
    pub expires_at: Instant,
}

impl Session {
    pub fn context(&self) -> SessionContext {
        SessionContext::new(self.principal.clone(), self.role)
    }
}


fn gen_id() -> AppResult<String> {
    gen_id_with(getrandom::getrandom)
}

// 256-bit random token base64url without padding
fn gen_id_with(fill: impl Fn(&mut [u8]) -> Result<(), getrandom::Error>) -> AppResult<String> {
    let mut buf = [0u8; 32];
    fill(&mut buf).map_err(|e| AppError::internal("rng_unavailable".to_string(), format!("cannot generate session token: {}", e)))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Issues and validates gateway sessions. Each server owns its own manager;
/// clones share the same table.
#[derive(Clone)]
pub struct SessionManager {
    pub ttl: Duration,
    sessions: Arc<RwLock<HashMap<SessionToken, Session>>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self { Self { ttl, sessions: Arc::new(RwLock::new(HashMap::new())) } }

    /// Issue a new session. Expired sessions are swept first, so tokens that
    /// are never presented again do not accumulate.
    pub fn issue(&self, principal: Principal, role: Role) -> AppResult<Session> {
        let now = Instant::now();
        let sess = Session {
            session_id: gen_id()?,
            token: gen_id()?,
            csrf: gen_id()?,
            principal: principal.clone(),
            role,
            expires_at: now + self.ttl,
        };
        let swept = {
            let mut t = self.sessions.write();
            let before = t.len();
            t.retain(|_, s| s.expires_at > now);
            let swept = before - t.len();
            t.insert(sess.token.clone(), sess.clone());
            swept
        };
        tprintln!("session.issue principal={} sid={} ttl_secs={} swept={}", principal, sess.session_id, self.ttl.as_secs(), swept);
        Ok(sess)
    }

    /// Return the live session for `token`, dropping it if expired.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        {
            let t = self.sessions.read();
            match t.get(token) {
                Some(s) if s.expires_at > now => return Some(s.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.logout(token);
        None
    }

    pub fn logout(&self, token: &str) -> bool { self.sessions.write().remove(token).is_some() }

    pub fn active(&self) -> usize { self.sessions.read().len() }
}
