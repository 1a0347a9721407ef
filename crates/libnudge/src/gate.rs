use std::sync::Arc;

use tracing::debug;

use crate::error::{NudgeError, Result};
use crate::model::{Principal, Session};
use crate::session::{SessionManager, Validation};

/// A path that may be reached without a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExemptRule {
    Exact(String),
    Prefix(String),
}

impl ExemptRule {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            ExemptRule::Exact(p) => path == p,
            ExemptRule::Prefix(p) => path.starts_with(p.as_str()),
        }
    }
}

pub fn default_exempt_rules() -> Vec<ExemptRule> {
    vec![
        ExemptRule::Exact("/".to_string()),
        ExemptRule::Exact("/api/auth/register".to_string()),
        ExemptRule::Exact("/api/auth/login".to_string()),
        ExemptRule::Prefix("/api/public".to_string()),
    ]
}

/// Who is calling. Attached to the request once the gate admits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub principal: Principal,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Exempt path reached without a usable session.
    Anonymous,
    Authenticated(AuthContext),
}

/// Resolves a request's session token to a principal before handlers run.
pub struct AccessGate {
    sessions: Arc<SessionManager>,
    exempt: Vec<ExemptRule>,
}

impl AccessGate {
    pub fn new(sessions: Arc<SessionManager>, exempt: Vec<ExemptRule>) -> Self {
        Self { sessions, exempt }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|rule| rule.matches(path))
    }

    /// Admit or reject a request for `path` carrying `token`.
    ///
    /// Exempt paths never fail on a bad token; they fall back to anonymous.
    /// Elsewhere an unknown and an expired session are reported identically.
    pub async fn admit(&self, path: &str, token: Option<&str>) -> Result<GateOutcome> {
        let exempt = self.is_exempt(path);

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            if exempt {
                return Ok(GateOutcome::Anonymous);
            }
            debug!(path, "rejected: no session token");
            return Err(NudgeError::Unauthenticated);
        };

        match self.sessions.validate_session(token).await? {
            Validation::Valid { principal, session } => {
                Ok(GateOutcome::Authenticated(AuthContext { principal, session }))
            }
            _ if exempt => Ok(GateOutcome::Anonymous),
            Validation::NotFound | Validation::Expired => {
                debug!(path, "rejected: invalid or expired session");
                Err(NudgeError::InvalidSession)
            }
            Validation::Forbidden(principal) => {
                debug!(path, principal_id = principal.id, "rejected: inactive principal");
                Err(NudgeError::Forbidden)
            }
        }
    }
}
