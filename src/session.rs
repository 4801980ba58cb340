use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Ms, Role};

/// An authenticated identity, created at login and passed explicitly to
/// every operation that needs one. There is no ambient current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: Ulid,
    pub user_id: Ulid,
    pub username: String,
    pub role: Role,
    pub logged_in_at: Ms,
}

/// Where credentials are checked. Implemented by the engine over its user
/// table; kept as a trait so the session layer never reaches into state.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Returns the account's (id, username, role) when the pair matches.
    async fn verify(&self, username: &str, password: &str) -> Option<(Ulid, String, Role)>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCredentials;

impl std::fmt::Display for InvalidCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid username or password")
    }
}

impl std::error::Error for InvalidCredentials {}

/// Issues and invalidates sessions. Tokens are opaque ULIDs.
pub struct SessionManager {
    sessions: DashMap<Ulid, Session>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub async fn login(
        &self,
        source: &dyn CredentialSource,
        username: &str,
        password: &str,
    ) -> Result<Session, InvalidCredentials> {
        let Some((user_id, username, role)) = source.verify(username, password).await else {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(InvalidCredentials);
        };

        let session = Session {
            token: Ulid::new(),
            user_id,
            username,
            role,
            logged_in_at: crate::engine::now_ms(),
        };
        self.sessions.insert(session.token, session.clone());
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(self.sessions.len() as f64);
        Ok(session)
    }

    /// Invalidate a session. Returns false if the token was unknown.
    pub fn logout(&self, token: Ulid) -> bool {
        let removed = self.sessions.remove(&token).is_some();
        metrics::gauge!(crate::observability::SESSIONS_ACTIVE).set(self.sessions.len() as f64);
        removed
    }

    pub fn get(&self, token: Ulid) -> Option<Session> {
        self.sessions.get(&token).map(|s| s.value().clone())
    }
}
