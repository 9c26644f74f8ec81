//! Gateway authentication and authorization.
//!
//! Three credential kinds, checked in order for regular endpoints:
//! a dashboard session cookie, then a bearer api key.  Streaming
//! endpoints additionally accept per-agent stream tokens.  Mutations made
//! under a cookie session must present the session's CSRF token.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;

// ─── Roles / identity ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
}

impl Role {
    pub fn allows(self, required: Role) -> bool {
        match required {
            Role::Viewer => true,
            Role::Operator => self == Role::Operator,
        }
    }
}

/// How a request authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVia {
    Cookie { session_id: String },
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub principal: String,
    pub role: Role,
    pub via: AuthVia,
}

// ─── Registry internals ──────────────────────────────────────────────────────

struct AuthSession {
    principal: String,
    role: Role,
    csrf_token: String,
    expires_at: Instant,
    last_refresh: Instant,
}

struct ApiKey {
    principal: String,
    role: Role,
}

struct StreamGrant {
    agent_id: String,
    expires_at: Instant,
}

/// Default dashboard session TTL.
pub const SESSION_TTL: Duration = Duration::from_secs(8 * 3600);

/// Default stream token TTL.
pub const STREAM_TOKEN_TTL: Duration = Duration::from_secs(3600);

// ─── AuthRegistry ────────────────────────────────────────────────────────────

/// In-memory credential registry.  The surrounding OAuth/credential
/// surfaces live outside the core; they populate this registry through
/// the issue_* hooks.
#[derive(Default)]
pub struct AuthRegistry {
    sessions: Mutex<HashMap<String, AuthSession>>,
    api_keys: Mutex<HashMap<String, ApiKey>>,
    stream_tokens: Mutex<HashMap<String, StreamGrant>>,
    session_ttl: Option<Duration>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    fn ttl(&self) -> Duration {
        self.session_ttl.unwrap_or(SESSION_TTL)
    }

    // ── Issuance hooks ──────────────────────────────────────────────────────

    /// Create a dashboard session; returns `(session_id, csrf_token)`.
    pub fn issue_session(&self, principal: &str, role: Role) -> (String, String) {
        let session_id = Uuid::new_v4().simple().to_string();
        let csrf_token = Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        lock(&self.sessions).insert(
            session_id.clone(),
            AuthSession {
                principal: principal.to_string(),
                role,
                csrf_token: csrf_token.clone(),
                expires_at: now + self.ttl(),
                last_refresh: now,
            },
        );
        (session_id, csrf_token)
    }

    pub fn issue_api_key(&self, principal: &str, role: Role) -> String {
        let key = Uuid::new_v4().simple().to_string();
        lock(&self.api_keys).insert(
            key.clone(),
            ApiKey {
                principal: principal.to_string(),
                role,
            },
        );
        key
    }

    /// Issue a bearer token granting stream access to one agent.
    pub fn issue_stream_token(&self, agent_id: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        lock(&self.stream_tokens).insert(
            token.clone(),
            StreamGrant {
                agent_id: agent_id.to_string(),
                expires_at: Instant::now() + STREAM_TOKEN_TTL,
            },
        );
        token
    }

    pub fn revoke_session(&self, session_id: &str) {
        lock(&self.sessions).remove(session_id);
    }

    // ── Request checks ──────────────────────────────────────────────────────

    /// Authenticate: session cookie first, bearer api key as fallback.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        if let Some(session_id) = cookie_value(headers, "sid") {
            if let Some(identity) = self.check_session(&session_id) {
                return Ok(identity);
            }
        }
        if let Some(token) = bearer(headers) {
            let keys = lock(&self.api_keys);
            if let Some(key) = keys.get(token) {
                return Ok(Identity {
                    principal: key.principal.clone(),
                    role: key.role,
                    via: AuthVia::Bearer,
                });
            }
        }
        Err(ApiError::Unauthorized)
    }

    /// Authenticate and enforce a role.
    pub fn authorize(&self, headers: &HeaderMap, required: Role) -> Result<Identity, ApiError> {
        let identity = self.authenticate(headers)?;
        if !identity.role.allows(required) {
            return Err(ApiError::Forbidden);
        }
        Ok(identity)
    }

    /// Authorize a mutation: role check plus CSRF for cookie sessions.
    /// Bearer credentials are CSRF-exempt (no ambient browser authority).
    pub fn authorize_mutation(
        &self,
        headers: &HeaderMap,
        required: Role,
    ) -> Result<Identity, ApiError> {
        let identity = self.authorize(headers, required)?;
        if let AuthVia::Cookie { session_id } = &identity.via {
            let provided = headers
                .get("x-csrf-token")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let sessions = lock(&self.sessions);
            let valid = sessions
                .get(session_id)
                .is_some_and(|s| !provided.is_empty() && s.csrf_token == provided);
            if !valid {
                return Err(ApiError::Forbidden);
            }
        }
        Ok(identity)
    }

    /// Streaming access: a per-agent bearer token, or any dashboard
    /// cookie session.
    pub fn authorize_stream(
        &self,
        headers: &HeaderMap,
        agent_id: &str,
    ) -> Result<(), ApiError> {
        if let Some(token) = bearer(headers) {
            let mut tokens = lock(&self.stream_tokens);
            if let Some(grant) = tokens.get(token) {
                if grant.expires_at < Instant::now() {
                    tokens.remove(token);
                    return Err(ApiError::Unauthorized);
                }
                if grant.agent_id == agent_id {
                    return Ok(());
                }
                return Err(ApiError::Forbidden);
            }
        }
        if let Some(session_id) = cookie_value(headers, "sid") {
            if self.check_session(&session_id).is_some() {
                return Ok(());
            }
        }
        Err(ApiError::Unauthorized)
    }

    /// Validate a session and apply sliding expiry: the deadline extends
    /// only once more than 10 % of the TTL has passed since the last
    /// refresh, so hot sessions do not rewrite state on every request.
    fn check_session(&self, session_id: &str) -> Option<Identity> {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        let session = sessions.get_mut(session_id)?;
        if session.expires_at < now {
            sessions.remove(session_id);
            return None;
        }
        if now.duration_since(session.last_refresh) > self.ttl() / 10 {
            session.expires_at = now + self.ttl();
            session.last_refresh = now;
        }
        Some(Identity {
            principal: session.principal.clone(),
            role: session.role,
            via: AuthVia::Cookie {
                session_id: session_id.to_string(),
            },
        })
    }

    /// The CSRF token for a session (dashboard bootstrap).
    pub fn csrf_token(&self, session_id: &str) -> Option<String> {
        lock(&self.sessions)
            .get(session_id)
            .map(|s| s.csrf_token.clone())
    }
}

// ─── Header helpers ──────────────────────────────────────────────────────────

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get("cookie").and_then(|v| v.to_str().ok())?;
    for pair in cookies.split(';') {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(key.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn cookie_session_authenticates() {
        let registry = AuthRegistry::new();
        let (sid, _) = registry.issue_session("alice", Role::Operator);
        let headers = headers_with(&[("cookie", format!("sid={sid}"))]);

        let identity = registry.authenticate(&headers).unwrap();
        assert_eq!(identity.principal, "alice");
        assert!(matches!(identity.via, AuthVia::Cookie { .. }));
    }

    #[test]
    fn bearer_api_key_is_fallback() {
        let registry = AuthRegistry::new();
        let key = registry.issue_api_key("svc", Role::Viewer);
        let headers = headers_with(&[("authorization", format!("Bearer {key}"))]);

        let identity = registry.authenticate(&headers).unwrap();
        assert_eq!(identity.principal, "svc");
        assert_eq!(identity.via, AuthVia::Bearer);
    }

    #[test]
    fn missing_credentials_are_unauthorized() {
        let registry = AuthRegistry::new();
        assert_eq!(
            registry.authenticate(&HeaderMap::new()).unwrap_err(),
            ApiError::Unauthorized
        );
    }

    #[test]
    fn role_check_rejects_viewers_from_operator_routes() {
        let registry = AuthRegistry::new();
        let key = registry.issue_api_key("svc", Role::Viewer);
        let headers = headers_with(&[("authorization", format!("Bearer {key}"))]);

        assert!(registry.authorize(&headers, Role::Viewer).is_ok());
        assert_eq!(
            registry.authorize(&headers, Role::Operator).unwrap_err(),
            ApiError::Forbidden
        );
    }

    #[test]
    fn cookie_mutation_requires_csrf() {
        let registry = AuthRegistry::new();
        let (sid, csrf) = registry.issue_session("alice", Role::Operator);

        let no_csrf = headers_with(&[("cookie", format!("sid={sid}"))]);
        assert_eq!(
            registry.authorize_mutation(&no_csrf, Role::Operator).unwrap_err(),
            ApiError::Forbidden
        );

        let wrong = headers_with(&[
            ("cookie", format!("sid={sid}")),
            ("x-csrf-token", "nope".to_string()),
        ]);
        assert!(registry.authorize_mutation(&wrong, Role::Operator).is_err());

        let good = headers_with(&[
            ("cookie", format!("sid={sid}")),
            ("x-csrf-token", csrf),
        ]);
        assert!(registry.authorize_mutation(&good, Role::Operator).is_ok());
    }

    #[test]
    fn bearer_mutations_skip_csrf() {
        let registry = AuthRegistry::new();
        let key = registry.issue_api_key("svc", Role::Operator);
        let headers = headers_with(&[("authorization", format!("Bearer {key}"))]);
        assert!(registry.authorize_mutation(&headers, Role::Operator).is_ok());
    }

    #[test]
    fn stream_token_is_scoped_to_its_agent() {
        let registry = AuthRegistry::new();
        let token = registry.issue_stream_token("a1");
        let headers = headers_with(&[("authorization", format!("Bearer {token}"))]);

        assert!(registry.authorize_stream(&headers, "a1").is_ok());
        assert_eq!(
            registry.authorize_stream(&headers, "a2").unwrap_err(),
            ApiError::Forbidden
        );
    }

    #[test]
    fn dashboard_cookie_grants_stream_access() {
        let registry = AuthRegistry::new();
        let (sid, _) = registry.issue_session("alice", Role::Viewer);
        let headers = headers_with(&[("cookie", format!("sid={sid}"))]);
        assert!(registry.authorize_stream(&headers, "any-agent").is_ok());
    }

    #[test]
    fn expired_session_is_rejected() {
        let registry = AuthRegistry::new().with_session_ttl(Duration::from_millis(1));
        let (sid, _) = registry.issue_session("alice", Role::Viewer);
        std::thread::sleep(Duration::from_millis(10));

        let headers = headers_with(&[("cookie", format!("sid={sid}"))]);
        assert_eq!(
            registry.authenticate(&headers).unwrap_err(),
            ApiError::Unauthorized
        );
    }

    #[test]
    fn sliding_expiry_refreshes_after_ten_percent() {
        let registry = AuthRegistry::new().with_session_ttl(Duration::from_millis(200));
        let (sid, _) = registry.issue_session("alice", Role::Viewer);
        let headers = headers_with(&[("cookie", format!("sid={sid}"))]);

        // Touch the session past 10% of the TTL, repeatedly; each touch
        // slides the deadline so the session outlives the original TTL.
        for _ in 0..8 {
            std::thread::sleep(Duration::from_millis(50));
            assert!(
                registry.authenticate(&headers).is_ok(),
                "session should keep sliding"
            );
        }
    }

    #[test]
    fn revoked_session_stops_working() {
        let registry = AuthRegistry::new();
        let (sid, _) = registry.issue_session("alice", Role::Viewer);
        registry.revoke_session(&sid);
        let headers = headers_with(&[("cookie", format!("sid={sid}"))]);
        assert!(registry.authenticate(&headers).is_err());
    }
}
