//! Authentication port and a local single-user provider
//!
//! The orchestrator only observes the session through [`AuthProvider::state`];
//! how a session is obtained belongs to the provider.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::{BackupError, Result};

/// Result code reported by the host when the external flow completed
pub const RESULT_OK: i32 = -1;

/// Result code reported by the host when the user backed out
pub const RESULT_CANCELED: i32 = 0;

/// An authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct User {
    /// Stable identifier, also used as the backup namespace
    pub id: String,
}

/// Session state as published by an [`AuthProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    NotAuthenticated,
    Authenticating,
    Authenticated(User),
}

impl AuthState {
    /// The session's user, if authenticated
    pub fn user(&self) -> Option<&User> {
        match self {
            AuthState::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

/// Authentication capability consumed by the backup engine and orchestrator
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Subscribe to session state changes; the receiver starts at the current state
    fn state(&self) -> watch::Receiver<AuthState>;

    /// Begin an authentication flow on behalf of the given host context
    async fn start_authentication(&self, host_context: &str) -> Result<()>;

    /// Feed the result of an external authentication flow back into the provider
    async fn handle_external_result(
        &self,
        request_code: i32,
        result_code: i32,
        payload: Option<String>,
    ) -> Result<()>;

    /// End the current session
    async fn logout(&self) -> Result<()>;
}

/// In-process provider for a single-user install
///
/// `start_authentication` issues a request code; the host completes the flow
/// by calling `handle_external_result` with that code and the user id as
/// payload.
pub struct LocalAuthProvider {
    state: watch::Sender<AuthState>,
    pending: Mutex<Option<PendingRequest>>,
    next_request_code: Mutex<i32>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request_code: i32,
    host_context: String,
}

impl LocalAuthProvider {
    /// Create a provider, optionally already signed in as `user`
    pub fn new(user: Option<User>) -> Self {
        let initial = match user {
            Some(user) => AuthState::Authenticated(user),
            None => AuthState::NotAuthenticated,
        };
        let (state, _) = watch::channel(initial);

        Self {
            state,
            pending: Mutex::new(None),
            next_request_code: Mutex::new(1000),
        }
    }

    /// Request code of the flow currently waiting for a result
    pub fn pending_request_code(&self) -> Option<i32> {
        self.pending
            .lock()
            .ok()
            .and_then(|pending| pending.as_ref().map(|p| p.request_code))
    }

    fn lock_error() -> BackupError {
        BackupError::Internal("auth provider lock poisoned".to_string())
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    fn state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    async fn start_authentication(&self, host_context: &str) -> Result<()> {
        let request_code = {
            let mut next = self.next_request_code.lock().map_err(|_| Self::lock_error())?;
            *next += 1;
            *next
        };

        *self.pending.lock().map_err(|_| Self::lock_error())? = Some(PendingRequest {
            request_code,
            host_context: host_context.to_string(),
        });

        info!(request_code, host = host_context, "Starting authentication");
        self.state.send_replace(AuthState::Authenticating);
        Ok(())
    }

    async fn handle_external_result(
        &self,
        request_code: i32,
        result_code: i32,
        payload: Option<String>,
    ) -> Result<()> {
        let pending = {
            let mut pending = self.pending.lock().map_err(|_| Self::lock_error())?;
            match pending.as_ref() {
                Some(p) if p.request_code == request_code => pending.take(),
                _ => None,
            }
        };

        let Some(pending) = pending else {
            debug!(request_code, "Ignoring result for unknown authentication request");
            return Ok(());
        };

        let user = payload
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && result_code == RESULT_OK);

        match user {
            Some(id) => {
                info!(user = %id, host = %pending.host_context, "Authentication completed");
                self.state.send_replace(AuthState::Authenticated(User { id }));
            }
            None if result_code == RESULT_CANCELED => {
                info!(request_code, "Authentication cancelled");
                self.state.send_replace(AuthState::NotAuthenticated);
            }
            None => {
                warn!(request_code, result_code, "Authentication did not complete");
                self.state.send_replace(AuthState::NotAuthenticated);
            }
        }

        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
        info!("Logging out");
        self.state.send_replace(AuthState::NotAuthenticated);
        Ok(())
    }
}
