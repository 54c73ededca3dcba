//! Orchestrator context, its changes, and the published status projection
//!
//! Everything here is pure: the event loop owns a [`Context`], feeds it
//! [`Change`]s through [`reduce`], and publishes whatever comes out.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::auth::{AuthState, User};

/// How long after a backup "backup now" stays unavailable
pub fn backup_cooldown() -> Duration {
    Duration::hours(24)
}

/// Operation currently holding the exclusive slot
///
/// One slot for both kinds keeps backup and restore from ever running together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    Idle,
    Backup,
    Restore,
}

/// Everything the published status is computed from
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub auth: AuthState,
    pub backup_enabled: bool,
    pub last_backup: Option<DateTime<Utc>>,
    pub operation: Operation,
}

impl Context {
    pub fn new(auth: AuthState, backup_enabled: bool, last_backup: Option<DateTime<Utc>>) -> Self {
        Self {
            auth,
            backup_enabled,
            last_backup,
            operation: Operation::Idle,
        }
    }

    pub fn backup_in_progress(&self) -> bool {
        self.operation == Operation::Backup
    }

    pub fn restoration_in_progress(&self) -> bool {
        self.operation == Operation::Restore
    }
}

/// A single mutation of the context
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Auth(AuthState),
    BackupEnabled(bool),
    LastBackup(Option<DateTime<Utc>>),
    /// Durable state re-read from the preference store
    Reloaded {
        backup_enabled: bool,
        last_backup: Option<DateTime<Utc>>,
    },
    /// Ignored unless no operation is running
    OperationStarted(Operation),
    OperationFinished,
    /// Logout: session ended, timestamp cleared and backup disabled together
    Reset,
}

/// Externally observable status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackupCloudStorageState {
    NotAuthenticated,
    Authenticating,
    NotActivated {
        user: User,
    },
    Activated {
        user: User,
        last_backup: Option<DateTime<Utc>>,
        backup_now_available: bool,
    },
    BackupInProgress {
        user: User,
    },
    RestorationInProgress {
        user: User,
    },
}

/// True iff there is no backup yet or the last one is older than the cooldown
pub fn backup_now_available(last_backup: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_backup {
        None => true,
        Some(at) => now.signed_duration_since(at) > backup_cooldown(),
    }
}

/// Map a context to the status observers see
pub fn project(ctx: &Context, now: DateTime<Utc>) -> BackupCloudStorageState {
    let user = match &ctx.auth {
        AuthState::NotAuthenticated => return BackupCloudStorageState::NotAuthenticated,
        AuthState::Authenticating => return BackupCloudStorageState::Authenticating,
        AuthState::Authenticated(user) => user.clone(),
    };

    match ctx.operation {
        Operation::Restore => BackupCloudStorageState::RestorationInProgress { user },
        Operation::Backup => BackupCloudStorageState::BackupInProgress { user },
        Operation::Idle if !ctx.backup_enabled => BackupCloudStorageState::NotActivated { user },
        Operation::Idle => BackupCloudStorageState::Activated {
            user,
            last_backup: ctx.last_backup,
            backup_now_available: backup_now_available(ctx.last_backup, now),
        },
    }
}

/// Apply one change and compute the status to publish
pub fn reduce(
    mut ctx: Context,
    change: Change,
    now: DateTime<Utc>,
) -> (Context, BackupCloudStorageState) {
    match change {
        Change::Auth(auth) => ctx.auth = auth,
        Change::BackupEnabled(enabled) => ctx.backup_enabled = enabled,
        Change::LastBackup(at) => ctx.last_backup = at,
        Change::Reloaded {
            backup_enabled,
            last_backup,
        } => {
            ctx.backup_enabled = backup_enabled;
            ctx.last_backup = last_backup;
        }
        Change::OperationStarted(operation) => {
            if ctx.operation == Operation::Idle {
                ctx.operation = operation;
            }
        }
        Change::OperationFinished => ctx.operation = Operation::Idle,
        Change::Reset => {
            ctx.auth = AuthState::NotAuthenticated;
            ctx.backup_enabled = false;
            ctx.last_backup = None;
        }
    }

    let status = project(&ctx, now);
    (ctx, status)
}
