//! Backup orchestrator
//!
//! Fuses the session, the backup preference, background job outcomes and the
//! in-flight operation into one published [`BackupCloudStorageState`].
//!
//! ## Flow
//!
//! ```text
//! OrchestratorHandle ──commands──┐
//! AuthProvider::state ──changes──┤
//! BackupScheduler::outcomes ─────┼──→ event loop ──reduce──→ watch<status>
//! spawned I/O ───completions─────┘        │
//!                                          └──→ broadcast<OrchestratorEvent>
//! ```
//!
//! The event loop is the only place the context changes, one event at a
//! time. Network I/O runs in spawned tasks whose completions come back
//! through the same loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthProvider, AuthState, User};
use crate::database::backup::BackupEngine;
use crate::database::preferences::PreferenceStore;
use crate::database::storage::FileMetaData;
use crate::database::{BackupError, Result};
use crate::scheduler::{BackupScheduler, JobConstraints, JobOutcome};

pub mod state;

pub use state::BackupCloudStorageState;
use state::{project, reduce, Change, Context, Operation};

/// One-shot notifications for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    BackupFailed(BackupError),
    RestoreFailed(BackupError),
    /// Backup was just enabled and a previous backup exists remotely
    PreviousBackupAvailable(DateTime<Utc>),
    /// The database file was replaced; the process must restart
    RestartRequired,
}

/// How a user-triggered backup or restore ended
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Succeeded,
    /// The error was also published as an [`OrchestratorEvent`]
    Failed(BackupError),
    /// Another operation held the slot, or the current state did not allow it
    Skipped,
}

/// Settings for the background job the orchestrator schedules
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub schedule_period: Duration,
    pub constraints: JobConstraints,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            schedule_period: Duration::from_secs(24 * 60 * 60),
            constraints: JobConstraints::default(),
        }
    }
}

enum Command {
    EnableBackup {
        reply: oneshot::Sender<Result<bool>>,
    },
    DisableBackup {
        reply: oneshot::Sender<Result<bool>>,
    },
    BackupNow {
        reply: oneshot::Sender<OperationOutcome>,
    },
    Restore {
        reply: oneshot::Sender<OperationOutcome>,
    },
    Logout {
        reply: oneshot::Sender<Result<()>>,
    },
    StartAuthentication {
        host_context: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ExternalAuthResult {
        request_code: i32,
        result_code: i32,
        payload: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

enum Completion {
    Metadata {
        user: User,
        result: Result<FileMetaData>,
    },
    Operation {
        operation: Operation,
        /// Session user when the operation started
        started_by: Option<User>,
        /// Provider timestamp for a backup, `None` for a restore
        result: Result<Option<DateTime<Utc>>>,
        reply: oneshot::Sender<OperationOutcome>,
    },
}

/// Dependencies of the orchestrator, all injected by the host
pub struct Orchestrator {
    pub engine: BackupEngine,
    pub auth: Arc<dyn AuthProvider>,
    pub scheduler: Arc<dyn BackupScheduler>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub config: OrchestratorConfig,
}

impl Orchestrator {
    /// Load persisted state, subscribe to the ports and start the event loop
    pub async fn start(self) -> Result<(OrchestratorHandle, JoinHandle<()>)> {
        let backup_enabled = self.preferences.is_backup_enabled().await?;
        let last_backup = self.preferences.last_backup_date().await?;

        let mut auth_rx = self.auth.state();
        let auth_state = auth_rx.borrow_and_update().clone();
        let outcomes_rx = self.scheduler.outcomes();

        let ctx = Context::new(auth_state, backup_enabled, last_backup);
        let (status_tx, status_rx) = watch::channel(project(&ctx, Utc::now()));
        let (events_tx, _) = broadcast::channel(32);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        info!(
            backup_enabled,
            last_backup = ?last_backup,
            "Starting backup orchestrator"
        );

        let event_loop = EventLoop {
            ctx,
            engine: self.engine,
            auth: self.auth,
            scheduler: self.scheduler,
            preferences: self.preferences,
            config: self.config,
            status_tx,
            events_tx: events_tx.clone(),
            completion_tx,
        };

        // A session that already exists at startup counts as fresh
        if let Some(user) = event_loop.ctx.auth.user().cloned() {
            event_loop.refresh_remote_metadata(user);
        }

        let subscriptions = Subscriptions {
            commands: command_rx,
            completions: completion_rx,
            auth: Some(auth_rx),
            outcomes: Some(outcomes_rx),
        };
        let task = tokio::spawn(event_loop.run(subscriptions));

        let handle = OrchestratorHandle {
            commands: command_tx,
            status: status_rx,
            events: events_tx,
        };

        Ok((handle, task))
    }
}

/// Cloneable entry point used by the presentation layer
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<BackupCloudStorageState>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    /// Subscribe to the published status
    pub fn status(&self) -> watch::Receiver<BackupCloudStorageState> {
        self.status.clone()
    }

    /// Current published status
    pub fn current_status(&self) -> BackupCloudStorageState {
        self.status.borrow().clone()
    }

    /// Subscribe to one-shot events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| BackupError::OrchestratorStopped)?;
        rx.await.map_err(|_| BackupError::OrchestratorStopped)
    }

    /// Turn backup on; returns false if the current state does not allow it
    pub async fn enable_backup(&self) -> Result<bool> {
        self.request(|reply| Command::EnableBackup { reply }).await?
    }

    /// Turn backup off; returns false if the current state does not allow it
    pub async fn disable_backup(&self) -> Result<bool> {
        self.request(|reply| Command::DisableBackup { reply }).await?
    }

    /// Run a backup now and wait for it to finish
    pub async fn backup_now(&self) -> Result<OperationOutcome> {
        self.request(|reply| Command::BackupNow { reply }).await
    }

    /// Restore the remote backup over the local database and wait for it to finish
    pub async fn restore_previous_backup(&self) -> Result<OperationOutcome> {
        self.request(|reply| Command::Restore { reply }).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.request(|reply| Command::Logout { reply }).await?
    }

    pub async fn start_authentication(&self, host_context: &str) -> Result<()> {
        let host_context = host_context.to_string();
        self.request(|reply| Command::StartAuthentication { host_context, reply })
            .await?
    }

    /// Pass the result of an external authentication flow to the auth provider
    pub async fn handle_external_auth_result(
        &self,
        request_code: i32,
        result_code: i32,
        payload: Option<String>,
    ) -> Result<()> {
        self.request(|reply| Command::ExternalAuthResult {
            request_code,
            result_code,
            payload,
            reply,
        })
        .await?
    }

    /// Stop the event loop; nothing is published afterwards
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct Subscriptions {
    commands: mpsc::Receiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    auth: Option<watch::Receiver<AuthState>>,
    outcomes: Option<broadcast::Receiver<JobOutcome>>,
}

struct EventLoop {
    ctx: Context,
    engine: BackupEngine,
    auth: Arc<dyn AuthProvider>,
    scheduler: Arc<dyn BackupScheduler>,
    preferences: Arc<dyn PreferenceStore>,
    config: OrchestratorConfig,
    status_tx: watch::Sender<BackupCloudStorageState>,
    events_tx: broadcast::Sender<OrchestratorEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl EventLoop {
    async fn run(mut self, mut subs: Subscriptions) {
        loop {
            tokio::select! {
                // Finished work is folded in before the next command is looked at
                biased;

                Some(completion) = subs.completions.recv() => {
                    self.handle_completion(completion).await;
                }

                command = subs.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }

                changed = changed_auth(&mut subs.auth) => {
                    match changed {
                        Some(state) => self.handle_auth_change(state),
                        None => {
                            warn!("Auth provider closed its state stream");
                            subs.auth = None;
                        }
                    }
                }

                outcome = next_outcome(&mut subs.outcomes) => {
                    match outcome {
                        Ok(outcome) => self.handle_job_outcome(Some(outcome)).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Missed background job outcomes");
                            self.handle_job_outcome(None).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Scheduler closed its outcome stream");
                            subs.outcomes = None;
                        }
                    }
                }
            }
        }

        // Release upstream subscriptions before the status channel goes away
        drop(subs);
        info!("Backup orchestrator stopped");
    }

    fn apply(&mut self, change: Change) {
        let (ctx, status) = reduce(self.ctx.clone(), change, Utc::now());
        self.ctx = ctx;
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!(status = ?status, "Publishing backup status");
                *current = status;
                true
            }
        });
    }

    fn emit(&self, event: OrchestratorEvent) {
        // Nobody listening is not an error
        let _ = self.events_tx.send(event);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::EnableBackup { reply } => {
                let _ = reply.send(self.enable_backup().await);
            }
            Command::DisableBackup { reply } => {
                let _ = reply.send(self.disable_backup().await);
            }
            Command::BackupNow { reply } => self.start_operation(Operation::Backup, reply),
            Command::Restore { reply } => self.start_operation(Operation::Restore, reply),
            Command::Logout { reply } => {
                let _ = reply.send(self.logout().await);
            }
            Command::StartAuthentication {
                host_context,
                reply,
            } => {
                let _ = reply.send(self.auth.start_authentication(&host_context).await);
            }
            Command::ExternalAuthResult {
                request_code,
                result_code,
                payload,
                reply,
            } => {
                let result = self
                    .auth
                    .handle_external_result(request_code, result_code, payload)
                    .await;
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn enable_backup(&mut self) -> Result<bool> {
        if !matches!(
            project(&self.ctx, Utc::now()),
            BackupCloudStorageState::NotActivated { .. }
        ) {
            debug!("Ignoring enable request outside of NotActivated");
            return Ok(false);
        }

        self.preferences.set_backup_enabled(true).await?;
        self.apply(Change::BackupEnabled(true));
        info!("Cloud backup enabled");

        if let Some(last_backup) = self.ctx.last_backup {
            self.emit(OrchestratorEvent::PreviousBackupAvailable(last_backup));
        }

        if let Err(e) = self
            .scheduler
            .schedule(self.config.schedule_period, self.config.constraints.clone())
            .await
        {
            error!(error = %e, "Failed to schedule background backup");
        }

        Ok(true)
    }

    async fn disable_backup(&mut self) -> Result<bool> {
        if !matches!(
            project(&self.ctx, Utc::now()),
            BackupCloudStorageState::Activated { .. }
        ) {
            debug!("Ignoring disable request outside of Activated");
            return Ok(false);
        }

        self.preferences.set_backup_enabled(false).await?;
        self.apply(Change::BackupEnabled(false));
        info!("Cloud backup disabled");

        if let Err(e) = self.scheduler.unschedule().await {
            error!(error = %e, "Failed to unschedule background backup");
        }

        Ok(true)
    }

    async fn logout(&mut self) -> Result<()> {
        // Durable timestamp and preference go in one write; nothing else changes if it fails
        self.preferences.reset_backup_state().await?;

        if let Err(e) = self.scheduler.unschedule().await {
            error!(error = %e, "Failed to unschedule background backup on logout");
        }

        if let Err(e) = self.auth.logout().await {
            warn!(error = %e, "Auth provider logout failed, local state cleared anyway");
        }

        // The session ends in the same step, so observers never see the user with backup off
        self.apply(Change::Reset);
        info!("Logged out of cloud backup");
        Ok(())
    }

    fn start_operation(&mut self, operation: Operation, reply: oneshot::Sender<OperationOutcome>) {
        if self.ctx.operation != Operation::Idle {
            debug!(
                requested = ?operation,
                backup_in_progress = self.ctx.backup_in_progress(),
                restoration_in_progress = self.ctx.restoration_in_progress(),
                "Operation already in progress"
            );
            let _ = reply.send(OperationOutcome::Skipped);
            return;
        }

        self.apply(Change::OperationStarted(operation));

        let started_by = self.ctx.auth.user().cloned();
        let engine = self.engine.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let work = async {
                match operation {
                    Operation::Backup => engine
                        .perform_backup()
                        .await
                        .map(|report| Some(report.uploaded_at)),
                    _ => engine.perform_restore().await.map(|_| None),
                }
            };

            let result = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(BackupError::Internal(panic_message(panic.as_ref()))));

            let _ = completions.send(Completion::Operation {
                operation,
                started_by,
                result,
                reply,
            });
        });
    }

    fn refresh_remote_metadata(&self, user: User) {
        let engine = self.engine.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = engine.fetch_remote_metadata().await;
            let _ = completions.send(Completion::Metadata { user, result });
        });
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Metadata { user, result } => {
                if self.ctx.auth.user() != Some(&user) {
                    debug!(user = %user.id, "Discarding metadata for a session that has ended");
                    return;
                }

                match result {
                    Ok(meta) => {
                        let at = meta.last_update_date;
                        let known = self.known_last_backup().await;
                        if known.is_some_and(|known| known >= at) {
                            debug!(
                                user = %user.id,
                                remote = %at,
                                known = ?known,
                                "Remote backup is not newer than the recorded one"
                            );
                            return;
                        }
                        if let Err(e) = self.preferences.save_last_backup_date(Some(at)).await {
                            warn!(error = %e, "Failed to persist remote backup date");
                            return;
                        }
                        info!(user = %user.id, remote = %meta.path, last_backup = %at, "Found remote backup");
                        self.apply(Change::LastBackup(Some(at)));
                    }
                    Err(BackupError::RemoteNotFound) => {
                        debug!(user = %user.id, "No remote backup yet");
                    }
                    Err(e) => {
                        warn!(user = %user.id, error = %e, "Could not refresh remote backup metadata");
                    }
                }
            }
            Completion::Operation {
                operation,
                started_by,
                result,
                reply,
            } => {
                let result = match result {
                    Ok(Some(at)) if self.ctx.auth.user() != started_by.as_ref() => {
                        self.discard_backup_timestamp(at).await;
                        Err(BackupError::NotAuthenticated)
                    }
                    other => other,
                };

                if let Ok(Some(at)) = &result {
                    self.apply(Change::LastBackup(Some(*at)));
                }
                self.apply(Change::OperationFinished);

                let outcome = match (operation, result) {
                    (_, Ok(_)) => {
                        if operation == Operation::Restore {
                            self.emit(OrchestratorEvent::RestartRequired);
                        }
                        OperationOutcome::Succeeded
                    }
                    (Operation::Restore, Err(e)) => {
                        warn!(error = %e, "Restore failed");
                        self.emit(OrchestratorEvent::RestoreFailed(e.clone()));
                        OperationOutcome::Failed(e)
                    }
                    (_, Err(e)) => {
                        warn!(error = %e, "Backup failed");
                        self.emit(OrchestratorEvent::BackupFailed(e.clone()));
                        OperationOutcome::Failed(e)
                    }
                };

                let _ = reply.send(outcome);
            }
        }
    }

    /// Latest backup time known either in memory or durably
    async fn known_last_backup(&self) -> Option<DateTime<Utc>> {
        match self.preferences.last_backup_date().await {
            Ok(durable) => durable.max(self.ctx.last_backup),
            Err(e) => {
                warn!(error = %e, "Failed to read recorded backup date");
                self.ctx.last_backup
            }
        }
    }

    /// A backup finished for a session that is gone; put back what this session knows
    async fn discard_backup_timestamp(&self, at: DateTime<Utc>) {
        warn!(uploaded_at = %at, "Backup finished after its session ended, discarding timestamp");
        if let Err(e) = self.preferences.save_last_backup_date(self.ctx.last_backup).await {
            error!(error = %e, "Failed to restore recorded backup date");
        }
    }

    fn handle_auth_change(&mut self, state: AuthState) {
        let fresh_user = match (&self.ctx.auth, &state) {
            (AuthState::Authenticated(previous), AuthState::Authenticated(user)) if previous == user => None,
            (_, AuthState::Authenticated(user)) => Some(user.clone()),
            _ => None,
        };

        debug!(auth = ?state, "Auth state changed");
        self.apply(Change::Auth(state));

        if let Some(user) = fresh_user {
            self.refresh_remote_metadata(user);
        }
    }

    async fn handle_job_outcome(&mut self, outcome: Option<JobOutcome>) {
        if let Some(outcome) = &outcome {
            debug!(
                succeeded = outcome.succeeded,
                finished_at = %outcome.finished_at,
                error = ?outcome.error,
                "Background job finished"
            );
        }

        // The job only writes durable state, so pick up whatever it left there
        match (
            self.preferences.is_backup_enabled().await,
            self.preferences.last_backup_date().await,
        ) {
            (Ok(backup_enabled), Ok(last_backup)) => self.apply(Change::Reloaded {
                backup_enabled,
                last_backup,
            }),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to reload preferences after background job");
                self.apply(Change::LastBackup(self.ctx.last_backup));
            }
        }
    }
}

async fn changed_auth(rx: &mut Option<watch::Receiver<AuthState>>) -> Option<AuthState> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn next_outcome(
    rx: &mut Option<broadcast::Receiver<JobOutcome>>,
) -> std::result::Result<JobOutcome, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("operation panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("operation panicked: {}", message)
    } else {
        "operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RESULT_OK;
    use crate::database::backup::tests::Fixture;
    use crate::database::preferences::MockPreferenceStore;
    use async_trait::async_trait;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    struct RecordingScheduler {
        scheduled: AtomicUsize,
        unscheduled: AtomicUsize,
        outcomes: broadcast::Sender<JobOutcome>,
    }

    impl RecordingScheduler {
        fn new() -> Self {
            Self {
                scheduled: AtomicUsize::new(0),
                unscheduled: AtomicUsize::new(0),
                outcomes: broadcast::channel(8).0,
            }
        }
    }

    #[async_trait]
    impl BackupScheduler for RecordingScheduler {
        async fn schedule(&self, _periodicity: Duration, _constraints: JobConstraints) -> Result<()> {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unschedule(&self) -> Result<()> {
            self.unscheduled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn outcomes(&self) -> broadcast::Receiver<JobOutcome> {
            self.outcomes.subscribe()
        }
    }

    struct Harness {
        fixture: Fixture,
        scheduler: Arc<RecordingScheduler>,
        handle: OrchestratorHandle,
        task: JoinHandle<()>,
    }

    async fn start_with(fixture: Fixture, preferences: Arc<dyn PreferenceStore>) -> Harness {
        let scheduler = Arc::new(RecordingScheduler::new());
        let orchestrator = Orchestrator {
            engine: fixture.engine(),
            auth: fixture.auth.clone(),
            scheduler: scheduler.clone(),
            preferences,
            config: OrchestratorConfig::default(),
        };
        let (handle, task) = orchestrator.start().await.unwrap();
        Harness {
            fixture,
            scheduler,
            handle,
            task,
        }
    }

    async fn start(fixture: Fixture) -> Harness {
        let preferences = fixture.preferences.clone();
        start_with(fixture, preferences).await
    }

    async fn wait_for_status(
        handle: &OrchestratorHandle,
        mut predicate: impl FnMut(&BackupCloudStorageState) -> bool,
    ) -> BackupCloudStorageState {
        let mut rx = handle.status();
        let status = timeout(WAIT, rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
        (*status).clone()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn drain(events: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn alice() -> User {
        User {
            id: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_starts_not_activated() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotActivated { user: alice() }
        );
    }

    #[tokio::test]
    async fn test_enable_with_previous_backup_prompts_once() {
        let fixture = Fixture::new(Some("alice")).await;
        let report = fixture.engine().perform_backup().await.unwrap();
        // Fresh install: nothing known locally about the remote backup
        fixture.preferences.save_last_backup_date(None).await.unwrap();

        let harness = start(fixture).await;
        let preferences = harness.fixture.preferences.clone();
        eventually(|| {
            let preferences = preferences.clone();
            async move { preferences.last_backup_date().await.unwrap().is_some() }
        })
        .await;
        assert_eq!(
            harness.fixture.preferences.last_backup_date().await.unwrap(),
            Some(report.uploaded_at)
        );

        let mut events = harness.handle.events();
        assert!(harness.handle.enable_backup().await.unwrap());

        assert_eq!(
            drain(&mut events),
            vec![OrchestratorEvent::PreviousBackupAvailable(report.uploaded_at)]
        );
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::Activated {
                user: alice(),
                last_backup: Some(report.uploaded_at),
                backup_now_available: false,
            }
        );
        assert!(harness.fixture.preferences.is_backup_enabled().await.unwrap());
        assert_eq!(harness.scheduler.scheduled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enable_without_previous_backup_does_not_prompt() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        let mut events = harness.handle.events();

        assert!(harness.handle.enable_backup().await.unwrap());
        assert!(drain(&mut events).is_empty());
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::Activated {
                user: alice(),
                last_backup: None,
                backup_now_available: true,
            }
        );

        // Already activated
        assert!(!harness.handle.enable_backup().await.unwrap());
        assert_eq!(harness.scheduler.scheduled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disable_backup_unschedules() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        assert!(!harness.handle.disable_backup().await.unwrap());

        harness.handle.enable_backup().await.unwrap();
        assert!(harness.handle.disable_backup().await.unwrap());

        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotActivated { user: alice() }
        );
        assert!(!harness.fixture.preferences.is_backup_enabled().await.unwrap());
        assert_eq!(harness.scheduler.unscheduled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backup_now_records_timestamp() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.enable_backup().await.unwrap();
        let mut events = harness.handle.events();

        assert_eq!(
            harness.handle.backup_now().await.unwrap(),
            OperationOutcome::Succeeded
        );

        let last_backup = harness.fixture.preferences.last_backup_date().await.unwrap();
        assert!(last_backup.is_some());
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::Activated {
                user: alice(),
                last_backup,
                backup_now_available: false,
            }
        );
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_failed_backup_resets_flag_and_reports_once() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.enable_backup().await.unwrap();
        harness.fixture.set_failing(true);
        let mut events = harness.handle.events();

        let outcome = harness.handle.backup_now().await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Failed(BackupError::Transport(_))));

        let seen = drain(&mut events);
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            OrchestratorEvent::BackupFailed(BackupError::Transport(_))
        ));

        assert!(harness.fixture.preferences.is_backup_enabled().await.unwrap());
        assert_eq!(harness.fixture.preferences.last_backup_date().await.unwrap(), None);
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::Activated {
                user: alice(),
                last_backup: None,
                backup_now_available: true,
            }
        );

        // The flag was released, so another attempt runs
        harness.fixture.set_failing(false);
        assert_eq!(
            harness.handle.backup_now().await.unwrap(),
            OperationOutcome::Succeeded
        );
    }

    #[tokio::test]
    async fn test_backup_and_restore_are_mutually_exclusive() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.enable_backup().await.unwrap();
        harness.fixture.storage.holding.store(true, Ordering::SeqCst);

        let handle = harness.handle.clone();
        let running = tokio::spawn(async move { handle.backup_now().await });

        wait_for_status(&harness.handle, |s| {
            matches!(s, BackupCloudStorageState::BackupInProgress { .. })
        })
        .await;

        assert_eq!(
            harness.handle.restore_previous_backup().await.unwrap(),
            OperationOutcome::Skipped
        );
        assert_eq!(
            harness.handle.backup_now().await.unwrap(),
            OperationOutcome::Skipped
        );
        assert!(matches!(
            harness.handle.current_status(),
            BackupCloudStorageState::BackupInProgress { .. }
        ));

        harness.fixture.storage.holding.store(false, Ordering::SeqCst);
        harness.fixture.storage.release.notify_one();

        let outcome = timeout(WAIT, running).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, OperationOutcome::Succeeded);
        assert!(matches!(
            harness.handle.current_status(),
            BackupCloudStorageState::Activated { .. }
        ));
    }

    #[tokio::test]
    async fn test_restore_requires_restart_once() {
        let fixture = Fixture::new(Some("alice")).await;
        fixture.engine().perform_backup().await.unwrap();
        fixture.add_note().await;

        let harness = start(fixture).await;
        let mut events = harness.handle.events();

        assert_eq!(
            harness.handle.restore_previous_backup().await.unwrap(),
            OperationOutcome::Succeeded
        );
        assert_eq!(drain(&mut events), vec![OrchestratorEvent::RestartRequired]);
        assert_eq!(harness.fixture.note_count().await, 2);
        assert!(!matches!(
            harness.handle.current_status(),
            BackupCloudStorageState::RestorationInProgress { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_database() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        let db_path = harness.fixture.database.path().to_path_buf();
        let before = tokio::fs::read(&db_path).await.unwrap();
        let mut events = harness.handle.events();

        assert_eq!(
            harness.handle.restore_previous_backup().await.unwrap(),
            OperationOutcome::Failed(BackupError::RemoteNotFound)
        );
        assert_eq!(
            drain(&mut events),
            vec![OrchestratorEvent::RestoreFailed(BackupError::RemoteNotFound)]
        );
        assert_eq!(tokio::fs::read(&db_path).await.unwrap(), before);
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotActivated { user: alice() }
        );
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.enable_backup().await.unwrap();
        harness.handle.backup_now().await.unwrap();

        harness.handle.logout().await.unwrap();

        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotAuthenticated
        );
        assert!(!harness.fixture.preferences.is_backup_enabled().await.unwrap());
        assert_eq!(harness.fixture.preferences.last_backup_date().await.unwrap(), None);
        assert_eq!(harness.scheduler.unscheduled.load(Ordering::SeqCst), 1);
        assert_eq!(
            *harness.fixture.auth.state().borrow(),
            AuthState::NotAuthenticated
        );
    }

    #[tokio::test]
    async fn test_logout_during_backup_keeps_timestamp_cleared() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.enable_backup().await.unwrap();
        harness.fixture.storage.holding.store(true, Ordering::SeqCst);
        let mut events = harness.handle.events();

        let handle = harness.handle.clone();
        let running = tokio::spawn(async move { handle.backup_now().await });
        harness.fixture.storage.parked.notified().await;

        harness.handle.logout().await.unwrap();
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotAuthenticated
        );

        harness.fixture.storage.release_one();
        let outcome = timeout(WAIT, running).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, OperationOutcome::Failed(BackupError::NotAuthenticated));
        assert_eq!(
            drain(&mut events),
            vec![OrchestratorEvent::BackupFailed(BackupError::NotAuthenticated)]
        );

        assert_eq!(harness.fixture.preferences.last_backup_date().await.unwrap(), None);
        assert!(!harness.fixture.preferences.is_backup_enabled().await.unwrap());
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotAuthenticated
        );
    }

    #[tokio::test]
    async fn test_stale_remote_metadata_does_not_roll_back_timestamp() {
        let fixture = Fixture::new(Some("alice")).await;
        let old = fixture.engine().perform_backup().await.unwrap().uploaded_at;
        fixture.preferences.save_last_backup_date(None).await.unwrap();
        fixture.storage.holding_metadata.store(true, Ordering::SeqCst);

        let harness = start(fixture).await;
        // The lookup started for the existing session has read the old backup
        harness.fixture.storage.parked.notified().await;
        harness.handle.enable_backup().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            harness.handle.backup_now().await.unwrap(),
            OperationOutcome::Succeeded
        );
        let newer = harness
            .fixture
            .preferences
            .last_backup_date()
            .await
            .unwrap()
            .unwrap();
        assert!(newer > old);

        harness.fixture.storage.release_one();
        harness.fixture.storage.metadata_returned.notified().await;
        // Completions are handled before commands, so this round trip sees the lookup's result applied
        assert!(!harness.handle.enable_backup().await.unwrap());

        assert_eq!(
            harness.fixture.preferences.last_backup_date().await.unwrap(),
            Some(newer)
        );
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::Activated {
                user: alice(),
                last_backup: Some(newer),
                backup_now_available: false,
            }
        );
    }

    #[tokio::test]
    async fn test_failed_logout_changes_nothing() {
        let fixture = Fixture::new(Some("alice")).await;
        let last = Utc::now();

        let mut preferences = MockPreferenceStore::new();
        preferences.expect_is_backup_enabled().returning(|| Ok(true));
        preferences
            .expect_last_backup_date()
            .returning(move || Ok(Some(last)));
        preferences
            .expect_reset_backup_state()
            .times(1)
            .returning(|| Err(BackupError::Preferences("disk full".to_string())));

        let harness = start_with(fixture, Arc::new(preferences)).await;
        let before = harness.handle.current_status();

        assert!(matches!(
            harness.handle.logout().await,
            Err(BackupError::Preferences(_))
        ));
        assert_eq!(harness.handle.current_status(), before);
        assert_eq!(harness.scheduler.unscheduled.load(Ordering::SeqCst), 0);
        assert!(harness.fixture.auth.state().borrow().user().is_some());
    }

    #[tokio::test]
    async fn test_authentication_pass_through() {
        let harness = start(Fixture::new(None).await).await;
        assert_eq!(
            harness.handle.current_status(),
            BackupCloudStorageState::NotAuthenticated
        );

        harness.handle.start_authentication("settings").await.unwrap();
        wait_for_status(&harness.handle, |s| {
            *s == BackupCloudStorageState::Authenticating
        })
        .await;

        let code = harness.fixture.auth.pending_request_code().unwrap();
        harness
            .handle
            .handle_external_auth_result(code, RESULT_OK, Some("alice".to_string()))
            .await
            .unwrap();

        let status = wait_for_status(&harness.handle, |s| {
            matches!(s, BackupCloudStorageState::NotActivated { .. })
        })
        .await;
        assert_eq!(status, BackupCloudStorageState::NotActivated { user: alice() });
    }

    #[tokio::test]
    async fn test_job_outcome_republishes_durable_state() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.enable_backup().await.unwrap();

        // What the background job does: back up outside the orchestrator
        let report = harness.fixture.engine().perform_backup().await.unwrap();
        harness
            .scheduler
            .outcomes
            .send(JobOutcome {
                succeeded: true,
                finished_at: Utc::now(),
                error: None,
            })
            .unwrap();

        let status = wait_for_status(&harness.handle, |s| {
            matches!(s, BackupCloudStorageState::Activated { last_backup: Some(_), .. })
        })
        .await;
        assert_eq!(
            status,
            BackupCloudStorageState::Activated {
                user: alice(),
                last_backup: Some(report.uploaded_at),
                backup_now_available: false,
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let harness = start(Fixture::new(Some("alice")).await).await;
        harness.handle.shutdown().await;
        timeout(WAIT, harness.task).await.unwrap().unwrap();

        assert_eq!(
            harness.handle.backup_now().await,
            Err(BackupError::OrchestratorStopped)
        );
    }
}
