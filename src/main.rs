use axum::{
    Json, Router,
    extract::{Form, State},
    http::StatusCode,
    routing::{get, post},
};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod database;
mod db;
mod orchestrator;
mod scheduler;

use auth::{AuthProvider, LocalAuthProvider};
use config::BackupConfig;
use database::BackupError;
use database::backup::{BackupEngine, LocalDatabase};
use database::preferences::{PreferenceStore, SqlitePreferenceStore};
use database::storage::{CloudStorage, create_storage_provider};
use orchestrator::{
    BackupCloudStorageState, OperationOutcome, Orchestrator, OrchestratorEvent, OrchestratorHandle,
};
use scheduler::{BackupScheduler, TokioBackupScheduler};

// Application state shared by handlers
struct AppState {
    backup: OrchestratorHandle,
    auth: Arc<LocalAuthProvider>,
}

// Body of every action response
#[derive(Serialize)]
struct ActionResponse {
    accepted: bool,
    error: Option<String>,
}

type ActionResult = (StatusCode, Json<ActionResponse>);

fn error_status(error: &BackupError) -> StatusCode {
    match error {
        BackupError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        BackupError::RemoteNotFound => StatusCode::NOT_FOUND,
        BackupError::Transport(_) => StatusCode::BAD_GATEWAY,
        BackupError::OrchestratorStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn accepted(accepted: bool) -> ActionResult {
    let status = if accepted { StatusCode::OK } else { StatusCode::CONFLICT };
    (status, Json(ActionResponse { accepted, error: None }))
}

fn failed(error: BackupError) -> ActionResult {
    (
        error_status(&error),
        Json(ActionResponse {
            accepted: false,
            error: Some(error.to_string()),
        }),
    )
}

fn toggle_response(result: Result<bool, BackupError>) -> ActionResult {
    match result {
        Ok(done) => accepted(done),
        Err(e) => failed(e),
    }
}

fn operation_response(result: Result<OperationOutcome, BackupError>) -> ActionResult {
    match result {
        Ok(OperationOutcome::Succeeded) => accepted(true),
        Ok(OperationOutcome::Skipped) => accepted(false),
        Ok(OperationOutcome::Failed(e)) | Err(e) => failed(e),
    }
}

// Handler for the published backup status
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<BackupCloudStorageState> {
    Json(state.backup.current_status())
}

async fn enable_handler(State(state): State<Arc<AppState>>) -> ActionResult {
    toggle_response(state.backup.enable_backup().await)
}

async fn disable_handler(State(state): State<Arc<AppState>>) -> ActionResult {
    toggle_response(state.backup.disable_backup().await)
}

async fn backup_now_handler(State(state): State<Arc<AppState>>) -> ActionResult {
    operation_response(state.backup.backup_now().await)
}

async fn restore_handler(State(state): State<Arc<AppState>>) -> ActionResult {
    operation_response(state.backup.restore_previous_backup().await)
}

async fn logout_handler(State(state): State<Arc<AppState>>) -> ActionResult {
    toggle_response(state.backup.logout().await.map(|_| true))
}

// Response to starting authentication; the request code must be posted back to /auth/callback
#[derive(Serialize)]
struct StartAuthResponse {
    request_code: Option<i32>,
}

async fn start_auth_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StartAuthResponse>, ActionResult> {
    state
        .backup
        .start_authentication("http")
        .await
        .map_err(failed)?;
    Ok(Json(StartAuthResponse {
        request_code: state.auth.pending_request_code(),
    }))
}

// Form data posted back by the external authentication flow
#[derive(Deserialize)]
struct AuthCallbackForm {
    request_code: i32,
    result_code: i32,
    payload: Option<String>,
}

async fn auth_callback_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<AuthCallbackForm>,
) -> ActionResult {
    let result = state
        .backup
        .handle_external_auth_result(form.request_code, form.result_code, form.payload)
        .await;
    toggle_response(result.map(|_| true))
}

/// Resolves once a restore has replaced the database file
async fn restart_required(backup: OrchestratorHandle) {
    let mut events = backup.events();
    loop {
        match events.recv().await {
            Ok(OrchestratorEvent::RestartRequired) => {
                warn!("Database restored, restarting to reopen it");
                return;
            }
            Ok(OrchestratorEvent::BackupFailed(e)) => error!(error = %e, "Backup failed"),
            Ok(OrchestratorEvent::RestoreFailed(e)) => error!(error = %e, "Restore failed"),
            Ok(OrchestratorEvent::PreviousBackupAvailable(at)) => {
                info!(last_backup = %at, "A previous backup is available to restore")
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let config = BackupConfig::from_env();

    let db_pool = db::init_db(&config.database_path).await?;
    let settings_pool = db::init_settings_db(&config.settings_path).await?;
    info!(path = %config.database_path.display(), "Database initialized");

    let preferences: Arc<dyn PreferenceStore> = Arc::new(SqlitePreferenceStore::new(settings_pool));
    let storage: Arc<dyn CloudStorage> = Arc::from(create_storage_provider(&config).await?);
    let local_auth = Arc::new(LocalAuthProvider::new(config.initial_user()));
    let auth: Arc<dyn AuthProvider> = local_auth.clone();

    let engine = BackupEngine::new(
        LocalDatabase::new(db_pool, config.database_path.clone()),
        storage,
        auth.clone(),
        preferences.clone(),
    );

    let orchestrator_config = config.orchestrator_config();
    let scheduler = Arc::new(TokioBackupScheduler::new(engine.clone(), preferences.clone()));

    // The schedule lives in this process, so pick it back up after a restart
    if preferences.is_backup_enabled().await? {
        scheduler
            .schedule(
                orchestrator_config.schedule_period,
                orchestrator_config.constraints.clone(),
            )
            .await?;
    }
    info!(scheduled = scheduler.is_scheduled(), "Background backup scheduler ready");

    let (backup, orchestrator_task) = Orchestrator {
        engine,
        auth,
        scheduler,
        preferences,
        config: orchestrator_config,
    }
    .start()
    .await?;

    let state = Arc::new(AppState {
        backup: backup.clone(),
        auth: local_auth,
    });

    let app = Router::new()
        .route("/backup/status", get(status_handler))
        .route("/backup/enable", post(enable_handler))
        .route("/backup/disable", post(disable_handler))
        .route("/backup/now", post(backup_now_handler))
        .route("/backup/restore", post(restore_handler))
        .route("/auth/start", post(start_auth_handler))
        .route("/auth/callback", post(auth_callback_handler))
        .route("/auth/logout", post(logout_handler))
        .with_state(state);

    info!(addr = %config.bind_addr, "Server starting");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(restart_required(backup.clone()))
        .await?;

    backup.shutdown().await;
    let _ = orchestrator_task.await;
    info!("Server stopped");

    Ok(())
}
