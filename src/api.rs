//! HTTP surface for signals and user commands
//!
//! - `POST /signals` - deliver a lifecycle signal (202 Accepted)
//! - `POST /actions/create-backup` - `{"type": "full|differential|incremental"}`
//! - `POST /actions/list-backups`
//! - `POST /actions/restore` - `{"backup-id": "..."}`
//!
//! Actions answer 200 with the command output, or 422 with `{"error": reason}`.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::controller::{CommandResult, Envelope};
use crate::model::{BackupType, Signal};

#[derive(Deserialize, Default)]
struct CreateBackupParams {
    #[serde(default, rename = "type")]
    backup_type: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RestoreParams {
    #[serde(default)]
    backup_id: Option<String>,
}

/// Parse an optional JSON body; an empty body means defaults
fn params<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid parameters: {}", e))
}

fn failure(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({ "error": reason }))).into_response()
}

async fn deliver(tx: &mpsc::Sender<Envelope>, signal: Signal) -> Response {
    if signal.is_command() {
        let (envelope, reply) = Envelope::command(signal);
        if tx.send(envelope).await.is_err() {
            return failure(StatusCode::SERVICE_UNAVAILABLE, "dispatcher not running");
        }
        return match reply.await {
            Ok(result) => command_response(result),
            Err(_) => failure(StatusCode::SERVICE_UNAVAILABLE, "dispatcher stopped"),
        };
    }

    debug!(signal = %signal.kind(), "Signal received");
    match tx.send(Envelope::signal(signal)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => failure(StatusCode::SERVICE_UNAVAILABLE, "dispatcher not running"),
    }
}

fn command_response(result: CommandResult) -> Response {
    match result {
        Ok(output) => (StatusCode::OK, Json(output)).into_response(),
        Err(reason) => failure(StatusCode::UNPROCESSABLE_ENTITY, &reason),
    }
}

async fn signals(State(tx): State<mpsc::Sender<Envelope>>, body: Bytes) -> Response {
    match serde_json::from_slice::<Signal>(&body) {
        Ok(signal) => deliver(&tx, signal).await,
        Err(e) => failure(StatusCode::BAD_REQUEST, &format!("invalid signal: {}", e)),
    }
}

async fn create_backup(State(tx): State<mpsc::Sender<Envelope>>, body: Bytes) -> Response {
    let params: CreateBackupParams = match params(&body) {
        Ok(p) => p,
        Err(reason) => return failure(StatusCode::UNPROCESSABLE_ENTITY, &reason),
    };
    let backup_type = match params.backup_type.as_deref() {
        None => BackupType::default(),
        Some(value) => match value.parse::<BackupType>() {
            Ok(t) => t,
            Err(reason) => return failure(StatusCode::UNPROCESSABLE_ENTITY, &reason),
        },
    };
    deliver(&tx, Signal::CreateBackupRequested { backup_type }).await
}

async fn list_backups(State(tx): State<mpsc::Sender<Envelope>>) -> Response {
    deliver(&tx, Signal::ListBackupsRequested).await
}

async fn restore(State(tx): State<mpsc::Sender<Envelope>>, body: Bytes) -> Response {
    let params: RestoreParams = match params(&body) {
        Ok(p) => p,
        Err(reason) => return failure(StatusCode::UNPROCESSABLE_ENTITY, &reason),
    };
    deliver(
        &tx,
        Signal::RestoreRequested {
            backup_id: params.backup_id,
        },
    )
    .await
}

/// Router for signal delivery and actions
pub fn create_router(tx: mpsc::Sender<Envelope>) -> Router {
    Router::new()
        .route("/signals", post(signals))
        .route("/actions/create-backup", post(create_backup))
        .route("/actions/list-backups", post(list_backups))
        .route("/actions/restore", post(restore))
        .with_state(tx)
}
