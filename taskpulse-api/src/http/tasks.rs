//! Task mutation endpoint

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use taskpulse_core::models::{EntityId, EntityKind};
use tracing::warn;

use super::{AppError, AppResult, AppState, AuthUser};

#[derive(Debug, Serialize)]
pub struct UpdateAccepted {
    pub status: &'static str,
    pub task_id: EntityId,
}

/// `PATCH /tasks/{id}`
///
/// Broadcasts the changed fields right away and defers the database write to
/// the coalescer. Answers 202 once the edit is scheduled.
pub async fn update_task(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<(StatusCode, Json<UpdateAccepted>)> {
    let task_id: EntityId = id
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid task id: {id}")))?;

    let Value::Object(mut fields) = body else {
        return Err(AppError::bad_request("Body must be a JSON object"));
    };
    fields.remove("id");
    if fields.is_empty() {
        return Err(AppError::bad_request("No fields to update"));
    }

    state
        .hub
        .authorize(&auth.user_id, EntityKind::Task, &task_id)
        .await?;

    // The write is still scheduled when the broadcast fails
    if let Err(e) = state
        .hub
        .request_update(EntityKind::Task, task_id, fields)
        .await
    {
        warn!(task_id = %task_id, error = %e, "Task update broadcast failed");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(UpdateAccepted {
            status: "accepted",
            task_id,
        }),
    ))
}
