//! WebSocket handler for realtime entity updates
//!
//! Clients connect with `GET /ws?token=<access token>&topics=<list>`. The
//! token is checked before the upgrade; an invalid one never gets a socket.
//! `topics` is a comma-separated list such as `task_updates,comment_updates`
//! and defaults to every topic.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use taskpulse_cluster::{RealtimeHub, Topic};
use taskpulse_core::models::UserId;
use tracing::{debug, info, warn};

use super::{AppError, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub topics: Option<String>,
}

/// Parse the `topics` query value, rejecting unknown names
fn parse_topics(raw: Option<&str>) -> AppResult<Vec<Topic>> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(Topic::ALL.to_vec());
    };

    let mut topics = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let topic = Topic::from_name(name)
            .ok_or_else(|| AppError::bad_request(format!("Unknown topic: {name}")))?;
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    Ok(topics)
}

/// Verify the token, then upgrade to a WebSocket
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<impl IntoResponse> {
    let token = query
        .token
        .ok_or_else(|| AppError::unauthorized("Missing token"))?;
    let user_id = state.verifier.verify(&token)?;
    let topics = parse_topics(query.topics.as_deref())?;

    let ws = ws.map_err(|e| AppError::bad_request(e.to_string()))?;
    let max_message_bytes = state.hub.config().max_message_bytes;
    let hub = state.hub.clone();

    info!(user_id = %user_id, "WebSocket upgrade accepted");

    Ok(ws
        .max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, hub, user_id, topics)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RealtimeHub>, user_id: UserId, topics: Vec<Topic>) {
    let (handle, mut outbound) = hub.new_connection(user_id);
    hub.on_connection_established(handle.clone(), &topics);
    let cancel = handle.cancel_token();

    info!(user_id = %user_id, connection_id = %handle.id(), "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    // Writer: drain the outbound queue into the socket
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = writer_cancel.cancelled() => break,
                frame = outbound.recv() => frame,
            };
            let Some(frame) = frame else { break };

            if let Err(e) = sink.send(Message::text(frame.to_string())).await {
                debug!(error = %e, "WebSocket write failed");
                break;
            }
        }
        // Stop the reader if the writer went first
        writer_cancel.cancel();
        let _ = sink.close().await;
    });

    // Reader: client frames are republished through the hub
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = hub.on_client_message(&handle, text.as_str()).await {
                    debug!(
                        user_id = %user_id,
                        connection_id = %handle.id(),
                        error = %e,
                        "Client message rejected"
                    );
                    let notice = json!({ "error": e.to_string() }).to_string();
                    if handle.send(notice.into()).is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "WebSocket read error");
                break;
            }
            // Binary, ping and pong frames carry nothing for us
            Some(Ok(_)) => {}
        }
    }

    hub.on_connection_closed(&handle);
    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }

    info!(user_id = %user_id, connection_id = %handle.id(), "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics() {
        assert_eq!(parse_topics(None).unwrap(), Topic::ALL.to_vec());
        assert_eq!(parse_topics(Some("")).unwrap(), Topic::ALL.to_vec());
        assert_eq!(
            parse_topics(Some("task_updates, comment_updates,task_updates")).unwrap(),
            vec![Topic::TaskUpdates, Topic::CommentUpdates]
        );
        assert_eq!(
            parse_topics(Some("bogus")).unwrap_err().status,
            axum::http::StatusCode::BAD_REQUEST
        );
    }
}
