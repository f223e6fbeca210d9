//! Participant sockets
//!
//! One socket per participant. Outbound events come from the presence hub
//! channel; inbound frames are parsed as [`ClientEvent`]s and dispatched to
//! the engine.

use super::handlers::CurrentParticipant;
use super::AppState;
use crate::db::ParticipantId;
use crate::engine::NegotiationEngine;
use crate::error::ErrorKind;
use crate::events::{ClientEvent, ServerEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub async fn connect_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    CurrentParticipant(me): CurrentParticipant,
) -> Response {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| run_socket(socket, engine, me))
}

async fn run_socket(socket: WebSocket, engine: Arc<NegotiationEngine>, me: ParticipantId) {
    let (connection_id, outbound) = engine.connect(&me);
    let mut outbound = UnboundedReceiverStream::new(outbound);
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(participant = %me, "Socket connected");

    loop {
        tokio::select! {
            maybe = outbound.next() => {
                // None: a newer connection replaced this one
                let Some(event) = maybe else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(participant = %me, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_frame(&engine, &me, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(participant = %me, error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        }
    }

    engine.disconnect(&me, connection_id);
    tracing::info!(participant = %me, "Socket disconnected");
}

async fn handle_frame(engine: &NegotiationEngine, me: &ParticipantId, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => engine.dispatch(me, event).await,
        Err(e) => {
            engine.presence().send_to(
                me,
                ServerEvent::Error {
                    kind: ErrorKind::InvalidMessage,
                    detail: format!("unrecognized event: {e}"),
                },
            );
        }
    }
}
