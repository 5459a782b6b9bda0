//! WebSocket transport
//!
//! A thin adapter in front of [`MessageService`]. Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Parse each text frame as a [`ClientRequest`]
//! - Run the matching facade call and answer with one [`ServerResponse`]
//!
//! Requests on one connection are answered in order. Validation failures
//! come back as `error` responses and never close the connection.

use std::str::FromStr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::model::{Message, MessageEnvelope, MessageType};
use crate::service::MessageService;
use crate::transport::message::{ClientRequest, ServerResponse};
use crate::utils::Result;

pub async fn start_websocket_server(addr: &str, service: MessageService) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{addr}");

    while let Ok((stream, peer)) = listener.accept().await {
        let service = service.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, "WebSocket handshake error: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
            info!(%peer, "Client connected");

            spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!(%peer, "Failed to send response: {e}");
                        break;
                    }
                }
                debug!(%peer, "Send loop closed");
            });

            while let Some(Ok(msg)) = ws_receiver.next().await {
                if !msg.is_text() {
                    continue;
                }
                let Ok(text) = msg.to_text() else {
                    continue;
                };

                let response = handle_request(&service, text);
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if tx.send(WsMessage::Text(json.into())).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%peer, "Failed to encode response: {e}"),
                }
            }

            info!(%peer, "Client disconnected");
        });
    }

    Ok(())
}

/// Decodes one request frame and runs it against `service`.
pub fn handle_request(service: &MessageService, text: &str) -> ServerResponse {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => dispatch(service, request).unwrap_or_else(|e| {
            warn!(error = %e, "Request failed");
            ServerResponse::Error {
                message: e.to_string(),
            }
        }),
        Err(e) => {
            warn!("Invalid client request: {e} | {text}");
            ServerResponse::Error {
                message: format!("invalid request: {e}"),
            }
        }
    }
}

fn dispatch(service: &MessageService, request: ClientRequest) -> Result<ServerResponse> {
    let response = match request {
        ClientRequest::Create {
            content,
            sender,
            message_type,
        } => {
            let message_type = MessageType::from_str(&message_type)?;
            let message = service.create_and_send(&content, &sender, message_type)?;
            ServerResponse::Message {
                message: Some(MessageEnvelope::from(&message)),
            }
        }
        ClientRequest::Get { id } => ServerResponse::Message {
            message: service.get_by_id(&id)?.as_ref().map(MessageEnvelope::from),
        },
        ClientRequest::BySender { sender } => envelopes(service.get_by_sender(&sender)?),
        ClientRequest::All => envelopes(service.get_all()?),
        ClientRequest::Urgent => envelopes(service.get_urgent()?),
        ClientRequest::Delete { id } => {
            let deleted = service.delete_by_id(&id)?;
            ServerResponse::Deleted { id, deleted }
        }
        ClientRequest::Cleanup { minutes } => ServerResponse::Cleaned {
            removed: service.cleanup(minutes)?,
        },
        ClientRequest::SendBatch { count } => ServerResponse::BatchSent {
            report: service.send_batch(count),
        },
        ClientRequest::StressTest {
            duration_secs,
            rate_per_second,
        } => {
            // the run outlives the request; only its start is reported
            let (started, _task) =
                service.stress_test(Duration::from_secs(duration_secs), rate_per_second)?;
            ServerResponse::StressStarted { started }
        }
        ClientRequest::Status => ServerResponse::Status {
            status: service.consumer_status()?,
        },
    };
    Ok(response)
}

fn envelopes(messages: Vec<Message>) -> ServerResponse {
    ServerResponse::Messages {
        messages: messages.iter().map(MessageEnvelope::from).collect(),
    }
}
