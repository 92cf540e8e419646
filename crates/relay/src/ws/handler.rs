use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use parley_common::protocol::ws::ChatFrame;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::protocol as ws_protocol;
use super::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES};
use crate::chat::{ChatService, ConnectRequest, SubmitOutcome, Undelivered};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
};
use crate::metrics;
use crate::protocol;

pub async fn ws_upgrade(
    State(service): State<Arc<ChatService>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    // Oversized frames are let through to the size check below so they get
    // a proper 1009 close instead of a transport error.
    ws.max_frame_size(MAX_FRAME_BYTES * 2).max_message_size(MAX_FRAME_BYTES * 2).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(service, socket)).await;
        },
    )
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn reject(socket: &mut WebSocket, code: ErrorCode, message: &str) {
    let _ = ws_protocol::send_ws_message(socket, &code.to_frame(message)).await;
    let _ = socket.send(Message::Close(None)).await;
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at.elapsed().as_millis() as u64
}

/// Reads the opening `hello` and returns `(server_offset, resume_token)`.
/// Anything else answers with an error frame and closes the socket.
async fn read_hello(socket: &mut WebSocket) -> Option<(i64, Option<String>)> {
    let started_at = Instant::now();
    let hello = match socket.recv().await {
        Some(Ok(Message::Text(raw_message))) => {
            if raw_message.len() > MAX_FRAME_BYTES {
                close_frame_too_large(socket).await;
                None
            } else {
                match ws_protocol::decode_message(&raw_message) {
                    Ok(ChatFrame::Hello { protocol_version, server_offset, resume_token }) => {
                        match protocol::require_supported(&protocol_version) {
                            Ok(()) => Some((server_offset.unwrap_or(0), resume_token)),
                            Err(relay_error) => {
                                reject(socket, relay_error.code(), relay_error.message()).await;
                                None
                            }
                        }
                    }
                    _ => {
                        reject(
                            socket,
                            ErrorCode::ChatHelloRequired,
                            ErrorCode::ChatHelloRequired.default_message(),
                        )
                        .await;
                        None
                    }
                }
            }
        }
        Some(Err(error)) if is_frame_size_violation(&error) => {
            close_frame_too_large(socket).await;
            None
        }
        _ => None,
    };

    if hello.is_none() {
        metrics::record_ws_request("hello", true, elapsed_ms(started_at));
    }
    hello
}

async fn handle_socket(service: Arc<ChatService>, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let hello_started_at = Instant::now();

    let Some((server_offset, resume_token)) = read_hello(&mut socket).await else {
        return;
    };

    let (outbound, mut outbound_receiver) = mpsc::unbounded_channel::<ChatFrame>();
    let connected = match service
        .connect(ConnectRequest { server_offset, resume_token, outbound: outbound.clone() })
        .await
    {
        Ok(connected) => connected,
        Err(connect_error) => {
            error!(request_id = %request_id, error = %connect_error, "failed to admit connection");
            metrics::record_ws_request("hello", true, elapsed_ms(hello_started_at));
            reject(&mut socket, ErrorCode::InternalError, ErrorCode::InternalError.default_message())
                .await;
            return;
        }
    };
    let session = connected.session;
    let connection_id = session.connection_id.clone();

    let hello_ack = ChatFrame::HelloAck {
        connection_id: connection_id.clone(),
        display_name: session.display_name.clone(),
        recovered: session.recovered,
        resume_token: session.resume_token.clone(),
        resume_window_ms: service.recovery_window().as_millis() as u64,
    };
    if ws_protocol::send_ws_message(&mut socket, &hello_ack).await.is_err() {
        metrics::record_ws_request("hello", true, elapsed_ms(hello_started_at));
        let undelivered = Undelivered { failed: None, queued: Some(&mut outbound_receiver) };
        service.disconnect(&connection_id, undelivered).await;
        return;
    }
    metrics::record_ws_request("hello", false, elapsed_ms(hello_started_at));

    // Heartbeat: ping every HEARTBEAT_INTERVAL_MS, drop the connection when a
    // ping is still unanswered HEARTBEAT_TIMEOUT_MS later.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut ping_sent_at: Option<Instant> = None;
    let mut failed_frame: Option<ChatFrame> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if ping_sent_at.is_some_and(|sent_at| sent_at.elapsed() >= heartbeat_timeout) {
                    warn!(
                        connection_id = %connection_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if ping_sent_at.is_none() {
                    ping_sent_at = Some(Instant::now());
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            failed_frame = Some(outbound_message);
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            metrics::record_ws_request("send", true, 0);
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        match ws_protocol::decode_message(&raw_message) {
                            Ok(ChatFrame::Send { content, client_offset }) => {
                                let started_at = Instant::now();
                                let outcome = service
                                    .submit(&connection_id, &content, client_offset.as_deref())
                                    .await;
                                metrics::record_ws_request(
                                    "send",
                                    outcome.acknowledged_id().is_none(),
                                    elapsed_ms(started_at),
                                );

                                // Queued behind the broadcast so the sender sees
                                // its message before the ack.
                                if let (Some(client_offset), Some((id, duplicate))) =
                                    (client_offset, outcome.acknowledged_id())
                                {
                                    let _ = outbound.send(ChatFrame::Ack { client_offset, id, duplicate });
                                }
                                if outcome == SubmitOutcome::UnknownSession {
                                    break;
                                }
                            }
                            Ok(unexpected) => {
                                debug!(frame = unexpected.kind(), "unexpected frame from client");
                                metrics::record_ws_request(unexpected.kind(), true, 0);
                                let error_frame = ErrorCode::ChatInvalidMessage
                                    .to_frame(format!("unexpected {} frame", unexpected.kind()));
                                if ws_protocol::send_ws_message(&mut socket, &error_frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                let error_frame = ErrorCode::ChatInvalidMessage
                                    .to_frame(ErrorCode::ChatInvalidMessage.default_message());
                                if ws_protocol::send_ws_message(&mut socket, &error_frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        ping_sent_at = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    let undelivered = Undelivered { failed: failed_frame, queued: Some(&mut outbound_receiver) };
    service.disconnect(&connection_id, undelivered).await;
}
