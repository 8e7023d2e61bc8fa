//! Carrier media WebSocket
//!
//! The carrier connects here after being told to stream. The `token` query
//! parameter binds the socket to exactly one session: the registry resolves
//! it with a constant-time comparison against every live session's token,
//! and unknown tokens are rejected at upgrade time, so audio can never
//! cross sessions.
//!
//! Inbound frames are JSON control messages; caller-voice audio goes to the
//! session's recognizer, the process's own echo track is discarded, and
//! anything malformed is logged and skipped. Outbound frames arrive on the
//! session's channel and are written by this task, which is the only writer
//! the socket ever has.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::session::Session;

/// Queue depth between the pacer and the socket writer
const OUTBOUND_QUEUE: usize = 64;

/// Media-stream control messages, both carrier dialects
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum StreamEvent {
    Connected {},
    Start {
        #[serde(rename = "streamSid", alias = "stream_id", default)]
        stream_sid: Option<String>,
    },
    Media {
        media: MediaPayload,
    },
    Mark {},
    Stop {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
    #[serde(default)]
    track: Option<String>,
}

impl MediaPayload {
    /// Caller voice comes in on the inbound track; our own audio is echoed
    /// back on the outbound track and must not reach the recognizer.
    fn is_caller_voice(&self) -> bool {
        match self.track.as_deref() {
            None => true,
            Some(track) => track == "inbound" || track == "inbound_track",
        }
    }
}

/// HTTP upgrade handler for GET /media-stream?token=…
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = params.get("token").cloned() else {
        warn!("media stream upgrade without token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let Some(session) = state.engine.registry().get_by_token(&token).await else {
        warn!("media stream upgrade with unknown token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_stream(socket, session))
}

/// Run one bound media socket until either side closes it.
async fn handle_stream(mut socket: WebSocket, session: Arc<Session>) {
    info!(session_id = session.id, "media stream connected");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    session.set_outbound(outbound_tx);

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = session.id, "media stream closed");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(session_id = session.id, "media stream error: {e}");
                        break;
                    }
                };

                let event: StreamEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(session_id = session.id, "unparseable stream message: {e}");
                        continue;
                    }
                };

                match event {
                    StreamEvent::Connected {} => {
                        debug!(session_id = session.id, "stream handshake");
                    }
                    StreamEvent::Start { stream_sid } => {
                        match stream_sid {
                            Some(sid) => {
                                debug!(session_id = session.id, stream_sid = %sid, "stream started");
                                session.set_stream_sid(sid);
                            }
                            None => session.mark_streaming_ready(),
                        }
                    }
                    StreamEvent::Media { media } => {
                        if !media.is_caller_voice() {
                            continue;
                        }
                        match BASE64.decode(&media.payload) {
                            Ok(mulaw) => {
                                if let Some(stt) = session.stt() {
                                    stt.send_audio(mulaw);
                                }
                            }
                            Err(e) => {
                                debug!(session_id = session.id, "bad media payload: {e}");
                            }
                        }
                    }
                    StreamEvent::Stop {} => {
                        info!(session_id = session.id, "stream stopped by carrier");
                        session.mark_hung_up();
                        break;
                    }
                    StreamEvent::Mark {} | StreamEvent::Other => {}
                }
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if socket.send(message).await.is_err() {
                            warn!(session_id = session.id, "outbound write failed");
                            break;
                        }
                    }
                    // Cleanup dropped the sender: close our side.
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    // The carrier tearing the socket down mid-call means the call is over.
    session.mark_hung_up();
}
