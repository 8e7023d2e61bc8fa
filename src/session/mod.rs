//! Call sessions and the live-session registry
//!
//! A [`Session`] is one active phone call: identifiers, readiness latches,
//! conversation history, and the owned speech/socket resources. The
//! [`SessionRegistry`] is the single live-session map plus the carrier
//! handle index, mutated under one lock so the index can never outlive its
//! session. Media-stream tokens are deliberately not hash-indexed: token
//! resolution walks the live sessions with a constant-time comparison per
//! candidate, so an attacker probing the upgrade endpoint learns nothing
//! about how much of a token prefix matched.

pub mod engine;

use axum::extract::ws::Message as WsMessage;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::stt::SttSession;

pub use engine::{EndReply, SessionEngine, ToolReply};

/// Who said an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Assistant,
    User,
}

/// One live phone call
pub struct Session {
    pub id: u64,
    /// Binds the inbound media WebSocket to this session
    pub token: String,
    pub to_number: String,
    pub from_number: String,
    started_at: Instant,

    carrier_handle: StdMutex<Option<String>>,
    /// Carrier-assigned media-stream sub-identifier (from the `start` frame)
    stream_sid: StdMutex<Option<String>>,
    streaming_ready: AtomicBool,
    hung_up: AtomicBool,
    machine_result: StdMutex<Option<String>>,

    history: StdMutex<Vec<(Speaker, String)>>,
    stt: StdMutex<Option<Arc<SttSession>>>,
    outbound: StdMutex<Option<mpsc::Sender<WsMessage>>>,
}

impl Session {
    pub fn new(id: u64, token: String, to_number: String, from_number: String) -> Self {
        Self {
            id,
            token,
            to_number,
            from_number,
            started_at: Instant::now(),
            carrier_handle: StdMutex::new(None),
            stream_sid: StdMutex::new(None),
            streaming_ready: AtomicBool::new(false),
            hung_up: AtomicBool::new(false),
            machine_result: StdMutex::new(None),
            history: StdMutex::new(Vec::new()),
            stt: StdMutex::new(None),
            outbound: StdMutex::new(None),
        }
    }

    pub fn set_carrier_handle(&self, handle: String) {
        *self.carrier_handle.lock().unwrap() = Some(handle);
    }

    pub fn carrier_handle(&self) -> Option<String> {
        self.carrier_handle.lock().unwrap().clone()
    }

    /// Record the sub-identifier from the WebSocket `start` frame. The
    /// frame also means the carrier considers the stream live.
    pub fn set_stream_sid(&self, sid: String) {
        *self.stream_sid.lock().unwrap() = Some(sid);
        self.streaming_ready.store(true, Ordering::SeqCst);
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.stream_sid.lock().unwrap().clone()
    }

    /// The other readiness path: a carrier control webhook.
    pub fn mark_streaming_ready(&self) {
        self.streaming_ready.store(true, Ordering::SeqCst);
    }

    pub fn mark_hung_up(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
    }

    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }

    pub fn set_machine_result(&self, result: String) {
        *self.machine_result.lock().unwrap() = Some(result);
    }

    pub fn machine_result(&self) -> Option<String> {
        self.machine_result.lock().unwrap().clone()
    }

    pub fn set_stt(&self, stt: Arc<SttSession>) {
        *self.stt.lock().unwrap() = Some(stt);
    }

    pub fn stt(&self) -> Option<Arc<SttSession>> {
        self.stt.lock().unwrap().clone()
    }

    /// Persist the bound media WebSocket's outbound channel.
    pub fn set_outbound(&self, tx: mpsc::Sender<WsMessage>) {
        *self.outbound.lock().unwrap() = Some(tx);
    }

    fn outbound_sender(&self) -> Option<mpsc::Sender<WsMessage>> {
        self.outbound.lock().unwrap().clone()
    }

    /// Ready for outbound audio: socket bound and the stream declared live.
    pub fn is_ready(&self) -> bool {
        self.outbound.lock().unwrap().is_some() && self.streaming_ready.load(Ordering::SeqCst)
    }

    pub fn push_history(&self, speaker: Speaker, text: &str) {
        self.history.lock().unwrap().push((speaker, text.to_string()));
    }

    pub fn history(&self) -> Vec<(Speaker, String)> {
        self.history.lock().unwrap().clone()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Send one mu-law frame to the carrier as a media message.
    ///
    /// Dropped silently unless the stream is ready and the socket is still
    /// open; the sub-identifier is included whenever the session holds one.
    pub async fn send_frame(&self, mulaw: &[u8]) {
        if !self.is_ready() {
            return;
        }
        let Some(tx) = self.outbound_sender() else {
            return;
        };

        let payload = BASE64.encode(mulaw);
        let message = match self.stream_sid() {
            Some(sid) => json!({
                "event": "media",
                "streamSid": sid,
                "media": { "payload": payload },
            }),
            None => json!({
                "event": "media",
                "media": { "payload": payload },
            }),
        };

        // A closed channel means the socket is gone; the frame is discarded.
        let _ = tx.send(WsMessage::Text(message.to_string().into())).await;
    }

    /// Release owned resources. Safe to call more than once.
    pub fn release(&self) {
        if let Some(stt) = self.stt.lock().unwrap().take() {
            stt.close();
        }
        // Dropping the sender closes the media socket task's queue, which
        // shuts the WebSocket down.
        self.outbound.lock().unwrap().take();
        debug!(session_id = self.id, "session resources released");
    }
}

/// The live-session map and its lookup paths
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<u64, Arc<Session>>,
    by_handle: HashMap<String, u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.id, session);
    }

    /// Index the carrier handle once the carrier has assigned one.
    pub async fn index_handle(&self, handle: &str, session_id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&session_id) {
            inner.by_handle.insert(handle.to_string(), session_id);
        }
    }

    pub async fn get(&self, session_id: u64) -> Option<Arc<Session>> {
        self.inner.lock().await.sessions.get(&session_id).cloned()
    }

    /// Resolve a media-stream token to its session.
    ///
    /// Every live session's token is compared in constant time, and the
    /// scan never exits early, so response timing reveals neither a
    /// partial token match nor which candidate matched. Live-session
    /// counts are small; the linear walk is irrelevant next to the
    /// WebSocket upgrade it gates.
    pub async fn get_by_token(&self, token: &str) -> Option<Arc<Session>> {
        let inner = self.inner.lock().await;
        let mut found: Option<Arc<Session>> = None;
        for session in inner.sessions.values() {
            let matches: bool = token.as_bytes().ct_eq(session.token.as_bytes()).into();
            if matches && found.is_none() {
                found = Some(session.clone());
            }
        }
        found
    }

    pub async fn get_by_handle(&self, handle: &str) -> Option<Arc<Session>> {
        let inner = self.inner.lock().await;
        let id = inner.by_handle.get(handle)?;
        inner.sessions.get(id).cloned()
    }

    /// Remove the session and any index entry pointing at it.
    ///
    /// Returns the session so the caller can release its resources after
    /// it is no longer reachable. Idempotent: a second call returns None.
    pub async fn remove(&self, session_id: u64) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.remove(&session_id)?;
        if let Some(handle) = session.carrier_handle() {
            inner.by_handle.remove(&handle);
        }
        Some(session)
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}
