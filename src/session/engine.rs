//! The per-call state machine
//!
//! One engine per process owns the registry and coordinates every call:
//! placing it, racing transcript arrival against hangup, pacing outbound
//! audio, and tearing everything down on any exit path. Tool operations
//! never throw past cleanup: hangups and connection timeouts end the call,
//! transcript timeouts end only the turn.

use futures_util::TryStreamExt;
use rand::RngCore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Session, SessionRegistry, Speaker};
use crate::audio::{downsample_24k_to_8k, pcm_to_mulaw, FramePacer, FRAME_BYTES, FRAME_INTERVAL_MS};
use crate::carrier::{create_adapter, CallEvent, CarrierAdapter};
use crate::config::Config;
use crate::error::{CallError, CallResult};
use crate::stt::SttSession;
use crate::tts::TtsClient;

/// How long the media WebSocket may take to connect and declare readiness
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Cadence of the readiness poll and the hangup watcher
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period letting the last frame play out after an utterance
const POST_AUDIO_DRAIN: Duration = Duration::from_millis(200);

/// Grace period before hanging up, so the goodbye is heard
const HANGUP_DRAIN: Duration = Duration::from_secs(2);

/// Result of a speaking-and-listening tool operation
#[derive(Debug, Clone, Serialize)]
pub struct ToolReply {
    pub session_id: u64,
    pub transcript: String,
    /// Answering-machine detection verdict, when the carrier reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_detection: Option<String>,
}

/// Result of `end_call`
#[derive(Debug, Clone, Serialize)]
pub struct EndReply {
    pub session_id: u64,
    pub duration_secs: f64,
}

/// The call-session engine
pub struct SessionEngine {
    config: Config,
    carrier: Arc<dyn CarrierAdapter>,
    tts: TtsClient,
    registry: SessionRegistry,
    next_id: AtomicU64,
}

impl SessionEngine {
    pub fn new(config: Config) -> Self {
        let carrier = create_adapter(&config.phone);
        Self::with_carrier(config, carrier)
    }

    /// Build the engine around a specific adapter instead of the one the
    /// configuration selects.
    pub fn with_carrier(config: Config, carrier: Arc<dyn CarrierAdapter>) -> Self {
        let tts = TtsClient::new(&config.speech);
        Self {
            config,
            carrier,
            tts,
            registry: SessionRegistry::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn carrier(&self) -> &Arc<dyn CarrierAdapter> {
        &self.carrier
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Place a call, speak the opening line, and wait for the reply.
    ///
    /// The opening line is synthesized while the carrier is still setting
    /// the call up, so speech starts the moment the stream is ready.
    pub async fn initiate(&self, text: &str) -> CallResult<ToolReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(
            id,
            generate_token(),
            self.config.phone.to_number.clone(),
            self.config.phone.from_number.clone(),
        ));
        self.registry.insert(session.clone()).await;
        info!(session_id = id, to = %session.to_number, "initiating call");

        match self.initiate_inner(&session, text).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A transcript timeout ends the turn, not the call.
                if !matches!(e, CallError::TranscriptTimeout(_)) {
                    self.cleanup(id).await;
                }
                Err(e)
            }
        }
    }

    async fn initiate_inner(&self, session: &Arc<Session>, text: &str) -> CallResult<ToolReply> {
        let stt = Arc::new(SttSession::connect(&self.config.speech).await?);
        session.set_stt(stt);

        // Pre-generate the opening utterance in parallel with call setup;
        // losing this overlap costs ~1.5 s of dead air on answer.
        let tts = self.tts.clone();
        let opening = text.to_string();
        let pregen = tokio::spawn(async move {
            let pcm = tts.synthesize(&opening).await?;
            Ok::<Vec<u8>, CallError>(pcm_to_mulaw(&downsample_24k_to_8k(&pcm)))
        });

        let handle = self
            .carrier
            .place_call(
                &session.to_number,
                &session.from_number,
                &self.config.webhook_url(),
            )
            .await?;
        session.set_carrier_handle(handle.clone());
        self.registry.index_handle(&handle, session.id).await;

        self.wait_for_stream(session).await?;

        let mulaw = pregen
            .await
            .map_err(|e| CallError::provider("tts", format!("pre-generation task died: {e}")))??;
        self.speak_mulaw(session, &mulaw).await;
        session.push_history(Speaker::Assistant, text);

        let transcript = self.listen(session).await?;
        session.push_history(Speaker::User, &transcript);

        Ok(ToolReply {
            session_id: session.id,
            transcript,
            machine_detection: session.machine_result(),
        })
    }

    /// Speak another utterance on a live call and wait for the reply.
    pub async fn continue_call(&self, session_id: u64, text: &str) -> CallResult<ToolReply> {
        let session = self.get_live(session_id).await?;

        let result = async {
            self.speak_streaming(&session, text).await?;
            session.push_history(Speaker::Assistant, text);
            let transcript = self.listen(&session).await?;
            session.push_history(Speaker::User, &transcript);
            Ok(ToolReply {
                session_id,
                transcript,
                machine_detection: None,
            })
        }
        .await;

        self.cleanup_if_call_over(session_id, &result).await;
        result
    }

    /// Speak without waiting for a reply.
    pub async fn speak_only(&self, session_id: u64, text: &str) -> CallResult<ToolReply> {
        let session = self.get_live(session_id).await?;

        let result = async {
            self.speak_streaming(&session, text).await?;
            session.push_history(Speaker::Assistant, text);
            Ok(ToolReply {
                session_id,
                transcript: String::new(),
                machine_detection: None,
            })
        }
        .await;

        self.cleanup_if_call_over(session_id, &result).await;
        result
    }

    /// Speak a goodbye, let it drain, hang up, and tear the session down.
    pub async fn end_call(&self, session_id: u64, text: &str) -> CallResult<EndReply> {
        let session = self.get_live(session_id).await?;

        if !text.is_empty() && !session.is_hung_up() {
            if let Err(e) = self.speak_streaming(&session, text).await {
                warn!(session_id, "goodbye synthesis failed: {e}");
            } else {
                session.push_history(Speaker::Assistant, text);
                tokio::time::sleep(HANGUP_DRAIN).await;
            }
        }

        if let Some(handle) = session.carrier_handle() {
            self.carrier.hangup(&handle).await;
        }
        session.mark_hung_up();
        let duration_secs = session.elapsed_secs();
        self.cleanup(session_id).await;
        info!(session_id, duration_secs, "call ended");

        Ok(EndReply { session_id, duration_secs })
    }

    /// Route a normalized carrier event to its session.
    pub async fn handle_event(&self, event: CallEvent) {
        match event {
            CallEvent::Answered { handle } => {
                let Some(session) = self.registry.get_by_handle(&handle).await else {
                    return;
                };
                debug!(session_id = session.id, "call answered");
                // Variant-B carriers start the stream through the API.
                let ws_url = self.config.media_stream_url(&session.token);
                if let Err(e) = self.carrier.start_stream(&handle, &ws_url).await {
                    warn!(session_id = session.id, "start_stream failed: {e}");
                }
            }
            CallEvent::StreamingReady { handle } => {
                if let Some(session) = self.registry.get_by_handle(&handle).await {
                    session.mark_streaming_ready();
                }
            }
            CallEvent::HungUp { handle } => {
                if let Some(session) = self.registry.get_by_handle(&handle).await {
                    info!(session_id = session.id, "carrier reported hangup");
                    session.mark_hung_up();
                }
            }
            CallEvent::MachineDetection { handle, result } => {
                if let Some(session) = self.registry.get_by_handle(&handle).await {
                    debug!(session_id = session.id, result = %result, "machine detection");
                    session.set_machine_result(result);
                }
            }
            CallEvent::Irrelevant => {}
        }
    }

    /// Tear down a session: make it unreachable first, then release what
    /// it owns. Running it twice is harmless.
    pub async fn cleanup(&self, session_id: u64) {
        if let Some(session) = self.registry.remove(session_id).await {
            session.release();
            debug!(session_id, "session cleaned up");
        }
    }

    async fn get_live(&self, session_id: u64) -> CallResult<Arc<Session>> {
        self.registry
            .get(session_id)
            .await
            .ok_or(CallError::NoSuchSession(session_id))
    }

    async fn cleanup_if_call_over<T>(&self, session_id: u64, result: &CallResult<T>) {
        if let Err(e) = result {
            if e.is_fatal_to_call() {
                self.cleanup(session_id).await;
            }
        }
    }

    /// Poll until the media socket is bound and streaming is declared
    /// ready, or fail the attempt after the connection window.
    async fn wait_for_stream(&self, session: &Session) -> CallResult<()> {
        let poll = async {
            loop {
                if session.is_hung_up() {
                    return Err(CallError::HungUp);
                }
                if session.is_ready() {
                    return Ok(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(CONNECT_TIMEOUT, poll)
            .await
            .unwrap_or(Err(CallError::ConnectionTimeout(CONNECT_TIMEOUT.as_secs())))
    }

    /// The transcript-versus-hangup race.
    ///
    /// Whichever side loses is a future dropped on scope exit, so the
    /// watcher's timer can never leak past this call. A hangup that lands
    /// while the transcript is in flight still wins.
    async fn listen(&self, session: &Session) -> CallResult<String> {
        if session.is_hung_up() {
            return Err(CallError::HungUp);
        }
        let stt = session
            .stt()
            .ok_or_else(|| CallError::provider("stt", "session has no recognizer"))?;
        let timeout = self.config.speech.transcript_timeout();

        tokio::select! {
            transcript = stt.wait_for_transcript(timeout) => {
                if session.is_hung_up() {
                    Err(CallError::HungUp)
                } else {
                    transcript
                }
            }
            _ = wait_for_hangup(session) => Err(CallError::HungUp),
        }
    }

    /// Send pre-generated mu-law at wire cadence, then let it drain.
    async fn speak_mulaw(&self, session: &Session, mulaw: &[u8]) {
        let mut interval = tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for frame in mulaw.chunks(FRAME_BYTES) {
            interval.tick().await;
            session.send_frame(frame).await;
        }
        tokio::time::sleep(POST_AUDIO_DRAIN).await;
    }

    /// Stream synthesis through the jitter-buffered pacer.
    ///
    /// The 20 ms tick keeps running while chunks arrive; frames only flow
    /// once the pacer's 100 ms pre-roll has filled, and the tail is flushed
    /// at the same cadence when the stream ends.
    async fn speak_streaming(&self, session: &Session, text: &str) -> CallResult<()> {
        let mut stream = self.tts.synthesize_stream(text).await?;
        let mut pacer = FramePacer::new();
        let mut interval = tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = stream.try_next() => match chunk? {
                    Some(bytes) => pacer.push_pcm(&bytes),
                    None => break,
                },
                _ = interval.tick() => {
                    if let Some(frame) = pacer.next_frame() {
                        session.send_frame(&frame).await;
                    }
                }
            }
        }

        for frame in pacer.finish() {
            interval.tick().await;
            session.send_frame(&frame).await;
        }
        tokio::time::sleep(POST_AUDIO_DRAIN).await;
        Ok(())
    }
}

/// Resolve once the session's hangup flag goes up. Always raced against
/// the transcript wait, never awaited alone.
async fn wait_for_hangup(session: &Session) {
    loop {
        if session.is_hung_up() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// 32 random bytes, URL-safe base64: the media-stream auth token.
fn generate_token() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
