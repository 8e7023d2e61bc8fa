//! Chat-session engine
//!
//! One chat may be active at a time. While no chat is active a background
//! task polls every two seconds and answers slash commands out-of-band;
//! the moment a chat starts (or `listen_for_commands` runs) that task is
//! aborted so exactly one consumer advances the update offset — two
//! concurrent polls would race and one of them would swallow the
//! operator's reply.
//!
//! The offset itself only ever ratchets forward: every observed update
//! contributes `max(offset, update_id + 1)`, so no transition between
//! consumers can rewind it and replay old messages.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::TelegramClient;
use crate::config::Config;
use crate::error::{CallError, CallResult};
use crate::session::{EndReply, ToolReply};

/// Cadence of the idle background poll
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Long-poll window handed to getUpdates while waiting for a reply
const LONG_POLL_SECS: u64 = 30;

/// Upper bound on listen_for_commands
const COMMAND_LISTEN_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

const HELP_TEXT: &str = "Commands:\n\
    /help - show this message\n\
    /verbose - toggle verbose replies";

/// Telegram-backed counterpart of the voice session engine
#[derive(Debug)]
pub struct ChatEngine {
    client: TelegramClient,
    chat_id: String,
    transcript_timeout: Duration,

    global_offset: AtomicI64,
    next_id: AtomicU64,
    /// Id of the active chat session, 0 when idle
    active_session: AtomicU64,
    verbose: AtomicBool,
    started_at: StdMutex<Option<Instant>>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

impl ChatEngine {
    pub fn new(config: Config) -> CallResult<Self> {
        let (Some(bot_token), Some(chat_id)) =
            (config.chat.bot_token.clone(), config.chat.chat_id.clone())
        else {
            return Err(CallError::Configuration {
                missing: vec![
                    "TELEGRAM_BOT_TOKEN".to_string(),
                    "TELEGRAM_CHAT_ID".to_string(),
                ],
            });
        };

        Ok(Self {
            client: TelegramClient::new(bot_token),
            chat_id,
            transcript_timeout: config.speech.transcript_timeout(),
            global_offset: AtomicI64::new(0),
            next_id: AtomicU64::new(1),
            active_session: AtomicU64::new(0),
            verbose: AtomicBool::new(false),
            started_at: StdMutex::new(None),
            poller: StdMutex::new(None),
        })
    }

    /// Spawn the idle poller. Called once at startup and again after each
    /// chat ends.
    pub fn start_background_poll(self: &Arc<Self>) {
        let mut slot = self.poller.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            info!("background command poll started");
            loop {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                let offset = engine.global_offset.load(Ordering::SeqCst);
                match engine.client.get_updates(offset, 0).await {
                    Ok(updates) => {
                        for update in updates {
                            engine.advance_offset(update.update_id);
                            if let Some(text) = update.message.and_then(|m| m.text) {
                                if text.starts_with('/') {
                                    engine.handle_command(&text).await;
                                }
                            }
                        }
                    }
                    Err(e) => debug!("background poll failed: {e}"),
                }
            }
        });
        *slot = Some(handle);
    }

    /// Abort the idle poller so the caller becomes the only update
    /// consumer.
    fn stop_background_poll(&self) {
        if let Some(handle) = self.poller.lock().unwrap().take() {
            handle.abort();
            debug!("background command poll stopped");
        }
    }

    /// Ratchet the offset; never regresses regardless of consumer order.
    fn advance_offset(&self, update_id: i64) {
        self.global_offset.fetch_max(update_id + 1, Ordering::SeqCst);
    }

    async fn handle_command(&self, command: &str) {
        match command.trim() {
            "/help" => {
                let _ = self.client.send_message(&self.chat_id, HELP_TEXT).await;
            }
            "/verbose" => {
                let now = !self.verbose.load(Ordering::SeqCst);
                self.verbose.store(now, Ordering::SeqCst);
                let state = if now { "on" } else { "off" };
                let _ = self
                    .client
                    .send_message(&self.chat_id, &format!("Verbose replies {state}."))
                    .await;
            }
            other => {
                if self.verbose.load(Ordering::SeqCst) {
                    let _ = self
                        .client
                        .send_message(&self.chat_id, &format!("Unknown command: {other}"))
                        .await;
                } else {
                    debug!("ignoring unknown command {other}");
                }
            }
        }
    }

    /// Start a chat session: send the opening message, wait for the reply.
    pub async fn initiate(self: &Arc<Self>, text: &str) -> CallResult<ToolReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self
            .active_session
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CallError::provider("telegram", "a chat is already active"));
        }

        self.stop_background_poll();
        *self.started_at.lock().unwrap() = Some(Instant::now());
        info!(session_id = id, "chat session started");

        match self.send_and_wait(text).await {
            Ok(transcript) => Ok(ToolReply {
                session_id: id,
                transcript,
                machine_detection: None,
            }),
            Err(e) => {
                // A reply timeout leaves the chat open, like a call.
                if !matches!(e, CallError::TranscriptTimeout(_)) {
                    self.finish_session();
                    self.start_background_poll();
                }
                Err(e)
            }
        }
    }

    /// Send another message on the active chat and wait for the reply.
    pub async fn continue_chat(self: &Arc<Self>, session_id: u64, text: &str) -> CallResult<ToolReply> {
        self.check_active(session_id)?;
        let transcript = self.send_and_wait(text).await?;
        Ok(ToolReply {
            session_id,
            transcript,
            machine_detection: None,
        })
    }

    /// Send without waiting.
    pub async fn send_only(self: &Arc<Self>, session_id: u64, text: &str) -> CallResult<ToolReply> {
        self.check_active(session_id)?;
        self.client.send_message(&self.chat_id, text).await?;
        Ok(ToolReply {
            session_id,
            transcript: String::new(),
            machine_detection: None,
        })
    }

    /// Close the active chat and restart the idle poller.
    pub async fn end_chat(self: &Arc<Self>, session_id: u64, text: &str) -> CallResult<EndReply> {
        self.check_active(session_id)?;

        if !text.is_empty() {
            if let Err(e) = self.client.send_message(&self.chat_id, text).await {
                warn!(session_id, "goodbye message failed: {e}");
            }
        }

        let duration_secs = self
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.finish_session();
        self.start_background_poll();
        info!(session_id, duration_secs, "chat session ended");

        Ok(EndReply { session_id, duration_secs })
    }

    /// Wait (up to 24 h) for the operator's next message or command.
    ///
    /// Takes over update consumption for its whole duration; the idle
    /// poller is restarted afterwards unless a chat became active.
    pub async fn listen_for_commands(self: &Arc<Self>) -> CallResult<String> {
        self.stop_background_poll();

        let result = tokio::time::timeout(COMMAND_LISTEN_LIMIT, self.next_message())
            .await
            .map_err(|_| CallError::TranscriptTimeout(COMMAND_LISTEN_LIMIT.as_secs()))?;

        if self.active_session.load(Ordering::SeqCst) == 0 {
            self.start_background_poll();
        }
        result
    }

    fn check_active(&self, session_id: u64) -> CallResult<()> {
        if self.active_session.load(Ordering::SeqCst) == session_id && session_id != 0 {
            Ok(())
        } else {
            Err(CallError::NoSuchSession(session_id))
        }
    }

    fn finish_session(&self) {
        self.active_session.store(0, Ordering::SeqCst);
        *self.started_at.lock().unwrap() = None;
    }

    async fn send_and_wait(&self, text: &str) -> CallResult<String> {
        self.client.send_message(&self.chat_id, text).await?;

        tokio::time::timeout(self.transcript_timeout, self.next_message())
            .await
            .map_err(|_| CallError::TranscriptTimeout(self.transcript_timeout.as_secs()))?
    }

    /// Consume updates until a non-command message from the operator's
    /// chat arrives. Commands are answered inline without ending the wait.
    async fn next_message(&self) -> CallResult<String> {
        loop {
            let offset = self.global_offset.load(Ordering::SeqCst);
            let updates = self.client.get_updates(offset, LONG_POLL_SECS).await?;

            for update in updates {
                self.advance_offset(update.update_id);
                let Some(message) = update.message else { continue };
                if message.chat.id.to_string() != self.chat_id {
                    continue;
                }
                let Some(text) = message.text else { continue };

                if text.starts_with('/') {
                    self.handle_command(&text).await;
                    continue;
                }
                return Ok(text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatConfig, PhoneConfig, PhoneProvider, ServerConfig, SpeechConfig};

    fn chat_config(with_chat: bool) -> Config {
        Config {
            phone: PhoneConfig {
                provider: PhoneProvider::Twilio,
                account_id: "AC123".to_string(),
                secret: "token".to_string(),
                from_number: "+15550001111".to_string(),
                to_number: "+15550002222".to_string(),
                telnyx_public_key: None,
            },
            speech: SpeechConfig {
                tts_api_key: "tts".to_string(),
                tts_voice: "alloy".to_string(),
                stt_api_key: "stt".to_string(),
                stt_model: "nova-2-phonecall".to_string(),
                utterance_silence_ms: 800,
                transcript_timeout_secs: 180,
            },
            server: ServerConfig {
                port: 0,
                public_url: "https://example.test".to_string(),
                tunnel_provider: None,
                tunnel_token: None,
                allow_unsigned: true,
            },
            chat: ChatConfig {
                bot_token: with_chat.then(|| "123:abc".to_string()),
                chat_id: with_chat.then(|| "42".to_string()),
            },
        }
    }

    #[test]
    fn test_new_requires_chat_config() {
        let err = ChatEngine::new(chat_config(false)).unwrap_err();
        let CallError::Configuration { missing } = err else {
            panic!("expected configuration error");
        };
        assert!(missing.contains(&"TELEGRAM_BOT_TOKEN".to_string()));
        assert!(missing.contains(&"TELEGRAM_CHAT_ID".to_string()));
    }

    #[test]
    fn test_offset_never_regresses() {
        let engine = ChatEngine::new(chat_config(true)).unwrap();
        engine.advance_offset(10);
        assert_eq!(engine.global_offset.load(Ordering::SeqCst), 11);

        // An older update observed late must not rewind the offset
        engine.advance_offset(5);
        assert_eq!(engine.global_offset.load(Ordering::SeqCst), 11);

        engine.advance_offset(20);
        assert_eq!(engine.global_offset.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_check_active_rejects_wrong_session() {
        let engine = ChatEngine::new(chat_config(true)).unwrap();
        assert!(matches!(
            engine.check_active(1),
            Err(CallError::NoSuchSession(1))
        ));

        engine.active_session.store(3, Ordering::SeqCst);
        assert!(engine.check_active(3).is_ok());
        assert!(matches!(
            engine.check_active(4),
            Err(CallError::NoSuchSession(4))
        ));
    }

    #[test]
    fn test_session_zero_is_never_active() {
        let engine = ChatEngine::new(chat_config(true)).unwrap();
        assert!(matches!(
            engine.check_active(0),
            Err(CallError::NoSuchSession(0))
        ));
    }

    #[tokio::test]
    async fn test_stop_background_poll_is_idempotent() {
        let engine = Arc::new(ChatEngine::new(chat_config(true)).unwrap());
        engine.start_background_poll();
        assert!(engine.poller.lock().unwrap().is_some());

        engine.stop_background_poll();
        assert!(engine.poller.lock().unwrap().is_none());
        engine.stop_background_poll();
    }

    #[tokio::test]
    async fn test_start_background_poll_does_not_double_spawn() {
        let engine = Arc::new(ChatEngine::new(chat_config(true)).unwrap());
        engine.start_background_poll();
        let first = engine.poller.lock().unwrap().as_ref().map(|h| h.id());
        engine.start_background_poll();
        let second = engine.poller.lock().unwrap().as_ref().map(|h| h.id());
        assert_eq!(first, second);
        engine.stop_background_poll();
    }
}
