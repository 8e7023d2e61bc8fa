//! Streaming speech-to-text session
//!
//! One [`SttSession`] per phone call, speaking the Deepgram live protocol:
//! a WebSocket carrying binary mu-law audio upstream and JSON results
//! downstream. The recognizer finalizes an utterance after the configured
//! end-of-utterance silence (`endpointing`); interim finals are accumulated
//! until the `speech_final` marker and then surfaced as one transcript.
//!
//! The writer never blocks the audio path (unbounded channel) and the
//! reader keeps the connection alive with periodic keepalives, since the
//! service drops sockets that stay silent for more than ten seconds.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::SpeechConfig;
use crate::error::{CallError, CallResult};

const STT_WS_BASE: &str = "wss://api.deepgram.com/v1/listen";

/// How often the writer nudges an otherwise-idle connection
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// One finalized recognizer result
#[derive(Debug, Deserialize)]
struct RecognizerResult {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    #[serde(default)]
    channel: Channel,
}

#[derive(Debug, Default, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// A live streaming-recognizer connection
pub struct SttSession {
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    transcript_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl SttSession {
    /// Open an authenticated streaming connection.
    pub async fn connect(speech: &SpeechConfig) -> CallResult<Self> {
        let ws_url = format!(
            "{STT_WS_BASE}?model={}&encoding=mulaw&sample_rate=8000&channels=1\
             &interim_results=true&endpointing={}",
            speech.stt_model, speech.utterance_silence_ms
        );

        let mut request = ws_url
            .into_client_request()
            .map_err(|e| CallError::provider("stt", format!("bad request: {e}")))?;
        request.headers_mut().insert(
            "authorization",
            format!("Token {}", speech.stt_api_key)
                .parse()
                .map_err(|_| CallError::provider("stt", "api key is not header-safe"))?,
        );

        debug!(model = %speech.stt_model, "connecting recognizer");
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| CallError::provider("stt", format!("connect failed: {e}")))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel::<String>();

        // Writer: audio frames out, keepalives while idle, CloseStream at
        // end. Exits on its own when the audio channel closes, so the
        // handle is not retained.
        tokio::spawn(async move {
            loop {
                let next = tokio::time::timeout(KEEPALIVE_INTERVAL, audio_rx.recv()).await;
                match next {
                    // An empty frame is the close sentinel from `close()`
                    Ok(Some(frame)) if frame.is_empty() => {
                        let _ = ws_sender
                            .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                            .await;
                        let _ = ws_sender.close().await;
                        break;
                    }
                    Ok(Some(frame)) => {
                        if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = ws_sender
                            .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                            .await;
                        let _ = ws_sender.close().await;
                        break;
                    }
                    Err(_) => {
                        if ws_sender
                            .send(Message::Text(r#"{"type":"KeepAlive"}"#.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: accumulate finals until speech_final, emit one utterance.
        let reader = tokio::spawn(async move {
            let mut pending_finals: Vec<String> = Vec::new();

            while let Some(message) = ws_receiver.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("recognizer socket error: {e}");
                        break;
                    }
                };

                let result: RecognizerResult = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("unrecognized recognizer message: {e}");
                        continue;
                    }
                };

                if !result.is_final {
                    continue;
                }

                let segment = result
                    .channel
                    .alternatives
                    .first()
                    .map(|a| a.transcript.trim().to_string())
                    .unwrap_or_default();
                if !segment.is_empty() {
                    pending_finals.push(segment);
                }

                if result.speech_final && !pending_finals.is_empty() {
                    let utterance = pending_finals.join(" ");
                    pending_finals.clear();
                    if transcript_tx.send(utterance).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            audio_tx,
            transcript_rx: Mutex::new(transcript_rx),
            reader,
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a mu-law audio frame. Never blocks; empty frames and frames
    /// sent after close are silently dropped.
    pub fn send_audio(&self, frame: Vec<u8>) {
        if frame.is_empty() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.audio_tx.send(frame);
    }

    /// Wait for the next finalized utterance.
    ///
    /// Repeatable across turns of the same call. Fails with
    /// `TranscriptTimeout` when the recognizer stays silent past `timeout`.
    pub async fn wait_for_transcript(&self, timeout: Duration) -> CallResult<String> {
        let mut rx = self.transcript_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err(CallError::provider("stt", "recognizer stream ended")),
            Err(_) => Err(CallError::TranscriptTimeout(timeout.as_secs())),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The sentinel makes the writer send CloseStream and shut the sink;
        // the reader is aborted in case the server never closes its side.
        let _ = self.audio_tx.send(Vec::new());
        self.reader.abort();
        debug!("recognizer session closed");
    }
}

impl Drop for SttSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_parsing_speech_final() {
        let raw = r#"{
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{"transcript": "hi there"}]}
        }"#;
        let result: RecognizerResult = serde_json::from_str(raw).unwrap();
        assert!(result.is_final);
        assert!(result.speech_final);
        assert_eq!(result.channel.alternatives[0].transcript, "hi there");
    }

    #[test]
    fn test_result_parsing_defaults() {
        let result: RecognizerResult = serde_json::from_str("{}").unwrap();
        assert!(!result.is_final);
        assert!(!result.speech_final);
        assert!(result.channel.alternatives.is_empty());
    }

    #[test]
    fn test_metadata_messages_are_ignorable() {
        // Metadata frames carry no channel; they parse with defaults and
        // fall out of the accumulation path.
        let raw = r#"{"type":"Metadata","request_id":"abc"}"#;
        let result: RecognizerResult = serde_json::from_str(raw).unwrap();
        assert!(!result.is_final);
    }
}
