//! Text-to-speech client
//!
//! Thin REST client for an OpenAI-compatible speech endpoint returning raw
//! 24 kHz 16-bit little-endian mono PCM. Two shapes: `synthesize` buffers
//! the whole utterance (used for the pre-generated opening line), while
//! `synthesize_stream` yields chunks as they arrive so the first frame can
//! hit the wire before synthesis finishes.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use serde_json::json;
use tracing::debug;

use crate::config::SpeechConfig;
use crate::error::{CallError, CallResult};

/// Incremental synthesis output
pub type PcmStream = BoxStream<'static, CallResult<Bytes>>;

const TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Sample rate of the PCM the service returns
pub const TTS_SAMPLE_RATE: u32 = 24_000;

const TTS_MODEL: &str = "gpt-4o-mini-tts";

/// Speech synthesis client
#[derive(Clone)]
pub struct TtsClient {
    api_key: String,
    voice: String,
    http_client: reqwest::Client,
    url: String,
}

impl TtsClient {
    pub fn new(speech: &SpeechConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("failed to build HTTP client");

        Self {
            api_key: speech.tts_api_key.clone(),
            voice: speech.tts_voice.clone(),
            http_client,
            url: TTS_URL.to_string(),
        }
    }

    async fn request(&self, text: &str) -> CallResult<reqwest::Response> {
        let body = json!({
            "model": TTS_MODEL,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        });

        let response = self
            .http_client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::provider("tts", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::provider(
                "tts",
                format!("synthesis returned {status}: {text}"),
            ));
        }
        Ok(response)
    }

    /// Synthesize the whole utterance as 24 kHz 16-bit LE PCM.
    pub async fn synthesize(&self, text: &str) -> CallResult<Vec<u8>> {
        let response = self.request(text).await?;
        let audio = response
            .bytes()
            .await
            .map_err(|e| CallError::provider("tts", e.to_string()))?;

        debug!(chars = text.len(), pcm_bytes = audio.len(), "synthesized");
        Ok(audio.to_vec())
    }

    /// Synthesize incrementally; yields PCM chunks of the same stream.
    pub async fn synthesize_stream(&self, text: &str) -> CallResult<PcmStream> {
        let response = self.request(text).await?;
        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| CallError::provider("tts", e.to_string())),
        ))
    }
}
