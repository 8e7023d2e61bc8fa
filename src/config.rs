//! Configuration management
//!
//! All settings come from environment variables, parsed exactly once at
//! startup. Required variables that are absent are collected and reported
//! together in a single fatal error rather than one at a time.

use serde::Serialize;
use std::time::Duration;

use crate::error::CallError;

/// Which telephony carrier the process talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhoneProvider {
    Twilio,
    Telnyx,
}

impl PhoneProvider {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "twilio" => Some(PhoneProvider::Twilio),
            "telnyx" => Some(PhoneProvider::Telnyx),
            _ => None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub phone: PhoneConfig,
    pub speech: SpeechConfig,
    pub server: ServerConfig,
    pub chat: ChatConfig,
}

/// Carrier settings
#[derive(Debug, Clone, Serialize)]
pub struct PhoneConfig {
    pub provider: PhoneProvider,
    /// Twilio account SID or Telnyx connection id
    pub account_id: String,
    /// Twilio auth token or Telnyx API key
    #[serde(skip)]
    pub secret: String,
    pub from_number: String,
    pub to_number: String,
    /// Ed25519 webhook verification key, Telnyx only
    pub telnyx_public_key: Option<String>,
}

/// Speech service settings
#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    #[serde(skip)]
    pub tts_api_key: String,
    pub tts_voice: String,
    #[serde(skip)]
    pub stt_api_key: String,
    pub stt_model: String,
    /// Silence the recognizer treats as end-of-utterance
    pub utterance_silence_ms: u64,
    /// How long a single listen() waits for a finalized transcript
    pub transcript_timeout_secs: u64,
}

impl SpeechConfig {
    pub fn transcript_timeout(&self) -> Duration {
        Duration::from_secs(self.transcript_timeout_secs)
    }
}

/// HTTP listener and tunnel settings
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Public base URL the carrier reaches us at (established by the tunnel)
    pub public_url: String,
    /// Tunnel provider name; the tunnel itself runs outside this process
    pub tunnel_provider: Option<String>,
    #[serde(skip)]
    pub tunnel_token: Option<String>,
    /// Development escape hatch: accept unsigned control webhooks
    pub allow_unsigned: bool,
}

/// Text-chat variant settings
#[derive(Debug, Clone, Serialize)]
pub struct ChatConfig {
    #[serde(skip)]
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

impl ChatConfig {
    /// Chat mode needs both the token and the target chat
    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

/// Collects required variables, remembering which were absent
struct EnvReader {
    missing: Vec<String>,
}

impl EnvReader {
    fn new() -> Self {
        Self { missing: Vec::new() }
    }

    fn required(&mut self, name: &str) -> String {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            _ => {
                self.missing.push(name.to_string());
                String::new()
            }
        }
    }

    fn optional(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    fn optional_parsed<T: std::str::FromStr>(&mut self, name: &str, default: T) -> T {
        match std::env::var(name) {
            Ok(v) if !v.is_empty() => match v.parse() {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.missing.push(format!("{name} (unparseable)"));
                    default
                }
            },
            _ => default,
        }
    }

    fn flag(&self, name: &str) -> bool {
        matches!(
            std::env::var(name).as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        )
    }
}

impl Config {
    /// Parse the full configuration from the environment.
    ///
    /// Returns `CallError::Configuration` naming every missing value.
    pub fn from_env() -> Result<Self, CallError> {
        let mut env = EnvReader::new();

        let provider_raw = env.required("PHONE_PROVIDER");
        let provider = PhoneProvider::parse(&provider_raw);
        if !provider_raw.is_empty() && provider.is_none() {
            env.missing
                .push("PHONE_PROVIDER (expected 'twilio' or 'telnyx')".to_string());
        }
        let provider = provider.unwrap_or(PhoneProvider::Twilio);

        let phone = PhoneConfig {
            provider,
            account_id: env.required("PHONE_ACCOUNT_ID"),
            secret: env.required("PHONE_SECRET"),
            from_number: env.required("PHONE_FROM_NUMBER"),
            to_number: env.required("PHONE_TO_NUMBER"),
            telnyx_public_key: env.optional("TELNYX_PUBLIC_KEY"),
        };

        // Telnyx signs webhooks with its own key, so the key is required
        // whenever that provider is selected.
        if provider == PhoneProvider::Telnyx && phone.telnyx_public_key.is_none() {
            env.missing.push("TELNYX_PUBLIC_KEY".to_string());
        }

        let speech = SpeechConfig {
            tts_api_key: env.required("TTS_API_KEY"),
            tts_voice: env
                .optional("TTS_VOICE")
                .unwrap_or_else(|| "alloy".to_string()),
            stt_api_key: env.required("STT_API_KEY"),
            stt_model: env
                .optional("STT_MODEL")
                .unwrap_or_else(|| "nova-2-phonecall".to_string()),
            utterance_silence_ms: env.optional_parsed("UTTERANCE_SILENCE_MS", 800),
            transcript_timeout_secs: env.optional_parsed("TRANSCRIPT_TIMEOUT_SECS", 180),
        };

        let server = ServerConfig {
            port: env.optional_parsed("PORT", 3333),
            public_url: env
                .required("PUBLIC_URL")
                .trim_end_matches('/')
                .to_string(),
            tunnel_provider: env.optional("TUNNEL_PROVIDER"),
            tunnel_token: env.optional("TUNNEL_TOKEN"),
            allow_unsigned: env.flag("ALLOW_UNSIGNED_WEBHOOKS"),
        };

        let chat = ChatConfig {
            bot_token: env.optional("TELEGRAM_BOT_TOKEN"),
            chat_id: env.optional("TELEGRAM_CHAT_ID"),
        };

        if env.missing.is_empty() {
            Ok(Config { phone, speech, server, chat })
        } else {
            Err(CallError::Configuration { missing: env.missing })
        }
    }

    /// The wss:// URL the carrier opens the media stream to
    pub fn media_stream_url(&self, token: &str) -> String {
        let base = self
            .server
            .public_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/media-stream?token={token}")
    }

    /// The webhook URL handed to the carrier on place_call
    pub fn webhook_url(&self) -> String {
        format!("{}/twiml", self.server.public_url)
    }
}
