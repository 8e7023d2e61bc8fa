//! Carrier adapters
//!
//! Everything provider-specific about placing a call and receiving its
//! control events lives behind [`CarrierAdapter`]. Two implementations:
//! - Twilio: form-urlencoded REST, HMAC-SHA1 webhook signatures, media
//!   streaming started by returning TwiML from the webhook
//! - Telnyx: JSON Call Control v2, Ed25519 webhook signatures, media
//!   streaming started by a separate API action

pub mod telnyx;
pub mod twilio;

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::sync::Arc;

use crate::config::{PhoneConfig, PhoneProvider};
use crate::error::CallResult;

pub use telnyx::TelnyxAdapter;
pub use twilio::TwilioAdapter;

/// A carrier control event, normalized across providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The human picked up
    Answered { handle: String },
    /// The call ended (completed, busy, failed, no-answer)
    HungUp { handle: String },
    /// The media stream is ready for outbound audio
    StreamingReady { handle: String },
    /// Answering-machine detection concluded
    MachineDetection { handle: String, result: String },
    /// Anything the engine does not care about
    Irrelevant,
}

/// Body format the `/twiml` webhook should answer with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReply {
    /// Variant A: the streaming XML document, returned synchronously
    Xml(String),
    /// Variant B: a JSON acknowledgement; streaming starts via the API
    Json(&'static str),
}

/// Provider-specific telephony operations
#[async_trait]
pub trait CarrierAdapter: Send + Sync {
    /// Place an outbound call; returns the carrier's opaque call handle.
    async fn place_call(&self, to: &str, from: &str, webhook_url: &str) -> CallResult<String>;

    /// The XML document instructing the carrier to open the media
    /// WebSocket. Only variant A consumes this; variant B adapters return
    /// it for completeness of the webhook reply.
    fn streaming_xml(&self, ws_url: &str) -> String;

    /// Instruct the carrier to begin media streaming. No-op for carriers
    /// that start streaming from the webhook XML.
    async fn start_stream(&self, handle: &str, ws_url: &str) -> CallResult<()>;

    /// Best-effort hangup; failures are logged, never surfaced.
    async fn hangup(&self, handle: &str);

    /// Verify a webhook's signature over its raw body.
    ///
    /// Missing or malformed signatures verify to false; this never errors.
    fn verify_signature(&self, url: &str, body: &[u8], headers: &HeaderMap) -> bool;

    /// Parse a raw webhook body into a normalized event.
    fn parse_event(&self, body: &[u8]) -> CallEvent;

    /// What `/twiml` should respond with for this provider.
    fn webhook_reply(&self, ws_url: &str) -> WebhookReply;
}

/// Build the adapter selected by configuration.
pub fn create_adapter(phone: &PhoneConfig) -> Arc<dyn CarrierAdapter> {
    match phone.provider {
        PhoneProvider::Twilio => Arc::new(TwilioAdapter::new(
            phone.account_id.clone(),
            phone.secret.clone(),
        )),
        PhoneProvider::Telnyx => Arc::new(TelnyxAdapter::new(
            phone.account_id.clone(),
            phone.secret.clone(),
            phone.telnyx_public_key.clone(),
        )),
    }
}
