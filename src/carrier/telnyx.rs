//! Telnyx adapter (variant B)
//!
//! JSON Call Control v2 with Bearer auth. Unlike Twilio, the webhook body
//! is ignored by the carrier: media streaming is started by a separate
//! `streaming_start` action once the call is answered. Webhooks are signed
//! with Telnyx's Ed25519 key over `timestamp|body`.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CallEvent, CarrierAdapter, WebhookReply};
use crate::error::{CallError, CallResult};

const API_BASE: &str = "https://api.telnyx.com/v2";

/// Webhook timestamps older or newer than this are rejected
const SIGNATURE_FRESHNESS_SECS: i64 = 300;

/// Telnyx Call Control client and webhook verifier
pub struct TelnyxAdapter {
    connection_id: String,
    api_key: String,
    verifying_key: Option<VerifyingKey>,
    http_client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct CallData {
    call_control_id: String,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    data: CallData,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    event_type: String,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    call_control_id: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

impl TelnyxAdapter {
    pub fn new(connection_id: String, api_key: String, public_key: Option<String>) -> Self {
        let verifying_key = public_key.as_deref().and_then(parse_verifying_key);
        if public_key.is_some() && verifying_key.is_none() {
            warn!("telnyx public key is not a valid Ed25519 key; webhooks will be rejected");
        }

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            connection_id,
            api_key,
            verifying_key,
            http_client,
            api_base: API_BASE.to_string(),
        }
    }

    fn action_url(&self, handle: &str, action: &str) -> String {
        format!("{}/calls/{handle}/actions/{action}", self.api_base)
    }

    async fn post_action(
        &self,
        handle: &str,
        action: &str,
        body: serde_json::Value,
    ) -> CallResult<()> {
        let response = self
            .http_client
            .post(self.action_url(handle, action))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::provider("telnyx", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::provider(
                "telnyx",
                format!("{action} returned {status}: {text}"),
            ));
        }
        Ok(())
    }
}

/// Decode a base64 Ed25519 public key
fn parse_verifying_key(encoded: &str) -> Option<VerifyingKey> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    let array: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&array).ok()
}

#[async_trait]
impl CarrierAdapter for TelnyxAdapter {
    async fn place_call(&self, to: &str, from: &str, webhook_url: &str) -> CallResult<String> {
        debug!(to, from, "placing call");

        let body = json!({
            "connection_id": self.connection_id,
            "to": to,
            "from": from,
            "webhook_url": webhook_url,
            "answering_machine_detection": "detect",
        });

        let response = self
            .http_client
            .post(format!("{}/calls", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::provider("telnyx", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CallError::provider(
                "telnyx",
                format!("place call returned {status}: {text}"),
            ));
        }

        let call: CallResponse = response
            .json()
            .await
            .map_err(|e| CallError::provider("telnyx", format!("bad call response: {e}")))?;

        Ok(call.data.call_control_id)
    }

    fn streaming_xml(&self, ws_url: &str) -> String {
        // Telnyx accepts TwiML-compatible XML when texml is in use; the
        // engine only sends this for completeness.
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Response><Connect><Stream url=\"{ws_url}\"/></Connect></Response>"
        )
    }

    async fn start_stream(&self, handle: &str, ws_url: &str) -> CallResult<()> {
        self.post_action(
            handle,
            "streaming_start",
            json!({
                "stream_url": ws_url,
                "stream_track": "inbound_track",
            }),
        )
        .await
    }

    async fn hangup(&self, handle: &str) {
        match self.post_action(handle, "hangup", json!({})).await {
            Ok(()) => debug!(handle, "hangup accepted"),
            Err(e) => warn!(handle, "hangup request failed: {e}"),
        }
    }

    fn verify_signature(&self, _url: &str, body: &[u8], headers: &HeaderMap) -> bool {
        let Some(key) = &self.verifying_key else {
            return false;
        };
        let Some(signature_b64) = headers
            .get("telnyx-signature-ed25519")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(timestamp_raw) = headers
            .get("telnyx-timestamp")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };

        let Ok(timestamp) = timestamp_raw.parse::<i64>() else {
            return false;
        };
        let age = (chrono::Utc::now().timestamp() - timestamp).abs();
        if age > SIGNATURE_FRESHNESS_SECS {
            return false;
        }

        let Ok(signature_bytes) = BASE64.decode(signature_b64) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };

        let mut message = Vec::with_capacity(timestamp_raw.len() + 1 + body.len());
        message.extend_from_slice(timestamp_raw.as_bytes());
        message.push(b'|');
        message.extend_from_slice(body);

        key.verify(&message, &signature).is_ok()
    }

    fn parse_event(&self, body: &[u8]) -> CallEvent {
        let Ok(envelope) = serde_json::from_slice::<WebhookEnvelope>(body) else {
            return CallEvent::Irrelevant;
        };

        let Some(handle) = envelope.data.payload.call_control_id else {
            return CallEvent::Irrelevant;
        };

        match envelope.data.event_type.as_str() {
            "call.answered" => CallEvent::Answered { handle },
            "call.hangup" => CallEvent::HungUp { handle },
            "streaming.started" => CallEvent::StreamingReady { handle },
            "call.machine.detection.ended" => CallEvent::MachineDetection {
                handle,
                result: envelope
                    .data
                    .payload
                    .result
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            _ => CallEvent::Irrelevant,
        }
    }

    fn webhook_reply(&self, _ws_url: &str) -> WebhookReply {
        WebhookReply::Json("{\"status\":\"ok\"}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public_b64 = BASE64.encode(signing.verifying_key().to_bytes());
        (signing, public_b64)
    }

    fn adapter_with_key(public_b64: Option<String>) -> TelnyxAdapter {
        TelnyxAdapter::new("conn-1".to_string(), "key".to_string(), public_b64)
    }

    fn signed_headers(signing: &SigningKey, timestamp: i64, body: &[u8]) -> HeaderMap {
        let ts = timestamp.to_string();
        let mut message = ts.clone().into_bytes();
        message.push(b'|');
        message.extend_from_slice(body);
        let signature = signing.sign(&message);

        let mut headers = HeaderMap::new();
        headers.insert(
            "telnyx-signature-ed25519",
            BASE64.encode(signature.to_bytes()).parse().unwrap(),
        );
        headers.insert("telnyx-timestamp", ts.parse().unwrap());
        headers
    }

    #[test]
    fn test_valid_signature_accepted() {
        let (signing, public) = keypair();
        let adapter = adapter_with_key(Some(public));
        let body = br#"{"data":{}}"#;
        let headers = signed_headers(&signing, chrono::Utc::now().timestamp(), body);
        assert!(adapter.verify_signature("unused", body, &headers));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let (signing, public) = keypair();
        let adapter = adapter_with_key(Some(public));
        let body = br#"{"data":{}}"#;
        let stale = chrono::Utc::now().timestamp() - 600;
        let headers = signed_headers(&signing, stale, body);
        assert!(!adapter.verify_signature("unused", body, &headers));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (signing, public) = keypair();
        let adapter = adapter_with_key(Some(public));
        let headers =
            signed_headers(&signing, chrono::Utc::now().timestamp(), br#"{"data":{}}"#);
        assert!(!adapter.verify_signature("unused", br#"{"data":{"x":1}}"#, &headers));
    }

    #[test]
    fn test_missing_headers_rejected() {
        let (_, public) = keypair();
        let adapter = adapter_with_key(Some(public));
        assert!(!adapter.verify_signature("unused", b"{}", &HeaderMap::new()));
    }

    #[test]
    fn test_malformed_signature_rejected_without_panic() {
        let (_, public) = keypair();
        let adapter = adapter_with_key(Some(public));
        let mut headers = HeaderMap::new();
        headers.insert("telnyx-signature-ed25519", "!!not-base64!!".parse().unwrap());
        headers.insert(
            "telnyx-timestamp",
            chrono::Utc::now().timestamp().to_string().parse().unwrap(),
        );
        assert!(!adapter.verify_signature("unused", b"{}", &headers));
    }

    #[test]
    fn test_no_key_rejects_everything() {
        let (signing, _) = keypair();
        let adapter = adapter_with_key(None);
        let body = b"{}";
        let headers = signed_headers(&signing, chrono::Utc::now().timestamp(), body);
        assert!(!adapter.verify_signature("unused", body, &headers));
    }

    #[test]
    fn test_parse_answered() {
        let body = br#"{"data":{"event_type":"call.answered","payload":{"call_control_id":"cc-1"}}}"#;
        let event = adapter_with_key(None).parse_event(body);
        assert_eq!(event, CallEvent::Answered { handle: "cc-1".into() });
    }

    #[test]
    fn test_parse_streaming_started() {
        let body = br#"{"data":{"event_type":"streaming.started","payload":{"call_control_id":"cc-1"}}}"#;
        let event = adapter_with_key(None).parse_event(body);
        assert_eq!(event, CallEvent::StreamingReady { handle: "cc-1".into() });
    }

    #[test]
    fn test_parse_machine_detection() {
        let body = br#"{"data":{"event_type":"call.machine.detection.ended","payload":{"call_control_id":"cc-1","result":"machine"}}}"#;
        let event = adapter_with_key(None).parse_event(body);
        assert_eq!(
            event,
            CallEvent::MachineDetection { handle: "cc-1".into(), result: "machine".into() }
        );
    }

    #[test]
    fn test_parse_unknown_event_irrelevant() {
        let body = br#"{"data":{"event_type":"call.recording.saved","payload":{"call_control_id":"cc-1"}}}"#;
        assert_eq!(adapter_with_key(None).parse_event(body), CallEvent::Irrelevant);
        assert_eq!(adapter_with_key(None).parse_event(b"not json"), CallEvent::Irrelevant);
    }
}
