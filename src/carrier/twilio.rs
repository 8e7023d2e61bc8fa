//! Twilio adapter (variant A)
//!
//! Form-urlencoded REST API with HTTP Basic auth. Media streaming is
//! started by the TwiML document returned from the voice webhook; call
//! progress arrives as status-callback form posts signed with HMAC-SHA1.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, warn};

use super::{CallEvent, CarrierAdapter, WebhookReply};
use crate::error::{CallError, CallResult};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

type HmacSha1 = Hmac<Sha1>;

/// Twilio REST client and webhook verifier
pub struct TwilioAdapter {
    account_sid: String,
    auth_token: String,
    http_client: reqwest::Client,
    api_base: String,
}

/// Subset of the call resource we read back
#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
}

impl TwilioAdapter {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            account_sid,
            auth_token,
            http_client,
            api_base: API_BASE.to_string(),
        }
    }

    fn calls_url(&self) -> String {
        format!("{}/Accounts/{}/Calls.json", self.api_base, self.account_sid)
    }

    fn call_url(&self, sid: &str) -> String {
        format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, sid
        )
    }

    /// The base string Twilio signs: the full webhook URL followed by every
    /// POST parameter as `key` then `value`, sorted by key.
    fn signature_base(url: &str, body: &[u8]) -> String {
        let mut params: Vec<(String, String)> = url::form_urlencoded::parse(body)
            .into_owned()
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut base = String::from(url);
        for (key, value) in params {
            base.push_str(&key);
            base.push_str(&value);
        }
        base
    }

    fn expected_signature(&self, url: &str, body: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(self.auth_token.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(Self::signature_base(url, body).as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl CarrierAdapter for TwilioAdapter {
    async fn place_call(&self, to: &str, from: &str, webhook_url: &str) -> CallResult<String> {
        let params = [
            ("To", to),
            ("From", from),
            ("Url", webhook_url),
            ("Method", "POST"),
            ("StatusCallback", webhook_url),
            ("StatusCallbackEvent", "answered completed"),
            ("MachineDetection", "Enable"),
        ];

        debug!(to, from, "placing call");

        let response = self
            .http_client
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| CallError::provider("twilio", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::provider(
                "twilio",
                format!("place call returned {status}: {body}"),
            ));
        }

        let call: CallResource = response
            .json()
            .await
            .map_err(|e| CallError::provider("twilio", format!("bad call resource: {e}")))?;

        Ok(call.sid)
    }

    fn streaming_xml(&self, ws_url: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Response><Connect><Stream url=\"{ws_url}\"/></Connect></Response>"
        )
    }

    async fn start_stream(&self, _handle: &str, _ws_url: &str) -> CallResult<()> {
        // Twilio starts the stream from the <Connect><Stream> TwiML.
        Ok(())
    }

    async fn hangup(&self, handle: &str) {
        let result = self
            .http_client
            .post(self.call_url(handle))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(handle, "hangup accepted");
            }
            Ok(resp) => warn!(handle, status = %resp.status(), "hangup rejected"),
            Err(e) => warn!(handle, "hangup request failed: {e}"),
        }
    }

    fn verify_signature(&self, url: &str, body: &[u8], headers: &HeaderMap) -> bool {
        let Some(signature) = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };

        // Byte comparison of two base64 strings; both derive from fixed-size
        // HMAC output so length leaks nothing.
        self.expected_signature(url, body) == signature
    }

    fn parse_event(&self, body: &[u8]) -> CallEvent {
        let mut call_sid = None;
        let mut call_status = None;
        let mut answered_by = None;

        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "CallSid" => call_sid = Some(value.into_owned()),
                "CallStatus" => call_status = Some(value.into_owned()),
                "AnsweredBy" => answered_by = Some(value.into_owned()),
                _ => {}
            }
        }

        let Some(handle) = call_sid else {
            return CallEvent::Irrelevant;
        };

        if let Some(result) = answered_by {
            if result != "human" {
                return CallEvent::MachineDetection { handle, result };
            }
        }

        match call_status.as_deref() {
            Some("in-progress") | Some("answered") => CallEvent::Answered { handle },
            Some("completed") | Some("busy") | Some("failed") | Some("no-answer")
            | Some("canceled") => CallEvent::HungUp { handle },
            _ => CallEvent::Irrelevant,
        }
    }

    fn webhook_reply(&self, ws_url: &str) -> WebhookReply {
        WebhookReply::Xml(self.streaming_xml(ws_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> TwilioAdapter {
        TwilioAdapter::new("AC123".to_string(), "secret_token".to_string())
    }

    fn headers_with_signature(sig: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-twilio-signature", sig.parse().unwrap());
        headers
    }

    #[test]
    fn test_signature_base_sorts_params() {
        let base = TwilioAdapter::signature_base(
            "https://example.com/twiml",
            b"Zebra=1&Alpha=two&Middle=x",
        );
        assert_eq!(base, "https://example.com/twimlAlphatwoMiddlexZebra1");
    }

    #[test]
    fn test_signature_round_trip() {
        let a = adapter();
        let url = "https://example.com/twiml";
        let body = b"CallSid=CA1&CallStatus=completed";
        let sig = a.expected_signature(url, body);
        assert!(a.verify_signature(url, body, &headers_with_signature(&sig)));
    }

    #[test]
    fn test_missing_signature_rejected() {
        let a = adapter();
        assert!(!a.verify_signature("https://example.com/twiml", b"a=1", &HeaderMap::new()));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let a = adapter();
        let url = "https://example.com/twiml";
        let sig = a.expected_signature(url, b"CallSid=CA1");
        assert!(!a.verify_signature(url, b"CallSid=CA2", &headers_with_signature(&sig)));
    }

    #[test]
    fn test_verification_is_pure() {
        let a = adapter();
        let url = "https://example.com/twiml";
        let body = b"CallSid=CA1";
        let sig = a.expected_signature(url, body);
        let headers = headers_with_signature(&sig);
        for _ in 0..3 {
            assert!(a.verify_signature(url, body, &headers));
        }
    }

    #[test]
    fn test_parse_answered() {
        let event = adapter().parse_event(b"CallSid=CA9&CallStatus=in-progress");
        assert_eq!(event, CallEvent::Answered { handle: "CA9".into() });
    }

    #[test]
    fn test_parse_hangup_statuses() {
        for status in ["completed", "busy", "failed", "no-answer"] {
            let body = format!("CallSid=CA9&CallStatus={status}");
            let event = adapter().parse_event(body.as_bytes());
            assert_eq!(event, CallEvent::HungUp { handle: "CA9".into() }, "{status}");
        }
    }

    #[test]
    fn test_parse_machine_detection() {
        let event = adapter().parse_event(b"CallSid=CA9&CallStatus=in-progress&AnsweredBy=machine_start");
        assert_eq!(
            event,
            CallEvent::MachineDetection { handle: "CA9".into(), result: "machine_start".into() }
        );
    }

    #[test]
    fn test_human_answer_is_not_machine() {
        let event = adapter().parse_event(b"CallSid=CA9&CallStatus=in-progress&AnsweredBy=human");
        assert_eq!(event, CallEvent::Answered { handle: "CA9".into() });
    }

    #[test]
    fn test_parse_garbage_is_irrelevant() {
        assert_eq!(adapter().parse_event(b"not&a=callback"), CallEvent::Irrelevant);
        assert_eq!(adapter().parse_event(b"\xff\xfe"), CallEvent::Irrelevant);
    }

    #[test]
    fn test_streaming_xml_contains_url() {
        let xml = adapter().streaming_xml("wss://example.com/media-stream?token=abc");
        assert!(xml.contains("<Connect><Stream url=\"wss://example.com/media-stream?token=abc\"/>"));
        assert!(xml.starts_with("<?xml"));
    }
}
