//! Carrier control webhook
//!
//! `/twiml` receives every control event for every call. The raw body is
//! signature-checked before any parsing; events are normalized by the
//! configured adapter and routed to the owning session. Variant-A carriers
//! consume the XML reply to open the media stream; variant-B carriers get
//! a JSON acknowledgement and are started through the API instead.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;
use crate::carrier::{CallEvent, WebhookReply};

/// Liveness probe with the live-session count
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let live_sessions = state.engine.registry().count().await;
    Json(json!({ "status": "ok", "live_sessions": live_sessions }))
}

/// Control webhook for both carrier variants
pub async fn twiml(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let engine = &state.engine;
    let config = engine.config();

    if !config.server.allow_unsigned {
        let url = config.webhook_url();
        if !engine.carrier().verify_signature(&url, &body, &headers) {
            warn!("rejected webhook with missing or invalid signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    if body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let event = engine.carrier().parse_event(&body);
    debug!(?event, "webhook event");

    // The XML reply needs the session's media token; resolve it from the
    // event's handle before the event is consumed by the router.
    let token = match &event {
        CallEvent::Answered { handle }
        | CallEvent::HungUp { handle }
        | CallEvent::StreamingReady { handle }
        | CallEvent::MachineDetection { handle, .. } => engine
            .registry()
            .get_by_handle(handle)
            .await
            .map(|session| session.token.clone()),
        CallEvent::Irrelevant => None,
    };

    engine.handle_event(event).await;

    match token {
        Some(token) => {
            let ws_url = config.media_stream_url(&token);
            match engine.carrier().webhook_reply(&ws_url) {
                WebhookReply::Xml(xml) => {
                    ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
                }
                WebhookReply::Json(body) => {
                    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
                }
            }
        }
        // Unknown call: acknowledge without instructions so the carrier
        // neither retries nor connects a stream.
        None => ([(header::CONTENT_TYPE, "application/xml")], "<Response/>").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatConfig, PhoneConfig, PhoneProvider, ServerConfig, SpeechConfig};
    use crate::session::SessionEngine;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_config(allow_unsigned: bool) -> crate::config::Config {
        crate::config::Config {
            phone: PhoneConfig {
                provider: PhoneProvider::Twilio,
                account_id: "AC123".to_string(),
                secret: "auth_token".to_string(),
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
                allow_unsigned,
            },
            chat: ChatConfig { bot_token: None, chat_id: None },
        }
    }

    async fn response_for(engine: Arc<SessionEngine>, request: Request<Body>) -> Response {
        crate::server::router(engine).oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_unsigned_webhook_rejected() {
        let engine = Arc::new(SessionEngine::new(test_config(false)));
        let request = Request::post("/twiml")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("CallSid=CA1&CallStatus=in-progress"))
            .unwrap();

        let response = response_for(engine.clone(), request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(engine.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_answered_webhook_returns_stream_xml_with_token() {
        let engine = Arc::new(SessionEngine::new(test_config(true)));

        let session = Arc::new(crate::session::Session::new(
            1,
            "secret-token".to_string(),
            "+15550002222".to_string(),
            "+15550001111".to_string(),
        ));
        engine.registry().insert(session.clone()).await;
        session.set_carrier_handle("CA1".to_string());
        engine.registry().index_handle("CA1", 1).await;

        let request = Request::post("/twiml")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("CallSid=CA1&CallStatus=in-progress"))
            .unwrap();
        let response = response_for(engine, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("wss://example.test/media-stream?token=secret-token"));
        assert!(text.contains("<Connect><Stream"));
    }

    #[tokio::test]
    async fn test_unknown_call_gets_empty_response() {
        let engine = Arc::new(SessionEngine::new(test_config(true)));
        let request = Request::post("/twiml")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("CallSid=CA404&CallStatus=in-progress"))
            .unwrap();
        let response = response_for(engine, request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<Response/>");
    }

    #[tokio::test]
    async fn test_hangup_webhook_sets_flag() {
        let engine = Arc::new(SessionEngine::new(test_config(true)));
        let session = Arc::new(crate::session::Session::new(
            2,
            "tok-2".to_string(),
            "+15550002222".to_string(),
            "+15550001111".to_string(),
        ));
        engine.registry().insert(session.clone()).await;
        session.set_carrier_handle("CA2".to_string());
        engine.registry().index_handle("CA2", 2).await;

        let request = Request::post("/twiml")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("CallSid=CA2&CallStatus=completed"))
            .unwrap();
        let response = response_for(engine.clone(), request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(session.is_hung_up());
    }

    #[tokio::test]
    async fn test_health_reports_session_count() {
        let engine = Arc::new(SessionEngine::new(test_config(true)));
        engine
            .registry()
            .insert(Arc::new(crate::session::Session::new(
                1,
                "t".to_string(),
                "+1".to_string(),
                "+2".to_string(),
            )))
            .await;

        let request = Request::get("/health").body(Body::empty()).unwrap();
        let response = response_for(engine, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["live_sessions"], 1);
    }
}
