//! Stdio JSON-RPC tool dispatcher
//!
//! The upstream assistant drives the process through JSON-RPC 2.0 framed
//! with `Content-Length` headers on stdin/stdout. The method surface is
//! deliberately tiny: `initialize`, `tools/list`, and `tools/call`. Every
//! tool call is synchronous from the assistant's point of view, and every
//! engine failure becomes a structured tool-error payload; nothing a tool
//! does can crash the process.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::chat::ChatEngine;
use crate::error::CallError;
use crate::session::SessionEngine;

/// Which engine answers the tool calls
pub enum Backend {
    Voice(Arc<SessionEngine>),
    Chat(Arc<ChatEngine>),
}

/// The stdio tool server
pub struct ToolDispatcher {
    backend: Backend,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ToolDispatcher {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Serve until stdin closes.
    pub async fn run<R, W>(&self, stdin: R, mut stdout: W) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stdin);
        info!("tool dispatcher ready");

        loop {
            let message = match read_frame(&mut reader).await? {
                Some(message) => message,
                None => {
                    info!("stdin closed, dispatcher exiting");
                    return Ok(());
                }
            };

            let response = match serde_json::from_str::<RpcRequest>(&message) {
                Ok(request) => {
                    debug!(method = %request.method, "rpc request");
                    self.handle_request(request).await
                }
                Err(e) => Some(error_response(Value::Null, -32700, &format!("parse error: {e}"))),
            };

            if let Some(response) = response {
                write_frame(&mut stdout, &response).await?;
            }
        }
    }

    /// Handle one request; notifications (no id) produce no response.
    async fn handle_request(&self, request: RpcRequest) -> Option<Value> {
        let id = request.id.clone()?;

        let response = match request.method.as_str() {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {
                        "name": crate::NAME,
                        "version": crate::VERSION,
                    },
                    "capabilities": { "tools": {} },
                }
            }),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": self.tool_catalog() }
            }),
            "tools/call" => {
                let params: ToolCallParams = match serde_json::from_value(request.params) {
                    Ok(params) => params,
                    Err(e) => {
                        return Some(error_response(id, -32602, &format!("invalid params: {e}")))
                    }
                };
                let outcome = self.call_tool(&params.name, &params.arguments).await;
                match outcome {
                    Ok(text) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [{ "type": "text", "text": text }],
                            "isError": false,
                        }
                    }),
                    Err(ToolFailure::UnknownTool) => {
                        return Some(error_response(
                            id,
                            -32601,
                            &format!("unknown tool: {}", params.name),
                        ))
                    }
                    Err(ToolFailure::Call(e)) => {
                        warn!(tool = %params.name, "tool failed: {e}");
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {
                                "content": [{ "type": "text", "text": e.to_string() }],
                                "isError": true,
                            }
                        })
                    }
                }
            }
            other => error_response(id, -32601, &format!("unknown method: {other}")),
        };

        Some(response)
    }

    fn tool_catalog(&self) -> Value {
        let mut tools = vec![
            tool_def(
                "initiate_call",
                "Place a phone call to the operator, speak the message, and return their reply",
                json!({
                    "type": "object",
                    "properties": {
                        "message": { "type": "string", "description": "What to say when they answer" }
                    },
                    "required": ["message"]
                }),
            ),
            tool_def(
                "continue_call",
                "Speak on an active call and return the operator's reply",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string" }
                    },
                    "required": ["session_id", "message"]
                }),
            ),
            tool_def(
                "speak_to_user",
                "Speak on an active call without waiting for a reply",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string" }
                    },
                    "required": ["session_id", "message"]
                }),
            ),
            tool_def(
                "end_call",
                "Say goodbye, hang up, and report the call duration",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string", "description": "Optional goodbye" }
                    },
                    "required": ["session_id"]
                }),
            ),
        ];

        if matches!(self.backend, Backend::Chat(_)) {
            tools.push(tool_def(
                "listen_for_commands",
                "Wait for the operator's next chat message or slash command",
                json!({ "type": "object", "properties": {} }),
            ));
        }

        Value::Array(tools)
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> std::result::Result<String, ToolFailure> {
        let message = arguments
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let session_id = arguments.get("session_id").and_then(Value::as_u64);

        let require_session = || {
            session_id.ok_or(ToolFailure::Call(CallError::Protocol(
                "session_id is required".to_string(),
            )))
        };

        match (&self.backend, name) {
            (Backend::Voice(engine), "initiate_call") => {
                let reply = engine.initiate(message).await?;
                Ok(render_reply(reply.session_id, &reply.transcript, reply.machine_detection))
            }
            (Backend::Voice(engine), "continue_call") => {
                let reply = engine.continue_call(require_session()?, message).await?;
                Ok(render_reply(reply.session_id, &reply.transcript, None))
            }
            (Backend::Voice(engine), "speak_to_user") => {
                let reply = engine.speak_only(require_session()?, message).await?;
                Ok(format!("Spoke on session {}.", reply.session_id))
            }
            (Backend::Voice(engine), "end_call") => {
                let reply = engine.end_call(require_session()?, message).await?;
                Ok(format!(
                    "Call {} ended after {:.1} seconds.",
                    reply.session_id, reply.duration_secs
                ))
            }
            (Backend::Chat(engine), "initiate_call") => {
                let reply = engine.initiate(message).await?;
                Ok(render_reply(reply.session_id, &reply.transcript, None))
            }
            (Backend::Chat(engine), "continue_call") => {
                let reply = engine.continue_chat(require_session()?, message).await?;
                Ok(render_reply(reply.session_id, &reply.transcript, None))
            }
            (Backend::Chat(engine), "speak_to_user") => {
                let reply = engine.send_only(require_session()?, message).await?;
                Ok(format!("Sent on session {}.", reply.session_id))
            }
            (Backend::Chat(engine), "end_call") => {
                let reply = engine.end_chat(require_session()?, message).await?;
                Ok(format!(
                    "Chat {} ended after {:.1} seconds.",
                    reply.session_id, reply.duration_secs
                ))
            }
            (Backend::Chat(engine), "listen_for_commands") => {
                let text = engine.listen_for_commands().await?;
                Ok(text)
            }
            _ => Err(ToolFailure::UnknownTool),
        }
    }
}

enum ToolFailure {
    UnknownTool,
    Call(CallError),
}

impl From<CallError> for ToolFailure {
    fn from(e: CallError) -> Self {
        ToolFailure::Call(e)
    }
}

fn tool_def(name: &str, description: &str, schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": schema,
    })
}

fn render_reply(session_id: u64, transcript: &str, machine: Option<String>) -> String {
    let mut text = format!("Session {session_id}. Operator said: {transcript}");
    if let Some(result) = machine {
        text.push_str(&format!("\nAnswering-machine detection: {result}"));
    }
    text
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Read one `Content-Length`-framed message. Returns None at EOF.
async fn read_frame<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .context("reading frame header")?;
        if read == 0 {
            return Ok(None);
        }

        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }

    let length = content_length.context("frame missing Content-Length header")?;
    let mut buffer = vec![0u8; length];
    reader
        .read_exact(&mut buffer)
        .await
        .context("reading frame body")?;
    Ok(Some(String::from_utf8(buffer).context("frame body is not UTF-8")?))
}

/// Write one `Content-Length`-framed message.
async fn write_frame<W>(writer: &mut W, message: &Value) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let body = serde_json::to_string(message)?;
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer
        .write_all(frame.as_bytes())
        .await
        .context("writing frame")?;
    writer.flush().await.context("flushing frame")?;
    Ok(())
}
