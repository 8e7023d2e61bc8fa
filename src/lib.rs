//! Phone Agent - Assistant-Driven Voice Call Bridge
//!
//! A local bridge that lets a coding assistant hold a real phone
//! conversation (or a Telegram chat) with a human operator:
//! - Stdio JSON-RPC tool server (`initiate_call`, `continue_call`,
//!   `speak_to_user`, `end_call`)
//! - Outbound calls through Twilio or Telnyx with signed webhooks
//! - Bidirectional media streaming (G.711 mu-law over WebSocket)
//! - Streaming speech-to-text with end-of-utterance detection
//! - Streaming text-to-speech with a jitter-buffered outbound pacer
//!
//! # Example
//!
//! ```ignore
//! use phone_agent::config::Config;
//! use phone_agent::session::SessionEngine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let engine = SessionEngine::new(config);
//!     let reply = engine.initiate("Hello, this is your agent calling.").await?;
//!     println!("{}", reply.transcript);
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod config;
pub mod audio;
pub mod carrier;
pub mod stt;
pub mod tts;
pub mod session;
pub mod server;
pub mod dispatcher;
pub mod chat;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::{Config, PhoneProvider};
pub use error::{CallError, CallResult};
pub use session::{SessionEngine, ToolReply};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
