//! Phone Agent - Assistant-Driven Voice Call Bridge

use phone_agent::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging goes to stderr: stdout belongs to the JSON-RPC transport.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phone_agent=info,tower_http=info".into()),
        )
        .init();

    cli::run().await
}
