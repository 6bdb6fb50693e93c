use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use toolbridge_core::telemetry::init_logging;
use toolbridge_core::{BridgeConfig, BridgeError, Orchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config path: TOOLBRIDGE_CONFIG, then the first argument, then ./toolbridge.toml
    let path = std::env::var("TOOLBRIDGE_CONFIG")
        .ok()
        .filter(|p| !p.is_empty())
        .or_else(|| std::env::args().nth(1))
        .unwrap_or_else(|| "toolbridge.toml".into());

    let config = BridgeConfig::load(&path)?;
    init_logging(&config.logging);

    let orchestrator = Orchestrator::start(&config).await?;
    tracing::info!(tools = ?orchestrator.tool_names(), "Toolbridge ready, reading messages from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let reply = match orchestrator.process_message(text).await {
            Ok(reply) => reply,
            Err(BridgeError::Cancelled) => break,
            Err(e) => {
                tracing::error!(error = %e, "Message failed");
                format!("Error: {}", e)
            }
        };
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    if let Err(e) = orchestrator.shutdown().await {
        tracing::error!(error = %e, "Shutdown reported errors");
        return Err(e.into());
    }
    Ok(())
}
