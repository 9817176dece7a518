use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use parley_core::provider::GenerationClient;
use parley_engine::ControllerConfig;
use parley_llm::{AnthropicClient, AnthropicConfig};
use parley_server::ServerConfig;
use parley_store::{ConversationStore, StoreConfig};
use parley_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Real-time chat relay between WebSocket clients and a generation service", long_about = None)]
struct Cli {
    /// Host to bind
    #[arg(long, env = "PARLEY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind
    #[arg(short, long, env = "PARLEY_PORT", default_value_t = 3000)]
    port: u16,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Model to generate with
    #[arg(short, long, env = "PARLEY_MODEL", default_value = parley_llm::anthropic::DEFAULT_MODEL)]
    model: String,

    /// Maximum tokens per response
    #[arg(long, env = "PARLEY_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: u32,

    /// Log output format (json or pretty)
    #[arg(long, env = "PARLEY_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, env = "PARLEY_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Seconds a disconnected session's history is kept
    #[arg(long, env = "PARLEY_GRACE_SECS", default_value_t = 3600)]
    grace_secs: u64,

    /// Turns kept per conversation (0 for no limit)
    #[arg(long, env = "PARLEY_MAX_TURNS", default_value_t = 40)]
    max_turns: usize,

    /// Text bytes kept per conversation (0 for no limit)
    #[arg(long, env = "PARLEY_MAX_HISTORY_BYTES", default_value_t = 64 * 1024)]
    max_history_bytes: usize,
}

impl Cli {
    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            format: self.log_format,
            ..TelemetryConfig::default()
        }
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_turns: nonzero(self.max_turns),
            max_bytes: nonzero(self.max_history_bytes),
            ..StoreConfig::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            ..ServerConfig::default()
        }
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            eviction_grace: Duration::from_secs(self.grace_secs),
            ..ControllerConfig::default()
        }
    }

    fn anthropic_config(&self) -> AnthropicConfig {
        AnthropicConfig {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            ..AnthropicConfig::new(SecretString::from(self.api_key.clone()))
        }
    }
}

fn nonzero(n: usize) -> Option<usize> {
    (n > 0).then_some(n)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(cli.telemetry_config());
    tracing::info!(model = %cli.model, "starting parley");

    let generator: Arc<dyn GenerationClient> = Arc::new(
        AnthropicClient::new(cli.anthropic_config()).context("failed to build generation client")?,
    );
    let store = Arc::new(ConversationStore::new(cli.store_config()));

    let handle = parley_server::start(
        cli.server_config(),
        generator,
        store,
        telemetry.metrics(),
        cli.controller_config(),
    )
    .await
    .with_context(|| format!("failed to bind {}", cli.server_config().bind_addr()))?;

    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
