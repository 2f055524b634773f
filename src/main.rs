mod wsbridge;

use std::path::PathBuf;

use clap::{Parser, builder::BoolishValueParser};

use wsbridge::config::{Overrides, TlsMode};

#[derive(Debug, Parser)]
#[command(
    name = "wsbridge",
    version,
    about = "wsbridge - SSH over WebSocket/TLS tunnel"
)]
struct Cli {
    /// Path to the config file (.yaml/.yml/.toml). If omitted, uses $WSBRIDGE_CONFIG, then auto-detects wsbridge.yaml > wsbridge.yml > wsbridge.toml from CWD; then falls back to the OS default path (Linux: /etc/wsbridge/config.yaml; others: user config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error).
    #[arg(short, long, env = "WSBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Plaintext listen address.
    #[arg(short, long, env = "WSBRIDGE_ADDRESS")]
    addr: Option<String>,

    /// TLS listen address.
    #[arg(long, env = "WSBRIDGE_TLS_ADDRESS")]
    tls_addr: Option<String>,

    /// Backend every connection is relayed to.
    #[arg(long, env = "WSBRIDGE_DST_ADDRESS")]
    dst_addr: Option<String>,

    /// Status code for an `HTTP/1.1 <code> Ok` response instead of the WebSocket upgrade.
    #[arg(long, env = "WSBRIDGE_HANDSHAKE_CODE")]
    custom_handshake: Option<String>,

    /// Enable the TLS listener.
    #[arg(long, env = "WSBRIDGE_TLS_ENABLED", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    tls: Option<bool>,

    /// PEM private key for the TLS listener.
    #[arg(long, env = "WSBRIDGE_TLS_PRIVATE_KEY")]
    private_key: Option<PathBuf>,

    /// PEM certificate chain for the TLS listener.
    #[arg(long, env = "WSBRIDGE_TLS_PUBLIC_KEY")]
    public_key: Option<PathBuf>,

    #[arg(long, env = "WSBRIDGE_TLS_MODE", value_enum)]
    tls_mode: Option<TlsMode>,

    /// Enable the Prometheus metrics listener.
    #[arg(long, env = "WSBRIDGE_METRICS_ENABLED", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    metrics: Option<bool>,

    #[arg(long, env = "WSBRIDGE_METRICS_PORT")]
    metrics_port: Option<String>,

    #[arg(long, env = "WSBRIDGE_MAX_CONNECTIONS", allow_negative_numbers = true)]
    max_connections: Option<i64>,

    /// Backend dial timeout in seconds.
    #[arg(long, env = "WSBRIDGE_TIMEOUT", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Seconds to wait for the opening payload; 0 waits indefinitely.
    #[arg(long, env = "WSBRIDGE_PAYLOAD_TIMEOUT", allow_negative_numbers = true)]
    payload_timeout: Option<i64>,

    #[arg(long, env = "WSBRIDGE_BUFFER_SIZE", allow_negative_numbers = true)]
    buffer_size: Option<i64>,

    #[arg(long, env = "WSBRIDGE_KEEP_ALIVE", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    keep_alive: Option<bool>,

    #[arg(long, env = "WSBRIDGE_NO_DELAY", num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    no_delay: Option<bool>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            address: self.addr.clone(),
            tls_address: self.tls_addr.clone(),
            dst_address: self.dst_addr.clone(),
            handshake_code: self.custom_handshake.clone(),
            tls_enabled: self.tls,
            tls_private_key: self.private_key.clone(),
            tls_public_key: self.public_key.clone(),
            tls_mode: self.tls_mode,
            metrics_enabled: self.metrics,
            metrics_port: self.metrics_port.clone(),
            max_connections: self.max_connections,
            timeout: self.timeout,
            payload_timeout: self.payload_timeout,
            buffer_size: self.buffer_size,
            keep_alive: self.keep_alive,
            no_delay: self.no_delay,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = cli.overrides();
    wsbridge::run(cli.config, overrides).await
}
