pub mod admin;
pub mod app;
pub mod config;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod tls;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    app::run(config_path, overrides).await
}
