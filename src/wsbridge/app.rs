use std::path::PathBuf;

use anyhow::Context;

use crate::wsbridge::{
    config::{self, Overrides},
    logging,
    server::{ListenerKind, Server},
    telemetry,
};

pub async fn run(config_path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load(&resolved, &overrides)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if resolved.path.is_file() {
        tracing::info!(path = %resolved.path.display(), source = %resolved.source, "config: loaded");
    } else {
        tracing::info!(path = %resolved.path.display(), "config: no config file; using defaults");
    }

    tracing::info!(
        address = %cfg.address,
        tls_enabled = cfg.tls_enabled,
        tls_address = %cfg.tls_address,
        tls_mode = %cfg.tls_mode,
        dst_address = %cfg.dst_address,
        custom_handshake = !cfg.handshake_code.is_empty(),
        metrics_enabled = cfg.metrics_enabled,
        "wsbridge: starting"
    );
    tracing::info!(
        max_connections = cfg.max_connections,
        "config: max_connections is advisory and not enforced"
    );

    let (metrics, prometheus) = telemetry::metrics_sink(cfg.metrics_enabled)?;
    let server = Server::new(&cfg, metrics, prometheus);
    server.start();

    if let Some(addr) = server.wait_listening(ListenerKind::Plain).await {
        tracing::debug!(local_addr = %addr, "wsbridge: plaintext listener ready");
    }

    // Wait for a shutdown signal or a fatal listener error.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            server.stop().await;
        }
        res = server.wait() => {
            res.context("wsbridge: listener failed")?;
            return Ok(());
        }
    }

    server.wait().await.context("wsbridge: listener failed")?;
    tracing::info!(
        http = ?server.state(ListenerKind::Plain),
        tls = ?server.state(ListenerKind::Tls),
        "wsbridge: shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut term, mut quit) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
        ) {
            (Ok(term), Ok(quit)) => (term, quit),
            (Err(err), _) | (_, Err(err)) => {
                tracing::warn!(err = %err, "shutdown: install signal handlers failed; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
