use std::{
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, sync::watch, time};

use crate::wsbridge::{
    admin,
    config::Config,
    error::ListenError,
    net,
    proxy::{Proxy, ProxyOptions},
    telemetry::SharedMetrics,
    tls,
};

/// How long the plaintext accept waits before re-checking for shutdown.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed accept so persistent errors (EMFILE) do not spin the loop.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Plain,
    Tls,
    Metrics,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::Plain => "http",
            ListenerKind::Tls => "tls",
            ListenerKind::Metrics => "metrics",
        }
    }

    fn is_primary(self) -> bool {
        !matches!(self, ListenerKind::Metrics)
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Listening,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct ListenerStatus {
    state: ListenerState,
    local_addr: Option<SocketAddr>,
}

struct Shared {
    shutdown_tx: watch::Sender<bool>,
    listeners: HashMap<ListenerKind, watch::Sender<ListenerStatus>>,
    fatal: Mutex<Option<ListenError>>,
}

impl Shared {
    fn set_state(&self, kind: ListenerKind, state: ListenerState) {
        if let Some(tx) = self.listeners.get(&kind) {
            tx.send_modify(|s| s.state = state);
        }
    }

    fn set_listening(&self, kind: ListenerKind, addr: SocketAddr) {
        if let Some(tx) = self.listeners.get(&kind) {
            tx.send_replace(ListenerStatus {
                state: ListenerState::Listening,
                local_addr: Some(addr),
            });
        }
    }

    /// Keeps the first fatal error and stops every listener.
    fn fail(&self, kind: ListenerKind, err: ListenError) {
        tracing::error!(listener = %kind, err = %err, "server: listener failed, stopping all listeners");
        if let Ok(mut slot) = self.fatal.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.shutdown_tx.send_replace(true);
    }
}

struct ListenerSettings {
    address: String,
    tls_address: String,
    dst_address: String,
    tls_cert: PathBuf,
    tls_key: PathBuf,
    metrics_port: String,
    keep_alive: bool,
    no_delay: bool,
}

/// Owns the plaintext, TLS and metrics listeners and their shared shutdown signal.
pub struct Server {
    settings: Arc<ListenerSettings>,
    proxy: Proxy,
    prometheus: Option<PrometheusHandle>,
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl Server {
    /// The metrics listener only runs when `prometheus` is set and metrics are enabled.
    pub fn new(cfg: &Config, metrics: SharedMetrics, prometheus: Option<PrometheusHandle>) -> Self {
        let prometheus = prometheus.filter(|_| cfg.metrics_enabled);

        let mut kinds = vec![ListenerKind::Plain];
        if cfg.tls_enabled {
            kinds.push(ListenerKind::Tls);
        }
        if prometheus.is_some() {
            kinds.push(ListenerKind::Metrics);
        }
        let listeners = kinds
            .into_iter()
            .map(|k| {
                let (tx, _) = watch::channel(ListenerStatus {
                    state: ListenerState::Starting,
                    local_addr: None,
                });
                (k, tx)
            })
            .collect();

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings: Arc::new(ListenerSettings {
                address: cfg.address.clone(),
                tls_address: cfg.tls_address.clone(),
                dst_address: cfg.dst_address.clone(),
                tls_cert: cfg.tls_public_key.clone(),
                tls_key: cfg.tls_private_key.clone(),
                metrics_port: cfg.metrics_port.clone(),
                keep_alive: cfg.keep_alive,
                no_delay: cfg.no_delay,
            }),
            proxy: Proxy::new(ProxyOptions::from_config(cfg, metrics)),
            prometheus,
            shared: Arc::new(Shared {
                shutdown_tx,
                listeners,
                fatal: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns every configured accept loop. Listener errors surface through [`Server::wait`].
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("server: start called twice; ignoring");
            return;
        }

        self.spawn_primary(ListenerKind::Plain);
        if self.shared.listeners.contains_key(&ListenerKind::Tls) {
            self.spawn_primary(ListenerKind::Tls);
        }
        if let Some(handle) = self.prometheus.clone() {
            self.spawn_metrics(handle);
        }
    }

    fn spawn_primary(&self, kind: ListenerKind) {
        let settings = self.settings.clone();
        let proxy = self.proxy.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let shutdown = shared.shutdown_tx.subscribe();
            let res = match kind {
                ListenerKind::Tls => serve_tls(&settings, proxy, &shared, shutdown).await,
                _ => serve_plain(&settings, proxy, &shared, shutdown).await,
            };
            if let Err(err) = res {
                shared.fail(kind, err);
            }
            shared.set_state(kind, ListenerState::Stopped);
            tracing::info!(listener = %kind, "server: listener stopped");
        });
    }

    fn spawn_metrics(&self, handle: PrometheusHandle) {
        let settings = self.settings.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let kind = ListenerKind::Metrics;
            let shutdown = shared.shutdown_tx.subscribe();
            match bind(kind, &settings.metrics_port).await {
                Ok(ln) => {
                    if let Ok(addr) = ln.local_addr() {
                        shared.set_listening(kind, addr);
                    }
                    if let Err(err) = admin::serve_with_shutdown(ln, handle, shutdown).await {
                        tracing::error!(listener = %kind, err = %err, "server: metrics listener failed");
                    }
                }
                // Never fatal for the proxy listeners.
                Err(err) => {
                    tracing::error!(listener = %kind, err = %err, "server: metrics listener failed");
                }
            }
            shared.set_state(kind, ListenerState::Stopped);
        });
    }

    /// Signals every accept loop to exit and waits for the plaintext and TLS loops.
    ///
    /// Sessions already relaying keep running; they are not tracked.
    pub async fn stop(&self) {
        tracing::info!("server: shutting down");
        self.shared.shutdown_tx.send_replace(true);

        if !self.started.load(Ordering::SeqCst) {
            for kind in self.shared.listeners.keys() {
                self.shared.set_state(*kind, ListenerState::Stopped);
            }
            return;
        }
        self.wait_primary_stopped().await;
        tracing::info!("server: all listeners stopped");
    }

    /// Resolves once the plaintext and TLS loops have exited, yielding the first fatal
    /// listener error. The error is handed out once.
    pub async fn wait(&self) -> Result<(), ListenError> {
        self.wait_primary_stopped().await;
        let fatal = self.shared.fatal.lock().ok().and_then(|mut slot| slot.take());
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The bound address once `kind` is listening, or `None` if it is not configured or
    /// stopped before listening.
    pub async fn wait_listening(&self, kind: ListenerKind) -> Option<SocketAddr> {
        let mut rx = self.shared.listeners.get(&kind)?.subscribe();
        let status = *rx
            .wait_for(|s| s.state != ListenerState::Starting)
            .await
            .ok()?;
        match status.state {
            ListenerState::Listening => status.local_addr,
            _ => None,
        }
    }

    pub fn state(&self, kind: ListenerKind) -> Option<ListenerState> {
        self.shared.listeners.get(&kind).map(|tx| tx.borrow().state)
    }

    async fn wait_primary_stopped(&self) {
        for (kind, tx) in &self.shared.listeners {
            if !kind.is_primary() {
                continue;
            }
            let mut rx = tx.subscribe();
            let _ = rx.wait_for(|s| s.state == ListenerState::Stopped).await;
        }
    }
}

async fn bind(kind: ListenerKind, addr: &str) -> Result<TcpListener, ListenError> {
    let bind_addr = net::normalize_bind_addr(addr);
    let resolved = tokio::net::lookup_host(bind_addr.as_ref())
        .await
        .map_err(|source| ListenError::Resolve {
            listener: kind.as_str(),
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ListenError::Resolve {
            listener: kind.as_str(),
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        })?;

    TcpListener::bind(resolved)
        .await
        .map_err(|source| ListenError::Bind {
            listener: kind.as_str(),
            addr: addr.to_string(),
            source,
        })
}

async fn accept_failed(kind: ListenerKind, err: &io::Error) {
    tracing::error!(listener = %kind, err = %err, "server: accept failed");
    time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Bounded-poll accept loop: each accept waits at most [`ACCEPT_POLL_INTERVAL`] so the
/// shutdown flag is observed within one interval.
async fn serve_plain(
    settings: &ListenerSettings,
    proxy: Proxy,
    shared: &Shared,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ListenError> {
    let kind = ListenerKind::Plain;
    let ln = bind(kind, &settings.address).await?;
    let local = ln.local_addr().ok();
    if let Some(addr) = local {
        shared.set_listening(kind, addr);
    }
    tracing::info!(
        listener = %kind,
        address = %settings.address,
        local_addr = ?local,
        redirect = %settings.dst_address,
        "server: listening"
    );

    while !*shutdown.borrow() {
        let (conn, peer) = match time::timeout(ACCEPT_POLL_INTERVAL, ln.accept()).await {
            Err(_) => continue,
            Ok(Err(err)) => {
                accept_failed(kind, &err).await;
                continue;
            }
            Ok(Ok(v)) => v,
        };

        if let Err(err) = net::configure_stream(&conn, settings.keep_alive, settings.no_delay) {
            tracing::error!(listener = %kind, client = %peer, err = %err, "server: configure connection failed");
            continue;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(listener = %kind, client = %peer, "server: accepted");
        }
        let p = proxy.clone();
        tokio::spawn(async move { p.handle_plain(conn).await });
    }

    shared.set_state(kind, ListenerState::ShuttingDown);
    tracing::info!(listener = %kind, "server: shutting down listener");
    Ok(())
}

/// Accept loop that races accept against the shutdown signal; no polling.
async fn serve_tls(
    settings: &ListenerSettings,
    proxy: Proxy,
    shared: &Shared,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ListenError> {
    let kind = ListenerKind::Tls;
    let acceptor = tls::load_acceptor(&settings.tls_cert, &settings.tls_key)?;
    let ln = bind(kind, &settings.tls_address).await?;
    let local = ln.local_addr().ok();
    if let Some(addr) = local {
        shared.set_listening(kind, addr);
    }
    tracing::info!(
        listener = %kind,
        address = %settings.tls_address,
        local_addr = ?local,
        redirect = %settings.dst_address,
        "server: listening"
    );

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                match res {
                    Ok((conn, peer)) => {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            tracing::debug!(listener = %kind, client = %peer, "server: accepted");
                        }
                        let p = proxy.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move { p.handle_tls(conn, acceptor).await });
                    }
                    Err(err) => accept_failed(kind, &err).await,
                }
            }
        }
    }

    shared.set_state(kind, ListenerState::ShuttingDown);
    tracing::info!(listener = %kind, "server: shutting down listener");
    Ok(())
}
