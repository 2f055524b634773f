use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{self, Instant},
};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::wsbridge::{
    config::{Config, TlsMode},
    error::ProxyError,
    handshake::{Handshake, discard_payload},
    relay::{Completion, relay},
    telemetry::{self, SharedMetrics},
};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STUNNEL_DURATION_KIND: &str = "tls-stunnel";

/// Which listener accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Plain,
    Tls,
}

impl Origin {
    /// Connection type label.
    pub fn kind(self) -> &'static str {
        match self {
            Origin::Plain => "http",
            Origin::Tls => "tls",
        }
    }
}

/// Lowers the active-connection gauge however the session ends.
struct SessionGuard {
    metrics: SharedMetrics,
}

impl SessionGuard {
    fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.record_connection_closed();
    }
}

pub struct ProxyOptions {
    pub handshake: Handshake,
    pub dst_addr: String,
    pub dial_timeout: Duration,
    /// Zero waits indefinitely for the opening payload.
    pub payload_timeout: Duration,
    pub tls_mode: TlsMode,
    pub buffer_size: usize,
    pub metrics: SharedMetrics,
}

impl ProxyOptions {
    pub fn from_config(cfg: &Config, metrics: SharedMetrics) -> Self {
        Self {
            handshake: Handshake::new(&cfg.handshake_code),
            dst_addr: cfg.dst_address.clone(),
            dial_timeout: cfg.timeout,
            payload_timeout: cfg.payload_timeout,
            tls_mode: cfg.tls_mode,
            buffer_size: cfg.buffer_size,
            metrics,
        }
    }
}

/// Per-connection orchestration: handshake, dial, optional payload discard, relay.
#[derive(Clone)]
pub struct Proxy {
    opts: Arc<ProxyOptions>,
}

impl Proxy {
    pub fn new(opts: ProxyOptions) -> Self {
        Self {
            opts: Arc::new(opts),
        }
    }

    pub async fn handle_plain(&self, conn: TcpStream) {
        let client = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        self.handle(conn, Origin::Plain, &client).await;
    }

    /// Runs one session over an already-accepted stream.
    pub async fn handle<S>(&self, conn: S, origin: Origin, client: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sid = telemetry::new_session_id();
        let _session = SessionGuard::new(self.opts.metrics.clone());
        let span = tracing::debug_span!("session", sid = %sid, client = %client, listener = origin.kind());

        let res = self.serve_session(conn, origin).instrument(span).await;
        log_outcome(&sid, client, origin, &res);
    }

    /// Terminates TLS, then runs the session over the decrypted stream.
    pub async fn handle_tls(&self, conn: TcpStream, acceptor: TlsAcceptor) {
        let sid = telemetry::new_session_id();
        let client = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let _session = SessionGuard::new(self.opts.metrics.clone());
        let span = tracing::debug_span!("session", sid = %sid, client = %client, listener = Origin::Tls.kind());

        let res: Result<Completion, ProxyError> = async {
            let tls = acceptor
                .accept(conn)
                .await
                .map_err(|e| self.failed(Origin::Tls, ProxyError::TlsAccept(e)))?;
            self.serve_session(tls, Origin::Tls).await
        }
        .instrument(span)
        .await;
        log_outcome(&sid, &client, Origin::Tls, &res);
    }

    /// Handshake, dial, discard and relay for one client stream.
    ///
    /// Records the connection status exactly once. The caller owns the closed-gauge guard.
    pub async fn serve_session<S>(&self, mut conn: S, origin: Origin) -> Result<Completion, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let opts = &*self.opts;
        let started = Instant::now();

        // Written on every path, stunnel included.
        if let Err(err) = opts.handshake.perform(&mut conn).await {
            return Err(self.failed(origin, err));
        }

        let backend = match self.dial().await {
            Ok(b) => b,
            Err(err) => return Err(self.failed(origin, err)),
        };
        opts.metrics.record_connection(origin.kind(), STATUS_SUCCESS);
        tracing::debug!(dst = %opts.dst_addr, "proxy: backend connected");

        let stunnel = origin == Origin::Tls && opts.tls_mode == TlsMode::Stunnel;
        if !stunnel {
            match discard_payload(&mut conn, opts.payload_timeout).await {
                Ok(n) => tracing::debug!(bytes = n, "proxy: discarded initial payload"),
                Err(err) => {
                    opts.metrics.record_error(err.kind(), &err.to_string());
                    return Err(err);
                }
            }
        }

        let res = relay(conn, backend, opts.buffer_size, opts.metrics.clone()).await;

        let duration_kind = if stunnel {
            STUNNEL_DURATION_KIND
        } else {
            origin.kind()
        };
        opts.metrics
            .record_connection_duration(duration_kind, started.elapsed().as_secs_f64());

        if let Err(err) = &res {
            opts.metrics.record_error(err.kind(), &err.to_string());
        }
        res
    }

    async fn dial(&self) -> Result<TcpStream, ProxyError> {
        let addr = self.opts.dst_addr.as_str();
        let timeout = self.opts.dial_timeout;
        let connect = TcpStream::connect(addr);

        let res = if timeout > Duration::from_millis(0) {
            time::timeout(timeout, connect)
                .await
                .map_err(|_| ProxyError::DialTimeout {
                    addr: addr.to_string(),
                    timeout,
                })?
        } else {
            connect.await
        };
        res.map_err(|source| ProxyError::Dial {
            addr: addr.to_string(),
            source,
        })
    }

    fn failed(&self, origin: Origin, err: ProxyError) -> ProxyError {
        let metrics = &self.opts.metrics;
        metrics.record_error(err.kind(), &err.to_string());
        metrics.record_connection(origin.kind(), STATUS_FAILED);
        err
    }
}

fn log_outcome(sid: &str, client: &str, origin: Origin, res: &Result<Completion, ProxyError>) {
    match res {
        Ok(done) => {
            tracing::info!(
                sid = %sid,
                client = %client,
                listener = origin.kind(),
                direction = %done.direction,
                bytes = done.bytes,
                "proxy: session closed"
            );
        }
        Err(err @ (ProxyError::Dial { .. } | ProxyError::DialTimeout { .. })) => {
            tracing::warn!(sid = %sid, client = %client, listener = origin.kind(), err = %err, "proxy: backend dial failed");
        }
        Err(err) => {
            tracing::debug!(sid = %sid, client = %client, listener = origin.kind(), err = %err, "proxy: session ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::atomic::Ordering};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        net::TcpListener,
    };

    use super::*;
    use crate::wsbridge::{
        telemetry::testing::CountingMetrics,
        tls::{self, testing::*},
    };

    const BANNER: &[u8] = b"SSH-2.0-stub\r\n";

    /// Backend that greets with [`BANNER`] and then echoes.
    async fn echo_backend() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if conn.write_all(BANNER).await.is_err() {
                        return;
                    }
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);
        addr
    }

    fn proxy(code: &str, dst: SocketAddr, mode: TlsMode, metrics: Arc<CountingMetrics>) -> Proxy {
        Proxy::new(ProxyOptions {
            handshake: Handshake::new(code),
            dst_addr: dst.to_string(),
            dial_timeout: Duration::from_secs(2),
            payload_timeout: Duration::ZERO,
            tls_mode: mode,
            buffer_size: 4096,
            metrics,
        })
    }

    async fn read_exactly<R: AsyncRead + Unpin>(r: &mut R, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        r.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn websocket_session_discards_payload_then_relays() {
        let backend = echo_backend().await;
        let metrics = Arc::new(CountingMetrics::default());
        let p = proxy("", backend, TlsMode::Handshake, metrics.clone());

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let server = {
            let p = p.clone();
            tokio::spawn(async move {
                let (conn, _) = ln.accept().await.unwrap();
                p.handle_plain(conn).await;
            })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        let expected = Handshake::websocket();
        let resp = read_exactly(&mut client, expected.response().len()).await;
        assert_eq!(resp, expected.response());

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n")
            .await
            .unwrap();
        // The banner only arrives once the relay runs, so the payload is gone by then.
        assert_eq!(read_exactly(&mut client, BANNER.len()).await, BANNER);

        client.write_all(b"hello").await.unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"hello");

        drop(client);
        server.await.unwrap();

        assert_eq!(metrics.statuses(), vec![("http", "success")]);
        assert_eq!(metrics.durations(), vec!["http"]);
        assert_eq!(metrics.active(), 0);
        assert_eq!(metrics.closed.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.client_to_backend.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn stunnel_tls_session_skips_discard() {
        let backend = echo_backend().await;
        let metrics = Arc::new(CountingMetrics::default());
        let p = proxy("200", backend, TlsMode::Stunnel, metrics.clone());

        let (dir, cert, key) = write_self_signed("stunnel");
        let acceptor = tls::load_acceptor(&cert, &key).unwrap();

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let server = {
            let p = p.clone();
            tokio::spawn(async move {
                let (conn, _) = ln.accept().await.unwrap();
                p.handle_tls(conn, acceptor).await;
            })
        };

        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut client = insecure_connector().connect(localhost(), tcp).await.unwrap();

        let resp = read_exactly(&mut client, b"HTTP/1.1 200 Ok\r\n\r\n".len()).await;
        assert_eq!(resp, b"HTTP/1.1 200 Ok\r\n\r\n");
        assert_eq!(read_exactly(&mut client, BANNER.len()).await, BANNER);

        // Fewer than five bytes: a discard step would stall here.
        client.write_all(b"hi").await.unwrap();
        client.flush().await.unwrap();
        assert_eq!(read_exactly(&mut client, 2).await, b"hi");

        client.shutdown().await.unwrap();
        drop(client);
        server.await.unwrap();

        assert_eq!(metrics.statuses(), vec![("tls", "success")]);
        assert_eq!(metrics.durations(), vec![STUNNEL_DURATION_KIND]);
        assert_eq!(metrics.active(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn payload_is_discarded_unless_tls_origin_uses_stunnel() {
        let backend = echo_backend().await;
        for (origin, mode) in [
            (Origin::Plain, TlsMode::Stunnel),
            (Origin::Tls, TlsMode::Handshake),
        ] {
            let metrics = Arc::new(CountingMetrics::default());
            let p = proxy("200", backend, mode, metrics.clone());

            let (mut client, server_side) = duplex(4096);
            let session = tokio::spawn(async move { p.serve_session(server_side, origin).await });

            let resp = read_exactly(&mut client, b"HTTP/1.1 200 Ok\r\n\r\n".len()).await;
            assert_eq!(resp, b"HTTP/1.1 200 Ok\r\n\r\n");

            client.write_all(b"PAYLOADxyz").await.unwrap();
            // The banner only flows once the relay runs, after the discard.
            assert_eq!(read_exactly(&mut client, BANNER.len()).await, BANNER);

            client.write_all(b"hello").await.unwrap();
            assert_eq!(
                read_exactly(&mut client, 5).await,
                b"hello",
                "{origin:?}/{mode}: payload leaked to the backend"
            );

            drop(client);
            session.await.unwrap().unwrap();

            assert_eq!(metrics.statuses(), vec![(origin.kind(), "success")]);
            assert_eq!(metrics.durations(), vec![origin.kind()]);
            assert_eq!(metrics.client_to_backend.load(Ordering::SeqCst), 5);
        }
    }

    #[tokio::test]
    async fn unreachable_backend_records_destination_failure() {
        let dst = closed_port().await;
        let metrics = Arc::new(CountingMetrics::default());
        let p = proxy("200", dst, TlsMode::Handshake, metrics.clone());

        let (mut client, server_side) = duplex(1024);
        let res = p.serve_session(server_side, Origin::Plain).await;
        let err = res.unwrap_err();
        assert_eq!(err.kind(), "destination");

        // The handshake still went out first.
        let resp = read_exactly(&mut client, b"HTTP/1.1 200 Ok\r\n\r\n".len()).await;
        assert_eq!(resp, b"HTTP/1.1 200 Ok\r\n\r\n");

        assert_eq!(metrics.statuses(), vec![("http", "failed")]);
        assert_eq!(metrics.errors(), vec!["destination"]);
        assert!(metrics.durations().is_empty(), "relay must not start");
        assert_eq!(metrics.client_to_backend.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dial_timeout_is_a_destination_error() {
        let metrics = Arc::new(CountingMetrics::default());
        let p = Proxy::new(ProxyOptions {
            handshake: Handshake::new("200"),
            // TEST-NET-1, never routed.
            dst_addr: "192.0.2.1:22".to_string(),
            dial_timeout: Duration::from_millis(100),
            payload_timeout: Duration::ZERO,
            tls_mode: TlsMode::Handshake,
            buffer_size: 4096,
            metrics: metrics.clone(),
        });

        let (_client, server_side) = duplex(1024);
        let started = std::time::Instant::now();
        let err = p.serve_session(server_side, Origin::Plain).await.unwrap_err();
        assert_eq!(err.kind(), "destination");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(metrics.statuses(), vec![("http", "failed")]);
    }

    #[tokio::test]
    async fn closed_gauge_matches_every_outcome() {
        let backend = echo_backend().await;
        let dead = closed_port().await;
        let metrics = Arc::new(CountingMetrics::default());
        let ok = proxy("", backend, TlsMode::Handshake, metrics.clone());
        let unreachable = proxy("", dead, TlsMode::Handshake, metrics.clone());

        // Handshake write fails: client already gone.
        let (client, server_side) = duplex(16);
        drop(client);
        ok.handle(server_side, Origin::Plain, "handshake-fail").await;

        // Dial fails.
        let (_client, server_side) = duplex(1024);
        unreachable.handle(server_side, Origin::Plain, "dial-fail").await;

        // Short payload then EOF.
        let (mut client, server_side) = duplex(1024);
        let peer = tokio::spawn(async move {
            client.write_all(b"ab").await.unwrap();
            let _ = read_exactly(&mut client, Handshake::websocket().response().len()).await;
        });
        ok.handle(server_side, Origin::Plain, "payload-fail").await;
        peer.await.unwrap();

        // Full session.
        let (mut client, server_side) = duplex(1024);
        let peer = tokio::spawn(async move {
            let _ = read_exactly(&mut client, Handshake::websocket().response().len()).await;
            client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            assert_eq!(read_exactly(&mut client, BANNER.len()).await, BANNER);
        });
        ok.handle(server_side, Origin::Plain, "success").await;
        peer.await.unwrap();

        // TLS handshake fails on a plaintext client.
        let (dir, cert, key) = write_self_signed("symmetry");
        let acceptor = tls::load_acceptor(&cert, &key).unwrap();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (conn, _) = ln.accept().await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        ok.handle_tls(conn, acceptor).await;
        let _ = std::fs::remove_dir_all(dir);

        assert_eq!(metrics.opened.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.closed.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.active(), 0);
        assert_eq!(
            metrics.statuses(),
            vec![
                ("http", "failed"),
                ("http", "failed"),
                ("http", "success"),
                ("http", "success"),
                ("tls", "failed"),
            ]
        );
        assert_eq!(
            metrics.errors(),
            vec!["handshake", "destination", "payload", "tls"]
        );
    }
}
