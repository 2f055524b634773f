use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf},
    task::JoinSet,
    time,
};

use crate::wsbridge::{error::ProxyError, telemetry::SharedMetrics};

/// Upper bound on the write-side close after a direction reaches EOF.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pin_project! {
    /// Reports every chunk read from `inner` to the metrics sink.
    pub struct CountingReader<R> {
        #[pin]
        inner: R,
        direction: Direction,
        metrics: SharedMetrics,
    }
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, direction: Direction, metrics: SharedMetrics) -> Self {
        Self {
            inner,
            direction,
            metrics,
        }
    }
}

impl<R: AsyncRead> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.metrics.record_bytes_transferred(*this.direction, n as u64);
            }
        }
        res
    }
}

/// The direction that finished first and how many bytes it moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub direction: Direction,
    pub bytes: u64,
}

/// Splices `client` and `backend` until the first direction finishes.
///
/// Each direction runs on its own task. Whichever completes first (EOF or error) decides the
/// result; the other task is aborted when this returns, so bytes still in flight on the open
/// direction are dropped.
pub async fn relay<C, B>(
    client: C,
    backend: B,
    buffer_size: usize,
    metrics: SharedMetrics,
) -> Result<Completion, ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (backend_r, backend_w) = tokio::io::split(backend);

    // Dropping the set aborts whichever copy is still running.
    let mut tasks = JoinSet::new();
    tasks.spawn(copy_direction(
        client_r,
        backend_w,
        Direction::ClientToBackend,
        buffer_size,
        metrics.clone(),
    ));
    tasks.spawn(copy_direction(
        backend_r,
        client_w,
        Direction::BackendToClient,
        buffer_size,
        metrics,
    ));

    let (direction, res) = match tasks.join_next().await {
        Some(Ok(done)) => done,
        Some(Err(join_err)) => return Err(ProxyError::RelayTask(io::Error::other(join_err))),
        None => return Err(ProxyError::RelayTask(io::Error::other("no copy task ran"))),
    };

    match res {
        Ok(bytes) => {
            tracing::debug!(direction = %direction, bytes, "relay: transfer completed");
            Ok(Completion { direction, bytes })
        }
        Err(source) => Err(ProxyError::Relay { direction, source }),
    }
}

async fn copy_direction<R, W>(
    reader: R,
    mut writer: W,
    direction: Direction,
    buffer_size: usize,
    metrics: SharedMetrics,
) -> (Direction, io::Result<u64>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(
        buffer_size.max(1),
        CountingReader::new(reader, direction, metrics),
    );
    let res = tokio::io::copy_buf(&mut reader, &mut writer).await;
    // A TLS close_notify can stall on a peer that stopped reading.
    if res.is_ok() && time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await.is_err() {
        tracing::debug!(direction = %direction, "relay: write shutdown timed out");
    }
    (direction, res)
}
