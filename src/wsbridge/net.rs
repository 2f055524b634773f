use std::{borrow::Cow, io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all interfaces". Rust's
/// `SocketAddr` parsing and Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Applies the configured keep-alive and no-delay options to an accepted socket.
pub fn configure_stream(conn: &TcpStream, keep_alive: bool, no_delay: bool) -> io::Result<()> {
    let sock = SockRef::from(conn);
    sock.set_keepalive(keep_alive)?;

    if keep_alive {
        let ka = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
        // Not every platform supports a period.
        if let Err(err) = sock.set_tcp_keepalive(&ka) {
            tracing::debug!(err = %err, "net: set keep-alive period failed");
        }
    }

    conn.set_nodelay(no_delay)
}
