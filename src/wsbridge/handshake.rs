use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

use crate::wsbridge::error::ProxyError;

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Key the upgrade response is derived from. The client's own key is never read.
pub const WEBSOCKET_KEY: &str = "Y2FmcnQ2NTRlY2Z2Z3ludTg=";

pub const DISCARD_BUFFER_SIZE: usize = 32 * 1024;
pub const MIN_PAYLOAD_BYTES: usize = 5;

/// `base64(sha1(key + GUID))`, the `Sec-WebSocket-Accept` derivation.
pub fn websocket_accept_key(key: &str) -> String {
    let mut h = Sha1::new();
    h.update(key.as_bytes());
    h.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(h.finalize())
}

/// The fixed response written to every client before its payload is relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    response: Vec<u8>,
}

impl Handshake {
    /// An empty `custom_code` selects the WebSocket upgrade response.
    pub fn new(custom_code: &str) -> Self {
        if custom_code.is_empty() {
            return Self::websocket();
        }
        Self {
            response: format!("HTTP/1.1 {custom_code} Ok\r\n\r\n").into_bytes(),
        }
    }

    pub fn websocket() -> Self {
        let accept = websocket_accept_key(WEBSOCKET_KEY);
        Self {
            response: format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\r\n"
            )
            .into_bytes(),
        }
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Writes the response. Nothing is read from `conn`.
    pub async fn perform<W>(&self, conn: &mut W) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        conn.write_all(self.response())
            .await
            .map_err(ProxyError::Handshake)?;
        conn.flush().await.map_err(ProxyError::Handshake)
    }
}

/// Reads and drops the client's opening payload (at least [`MIN_PAYLOAD_BYTES`], at most
/// [`DISCARD_BUFFER_SIZE`]). A zero `timeout` waits indefinitely.
pub async fn discard_payload<R>(conn: &mut R, timeout: Duration) -> Result<usize, ProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let fut = async {
        let mut buf = vec![0u8; DISCARD_BUFFER_SIZE];
        let mut filled = 0usize;
        while filled < MIN_PAYLOAD_BYTES {
            let n = conn
                .read(&mut buf[filled..])
                .await
                .map_err(ProxyError::PayloadDiscard)?;
            if n == 0 {
                return Err(ProxyError::PayloadDiscard(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("eof after {filled} of {MIN_PAYLOAD_BYTES} bytes"),
                )));
            }
            filled += n;
        }
        Ok(filled)
    };

    if timeout > Duration::from_millis(0) {
        time::timeout(timeout, fut)
            .await
            .map_err(|_| ProxyError::PayloadTimeout(timeout))?
    } else {
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEBSOCKET_RESPONSE: &str = "HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: SjHtBVMgyBRvoUUIjz1rGj0nK0g=\r\n\r\n";

    #[test]
    fn accept_key_matches_rfc6455_sample() {
        assert_eq!(
            websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn websocket_response_is_fixed() {
        let hs = Handshake::new("");
        assert_eq!(hs, Handshake::websocket());

        for _ in 0..3 {
            let mut out: Vec<u8> = Vec::new();
            hs.perform(&mut out).await.unwrap();
            assert_eq!(std::str::from_utf8(&out).unwrap(), WEBSOCKET_RESPONSE);
        }
    }

    #[tokio::test]
    async fn custom_code_is_written_verbatim() {
        for code in ["200", "101", "403", "204 No"] {
            let mut out: Vec<u8> = Vec::new();
            Handshake::new(code).perform(&mut out).await.unwrap();
            assert_eq!(out, format!("HTTP/1.1 {code} Ok\r\n\r\n").into_bytes());
        }
    }

    #[tokio::test]
    async fn handshake_leaves_client_bytes_unread() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        Handshake::new("200").perform(&mut server).await.unwrap();

        let mut resp = vec![0u8; b"HTTP/1.1 200 Ok\r\n\r\n".len()];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, b"HTTP/1.1 200 Ok\r\n\r\n");

        let mut pending = vec![0u8; 16];
        server.read_exact(&mut pending).await.unwrap();
        assert_eq!(pending, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn handshake_write_failure_is_reported() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);
        let err = Handshake::websocket().perform(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn discard_needs_five_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = discard_payload(&mut server, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, ProxyError::PayloadDiscard(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn discard_accepts_split_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            client.write_all(b"ab").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"cdefg").await.unwrap();
            client
        });

        let n = discard_payload(&mut server, Duration::from_secs(2)).await.unwrap();
        assert!(n >= MIN_PAYLOAD_BYTES);
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn discard_caps_at_buffer_size() {
        let (mut client, mut server) = tokio::io::duplex(2 * DISCARD_BUFFER_SIZE);
        client
            .write_all(&vec![7u8; DISCARD_BUFFER_SIZE + 100])
            .await
            .unwrap();

        let n = discard_payload(&mut server, Duration::ZERO).await.unwrap();
        assert!(n <= DISCARD_BUFFER_SIZE);

        // Whatever exceeded the buffer is still in the stream.
        let mut rest = vec![0u8; DISCARD_BUFFER_SIZE + 100 - n];
        server.read_exact(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn discard_times_out_on_short_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"ab").await.unwrap();

        let err = discard_payload(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PayloadTimeout(_)), "got {err:?}");
        drop(client);
    }
}
