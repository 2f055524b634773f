use std::{io, time::Duration};

use thiserror::Error;

use crate::wsbridge::relay::Direction;

/// Per-connection failures. Each one is terminal for its session only.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("write handshake response: {0}")]
    Handshake(#[source] io::Error),

    #[error("tls handshake: {0}")]
    TlsAccept(#[source] io::Error),

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {addr}: timed out after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("discard initial payload: {0}")]
    PayloadDiscard(#[source] io::Error),

    #[error("discard initial payload: timed out after {0:?}")]
    PayloadTimeout(Duration),

    #[error("relay {direction}: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("relay task: {0}")]
    RelayTask(#[source] io::Error),
}

impl ProxyError {
    /// Label used for the `type` dimension of the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Handshake(_) => "handshake",
            ProxyError::TlsAccept(_) => "tls",
            ProxyError::Dial { .. } | ProxyError::DialTimeout { .. } => "destination",
            ProxyError::PayloadDiscard(_) | ProxyError::PayloadTimeout(_) => "payload",
            ProxyError::Relay { .. } | ProxyError::RelayTask(_) => "relay",
        }
    }
}

/// Fatal listener failures. These stop the whole server.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("{listener}: resolve {addr}: {source}")]
    Resolve {
        listener: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{listener}: bind {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("tls: {0}")]
    TlsConfig(String),
}

impl From<rustls::Error> for ListenError {
    fn from(err: rustls::Error) -> Self {
        ListenError::TlsConfig(err.to_string())
    }
}
