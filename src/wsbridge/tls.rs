use std::{fs, io::Cursor, path::Path, sync::Arc};

use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tokio_rustls::TlsAcceptor;

use crate::wsbridge::error::ListenError;

/// Builds the TLS listener's acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ListenError> {
    let cfg = load_server_config(cert_path, key_path)?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

/// TLS 1.2 and 1.3 only, no client auth, a single certificate.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ListenError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let cfg = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(cfg)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ListenError> {
    fs::read(path).map_err(|e| ListenError::TlsConfig(format!("read {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ListenError> {
    let data = read_pem(path)?;
    let mut rd = Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenError::TlsConfig(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ListenError::TlsConfig(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ListenError> {
    let data = read_pem(path)?;
    let mut rd = Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .map_err(|e| ListenError::TlsConfig(format!("parse {}: {e}", path.display())))?;
    let Some(k) = key else {
        return Err(ListenError::TlsConfig(format!(
            "no private key found in {}",
            path.display()
        )));
    };
    Ok(k)
}


#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{testing::*, *};

    #[test]
    fn loads_generated_pem_pair() {
        let (dir, cert, key) = write_self_signed("load");
        let cfg = load_server_config(&cert, &key).expect("valid pair");
        assert!(cfg.alpn_protocols.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn swapped_paths_are_rejected() {
        let (dir, cert, key) = write_self_signed("swap");
        let err = load_server_config(&key, &cert).unwrap_err();
        assert!(matches!(err, ListenError::TlsConfig(_)), "got {err:?}");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_files_are_reported_with_path() {
        let err = load_server_config(
            Path::new("/nonexistent/wsbridge/public.pem"),
            Path::new("/nonexistent/wsbridge/private.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/wsbridge/public.pem"));
    }

    #[tokio::test]
    async fn acceptor_completes_a_handshake() {
        let (dir, cert, key) = write_self_signed("accept");
        let acceptor = load_acceptor(&cert, &key).unwrap();

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = ln.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut client = insecure_connector().connect(localhost(), tcp).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        server.await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
