//! API server binding, with optional TLS.
//!
//! When TLS is enabled, a plain-HTTP client hitting the TLS port gets a
//! `400 Bad Request` instead of an opaque handshake failure.

use std::io;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::domain::models::config::ApiConfig;

use super::{router, ApiState};

// First byte of a TLS handshake record.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;
const PLAIN_HTTP_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

/// Wraps the rustls acceptor; peeks the first byte of each connection and
/// answers plain HTTP with 400 before closing.
#[derive(Clone)]
pub struct PlainHttpRejectAcceptor {
    inner: RustlsAcceptor,
}

impl PlainHttpRejectAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<S> Accept<TcpStream, S> for PlainHttpRejectAcceptor
where
    RustlsAcceptor: Accept<TcpStream, S>,
    <RustlsAcceptor as Accept<TcpStream, S>>::Future: Send + 'static,
    S: Send + 'static,
{
    type Stream = <RustlsAcceptor as Accept<TcpStream, S>>::Stream;
    type Service = <RustlsAcceptor as Accept<TcpStream, S>>::Service;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut first = [0u8; 1];
            let n = stream.peek(&mut first).await?;
            if n > 0 && first[0] != TLS_HANDSHAKE_BYTE {
                let mut stream = stream;
                let _ = stream.write_all(PLAIN_HTTP_RESPONSE).await;
                let _ = stream.shutdown().await;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "plain HTTP request on TLS port",
                ));
            }
            inner.accept(stream, service).await
        })
    }
}

/// Bind and serve the control API until the process shuts down.
pub async fn serve(state: ApiState, config: &ApiConfig) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if config.tls.enabled {
        let (cert, key) = match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => (cert, key),
            _ => bail!("TLS is enabled but cert_path/key_path are not set"),
        };
        let rustls = RustlsConfig::from_pem_file(cert, key)
            .await
            .with_context(|| format!("loading TLS material from {}", cert.display()))?;
        tracing::info!(target: "catsync::api", %addr, "serving control API over TLS");
        axum_server::bind(addr)
            .acceptor(PlainHttpRejectAcceptor::new(rustls))
            .serve(app.into_make_service())
            .await
            .context("API server failed")?;
    } else {
        tracing::info!(target: "catsync::api", %addr, "serving control API");
        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
            .context("API server failed")?;
    }
    Ok(())
}
