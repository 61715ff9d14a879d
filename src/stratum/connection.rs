//! TCP/TLS connection management with line-delimited I/O.
//!
//! Stratum uses newline-delimited JSON over TCP, optionally inside TLS.
//! This module wraps the socket in buffered readers/writers that read and
//! write complete frames. The [`Transport`] trait abstracts frame I/O,
//! allowing channel-based mocks for deterministic testing.
//!
//! TLS uses rustls with peer verification. On Unix the trust store is the
//! CA bundle named by `SSL_CERT_FILE` (default
//! `/etc/ssl/certs/ca-certificates.crt`), falling back to the built-in
//! webpki anchors when the bundle cannot be read; on Windows the system
//! ROOT store is used.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::{self, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::error::{StratumError, StratumResult};
use super::messages::RpcEnvelope;
use crate::endpoint::{Endpoint, SecureLevel};

/// TCP keepalive time. Half-dead pools surface as read errors within this
/// window instead of hanging the connection indefinitely.
const KEEPALIVE_TIME: Duration = Duration::from_secs(10);

#[cfg(unix)]
const DEFAULT_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Frame-level I/O for the Stratum protocol.
///
/// Abstracts reading and writing JSON frames so the client can run over
/// TCP/TLS (production) or channels (tests).
#[async_trait]
pub trait Transport: Send {
    /// Read one complete frame.
    ///
    /// Returns `None` on clean connection close (EOF). An unparsable line
    /// yields [`StratumError::InvalidMessage`]; the line is consumed and
    /// the connection remains usable.
    async fn read_message(&mut self) -> StratumResult<Option<RpcEnvelope>>;

    /// Write one frame.
    async fn write_message(&mut self, msg: &Value) -> StratumResult<()>;
}

/// Marker for byte streams the connection can wrap.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Buffered connection to a pool, plain TCP or TLS.
pub struct Connection {
    reader: BufReader<ReadHalf<Box<dyn Stream>>>,
    writer: BufWriter<WriteHalf<Box<dyn Stream>>>,
    line_buf: String,
}

impl Connection {
    fn new(stream: Box<dyn Stream>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            line_buf: String::with_capacity(4096),
        }
    }

    /// Connect to one resolved address of the endpoint.
    ///
    /// Establishes the TCP stream, applies keepalive and no-delay, and on
    /// secured endpoints runs the TLS handshake with peer verification.
    /// Both the connect and the handshake are bounded by `dial_timeout`.
    pub async fn dial(
        endpoint: &Endpoint,
        addr: SocketAddr,
        dial_timeout: Duration,
    ) -> StratumResult<Self> {
        debug!(%addr, "Trying address");

        let stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| StratumError::Timeout)?
            .map_err(|e| StratumError::ConnectionFailed(e.to_string()))?;

        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;

        match endpoint.sec_level() {
            SecureLevel::None => Ok(Self::new(Box::new(stream))),
            level => {
                let connector = tls_connector(level)?;
                let server_name = ServerName::try_from(endpoint.host()).map_err(|e| {
                    StratumError::TlsHandshake(format!("invalid server name: {}", e))
                })?;

                let tls = timeout(dial_timeout, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| StratumError::TlsHandshake("handshake timed out".to_string()))?
                    .map_err(|e| {
                        if is_certificate_error(&e) {
                            log_certificate_guidance();
                        }
                        StratumError::TlsHandshake(e.to_string())
                    })?;

                Ok(Self::new(Box::new(tls)))
            }
        }
    }

    /// Flush and close the write side. On TLS this sends close_notify; the
    /// caller bounds the exchange with a timeout.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<RpcEnvelope>> {
        loop {
            self.line_buf.clear();

            let n = self.reader.read_line(&mut self.line_buf).await?;
            if n == 0 {
                return Ok(None);
            }

            let line = self.line_buf.trim();
            if line.is_empty() {
                continue;
            }

            trace!(rx = %line, "Received frame");

            let msg = serde_json::from_str(line).map_err(|e| {
                StratumError::InvalidMessage(format!("{}, line: {}", e, line))
            })?;

            return Ok(Some(msg));
        }
    }

    async fn write_message(&mut self, msg: &Value) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        trace!(tx = %json, "Sending frame");

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Build a TLS connector for the requested security level.
fn tls_connector(level: SecureLevel) -> StratumResult<TlsConnector> {
    let roots = load_root_store();
    let config = match level {
        SecureLevel::Tls12 => ClientConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS12])
            .map_err(|e| StratumError::TlsHandshake(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth(),
        _ => ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Assemble the trust store for peer verification.
fn load_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    #[cfg(unix)]
    {
        let path = std::env::var("SSL_CERT_FILE")
            .unwrap_or_else(|_| DEFAULT_CA_BUNDLE.to_string());
        match read_ca_bundle(&path) {
            Ok(certs) => {
                let (added, _) = roots.add_parsable_certificates(&certs);
                if added > 0 {
                    return roots;
                }
                warn!(path = %path, "CA bundle contained no usable certificates");
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load CA certificates");
                warn!(
                    "Either the file does not exist or the environment variable \
                     SSL_CERT_FILE is set to an invalid or inaccessible file"
                );
            }
        }
        warn!("Falling back to built-in trust anchors; certificate verification may fail");
    }

    #[cfg(windows)]
    {
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let der: Vec<Vec<u8>> = certs.into_iter().map(|c| c.0).collect();
                let (added, _) = roots.add_parsable_certificates(&der);
                if added > 0 {
                    return roots;
                }
            }
            Err(e) => warn!(error = %e, "Failed to load the system ROOT store"),
        }
    }

    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.as_ref().to_vec(),
            ta.subject_public_key_info.as_ref().to_vec(),
            ta.name_constraints.clone().map(|c| c.as_ref().to_vec()),
        )
    }));
    roots
}

#[cfg(unix)]
fn read_ca_bundle(path: &str) -> std::io::Result<Vec<Vec<u8>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
}

fn is_certificate_error(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false)
}

fn log_certificate_guidance() {
    warn!("Certificate verification failed. This can have multiple reasons:");
    warn!("* Root certs are either not installed or not found");
    warn!("* Pool uses a self-signed certificate");
    warn!("Possible fixes:");
    warn!("* Make sure the CA bundle exists and is accessible");
    warn!("* Export the correct path via 'export SSL_CERT_FILE=...'");
    warn!("* On most systems you can install the 'ca-certificates' package");
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// client's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<Value>,
    tx: tokio::sync::mpsc::UnboundedSender<Value>,
}

/// Test-side handle for a [`MockTransport`].
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Value>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Value>,
}

#[cfg(test)]
impl MockTransport {
    /// Create a linked (transport, handle) pair.
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = MockTransport {
            rx: client_rx,
            tx: client_tx,
        };
        let handle = MockTransportHandle {
            tx: handle_tx,
            rx: handle_rx,
        };
        (transport, handle)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<RpcEnvelope>> {
        match self.rx.recv().await {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StratumError::InvalidMessage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn write_message(&mut self, msg: &Value) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Feed a frame to the client.
    pub fn send(&self, msg: Value) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a frame the client wrote.
    pub async fn recv(&mut self) -> Value {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Check for a frame without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(Box::new(socket));
            loop {
                match conn.read_message().await {
                    Ok(Some(msg)) => {
                        let value = json!({
                            "id": msg.id(),
                            "result": msg.method(),
                            "error": null
                        });
                        conn.write_message(&value).await.unwrap();
                    }
                    Ok(None) => break,
                    Err(StratumError::InvalidMessage(_)) => {
                        conn.write_message(&json!({"id": 0, "result": "bad", "error": null}))
                            .await
                            .unwrap();
                    }
                    Err(_) => break,
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let addr = echo_server().await;
        let endpoint =
            Endpoint::from_uri(&format!("stratum+tcp://u:p@{}:{}", addr.ip(), addr.port()))
                .unwrap();

        let mut conn = Connection::dial(&endpoint, addr, Duration::from_secs(5))
            .await
            .unwrap();

        let request = json!({"id": 7, "method": "test.method", "params": []});
        conn.write_message(&request).await.unwrap();

        let reply = conn.read_message().await.unwrap().unwrap();
        assert_eq!(reply.id(), 7);
        assert_eq!(reply.result, json!("test.method"));
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"this is not json\n").await.unwrap();
            socket
                .write_all(b"{\"id\":1,\"result\":true,\"error\":null}\n")
                .await
                .unwrap();
            // Hold the socket open until the client is done reading.
            let mut buf = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
        });

        let endpoint =
            Endpoint::from_uri(&format!("stratum+tcp://u:p@{}:{}", addr.ip(), addr.port()))
                .unwrap();
        let mut conn = Connection::dial(&endpoint, addr, Duration::from_secs(5))
            .await
            .unwrap();

        // First line fails to parse but does not kill the connection.
        assert!(matches!(
            conn.read_message().await,
            Err(StratumError::InvalidMessage(_))
        ));

        // Next frame comes through fine.
        let msg = conn.read_message().await.unwrap().unwrap();
        assert_eq!(msg.id(), 1);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind and drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint =
            Endpoint::from_uri(&format!("stratum+tcp://u:p@{}:{}", addr.ip(), addr.port()))
                .unwrap();
        let result = Connection::dial(&endpoint, addr, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(StratumError::ConnectionFailed(_)) | Err(StratumError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_mock_transport_pair() {
        let (mut transport, mut handle) = MockTransport::pair();

        transport
            .write_message(&json!({"id": 1, "method": "m", "params": []}))
            .await
            .unwrap();
        let seen = handle.recv().await;
        assert_eq!(seen["id"], 1);

        handle.send(json!({"id": 1, "result": true, "error": null}));
        let msg = transport.read_message().await.unwrap().unwrap();
        assert!(msg.is_success());

        assert!(handle.try_recv().is_none());
    }
}
