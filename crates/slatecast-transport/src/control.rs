//! Single-client control server (TCP, optionally TLS 1.3).
//!
//! # Lifecycle
//!
//! ```text
//! 1. ControlServer::bind(port, tls)       TCP listener up
//! 2. server.accept().await                TLS handshake + CONFIG_REQUEST
//!       └─ returns PendingSession { peer, request }
//! 3. pending.send_profile(&profile)       CONFIG_RESPONSE
//!       └─ returns ControlSession + spawned reader loop
//! 4. session.poll_event()                 once per scheduler tick
//!       ├─ ControlEvent::KeyframeRequest
//!       └─ ControlEvent::Disconnected     (DISCONNECT, EOF or read error)
//! ```
//!
//! PING messages are echoed back as PONG by the reader loop itself; the
//! scheduler never sees them. Any deviation during the handshake (first
//! message not CONFIG_REQUEST, short read, TLS failure) surfaces as a
//! protocol error and the server returns to listening without emitting
//! media.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use slatecast_core::protocol::{frame_control_message, ConfigRequest, ControlMessageType, SessionProfile};
use slatecast_core::{Error, Result};

// ── TLS setup ─────────────────────────────────────────────────────────────────

/// Build a TLS 1.3 acceptor from PEM files.
///
/// Client certificates are verified iff `ca_file` is given. Returns
/// `ResourceUnavailable` when the certificate or key cannot be loaded;
/// the caller decides whether to fall back to plain TCP.
pub fn build_tls_acceptor(
    cert_file: &str,
    key_file: &str,
    ca_file: Option<&str>,
) -> Result<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let builder = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
    let config = match ca_file {
        Some(path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::unavailable(format!("bad CA certificate in {path}: {e}")))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::unavailable(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| Error::unavailable(format!("TLS configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::unavailable(format!("cannot open certificate {path}: {e}")))?;
    let certs: std::io::Result<Vec<_>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(file)).collect();
    let certs = certs.map_err(|e| Error::unavailable(format!("cannot parse {path}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::unavailable(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::unavailable(format!("cannot open key {path}: {e}")))?;
    rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
        .map_err(|e| Error::unavailable(format!("cannot parse {path}: {e}")))?
        .ok_or_else(|| Error::unavailable(format!("no private key in {path}")))
}

// ── Stream plumbing ───────────────────────────────────────────────────────────

enum ControlStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl ControlStream {
    async fn read_message(&mut self) -> Result<(u8, Vec<u8>)> {
        match self {
            Self::Plain(s) => read_message(s).await,
            Self::Tls(s) => read_message(s).await,
        }
    }

    async fn write_message(&mut self, kind: ControlMessageType, payload: &[u8]) -> Result<()> {
        match self {
            Self::Plain(s) => write_message(s, kind, payload).await,
            Self::Tls(s) => write_message(s, kind, payload).await,
        }
    }
}

/// Read one `[length_be:2][type:1][payload]` message.
async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 3];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|_| Error::PeerGone)?;

    let length = u16::from_be_bytes([header[0], header[1]]) as usize;
    if length == 0 {
        return Err(Error::protocol("zero-length control message"));
    }
    let kind = header[2];

    let mut payload = vec![0u8; length - 1];
    if !payload.is_empty() {
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|_| Error::PeerGone)?;
    }
    Ok((kind, payload))
}

async fn write_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    kind: ControlMessageType,
    payload: &[u8],
) -> Result<()> {
    let msg = frame_control_message(kind, payload);
    stream.write_all(&msg).await.map_err(|_| Error::PeerGone)?;
    stream.flush().await.map_err(|_| Error::PeerGone)?;
    Ok(())
}

// ── ControlServer ─────────────────────────────────────────────────────────────

/// The TCP/TLS listener. One client at a time.
pub struct ControlServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl ControlServer {
    pub async fn bind(port: u16, acceptor: Option<TlsAcceptor>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(
            "control server listening on port {} ({})",
            listener.local_addr()?.port(),
            if acceptor.is_some() { "TLS" } else { "no TLS" }
        );
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tls_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Block until a client connects and completes the opening
    /// CONFIG_REQUEST. TLS failures and malformed openings return an
    /// error; the caller loops back to accept.
    pub async fn accept(&self) -> Result<PendingSession> {
        let (tcp, peer) = self.listener.accept().await?;
        tcp.set_nodelay(true)?;
        info!("client connected from {peer}");

        let mut stream = match &self.acceptor {
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls) => ControlStream::Tls(Box::new(tls)),
                Err(e) => {
                    return Err(Error::protocol(format!("TLS handshake with {peer} failed: {e}")))
                }
            },
            None => ControlStream::Plain(tcp),
        };

        let (kind, payload) = stream.read_message().await?;
        if ControlMessageType::try_from(kind)? != ControlMessageType::ConfigRequest {
            return Err(Error::protocol(format!(
                "expected CONFIG_REQUEST from {peer}, got type 0x{kind:02x}"
            )));
        }
        let request = ConfigRequest::decode(&payload)?;
        info!(
            "client config: {}x{}, video_port={}, input_port={}",
            request.client_width, request.client_height, request.video_port, request.input_port
        );

        Ok(PendingSession { stream, peer, request })
    }
}

// ── PendingSession ────────────────────────────────────────────────────────────

/// A client that has sent its CONFIG_REQUEST but not yet received the
/// negotiated profile.
pub struct PendingSession {
    stream: ControlStream,
    pub peer: SocketAddr,
    pub request: ConfigRequest,
}

impl PendingSession {
    /// Send CONFIG_RESPONSE and enter the streaming steady state. The
    /// returned session owns a background reader that echoes pings and
    /// forwards keyframe/disconnect events.
    pub async fn send_profile(mut self, profile: &SessionProfile) -> Result<ControlSession> {
        self.stream
            .write_message(ControlMessageType::ConfigResponse, &profile.encode())
            .await?;

        let (events_tx, events_rx) = mpsc::channel(8);
        let task = tokio::spawn(control_loop(self.stream, events_tx));

        Ok(ControlSession { peer: self.peer, events: events_rx, task })
    }
}

// ── ControlSession ────────────────────────────────────────────────────────────

/// Steady-state events surfaced to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    KeyframeRequest,
    Disconnected,
}

pub struct ControlSession {
    pub peer: SocketAddr,
    events: mpsc::Receiver<ControlEvent>,
    task: JoinHandle<()>,
}

impl ControlSession {
    /// Non-blocking poll, called once per scheduler tick.
    pub fn poll_event(&mut self) -> Option<ControlEvent> {
        self.events.try_recv().ok()
    }

    /// Tear the connection down (client socket closes with the task).
    pub fn close(self) {
        self.task.abort();
    }
}

async fn control_loop(mut stream: ControlStream, events: mpsc::Sender<ControlEvent>) {
    loop {
        let (kind, payload) = match stream.read_message().await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("control read failed: {e}");
                let _ = events.send(ControlEvent::Disconnected).await;
                return;
            }
        };

        match ControlMessageType::try_from(kind) {
            Ok(ControlMessageType::KeyframeRequest) => {
                if events.send(ControlEvent::KeyframeRequest).await.is_err() {
                    return;
                }
            }
            Ok(ControlMessageType::Ping) => {
                if let Err(e) = stream.write_message(ControlMessageType::Pong, &payload).await {
                    warn!("pong write failed: {e}");
                    let _ = events.send(ControlEvent::Disconnected).await;
                    return;
                }
            }
            Ok(ControlMessageType::Disconnect) => {
                info!("client sent disconnect");
                let _ = events.send(ControlEvent::Disconnected).await;
                return;
            }
            Ok(other) => debug!("ignoring unexpected control message {other:?}"),
            Err(_) => debug!("ignoring unknown control message type 0x{kind:02x}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_profile() -> SessionProfile {
        SessionProfile {
            server_width: 1920,
            server_height: 1080,
            video_port: 9501,
            input_port: 9502,
            audio_port: 9503,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_frame_ms: 10,
            codec_type: 2,
        }
    }

    async fn client_send(
        stream: &mut TcpStream,
        kind: ControlMessageType,
        payload: &[u8],
    ) -> std::io::Result<()> {
        stream.write_all(&frame_control_message(kind, payload)).await
    }

    async fn client_read(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        read_message(stream).await.unwrap()
    }

    #[tokio::test]
    async fn handshake_ping_and_disconnect() {
        let server = ControlServer::bind(0, None).await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let request = ConfigRequest {
                client_width: 1080,
                client_height: 2340,
                video_port: 40001,
                input_port: 40002,
            };
            client_send(&mut stream, ControlMessageType::ConfigRequest, &request.encode())
                .await
                .unwrap();

            let (kind, payload) = client_read(&mut stream).await;
            assert_eq!(kind, ControlMessageType::ConfigResponse as u8);
            let profile = SessionProfile::decode(&payload).unwrap();
            assert_eq!(profile.server_width, 1920);
            assert_eq!(profile.codec_type, 2);

            client_send(&mut stream, ControlMessageType::Ping, &[1, 2, 3]).await.unwrap();
            let (kind, payload) = client_read(&mut stream).await;
            assert_eq!(kind, ControlMessageType::Pong as u8);
            assert_eq!(payload, vec![1, 2, 3]);

            client_send(&mut stream, ControlMessageType::KeyframeRequest, &[]).await.unwrap();
            client_send(&mut stream, ControlMessageType::Disconnect, &[]).await.unwrap();
        });

        let pending = server.accept().await.unwrap();
        assert_eq!(pending.request.client_width, 1080);
        assert_eq!(pending.request.video_port, 40001);

        let mut session = pending.send_profile(&test_profile()).await.unwrap();

        let mut saw_keyframe = false;
        let mut saw_disconnect = false;
        for _ in 0..100 {
            match session.poll_event() {
                Some(ControlEvent::KeyframeRequest) => saw_keyframe = true,
                Some(ControlEvent::Disconnected) => {
                    saw_disconnect = true;
                    break;
                }
                None => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        }
        assert!(saw_keyframe);
        assert!(saw_disconnect);

        client.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_first_message_is_a_protocol_error() {
        let server = ControlServer::bind(0, None).await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            client_send(&mut stream, ControlMessageType::Ping, &[0xFF]).await.unwrap();
        });

        match server.accept().await {
            Err(Error::Protocol { .. }) => {}
            Err(e) => panic!("expected protocol error, got {e:?}"),
            Ok(_) => panic!("expected protocol error, got a session"),
        }
    }

    #[tokio::test]
    async fn abrupt_close_surfaces_peer_gone() {
        let server = ControlServer::bind(0, None).await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        });

        match server.accept().await {
            Err(Error::PeerGone) => {}
            Err(e) => panic!("expected PeerGone, got {e:?}"),
            Ok(_) => panic!("expected PeerGone, got a session"),
        }
    }
}
