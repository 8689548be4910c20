//! TCP input receiver: fixed-size binary events from the tablet client.
//!
//! The client opens a second TCP connection on the input port and writes
//! back-to-back 28-byte event packets. A background task accepts one
//! client at a time (TCP_NODELAY on), decodes packets and pushes them
//! into a bounded channel that the scheduler drains non-blockingly each
//! tick. Events that arrive faster than the scheduler drains are dropped,
//! never queued unboundedly.
//!
//! Session teardown bumps a reset generation; a connection only honours
//! resets issued while it was live, so a reset fired between clients
//! cannot kill the next connection.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slatecast_core::{InputEvent, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct InputReceiver {
    listener: TcpListener,
}

/// Handle to the spawned receiver task.
pub struct InputReceiverHandle {
    reset: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl InputReceiverHandle {
    /// Drop the currently connected client (if any) and go back to
    /// accepting. Called on session teardown.
    pub fn reset(&self) {
        self.reset.send_modify(|generation| *generation += 1);
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl InputReceiver {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        info!("input receiver listening on port {}", listener.local_addr()?.port());
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept/read loop. Returns the event channel and a
    /// control handle.
    pub fn start(self) -> (mpsc::Receiver<InputEvent>, InputReceiverHandle) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (reset_tx, reset_rx) = watch::channel(0u64);
        let task = tokio::spawn(accept_loop(self.listener, tx, reset_rx));
        (rx, InputReceiverHandle { reset: reset_tx, task })
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<InputEvent>,
    mut reset: watch::Receiver<u64>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("input accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("input TCP_NODELAY: {e}");
        }
        info!("input client connected from {peer}");

        // Absorb resets that fired while nobody was connected.
        reset.borrow_and_update();

        read_events(stream, &tx, &mut reset).await;
        if tx.is_closed() {
            return;
        }
    }
}

/// Read events until the client disconnects, a packet fails to decode,
/// or a reset is requested.
async fn read_events(
    mut stream: TcpStream,
    tx: &mpsc::Sender<InputEvent>,
    reset: &mut watch::Receiver<u64>,
) {
    let mut buf = [0u8; InputEvent::WIRE_SIZE];
    loop {
        tokio::select! {
            _ = reset.changed() => {
                info!("input connection reset");
                return;
            }
            read = stream.read_exact(&mut buf) => {
                if read.is_err() {
                    info!("input client disconnected");
                    return;
                }
                match InputEvent::decode(&buf) {
                    Ok(event) => {
                        // Drop rather than queue when the scheduler lags.
                        if tx.try_send(event).is_err() && tx.is_closed() {
                            return;
                        }
                    }
                    Err(e) => {
                        // A bad packet means the stream is desynchronised.
                        warn!("dropping input client: {e}");
                        return;
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
