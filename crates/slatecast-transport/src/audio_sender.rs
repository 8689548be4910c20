//! UDP audio sender. One Opus packet per datagram, no fragmentation.
//!
//! `AudioSender` is `Clone` — the audio pipeline task sends from the
//! audio-capture side while the session controller binds and clears the
//! client address, so the address lives behind a short-lived mutex.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

use slatecast_core::protocol::AudioPacketHeader;
use slatecast_core::{EncodedAudio, Result};

/// Audio datagrams are small; a modest buffer suffices.
const SEND_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct AudioSender {
    socket: Arc<UdpSocket>,
    client: Arc<Mutex<Option<SocketAddr>>>,
    sample_rate: u32,
    sequence: Arc<AtomicU16>,
    bytes_sent: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
}

impl AudioSender {
    /// Bind the audio socket on all interfaces.
    pub async fn bind(port: u16, sample_rate: u32) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = raw.set_send_buffer_size(SEND_BUFFER_BYTES) {
            warn!("could not grow audio send buffer: {e}");
        }
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into())?;
        let socket = UdpSocket::from_std(raw.into())?;

        info!("audio sender bound on port {port}");
        Ok(Self {
            socket: Arc::new(socket),
            client: Arc::new(Mutex::new(None)),
            sample_rate,
            sequence: Arc::new(AtomicU16::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            packets_sent: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_client(&self, addr: SocketAddr) {
        *self.client.lock().expect("audio client lock") = Some(addr);
        self.sequence.store(0, Ordering::Relaxed);
        info!("audio client set to {addr}");
    }

    pub fn clear_client(&self) {
        *self.client.lock().expect("audio client lock") = None;
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Send one encoded packet. Silently discarded when no client is
    /// bound or the socket buffer is momentarily full.
    pub fn send_packet(&self, packet: &EncodedAudio) -> Result<bool> {
        let Some(client) = *self.client.lock().expect("audio client lock") else {
            return Ok(false);
        };

        let header = AudioPacketHeader {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: sample_timestamp(packet.timestamp_us, self.sample_rate),
            payload_len: packet.data.len() as u16,
        };

        let mut datagram = Vec::with_capacity(AudioPacketHeader::SIZE + packet.data.len());
        datagram.extend_from_slice(&header.encode());
        datagram.extend_from_slice(&packet.data);

        match self.socket.try_send_to(&datagram, client) {
            Ok(sent) => {
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("audio socket full, dropped packet");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Microseconds → sample units at the session rate; the low 32 bits wrap
/// (about a day at 48 kHz).
fn sample_timestamp(timestamp_us: u64, sample_rate: u32) -> u32 {
    (timestamp_us as u128 * sample_rate as u128 / 1_000_000) as u32
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_converts_to_sample_units() {
        // 1 ms at 48 kHz is 48 samples.
        assert_eq!(sample_timestamp(1_000, 48_000), 48);
        assert_eq!(sample_timestamp(1_000_000, 48_000), 48_000);
        // Wraps through u32 without panicking.
        assert_eq!(
            sample_timestamp(u64::MAX / 48_000, 48_000),
            ((u64::MAX as u128 / 48_000 * 48_000 / 1_000_000) & 0xFFFF_FFFF) as u32
        );
    }

    #[tokio::test]
    async fn packets_carry_header_and_sequence() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = AudioSender::bind(0, 48_000).await.unwrap();
        sender.set_client(receiver.local_addr().unwrap());

        for ts in [0u64, 10_000, 20_000] {
            let packet = EncodedAudio {
                data: vec![0x11, 0x22, 0x33],
                timestamp_us: ts,
                samples_per_channel: 480,
            };
            assert!(sender.send_packet(&packet).unwrap());
        }

        let mut buf = [0u8; 256];
        for (i, expected_ts) in [0u32, 480, 960].iter().enumerate() {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let header = AudioPacketHeader::decode(&buf[..len]).unwrap();
            assert_eq!(header.sequence, i as u16);
            assert_eq!(header.timestamp, *expected_ts);
            assert_eq!(header.payload_len, 3);
            assert_eq!(&buf[AudioPacketHeader::SIZE..len], &[0x11, 0x22, 0x33]);
        }
    }

    #[tokio::test]
    async fn unbound_client_discards() {
        let sender = AudioSender::bind(0, 48_000).await.unwrap();
        let packet = EncodedAudio { data: vec![1], timestamp_us: 0, samples_per_channel: 480 };
        assert!(!sender.send_packet(&packet).unwrap());
        assert_eq!(sender.packets_sent(), 0);
    }
}
