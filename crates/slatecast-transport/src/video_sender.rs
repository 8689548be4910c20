//! UDP video sender: fragmentation, framing and paced bursts.
//!
//! Each encoded access unit is split into fragments of at most
//! [`MAX_PAYLOAD`] bytes, each prefixed with a 16-byte
//! [`VideoPacketHeader`]. A global 16-bit sequence number runs across all
//! fragments of all frames and wraps naturally.
//!
//! # Pacing
//!
//! Cheap receivers (USB-tethered tablets in particular) drop bursts that
//! arrive faster than their network stack drains. The sender therefore
//! pauses between bursts of fragments according to [`PacingMode`]:
//!
//! | Mode       | Paces when              | Burst | Pause  |
//! |------------|-------------------------|-------|--------|
//! | NONE       | never                   | —     | —      |
//! | LIGHT      | frame > 50 KB           | 20    | 50 µs  |
//! | AGGRESSIVE | frame > 2.4 KB          | 4     | 200 µs |
//! | KEYFRAME   | keyframes > 100 KB only | 6/4/2 | 150–300 µs |
//! | AUTO       | resolved from client IP at bind time | | |
//!
//! Pauses are cooperative `tokio::time::sleep`s on the sender task; no
//! shared state is held across them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use slatecast_core::config::PacingMode;
use slatecast_core::protocol::{
    VideoPacketHeader, FLAG_END_OF_FRAME, FLAG_KEYFRAME, FLAG_START_OF_FRAME, MAX_PAYLOAD,
};
use slatecast_core::{EncodedFrame, Error, Result};

/// Send-buffer request for the video socket; large enough to absorb a
/// worst-case keyframe burst.
const SEND_BUFFER_BYTES: usize = 4 * 1024 * 1024;

// ── Pacing ────────────────────────────────────────────────────────────────────

/// One pacing decision: emit `packets_per_burst` fragments, then pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPlan {
    pub packets_per_burst: usize,
    pub delay: Duration,
}

impl BurstPlan {
    const fn new(packets_per_burst: usize, delay_us: u64) -> Self {
        Self { packets_per_burst, delay: Duration::from_micros(delay_us) }
    }
}

/// Resolve AUTO pacing from the client address.
///
/// USB tethering and phone hotspots hand out 10.0.0.0/8 or
/// 192.168.42.0/24 / 192.168.43.0/24 addresses and need aggressive
/// pacing; everything else is assumed to be Wi-Fi.
pub fn detect_pacing_mode(ip: IpAddr) -> PacingMode {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            if a == 10 || (a == 192 && b == 168 && (c == 42 || c == 43)) {
                PacingMode::Aggressive
            } else {
                PacingMode::Light
            }
        }
        IpAddr::V6(_) => PacingMode::Light,
    }
}

/// Pacing parameters for one frame, or `None` when the frame goes out in
/// a single unpaced burst.
///
/// `mode` must already be resolved (not AUTO); an unresolved AUTO is
/// treated as LIGHT.
pub fn pacing_plan(mode: PacingMode, frame_len: usize, keyframe: bool) -> Option<BurstPlan> {
    match mode {
        PacingMode::None => None,
        PacingMode::Light | PacingMode::Auto => {
            (frame_len > 50_000).then(|| BurstPlan::new(20, 50))
        }
        PacingMode::Aggressive => (frame_len > 2_400).then(|| BurstPlan::new(4, 200)),
        PacingMode::Keyframe => {
            if !keyframe || frame_len <= 100_000 {
                None
            } else if frame_len <= 300_000 {
                Some(BurstPlan::new(6, 150))
            } else if frame_len <= 500_000 {
                Some(BurstPlan::new(4, 200))
            } else {
                Some(BurstPlan::new(2, 300))
            }
        }
    }
}

// ── VideoSender ───────────────────────────────────────────────────────────────

/// Fragmenting, pacing UDP sender for encoded video.
pub struct VideoSender {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    pacing: PacingMode,
    sequence: u16,
    bytes_sent: u64,
    packets_sent: u64,
}

impl VideoSender {
    /// Bind the video socket on all interfaces.
    pub async fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = raw.set_send_buffer_size(SEND_BUFFER_BYTES) {
            warn!("could not grow video send buffer: {e}");
        }
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into())?;
        let socket = UdpSocket::from_std(raw.into())?;

        info!("video sender bound on port {port}");
        Ok(Self {
            socket,
            client: None,
            pacing: PacingMode::Light,
            sequence: 0,
            bytes_sent: 0,
            packets_sent: 0,
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Target the client learned from the control handshake, resolving
    /// AUTO pacing from its address.
    pub fn set_client(&mut self, addr: SocketAddr, mode: PacingMode) {
        self.pacing = if mode == PacingMode::Auto { detect_pacing_mode(addr.ip()) } else { mode };
        self.client = Some(addr);
        info!("video client set to {addr} (pacing {:?})", self.pacing);
    }

    /// Forget the client; subsequent frames are discarded.
    pub fn clear_client(&mut self) {
        self.client = None;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Fragment and send one access unit. Returns the number of fragments
    /// emitted (0 when no client is bound).
    ///
    /// A full socket buffer drops the remainder of the frame: UDP is
    /// best-effort and the client recovers at the next keyframe.
    pub async fn send_frame(&mut self, frame: &EncodedFrame, frame_number: u32) -> Result<u32> {
        let Some(client) = self.client else {
            return Ok(0);
        };
        let data = &frame.data;
        if data.is_empty() {
            return Ok(0);
        }

        let fragment_count = data.len().div_ceil(MAX_PAYLOAD);
        if fragment_count > u16::MAX as usize {
            return Err(Error::protocol(format!(
                "frame of {} bytes needs {} fragments",
                data.len(),
                fragment_count
            )));
        }

        if frame.is_keyframe {
            debug!(
                "keyframe {frame_number}: {} bytes ({} fragments)",
                data.len(),
                fragment_count
            );
        }

        let plan = pacing_plan(self.pacing, data.len(), frame.is_keyframe);
        let mut in_burst = 0usize;
        let mut datagram = Vec::with_capacity(VideoPacketHeader::SIZE + MAX_PAYLOAD);

        for (idx, payload) in data.chunks(MAX_PAYLOAD).enumerate() {
            let mut flags = 0u8;
            if frame.is_keyframe {
                flags |= FLAG_KEYFRAME;
            }
            if idx == 0 {
                flags |= FLAG_START_OF_FRAME;
            }
            if idx == fragment_count - 1 {
                flags |= FLAG_END_OF_FRAME;
            }

            let header = VideoPacketHeader {
                sequence: self.sequence,
                frame_number: (frame_number & 0xFFFF) as u16,
                flags,
                fragment_idx: idx as u16,
                fragment_count: fragment_count as u16,
                payload_len: payload.len() as u16,
            };
            self.sequence = self.sequence.wrapping_add(1);

            datagram.clear();
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(payload);

            match self.socket.try_send_to(&datagram, client) {
                Ok(sent) => {
                    self.bytes_sent += sent as u64;
                    self.packets_sent += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Soft drop; the sequence gap tells the client.
                    trace!("video socket full, dropped fragment {idx}/{fragment_count}");
                }
                Err(e) => return Err(e.into()),
            }

            if let Some(plan) = plan {
                in_burst += 1;
                if in_burst >= plan.packets_per_burst && idx < fragment_count - 1 {
                    tokio::time::sleep(plan.delay).await;
                    in_burst = 0;
                }
            }
        }

        Ok(fragment_count as u32)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use slatecast_core::CodecKind;

    fn frame(len: usize, keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            data: Bytes::from(vec![0x42u8; len]),
            timestamp_us: 0,
            is_keyframe: keyframe,
            codec: CodecKind::H264,
        }
    }

    #[test]
    fn auto_mode_resolves_from_client_ip() {
        assert_eq!(detect_pacing_mode("10.42.7.9".parse().unwrap()), PacingMode::Aggressive);
        assert_eq!(detect_pacing_mode("192.168.42.7".parse().unwrap()), PacingMode::Aggressive);
        assert_eq!(detect_pacing_mode("192.168.43.200".parse().unwrap()), PacingMode::Aggressive);
        assert_eq!(detect_pacing_mode("192.168.1.50".parse().unwrap()), PacingMode::Light);
        assert_eq!(detect_pacing_mode("172.16.0.3".parse().unwrap()), PacingMode::Light);
    }

    #[test]
    fn pacing_table() {
        // NONE never paces.
        assert_eq!(pacing_plan(PacingMode::None, 10_000_000, true), None);

        // LIGHT paces only large frames.
        assert_eq!(pacing_plan(PacingMode::Light, 50_000, false), None);
        assert_eq!(
            pacing_plan(PacingMode::Light, 50_001, false),
            Some(BurstPlan::new(20, 50))
        );

        // AGGRESSIVE paces nearly everything.
        assert_eq!(pacing_plan(PacingMode::Aggressive, 2_400, false), None);
        assert_eq!(
            pacing_plan(PacingMode::Aggressive, 2_401, false),
            Some(BurstPlan::new(4, 200))
        );
    }

    #[test]
    fn keyframe_pacing_sub_policy() {
        // Delta frames are never paced, whatever their size.
        assert_eq!(pacing_plan(PacingMode::Keyframe, 800_000, false), None);

        // Keyframes pace by size.
        assert_eq!(pacing_plan(PacingMode::Keyframe, 90_000, true), None);
        assert_eq!(
            pacing_plan(PacingMode::Keyframe, 200_000, true),
            Some(BurstPlan::new(6, 150))
        );
        assert_eq!(
            pacing_plan(PacingMode::Keyframe, 400_000, true),
            Some(BurstPlan::new(4, 200))
        );
        assert_eq!(
            pacing_plan(PacingMode::Keyframe, 600_000, true),
            Some(BurstPlan::new(2, 300))
        );
    }

    #[tokio::test]
    async fn fragments_carry_frame_flags_and_reassemble() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut sender = VideoSender::bind(0).await.unwrap();
        sender.set_client(receiver.local_addr().unwrap(), PacingMode::None);

        // 3650 bytes → ceil(3650 / 1200) = 4 fragments.
        let f = frame(3650, true);
        let sent = sender.send_frame(&f, 7).await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 2048];
        let mut reassembled = Vec::new();
        for idx in 0..4u16 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let header = VideoPacketHeader::decode(&buf[..len]).unwrap();

            assert_eq!(header.frame_number, 7);
            assert_eq!(header.fragment_idx, idx);
            assert_eq!(header.fragment_count, 4);
            assert_eq!(header.sequence, idx);
            assert!(header.is_keyframe());
            assert_eq!(header.is_start_of_frame(), idx == 0);
            assert_eq!(header.is_end_of_frame(), idx == 3);
            assert_eq!(len, VideoPacketHeader::SIZE + header.payload_len as usize);

            reassembled.extend_from_slice(&buf[VideoPacketHeader::SIZE..len]);
        }
        assert_eq!(reassembled, f.data.as_ref());
    }

    #[tokio::test]
    async fn sequence_runs_across_frames() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut sender = VideoSender::bind(0).await.unwrap();
        sender.set_client(receiver.local_addr().unwrap(), PacingMode::None);

        sender.send_frame(&frame(100, true), 0).await.unwrap();
        sender.send_frame(&frame(100, false), 1).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let first = VideoPacketHeader::decode(&buf[..len]).unwrap();
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let second = VideoPacketHeader::decode(&buf[..len]).unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.frame_number, 1);
        assert!(!second.is_keyframe());
    }

    #[tokio::test]
    async fn no_client_means_no_datagrams() {
        let mut sender = VideoSender::bind(0).await.unwrap();
        assert_eq!(sender.send_frame(&frame(5000, true), 0).await.unwrap(), 0);
        assert_eq!(sender.packets_sent(), 0);
    }
}
