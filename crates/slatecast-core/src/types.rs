use bytes::Bytes;

// ── CodecKind ─────────────────────────────────────────────────────────────────

/// Video codec actually selected by the encoder probe.
///
/// The discriminant is the value the client sees in the `CONFIG_RESPONSE`
/// `codec_type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecKind {
    Av1 = 0,
    Hevc = 1,
    H264 = 2,
}

impl CodecKind {
    /// Wire id carried in the session profile.
    pub fn wire_id(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Av1 => "AV1",
            Self::Hevc => "HEVC",
            Self::H264 => "H.264",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── RawFrame ──────────────────────────────────────────────────────────────────

/// One captured screen frame in BGRA8 (4 bytes per pixel).
///
/// Produced by a capture backend and consumed by the encoder on the same
/// scheduler tick; rows are `stride` bytes apart and `stride >= 4 * width`.
#[derive(Debug)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row (usually `width * 4`).
    pub stride: u32,
    /// Monotonic capture timestamp in microseconds.
    pub timestamp_us: u64,
}

// ── EncodedFrame ──────────────────────────────────────────────────────────────

/// One complete encoded access unit ready for fragmentation.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub timestamp_us: u64,
    /// Decodable without prior state.
    pub is_keyframe: bool,
    pub codec: CodecKind,
}

// ── AudioBlock ────────────────────────────────────────────────────────────────

/// A chunk of interleaved f32 samples handed off by the audio capture
/// thread. Owned — the capture callback copies out of its borrowed buffer
/// before sending.
#[derive(Debug)]
pub struct AudioBlock {
    /// Interleaved samples in [-1.0, 1.0], `samples_per_channel * channels`
    /// entries.
    pub samples: Vec<f32>,
    pub samples_per_channel: usize,
    pub channels: u8,
    pub timestamp_us: u64,
}

// ── EncodedAudio ──────────────────────────────────────────────────────────────

/// One Opus packet (exactly one encoder frame).
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub samples_per_channel: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_wire_ids_match_protocol() {
        assert_eq!(CodecKind::Av1.wire_id(), 0);
        assert_eq!(CodecKind::Hevc.wire_id(), 1);
        assert_eq!(CodecKind::H264.wire_id(), 2);
    }
}
