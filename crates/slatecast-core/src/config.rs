//! Server and encoder configuration.
//!
//! The defaults here are the canonical set: adaptive CQP quality, AUTO
//! codec selection, AUTO pacing and audio enabled. Bitrate and GOP are
//! derived from the capture rate when not given explicitly (see
//! [`ServerConfig::finalize`]).

use crate::error::{Error, Result};

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Rate-control strategy for the video encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// CBR, bitrate == max, one frame of buffering, fastest preset.
    CbrLowLatency,
    /// CBR, bitrate == max, one frame of buffering, fast preset.
    CbrBalanced,
    /// Constant QP, cap at 2× target bitrate, one GOP of buffering.
    CqpHighQuality,
    /// Constant QP starting point with a 2× cap; the default.
    AdaptiveCqp,
}

impl RateControl {
    pub fn is_cqp(self) -> bool {
        matches!(self, Self::CqpHighQuality | Self::AdaptiveCqp)
    }
}

/// Preferred codec ordering for the encoder probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecPreference {
    /// Best available: AV1, then HEVC, then H.264.
    #[default]
    Auto,
    Av1,
    Hevc,
    H264,
}

/// Fragment pacing policy for the video sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingMode {
    /// Pick LIGHT or AGGRESSIVE from the client address.
    #[default]
    Auto,
    /// Never pause between fragments.
    None,
    /// Pace frames larger than 50 KB: 20 fragments, 50 µs pauses.
    Light,
    /// Pace frames larger than ~2.4 KB: 4 fragments, 200 µs pauses.
    Aggressive,
    /// Pace keyframes only, with a size-dependent sub-policy.
    Keyframe,
}

/// Which screen-capture backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureBackendKind {
    /// Wayland session → portal, otherwise X11.
    #[default]
    Auto,
    X11,
    Portal,
}

// ── EncoderConfig ─────────────────────────────────────────────────────────────

/// Parameters handed to the video encoder probe.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_bps: u64,
    pub gop_size: u32,
    pub rate_control: RateControl,
    /// Quantiser for the CQP modes, 1..=51.
    pub cqp: u8,
    pub codec: CodecPreference,
}

impl EncoderConfig {
    /// Bits of encoder buffering for the selected rate-control mode:
    /// one frame for CBR, one GOP for CQP.
    pub fn buffer_bits(&self) -> u64 {
        if self.rate_control.is_cqp() {
            self.bitrate_bps * self.gop_size as u64 / self.framerate as u64
        } else {
            self.bitrate_bps / self.framerate as u64
        }
    }

    /// Bitrate cap: 2× target for CQP modes, the target itself for CBR.
    pub fn max_bitrate_bps(&self) -> u64 {
        if self.rate_control.is_cqp() {
            self.bitrate_bps * 2
        } else {
            self.bitrate_bps
        }
    }
}

// ── ServerConfig ──────────────────────────────────────────────────────────────

/// Full server configuration assembled from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Display
    pub display: String,
    pub capture_backend: CaptureBackendKind,
    pub capture_fps: u32,

    // Encoding
    pub bitrate_bps: Option<u64>,
    pub gop_size: Option<u32>,
    pub rate_control: RateControl,
    pub cqp: u8,
    pub codec: CodecPreference,

    // Network
    pub control_port: u16,
    pub pacing: PacingMode,

    // Audio
    pub audio_enabled: bool,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
    pub audio_bitrate_bps: u32,
    pub audio_frame_ms: u8,
    /// Opus in-band forward error correction; off unless requested.
    pub audio_inband_fec: bool,
    pub audio_device: Option<String>,

    // Security
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            display: ":0".to_owned(),
            capture_backend: CaptureBackendKind::Auto,
            capture_fps: 60,
            bitrate_bps: None,
            gop_size: None,
            rate_control: RateControl::AdaptiveCqp,
            cqp: 24,
            codec: CodecPreference::Auto,
            control_port: 9500,
            pacing: PacingMode::Auto,
            audio_enabled: true,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_bitrate_bps: 128_000,
            audio_frame_ms: 10,
            audio_inband_fec: false,
            audio_device: None,
            cert_file: "server.crt".to_owned(),
            key_file: "server.key".to_owned(),
            ca_file: None,
        }
    }
}

impl ServerConfig {
    /// UDP video port, always `control_port + 1`.
    pub fn video_port(&self) -> u16 {
        self.control_port.wrapping_add(1)
    }

    /// TCP input port, always `control_port + 2`.
    pub fn input_port(&self) -> u16 {
        self.control_port.wrapping_add(2)
    }

    /// UDP audio port, always `control_port + 3`.
    pub fn audio_port(&self) -> u16 {
        self.control_port.wrapping_add(3)
    }

    /// Interval between scheduler ticks at the configured capture rate.
    pub fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.capture_fps as u64
    }

    /// Validate ranges and fill the derived fields.
    ///
    /// Bitrate defaults scale with fps relative to the 60 fps base rates
    /// (10 Mbps low latency, 20 Mbps balanced, 100 Mbps CQP). GOP defaults
    /// to half a second of frames. AUTO pacing becomes KEYFRAME pacing
    /// when running in adaptive-CQP mode.
    pub fn finalize(mut self) -> Result<Self> {
        if !(1..=120).contains(&self.capture_fps) {
            return Err(Error::config(format!(
                "capture fps {} out of range 1..=120",
                self.capture_fps
            )));
        }
        if !(1..=51).contains(&self.cqp) {
            return Err(Error::config(format!("cqp {} out of range 1..=51", self.cqp)));
        }
        if self.audio_channels == 0 || self.audio_channels > 2 {
            return Err(Error::config(format!(
                "audio channels {} out of range 1..=2",
                self.audio_channels
            )));
        }

        if self.bitrate_bps.is_none() {
            let base: u64 = match self.rate_control {
                RateControl::CbrLowLatency => 10_000_000,
                RateControl::CbrBalanced => 20_000_000,
                RateControl::CqpHighQuality | RateControl::AdaptiveCqp => 100_000_000,
            };
            self.bitrate_bps = Some(base * self.capture_fps as u64 / 60);
        }

        if self.gop_size.is_none() {
            self.gop_size = Some((self.capture_fps / 2).max(1));
        }

        if self.rate_control == RateControl::AdaptiveCqp && self.pacing == PacingMode::Auto {
            self.pacing = PacingMode::Keyframe;
        }

        self.audio_bitrate_bps = self.audio_bitrate_bps.clamp(16_000, 510_000);

        Ok(self)
    }

    /// Encoder parameters for a screen of the given dimensions. Call after
    /// [`finalize`](Self::finalize).
    pub fn encoder_config(&self, width: u32, height: u32) -> EncoderConfig {
        EncoderConfig {
            width,
            height,
            framerate: self.capture_fps,
            bitrate_bps: self.bitrate_bps.unwrap_or(20_000_000),
            gop_size: self.gop_size.unwrap_or_else(|| (self.capture_fps / 2).max(1)),
            rate_control: self.rate_control,
            cqp: self.cqp,
            codec: self.codec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_derive_from_control_port() {
        let cfg = ServerConfig { control_port: 9500, ..Default::default() };
        assert_eq!(cfg.video_port(), 9501);
        assert_eq!(cfg.input_port(), 9502);
        assert_eq!(cfg.audio_port(), 9503);
    }

    #[test]
    fn bitrate_scales_with_fps() {
        let cfg = ServerConfig {
            capture_fps: 30,
            rate_control: RateControl::CbrBalanced,
            ..Default::default()
        };
        let cfg = cfg.finalize().unwrap();
        assert_eq!(cfg.bitrate_bps, Some(10_000_000)); // 20 Mbps × 30/60
    }

    #[test]
    fn gop_defaults_to_half_a_second() {
        let cfg = ServerConfig { capture_fps: 60, ..Default::default() }.finalize().unwrap();
        assert_eq!(cfg.gop_size, Some(30));

        let cfg = ServerConfig { capture_fps: 1, ..Default::default() }.finalize().unwrap();
        assert_eq!(cfg.gop_size, Some(1));
    }

    #[test]
    fn adaptive_auto_pacing_selects_keyframe_mode() {
        let cfg = ServerConfig::default().finalize().unwrap();
        assert_eq!(cfg.rate_control, RateControl::AdaptiveCqp);
        assert_eq!(cfg.pacing, PacingMode::Keyframe);

        let cfg = ServerConfig {
            rate_control: RateControl::CbrBalanced,
            ..Default::default()
        }
        .finalize()
        .unwrap();
        assert_eq!(cfg.pacing, PacingMode::Auto);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(ServerConfig { capture_fps: 0, ..Default::default() }.finalize().is_err());
        assert!(ServerConfig { capture_fps: 121, ..Default::default() }.finalize().is_err());
        assert!(ServerConfig { cqp: 52, ..Default::default() }.finalize().is_err());
    }

    #[test]
    fn encoder_buffer_sizing_per_mode() {
        let mut enc = EncoderConfig {
            width: 1920,
            height: 1080,
            framerate: 60,
            bitrate_bps: 12_000_000,
            gop_size: 30,
            rate_control: RateControl::CbrBalanced,
            cqp: 24,
            codec: CodecPreference::Auto,
        };
        // CBR: one frame worth, cap == target.
        assert_eq!(enc.buffer_bits(), 200_000);
        assert_eq!(enc.max_bitrate_bps(), 12_000_000);

        // CQP: one GOP worth, cap == 2× target.
        enc.rate_control = RateControl::CqpHighQuality;
        assert_eq!(enc.buffer_bits(), 6_000_000);
        assert_eq!(enc.max_bitrate_bps(), 24_000_000);
    }
}
