//! Opus audio encoding and the audio pipeline task.
//!
//! Capture blocks arrive in whatever size the audio backend produces;
//! the encoder accumulates interleaved samples until a full Opus frame
//! (`sample_rate · frame_ms / 1000` samples per channel) is available
//! and may therefore emit zero or more packets per input block. Packet
//! timestamps start at the timestamp of the first buffered sample and
//! advance by `frame_ms` per emitted packet.

use opus::{Application, Channels};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slatecast_core::{AudioBlock, EncodedAudio, Error, Result};
use slatecast_transport::AudioSender;

/// Largest Opus packet we ever expect (hard ceiling is 1275 bytes/frame).
const MAX_PACKET_BYTES: usize = 4000;

pub struct OpusAudioEncoder {
    encoder: opus::Encoder,
    channels: u8,
    frame_ms: u8,
    /// Samples per channel in one Opus frame.
    frame_size: usize,
    buffer: Vec<f32>,
    buffer_start_us: u64,
    packet: Vec<u8>,
}

impl OpusAudioEncoder {
    pub fn new(
        sample_rate: u32,
        channels: u8,
        bitrate_bps: u32,
        frame_ms: u8,
        inband_fec: bool,
    ) -> Result<Self> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(Error::config(format!("unsupported channel count {other}"))),
        };

        let frame_size = (sample_rate as usize * frame_ms as usize) / 1000;

        let mut encoder = opus::Encoder::new(sample_rate, opus_channels, Application::Audio)
            .map_err(|e| Error::unavailable(format!("opus encoder: {e}")))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate_bps as i32))
            .map_err(|e| Error::config(format!("opus bitrate: {e}")))?;
        encoder
            .set_inband_fec(inband_fec)
            .map_err(|e| Error::config(format!("opus fec: {e}")))?;

        info!(
            "opus encoder: {} Hz, {} ch, {} kbps, {} ms frames ({} samples/frame)",
            sample_rate,
            channels,
            bitrate_bps / 1000,
            frame_ms,
            frame_size
        );

        Ok(Self {
            encoder,
            channels,
            frame_ms,
            frame_size,
            buffer: Vec::with_capacity(frame_size * channels as usize * 4),
            buffer_start_us: 0,
            packet: vec![0u8; MAX_PACKET_BYTES],
        })
    }

    /// Append one capture block and encode every complete frame in the
    /// accumulator.
    pub fn encode(&mut self, block: &AudioBlock) -> Result<Vec<EncodedAudio>> {
        if self.buffer.is_empty() {
            self.buffer_start_us = block.timestamp_us;
        }
        self.buffer.extend_from_slice(&block.samples);

        let samples_per_frame = self.frame_size * self.channels as usize;
        let mut packets = Vec::new();

        while self.buffer.len() >= samples_per_frame {
            let written = self
                .encoder
                .encode_float(&self.buffer[..samples_per_frame], &mut self.packet)
                .map_err(|e| Error::encode(format!("opus encode: {e}")))?;

            packets.push(EncodedAudio {
                data: self.packet[..written].to_vec(),
                timestamp_us: self.buffer_start_us,
                samples_per_channel: self.frame_size,
            });

            self.buffer.drain(..samples_per_frame);
            self.buffer_start_us += self.frame_ms as u64 * 1000;
        }

        Ok(packets)
    }

}

// ── Pipeline task ─────────────────────────────────────────────────────────────

/// Consume capture blocks, encode and send until the capture side closes
/// the channel.
pub fn spawn_audio_pipeline(
    mut encoder: OpusAudioEncoder,
    mut blocks: mpsc::Receiver<AudioBlock>,
    sender: AudioSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(block) = blocks.recv().await {
            match encoder.encode(&block) {
                Ok(packets) => {
                    for packet in packets {
                        if let Err(e) = sender.send_packet(&packet) {
                            debug!("audio send: {e}");
                        }
                    }
                }
                Err(e) => warn!("audio encode: {e}"),
            }
        }
        debug!("audio pipeline finished");
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(samples_per_channel: usize, timestamp_us: u64) -> AudioBlock {
        AudioBlock {
            samples: vec![0.0f32; samples_per_channel * 2],
            samples_per_channel,
            channels: 2,
            timestamp_us,
        }
    }

    #[test]
    fn exact_frames_encode_one_packet_each() {
        // 48 kHz / 10 ms → 480 samples per channel per frame.
        let mut enc = OpusAudioEncoder::new(48_000, 2, 128_000, 10, false).unwrap();

        let packets = enc.encode(&block(480, 1_000_000)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].timestamp_us, 1_000_000);
        assert_eq!(packets[0].samples_per_channel, 480);
        assert!(!packets[0].data.is_empty());
    }

    #[test]
    fn small_blocks_accumulate() {
        let mut enc = OpusAudioEncoder::new(48_000, 2, 128_000, 10, false).unwrap();

        // 3 × 160 = 480 samples per channel: exactly one frame, stamped
        // with the first block's timestamp.
        assert!(enc.encode(&block(160, 500_000)).unwrap().is_empty());
        assert!(enc.encode(&block(160, 503_333)).unwrap().is_empty());
        let packets = enc.encode(&block(160, 506_666)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].timestamp_us, 500_000);
    }

    #[test]
    fn large_block_emits_multiple_packets_with_advancing_timestamps() {
        let mut enc = OpusAudioEncoder::new(48_000, 2, 128_000, 10, false).unwrap();

        // 3.5 frames in one block: three packets, half a frame kept.
        let packets = enc.encode(&block(1680, 2_000_000)).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].timestamp_us, 2_000_000);
        assert_eq!(packets[1].timestamp_us, 2_010_000);
        assert_eq!(packets[2].timestamp_us, 2_020_000);

        // The remaining 240 samples complete a frame with the carried
        // timestamp.
        let packets = enc.encode(&block(240, 9_999_999)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].timestamp_us, 2_030_000);
    }

    #[test]
    fn mono_frames_use_channel_count() {
        let mut enc = OpusAudioEncoder::new(48_000, 1, 64_000, 20, false).unwrap();
        let block = AudioBlock {
            samples: vec![0.0f32; 960],
            samples_per_channel: 960,
            channels: 1,
            timestamp_us: 0,
        };
        let packets = enc.encode(&block).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].samples_per_channel, 960);
    }

    #[test]
    fn rejects_more_than_two_channels() {
        assert!(OpusAudioEncoder::new(48_000, 3, 128_000, 10, false).is_err());
    }
}
