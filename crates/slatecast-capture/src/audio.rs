//! System-audio capture on a dedicated cpal thread.
//!
//! cpal streams are not `Send`, so the stream lives on its own OS thread
//! for its whole lifetime. The stream callback copies the borrowed
//! sample slice into an owned [`AudioBlock`] and `try_send`s it into a
//! bounded channel — the callback never suspends, and blocks are dropped
//! rather than queued when the consumer lags.
//!
//! To capture desktop audio on PulseAudio/PipeWire hosts, pass the name
//! of a monitor source (e.g. `alsa_output…analog-stereo.monitor`) as the
//! device; the default input device is used otherwise.

use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use slatecast_core::{AudioBlock, Error, Result};

/// Bounded handoff to the encoder task; at 10 ms blocks this is more
/// than a second of slack.
const BLOCK_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Substring match against the host's input device names; `None`
    /// uses the default input device.
    pub device: Option<String>,
}

/// Handle to the capture thread. Dropping it stops the stream.
pub struct AudioCapture {
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapture {
    /// Start capturing. Blocks until the stream is live or failed.
    pub fn start(
        config: AudioCaptureConfig,
        blocks: mpsc::Sender<AudioBlock>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(config, blocks, stop_rx, ready_tx))
            .map_err(|e| Error::unavailable(format!("audio thread spawn: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self { stop_tx, thread: Some(thread) }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::unavailable("audio capture did not come up")),
        }
    }

    /// Stop the stream and join the thread.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn capture_thread(
    config: AudioCaptureConfig,
    blocks: mpsc::Sender<AudioBlock>,
    stop_rx: std_mpsc::Receiver<()>,
    ready_tx: std_mpsc::Sender<Result<()>>,
) {
    let stream = match build_stream(&config, blocks) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::unavailable(format!("audio stream start: {e}"))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Park until the handle asks us to stop (or is dropped).
    let _ = stop_rx.recv();
    drop(stream);
    debug!("audio capture thread exiting");
}

fn build_stream(
    config: &AudioCaptureConfig,
    blocks: mpsc::Sender<AudioBlock>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = match &config.device {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| Error::unavailable(format!("audio devices: {e}")))?
            .find(|d| d.name().map(|n| n.contains(wanted)).unwrap_or(false))
            .ok_or_else(|| Error::unavailable(format!("audio device '{wanted}' not found")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::unavailable("no default audio input device"))?,
    };
    info!(
        "audio capture device: {}",
        device.name().unwrap_or_else(|_| "<unnamed>".into())
    );

    let channels = config.channels;
    let stream_config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let started = Instant::now();
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let samples_per_channel = data.len() / channels as usize;
                if samples_per_channel == 0 {
                    return;
                }
                let block = AudioBlock {
                    samples: data.to_vec(),
                    samples_per_channel,
                    channels,
                    timestamp_us: started.elapsed().as_micros() as u64,
                };
                // Never block the audio callback; drop when full.
                let _ = blocks.try_send(block);
            },
            move |err| warn!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| Error::unavailable(format!("audio stream build: {e}")))?;

    Ok(stream)
}
