//! Hardware video encoder with probe-and-select.
//!
//! # Candidate matrix
//!
//! For each codec in preference order (AUTO → AV1, HEVC, H.264) the
//! probe tries, in order:
//!
//! | Backend | Elements | Devices |
//! |---------|----------|---------|
//! | VA-API (gst-va) | `va{codec}enc`, `va{node}{codec}enc` | every `/dev/dri/renderD*` |
//! | VA-API (legacy) | `vaapi{codec}enc` | driver default |
//! | NVENC | `nv{codec}enc` | `cuda-device-id` 0..2 |
//! | Software | `x264enc` (H.264 only) | — |
//!
//! The first candidate whose pipeline reaches `Playing` wins; every
//! failed attempt is torn down and logged at debug level. An exhausted
//! matrix is fatal. A rate-control property an element refuses simply
//! fails that probe, which is how "backend does not honour the mode"
//! falls through to the next backend.
//!
//! # Pipeline
//!
//! ```text
//! appsrc (NV12, converted in-process)
//!   → <selected encoder>
//!   → <stream caps> → <parser>
//!   → appsink (complete access units)
//! ```
//!
//! B-frames and look-ahead are off everywhere; a single encoder worker
//! keeps latency at one frame.

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use slatecast_core::config::{CodecPreference, EncoderConfig, RateControl};
use slatecast_core::{CodecKind, EncodedFrame, Error, RawFrame, Result};

use crate::nv12::{bgra_to_nv12, nv12_buffer_size};

/// How many NVENC device indices to probe.
const NVENC_DEVICE_PROBE: u32 = 2;

// ── Candidate matrix ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Candidate {
    codec: CodecKind,
    element: String,
    props: String,
    label: String,
}

fn codec_order(pref: CodecPreference) -> &'static [CodecKind] {
    match pref {
        CodecPreference::Auto => &[CodecKind::Av1, CodecKind::Hevc, CodecKind::H264],
        CodecPreference::Av1 => &[CodecKind::Av1],
        CodecPreference::Hevc => &[CodecKind::Hevc],
        CodecPreference::H264 => &[CodecKind::H264],
    }
}

fn codec_suffix(codec: CodecKind) -> &'static str {
    match codec {
        CodecKind::Av1 => "av1",
        CodecKind::Hevc => "h265",
        CodecKind::H264 => "h264",
    }
}

/// Sorted render nodes under /dev/dri (renderD128, renderD129, …).
fn render_nodes() -> Vec<String> {
    let mut nodes: Vec<String> = std::fs::read_dir("/dev/dri")
        .map(|dir| {
            dir.flatten()
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.starts_with("renderD"))
                .collect()
        })
        .unwrap_or_default();
    nodes.sort();
    nodes
}

/// gst-va registers the first render node under the plain element name
/// and every further node with the node name infixed.
fn va_element_name(index: usize, node: &str, suffix: &str) -> String {
    if index == 0 {
        format!("va{suffix}enc")
    } else {
        format!("va{node}{suffix}enc")
    }
}

/// Speed tier for the adaptive-CQP mode: the higher the frame rate, the
/// less time the encoder gets per picture. 0 = quality, 1 = balanced,
/// 2 = fast.
fn adaptive_tier(framerate: u32) -> usize {
    if framerate > 60 {
        2
    } else if framerate >= 30 {
        1
    } else {
        0
    }
}

fn va_props(config: &EncoderConfig) -> String {
    let kbps = config.bitrate_bps / 1000;
    let cpb_kbits = config.buffer_bits() / 1000;
    let gop = config.gop_size;
    let q = config.cqp;
    match config.rate_control {
        RateControl::CbrLowLatency => format!(
            "rate-control=cbr bitrate={kbps} cpb-size={cpb_kbits} key-int-max={gop} b-frames=0 target-usage=7"
        ),
        RateControl::CbrBalanced => format!(
            "rate-control=cbr bitrate={kbps} cpb-size={cpb_kbits} key-int-max={gop} b-frames=0 target-usage=4"
        ),
        RateControl::CqpHighQuality => {
            format!("rate-control=cqp qpi={q} qpp={q} key-int-max={gop} b-frames=0 target-usage=2")
        }
        RateControl::AdaptiveCqp => {
            let usage = [2u32, 4, 6][adaptive_tier(config.framerate)];
            format!(
                "rate-control=cqp qpi={q} qpp={q} key-int-max={gop} b-frames=0 target-usage={usage}"
            )
        }
    }
}

fn vaapi_props(config: &EncoderConfig) -> String {
    let kbps = config.bitrate_bps / 1000;
    let gop = config.gop_size;
    let q = config.cqp;
    match config.rate_control {
        RateControl::CbrLowLatency => format!(
            "rate-control=cbr bitrate={kbps} keyframe-period={gop} max-bframes=0 quality-level=7"
        ),
        RateControl::CbrBalanced => format!(
            "rate-control=cbr bitrate={kbps} keyframe-period={gop} max-bframes=0 quality-level=4"
        ),
        RateControl::CqpHighQuality => format!(
            "rate-control=cqp init-qp={q} keyframe-period={gop} max-bframes=0 quality-level=2"
        ),
        RateControl::AdaptiveCqp => {
            let level = [2u32, 4, 6][adaptive_tier(config.framerate)];
            format!(
                "rate-control=cqp init-qp={q} keyframe-period={gop} max-bframes=0 quality-level={level}"
            )
        }
    }
}

fn nvenc_props(config: &EncoderConfig) -> String {
    let kbps = config.bitrate_bps / 1000;
    let gop = config.gop_size;
    let q = config.cqp;
    match config.rate_control {
        RateControl::CbrLowLatency | RateControl::CbrBalanced => format!(
            "preset=low-latency-hq rc-mode=cbr bitrate={kbps} gop-size={gop} zerolatency=true"
        ),
        RateControl::CqpHighQuality => {
            format!("preset=hq rc-mode=constqp qp-const={q} gop-size={gop}")
        }
        RateControl::AdaptiveCqp => {
            let preset = ["hq", "low-latency-hq", "low-latency-hp"][adaptive_tier(config.framerate)];
            format!("preset={preset} rc-mode=constqp qp-const={q} gop-size={gop}")
        }
    }
}

fn x264_props(config: &EncoderConfig) -> String {
    let kbps = config.bitrate_bps / 1000;
    let gop = config.gop_size;
    let q = config.cqp;
    match config.rate_control {
        RateControl::CbrLowLatency => format!(
            "tune=zerolatency speed-preset=ultrafast bitrate={kbps} key-int-max={gop} bframes=0"
        ),
        RateControl::CbrBalanced => format!(
            "tune=zerolatency speed-preset=veryfast bitrate={kbps} key-int-max={gop} bframes=0"
        ),
        RateControl::CqpHighQuality => format!(
            "tune=zerolatency speed-preset=medium pass=quant quantizer={q} key-int-max={gop} bframes=0"
        ),
        RateControl::AdaptiveCqp => {
            let preset = ["fast", "veryfast", "superfast"][adaptive_tier(config.framerate)];
            format!(
                "tune=zerolatency speed-preset={preset} pass=quant quantizer={q} key-int-max={gop} bframes=0"
            )
        }
    }
}

fn candidates(config: &EncoderConfig, nodes: &[String]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for &codec in codec_order(config.codec) {
        let suffix = codec_suffix(codec);

        for (index, node) in nodes.iter().enumerate() {
            out.push(Candidate {
                codec,
                element: va_element_name(index, node, suffix),
                props: va_props(config),
                label: format!("VA-API on /dev/dri/{node}"),
            });
        }

        // The legacy vaapi plugin has no AV1 encoder.
        if codec != CodecKind::Av1 {
            out.push(Candidate {
                codec,
                element: format!("vaapi{suffix}enc"),
                props: vaapi_props(config),
                label: "VA-API (legacy)".to_owned(),
            });
        }

        for device in 0..NVENC_DEVICE_PROBE {
            out.push(Candidate {
                codec,
                element: format!("nv{suffix}enc"),
                props: format!("cuda-device-id={device} {}", nvenc_props(config)),
                label: format!("NVENC device {device}"),
            });
        }

        if codec == CodecKind::H264 {
            out.push(Candidate {
                codec,
                element: "x264enc".to_owned(),
                props: x264_props(config),
                label: "software x264".to_owned(),
            });
        }
    }
    out
}

fn stream_tail(codec: CodecKind) -> &'static str {
    match codec {
        CodecKind::H264 => "! video/x-h264,stream-format=byte-stream,alignment=au ! h264parse",
        CodecKind::Hevc => "! video/x-h265,stream-format=byte-stream,alignment=au ! h265parse",
        CodecKind::Av1 => "! av1parse",
    }
}

// ── VideoEncoder ──────────────────────────────────────────────────────────────

pub struct VideoEncoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoder_element: gst::Element,
    encoded_rx: mpsc::Receiver<EncodedFrame>,
    codec: CodecKind,
    nv12_buf: Vec<u8>,
    keyframe_requested: bool,
    frames_in: u64,
}

impl VideoEncoder {
    /// Walk the candidate matrix and keep the first encoder that opens.
    pub fn probe(config: &EncoderConfig) -> Result<Self> {
        gst::init().map_err(|e| Error::encode(format!("gstreamer init: {e}")))?;

        let nodes = render_nodes();
        info!("probing encoders across {} render node(s)", nodes.len());

        for candidate in candidates(config, &nodes) {
            if gst::ElementFactory::find(&candidate.element).is_none() {
                trace!("{} not present, skipping", candidate.element);
                continue;
            }
            match Self::open(&candidate, config) {
                Ok(encoder) => {
                    info!(
                        "selected {} encoder '{}' ({})",
                        candidate.codec, candidate.element, candidate.label
                    );
                    return Ok(encoder);
                }
                Err(e) => debug!("probe {} ({}): {e}", candidate.element, candidate.label),
            }
        }

        Err(Error::unavailable(
            "no working video encoder on any device (probed VA-API, NVENC and x264)",
        ))
    }

    fn open(candidate: &Candidate, config: &EncoderConfig) -> Result<Self> {
        let description = format!(
            "appsrc name=src is-live=true format=time \
                 caps=\"video/x-raw,format=NV12,width={w},height={h},framerate={fps}/1\" \
             ! {element} name=enc {props} \
             {tail} \
             ! appsink name=sink max-buffers=4 drop=false sync=false",
            w = config.width,
            h = config.height,
            fps = config.framerate,
            element = candidate.element,
            props = candidate.props,
            tail = stream_tail(candidate.codec),
        );
        debug!("encoder pipeline: {description}");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| Error::encode(format!("pipeline parse: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::encode("expected a pipeline"))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| Error::encode("appsrc missing"))?
            .downcast::<AppSrc>()
            .map_err(|_| Error::encode("'src' is not an appsrc"))?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| Error::encode("appsink missing"))?
            .downcast::<AppSink>()
            .map_err(|_| Error::encode("'sink' is not an appsink"))?;
        let encoder_element =
            pipeline.by_name("enc").ok_or_else(|| Error::encode("encoder element missing"))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<EncodedFrame>(16);
        let codec = candidate.codec;
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;

                    let timestamp_us = buffer.pts().map(|t| t.useconds()).unwrap_or(0);
                    let is_keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let frame = EncodedFrame {
                        data: Bytes::copy_from_slice(map.as_slice()),
                        timestamp_us,
                        is_keyframe,
                        codec,
                    };

                    if encoded_tx.blocking_send(frame).is_err() {
                        return Err(gst::FlowError::Flushing);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        // This is where an unsupported codec/device/mode combination
        // actually fails.
        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(Error::encode(format!("pipeline start: {e}")));
        }

        Ok(Self {
            pipeline,
            appsrc,
            encoder_element,
            encoded_rx,
            codec,
            nv12_buf: vec![0u8; nv12_buffer_size(config.width, config.height)],
            keyframe_requested: false,
            frames_in: 0,
        })
    }

    /// The codec the client must be told about.
    pub fn actual_codec(&self) -> CodecKind {
        self.codec
    }

    /// Make the next submitted frame a keyframe. One-shot: the request
    /// is consumed when the next frame is pushed, whether or not the
    /// backend honours it (the client re-asserts if it keeps receiving
    /// delta frames).
    pub fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    /// Convert and submit one frame; returns the next finished access
    /// unit if one is ready. `Ok(None)` is the encoder's "need more
    /// input".
    pub fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>> {
        bgra_to_nv12(&frame.data, frame.width, frame.height, frame.stride, &mut self.nv12_buf);

        let mut buffer = gst::Buffer::with_size(self.nv12_buf.len())
            .map_err(|e| Error::encode(format!("buffer alloc: {e}")))?;
        {
            let buffer = buffer.get_mut().expect("freshly allocated buffer is unique");
            buffer.set_pts(gst::ClockTime::from_useconds(frame.timestamp_us));
            let mut map = buffer
                .map_writable()
                .map_err(|_| Error::encode("cannot map encode buffer"))?;
            map.copy_from_slice(&self.nv12_buf);
        }

        if self.keyframe_requested {
            let structure = gst::Structure::builder("GstForceKeyUnit")
                .field("all-headers", true)
                .build();
            self.encoder_element.send_event(gst::event::CustomUpstream::new(structure));
            self.keyframe_requested = false;
            debug!("forced keyframe at frame {}", self.frames_in);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| Error::encode(format!("appsrc push: {e:?}")))?;
        self.frames_in += 1;

        match self.encoded_rx.try_recv() {
            Ok(encoded) => Ok(Some(encoded)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(Error::encode("encoder pipeline terminated"))
            }
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
