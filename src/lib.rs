//! # aircast
//!
//! A Wi-Fi Display (Miracast) sink/source core: the protocol and media
//! plumbing between the network and the codecs.
//!
//! - **Capability negotiation**: the wfd_video_formats / wfd_audio_codecs /
//!   wfd_uibc_capability grammars with parsing, generation, matching and
//!   best-mode selection ([`caps`]), plus a device-keyed XML capability
//!   loader ([`config`]).
//! - **Transport stream demux**: PAT/PMT discovery, PES reassembly,
//!   PTS→media-time conversion and per-codec access-unit queues
//!   ([`demux`]).
//! - **RTSP session control**: the sink-side state machine over an
//!   embedder-supplied transport ([`rtsp`]).
//! - **Adaptive QoS**: buffering pause/resume and encoder bitrate
//!   adaptation from queue depth and measured send rate ([`qos`]).
//! - **Audio loopback**: a record→playback bridge with prefill, steady
//!   state detection and xrun recovery ([`audio`]).
//!
//! Capture devices, encoders, decoders, sockets and the audio HAL are
//! external collaborators reached through traits and channels; this crate
//! never opens a device or a socket itself.
//!
//! ## Quick start (sink side)
//!
//! ```rust,ignore
//! use aircast::prelude::*;
//!
//! let config = CapabilityConfig::parse(&xml, "Tablet2")?;
//! let caps = SinkCapabilities {
//!     video: config.video_parameters()?.expect("video caps"),
//!     audio: config.audio_parameters()?.expect("audio caps"),
//!     uibc: config.uibc_parameters().unwrap_or_default(),
//!     rtp_port: 19000,
//! };
//! let (mut sink, events) = WfdSink::new(socket, caps, "rtsp://peer/wfd1.0");
//! sink.connect()?;
//!
//! let mut parser = TsParser::new(TsFlags { aligned_video_data: true, ..Default::default() });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audio;
pub mod caps;
pub mod clock;
pub mod config;
pub mod demux;
pub mod error;
pub mod observability;
pub mod qos;
pub mod rtsp;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::audio::{AudioLoopback, AudioPlayer, AudioRecorder, ChannelLayout, LoopbackEvent};
    pub use crate::caps::{AudioMode, AudioParameters, UibcParameters, VideoMode, VideoParameters};
    pub use crate::clock::MediaTime;
    pub use crate::config::CapabilityConfig;
    pub use crate::demux::{SourceKind, TsFlags, TsParser};
    pub use crate::error::{Error, Result};
    pub use crate::qos::{QosEvent, QosPolicy};
    pub use crate::rtsp::{RtspTransport, SinkCapabilities, SinkEvent, WfdSink};
}

pub use error::{Error, Result};
