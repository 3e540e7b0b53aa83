//! RTSP session control for the Wi-Fi Display profile.
//!
//! [`message`] implements the RTSP/1.0 wire codec (framing, headers,
//! `text/parameters` bodies); [`sink`] implements the sink-side session
//! state machine over an embedder-supplied transport.

pub mod message;
pub mod sink;

pub use message::{MessageAssembler, MessageBuilder, Parameters, RtspMessage};
pub use sink::{RtspTransport, SinkCapabilities, SinkEvent, SinkState, WfdSink};
