//! Downstream access-unit sources.
//!
//! A [`PacketSource`] is created by a TS stream the moment its elementary
//! queue determines a format, and stays attached to that stream for the
//! parser's lifetime. The producing side enqueues access units,
//! discontinuities and end-of-stream; the consuming side (a decoder thread)
//! drains them through a [`PacketSourceHandle`]. Single producer, single
//! consumer.

use crate::clock::MediaTime;
use crate::demux::queue::StreamFormat;
use crate::error::{Error, Result};

use bytes::Bytes;
use kanal::{Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A decoder-consumable unit of elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// The unit's bytes (e.g. one H.264 NAL group or one ADTS frame).
    pub data: Bytes,
    /// Presentation time, when the covering PES packet carried one.
    pub time: Option<MediaTime>,
}

/// Discontinuity categories, combinable as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscontinuityType(u32);

impl DiscontinuityType {
    /// Timeline jump.
    pub const TIME: DiscontinuityType = DiscontinuityType(0x01);
    /// Audio format will change.
    pub const AUDIO_FORMAT: DiscontinuityType = DiscontinuityType(0x02);
    /// Video format will change.
    pub const VIDEO_FORMAT: DiscontinuityType = DiscontinuityType(0x04);
    /// The embedder supplies an absolute time anchor.
    pub const ABSOLUTE_TIME: DiscontinuityType = DiscontinuityType(0x08);
    /// Everything changes: time plus both formats.
    pub const FORMAT_CHANGE: DiscontinuityType = DiscontinuityType(0x01 | 0x02 | 0x04);

    /// Whether all bits of `other` are present.
    pub fn contains(self, other: DiscontinuityType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DiscontinuityType {
    type Output = DiscontinuityType;

    fn bitor(self, rhs: DiscontinuityType) -> DiscontinuityType {
        DiscontinuityType(self.0 | rhs.0)
    }
}

/// Optional payload accompanying a discontinuity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscontinuityExtra {
    /// Raw 90 kHz PTS playback should resume at.
    pub resume_at_pts: Option<u64>,
    /// The same point converted through the program clock; filled in by the
    /// stream before the discontinuity is forwarded.
    pub resume_at_media_time: Option<MediaTime>,
}

/// Item delivered to a source consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceItem {
    /// A complete access unit.
    AccessUnit(AccessUnit),
    /// A signalled discontinuity.
    Discontinuity {
        /// What is discontinuous.
        kind: DiscontinuityType,
        /// Attached resume information.
        extra: DiscontinuityExtra,
    },
    /// No further items will follow.
    EndOfStream {
        /// Why the stream ended (decoders surface this to their caller).
        reason: String,
    },
}

struct SourceShared {
    format: Mutex<Option<StreamFormat>>,
    is_audio: bool,
}

/// Producer half, owned by the demultiplexer stream.
pub struct PacketSource {
    shared: Arc<SourceShared>,
    tx: Sender<SourceItem>,
    rx: Receiver<SourceItem>,
}

impl PacketSource {
    /// Create a source with a latched initial format.
    pub fn new(format: StreamFormat) -> PacketSource {
        let (tx, rx) = kanal::unbounded();
        let is_audio = format.is_audio();
        PacketSource {
            shared: Arc::new(SourceShared {
                format: Mutex::new(Some(format)),
                is_audio,
            }),
            tx,
            rx,
        }
    }

    /// A consumer handle. May be taken multiple times, but a single
    /// consumer is assumed.
    pub fn handle(&self) -> PacketSourceHandle {
        PacketSourceHandle {
            shared: Arc::clone(&self.shared),
            rx: self.rx.clone(),
        }
    }

    /// The currently latched format.
    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.format.lock().unwrap().clone()
    }

    /// Re-latch the format after a format-clearing discontinuity.
    pub fn set_format(&self, format: StreamFormat) {
        *self.shared.format.lock().unwrap() = Some(format);
    }

    /// Enqueue one access unit.
    pub fn queue_access_unit(&self, unit: AccessUnit) {
        metrics::counter!(crate::observability::TS_ACCESS_UNITS).increment(1);
        if self.tx.send(SourceItem::AccessUnit(unit)).is_err() {
            tracing::debug!("access unit dropped, consumer gone");
        }
    }

    /// Forward a discontinuity. A format-change matching this source's
    /// media kind clears the latched format.
    pub fn queue_discontinuity(&self, kind: DiscontinuityType, extra: DiscontinuityExtra) {
        let clears = if self.shared.is_audio {
            kind.contains(DiscontinuityType::AUDIO_FORMAT)
        } else {
            kind.contains(DiscontinuityType::VIDEO_FORMAT)
        };
        if clears {
            *self.shared.format.lock().unwrap() = None;
        }
        let _ = self.tx.send(SourceItem::Discontinuity { kind, extra });
    }

    /// Signal that no further items will follow.
    pub fn signal_eos(&self, reason: impl Into<String>) {
        let _ = self.tx.send(SourceItem::EndOfStream {
            reason: reason.into(),
        });
    }
}

/// Consumer half, handed to a decoder.
#[derive(Clone)]
pub struct PacketSourceHandle {
    shared: Arc<SourceShared>,
    rx: Receiver<SourceItem>,
}

impl PacketSourceHandle {
    /// The currently latched format. `None` between a format-clearing
    /// discontinuity and re-detection.
    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.format.lock().unwrap().clone()
    }

    /// Blocking dequeue of the next item.
    pub fn dequeue(&self) -> Result<SourceItem> {
        self.rx
            .recv()
            .map_err(|_| Error::FailedTransaction("packet source closed".into()))
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<SourceItem> {
        self.rx.try_recv().ok().flatten()
    }
}
