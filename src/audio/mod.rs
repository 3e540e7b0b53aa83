//! Audio pass-through.
//!
//! The audio HAL itself is an external collaborator: the crate defines the
//! [`AudioRecorder`] and [`AudioPlayer`] seams and the [`loopback`] engine
//! that bridges them. HAL callback threads call into the loopback; the
//! loopback never calls back into user code except through the typed event
//! callback.

pub mod loopback;

pub use loopback::{AudioLoopback, LoopbackEvent};

use crate::error::Result;

/// Channel layouts the loopback supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// One channel.
    Mono,
    /// Two interleaved channels.
    Stereo,
}

impl ChannelLayout {
    /// Number of channels.
    pub fn channels(self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// Capture side of the HAL. Recorded buffers arrive on the HAL's callback
/// thread, which the embedder wires to
/// [`AudioLoopback::on_record_buffer`](loopback::AudioLoopback::on_record_buffer).
pub trait AudioRecorder: Send {
    /// Start capturing.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing.
    fn stop(&mut self) -> Result<()>;
}

/// Playback side of the HAL. 16-bit interleaved PCM.
pub trait AudioPlayer: Send {
    /// Start playback.
    fn start(&mut self) -> Result<()>;

    /// Pause playback without dropping queued samples.
    fn pause(&mut self) -> Result<()>;

    /// Drop queued samples.
    fn flush(&mut self) -> Result<()>;

    /// Stop playback.
    fn stop(&mut self) -> Result<()>;

    /// Blocking write; returns frames accepted. Blocking on a full ring
    /// buffer is the loopback's only backpressure mechanism.
    fn write(&mut self, samples: &[i16]) -> Result<usize>;

    /// Non-blocking write; `Err(Error::WouldBlock)` once the ring buffer
    /// is full.
    fn try_write(&mut self, samples: &[i16]) -> Result<usize>;

    /// The HAL callback granularity in frames.
    fn notification_frames(&self) -> usize;

    /// The HAL period in frames.
    fn period_frames(&self) -> usize;

    /// Sample rate in Hz.
    fn sample_rate(&self) -> u32;
}
