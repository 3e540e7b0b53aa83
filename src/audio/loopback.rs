//! Record→playback loopback engine.
//!
//! Bridges an [`AudioRecorder`] to an [`AudioPlayer`] sharing the same
//! sample rate, 16-bit PCM format and channel layout. The player's ring
//! buffer is first prefilled with silence until its non-blocking write
//! reports "would block" — from that point the track is in steady state and
//! every recorded buffer is forwarded with a blocking write, which is the
//! only place backpressure is applied. Xruns on either side drop the engine
//! back into the prefill path; the underlying devices are never restarted.

use crate::audio::{AudioPlayer, AudioRecorder, ChannelLayout};
use crate::error::{Error, Result};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const WARM_UP_POLLS: u32 = 10;
const WARM_UP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Events delivered to the owner-supplied callback. The discriminants are
/// part of the embedder contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackEvent {
    /// Non-recoverable read/write failure.
    Error = 0,
    /// The player buffer drained.
    Underrun = 1,
    /// The recorder buffer overflowed.
    Overrun = 2,
}

/// Owner-supplied event callback.
pub type EventCallback = Box<dyn Fn(LoopbackEvent) + Send + Sync>;

struct Devices<R, P> {
    recorder: R,
    player: P,
}

/// The loopback engine. HAL callback threads call
/// [`on_record_buffer`](AudioLoopback::on_record_buffer),
/// [`on_record_overrun`](AudioLoopback::on_record_overrun) and
/// [`on_player_underrun`](AudioLoopback::on_player_underrun); the owner
/// calls [`start`](AudioLoopback::start) and [`stop`](AudioLoopback::stop).
pub struct AudioLoopback<R: AudioRecorder, P: AudioPlayer> {
    devices: Mutex<Devices<R, P>>,
    layout: ChannelLayout,
    callback: EventCallback,
    flush_delay: Duration,

    running: AtomicBool,
    record_warm: AtomicBool,
    recovering: AtomicBool,
    track_steady: AtomicBool,
    waiting_for_stop: AtomicBool,
    frames_written: AtomicU64,
    frames_read: AtomicU64,
}

impl<R: AudioRecorder, P: AudioPlayer> AudioLoopback<R, P> {
    /// Create a loopback over the given devices.
    pub fn new(
        recorder: R,
        player: P,
        layout: ChannelLayout,
        callback: EventCallback,
    ) -> Result<AudioLoopback<R, P>> {
        if player.sample_rate() == 0 || player.notification_frames() == 0 {
            return Err(Error::InvalidState("player reports an empty format".into()));
        }
        // One HAL period: how long the playback server needs to drain a
        // flush. The delay after stop() papers over a race in the playback
        // service; keep it adjustable via `set_flush_delay`.
        let flush_delay = Duration::from_secs_f64(
            player.period_frames() as f64 / player.sample_rate() as f64,
        );
        Ok(AudioLoopback {
            devices: Mutex::new(Devices { recorder, player }),
            layout,
            callback,
            flush_delay,
            running: AtomicBool::new(false),
            record_warm: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            track_steady: AtomicBool::new(false),
            waiting_for_stop: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
        })
    }

    /// Override the post-flush settle delay.
    pub fn set_flush_delay(&mut self, delay: Duration) {
        self.flush_delay = delay;
    }

    /// Total frames forwarded to the player.
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Total frames received from the recorder.
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }

    /// Whether the player has reached steady state.
    pub fn track_steady(&self) -> bool {
        self.track_steady.load(Ordering::Acquire)
    }

    /// Whether the engine is recovering from an xrun.
    pub fn recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Spin the recorder once so its first callback under real load is not
    /// the slow path. Call after wiring the HAL callbacks; polls up to
    /// 10 × 10 ms for the first callback to land.
    pub fn warm_up(&self) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        self.record_warm.store(false, Ordering::Release);
        devices.recorder.start()?;
        for _ in 0..WARM_UP_POLLS {
            if self.record_warm.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(WARM_UP_POLL_INTERVAL);
        }
        if !self.record_warm.load(Ordering::Acquire) {
            tracing::warn!("recorder produced no callback during warm-up");
        }
        devices.recorder.stop()
    }

    /// Start the bridge: player first, prefill to steady state, then the
    /// recorder.
    pub fn start(&self) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if self.running.load(Ordering::Acquire) {
            return Err(Error::InvalidState("loopback already running".into()));
        }
        tracing::info!("loopback starting");

        devices.player.start()?;
        self.prefill(&mut devices.player)?;
        devices.recorder.start()?;

        self.frames_written.store(0, Ordering::Relaxed);
        self.frames_read.store(0, Ordering::Relaxed);
        self.recovering.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the bridge: pause and flush the player, wait one HAL period for
    /// the flush to drain, then stop the recorder.
    pub fn stop(&self) {
        self.waiting_for_stop.store(true, Ordering::Release);
        let mut devices = self.devices.lock().unwrap();
        if !self.running.swap(false, Ordering::AcqRel) {
            self.waiting_for_stop.store(false, Ordering::Release);
            return;
        }
        tracing::info!("loopback stopping");

        if let Err(err) = devices.player.pause().and_then(|_| devices.player.flush()) {
            tracing::warn!(%err, "player pause/flush failed");
        }
        std::thread::sleep(self.flush_delay);
        if let Err(err) = devices.recorder.stop() {
            tracing::warn!(%err, "recorder stop failed");
        }

        self.track_steady.store(false, Ordering::Release);
        self.waiting_for_stop.store(false, Ordering::Release);
    }

    /// Write silence until the player's non-blocking write reports a full
    /// ring buffer; that is the steady-state condition.
    fn prefill(&self, player: &mut P) -> Result<()> {
        let silence = vec![0i16; player.notification_frames() * self.layout.channels()];
        loop {
            match player.try_write(&silence) {
                Ok(0) | Err(Error::WouldBlock) => {
                    self.track_steady.store(true, Ordering::Release);
                    return Ok(());
                }
                Ok(written) => {
                    self.frames_written.fetch_add(written as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    (self.callback)(LoopbackEvent::Error);
                    return Err(err);
                }
            }
        }
    }

    /// HAL record callback: forward one captured buffer of interleaved
    /// samples. Never blocks on user code; the only blocking call is the
    /// player write.
    pub fn on_record_buffer(&self, samples: &[i16]) {
        self.record_warm.store(true, Ordering::Release);
        if !self.running.load(Ordering::Acquire) || self.waiting_for_stop.load(Ordering::Acquire) {
            return;
        }
        let mut devices = self.devices.lock().unwrap();
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        if !self.track_steady.load(Ordering::Acquire) || self.recovering.load(Ordering::Acquire) {
            if self.prefill(&mut devices.player).is_err() {
                return;
            }
            self.recovering.store(false, Ordering::Release);
        }

        let frames = samples.len() / self.layout.channels();
        match devices.player.write(samples) {
            Ok(written) => {
                self.frames_written
                    .fetch_add(written as u64, Ordering::Relaxed);
                if written < frames {
                    tracing::warn!(want = frames, got = written, "short player write");
                    (self.callback)(LoopbackEvent::Error);
                }
            }
            Err(err) => {
                tracing::warn!(%err, "player write failed");
                (self.callback)(LoopbackEvent::Error);
            }
        }
        self.frames_read.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// HAL notification: the recorder overran.
    pub fn on_record_overrun(&self) {
        tracing::warn!("recorder overrun");
        self.enter_recovery();
        (self.callback)(LoopbackEvent::Overrun);
    }

    /// HAL notification: the player underran.
    pub fn on_player_underrun(&self) {
        tracing::warn!("player underrun");
        self.enter_recovery();
        (self.callback)(LoopbackEvent::Underrun);
    }

    fn enter_recovery(&self) {
        self.recovering.store(true, Ordering::Release);
        self.track_steady.store(false, Ordering::Release);
    }
}
