//! Adaptive QoS for the outgoing audio/video stream.
//!
//! Two sub-policies share one set of stream statistics fed by the RTP
//! packetizer. The *buffering* policy pauses and resumes the frame source
//! with hysteresis between two queue-depth watermarks; the *bitrate* policy
//! walks the encoder's target bitrate up and down from the smoothed queue
//! depth and the measured send rate.
//!
//! All entry points take the caller's notion of "now" in microseconds, so
//! the policy is deterministic and clock-free.

use kanal::{Receiver, Sender};
use std::collections::VecDeque;

const LOW_BUFFERING_WATERMARK_DEFAULT: i64 = 100_000;
const HIGH_BUFFERING_WATERMARK_DEFAULT: i64 = 10_000_000;
const MIN_ESTIMATION_INTERVAL_US: i64 = 1_200_000;
const MIN_EMERGENCY_ESTIMATION_INTERVAL_US: i64 = 600_000;
const DATA_RATE_ESTIMATION_INTERVAL_US: i64 = 3_000_000;
const BIT_RATE_CHECK_PERIOD_US: i64 = 500_000;
const TARGET_BIT_RATE_DEFAULT: i64 = 5_000_000;
const IGNORE_STARTUP_PTS_COUNT: i64 = 3;
const INITIAL_FRAME_DURATION_US: i64 = 20_000;

/// Decisions the policy emits to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosEvent {
    /// Stop feeding frames: the send queue crossed the high watermark.
    PauseVideo,
    /// Resume feeding frames: the queue drained below the low watermark.
    ResumeVideo,
    /// Reconfigure the encoder to this bitrate (bits per second).
    ChangeBitRate(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Rise,
    Fall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Downgrade,
    Upgrade,
}

/// Pause/resume hysteresis between two watermarks.
struct BufferingPolicy {
    low_watermark: i64,
    high_watermark: i64,
    overflow: bool,
}

impl BufferingPolicy {
    fn new() -> BufferingPolicy {
        BufferingPolicy {
            low_watermark: LOW_BUFFERING_WATERMARK_DEFAULT,
            high_watermark: HIGH_BUFFERING_WATERMARK_DEFAULT,
            overflow: false,
        }
    }

    fn set_policy(&mut self, low_watermark: i64, high_watermark: i64) {
        self.low_watermark = low_watermark;
        self.high_watermark = high_watermark;
    }

    fn check_policy(&mut self, edge: Edge, queue_length: i64) -> Option<QosEvent> {
        match edge {
            Edge::Rise if !self.overflow && queue_length > self.high_watermark => {
                self.overflow = true;
                Some(QosEvent::PauseVideo)
            }
            Edge::Fall if self.overflow && queue_length <= self.low_watermark => {
                self.overflow = false;
                Some(QosEvent::ResumeVideo)
            }
            _ => None,
        }
    }
}

/// Ring of recent bitrates observed while the policy held steady.
struct SteadyStateTracker {
    steady_count: i64,
    bit_rates: [i64; Self::LEN],
    bit_rate_count: usize,
    write_index: usize,
}

impl SteadyStateTracker {
    const LEN: usize = 32;

    fn new() -> SteadyStateTracker {
        SteadyStateTracker {
            steady_count: 0,
            bit_rates: [0; Self::LEN],
            bit_rate_count: 0,
            write_index: 0,
        }
    }

    fn reset(&mut self) {
        self.steady_count = 0;
        self.bit_rate_count = 0;
        self.write_index = 0;
    }

    fn update(&mut self, action: Action, bit_rate: i64) {
        if action == Action::None {
            self.steady_count += 1;
            if self.steady_count > 3 {
                self.bit_rates[self.write_index] = bit_rate;
                self.bit_rate_count += 1;
                self.write_index = (self.write_index + 1) % Self::LEN;
            }
        } else {
            self.steady_count = 0;
        }
    }

    fn average_bit_rate(&self) -> i64 {
        let count = self.bit_rate_count.min(Self::LEN);
        if count == 0 {
            return 0;
        }
        let sum: i64 = self.bit_rates[..count].iter().sum();
        sum / count as i64
    }
}

/// Encoder bitrate walking.
struct BitRatePolicy {
    target_bit_rate: i64,
    current_bit_rate: i64,
    aggressive_downgrade_watermark: i64,
    aggressive_upgrade_watermark: i64,
    downgrade_watermark: i64,
    upgrade_watermark: i64,
    action: Action,
    bit_rate_step: i64,
    steady: SteadyStateTracker,
}

impl BitRatePolicy {
    const DOWNGRADE_STEP: i64 = 800_000;
    const UPGRADE_STEP: i64 = 400_000;
    const UPGRADE_ABOVE_STEADY_STEP: i64 = 150_000;
    const DOWNGRADE_ATTENUATION: f64 = 0.6;
    const UPGRADE_ATTENUATION: f64 = 0.7;
    const DOWNGRADE_FACTOR: f64 = 0.8;
    const MINIMAL_STEP: i64 = 50_000;
    const MINIMAL_BIT_RATE: i64 = 1_000_000;
    const DATA_RATE_THRESHOLD: f64 = 0.05;

    fn new() -> BitRatePolicy {
        BitRatePolicy {
            target_bit_rate: TARGET_BIT_RATE_DEFAULT,
            current_bit_rate: TARGET_BIT_RATE_DEFAULT,
            aggressive_downgrade_watermark: 0,
            aggressive_upgrade_watermark: 0,
            downgrade_watermark: 0,
            upgrade_watermark: 0,
            action: Action::None,
            bit_rate_step: 0,
            steady: SteadyStateTracker::new(),
        }
    }

    fn set_target_bit_rate(&mut self, bit_rate: u32) {
        self.target_bit_rate = bit_rate as i64;
    }

    fn set_policy(&mut self, low_watermark: i64, high_watermark: i64) {
        self.aggressive_downgrade_watermark = (high_watermark as f64 * 0.5) as i64;
        self.aggressive_upgrade_watermark = (low_watermark as f64 * 0.5) as i64;
        self.downgrade_watermark = (high_watermark as f64 * 0.4) as i64;
        self.upgrade_watermark = low_watermark;

        self.action = Action::None;
        self.bit_rate_step = 0;
        self.steady.reset();
    }

    /// Returns the new bitrate when the decision changes it.
    fn check_policy(&mut self, queue_length: i64, data_rate: i64) -> Option<u32> {
        let mut new_bit_rate = self.current_bit_rate;
        let data_rate_delta = self.current_bit_rate - data_rate;
        let data_rate_action =
            data_rate_delta as f64 > self.current_bit_rate as f64 * Self::DATA_RATE_THRESHOLD;
        let latency_action = queue_length < self.aggressive_upgrade_watermark
            || queue_length > self.aggressive_downgrade_watermark;

        if data_rate_action || latency_action {
            let step = if data_rate_action && queue_length > self.downgrade_watermark {
                self.next_step(Action::Downgrade, Some(data_rate_delta))
            } else if queue_length > self.aggressive_downgrade_watermark {
                self.next_step(Action::Downgrade, None)
            } else if queue_length < self.upgrade_watermark
                && self.current_bit_rate < self.target_bit_rate
            {
                self.next_step(Action::Upgrade, None)
            } else {
                self.action = Action::None;
                0
            };

            match self.action {
                Action::Downgrade => {
                    new_bit_rate = (new_bit_rate - step).max(Self::MINIMAL_BIT_RATE);
                }
                Action::Upgrade => {
                    new_bit_rate = (new_bit_rate + step).min(self.target_bit_rate);
                }
                Action::None => {}
            }
        } else {
            self.action = Action::None;
        }

        self.steady.update(self.action, self.current_bit_rate);

        if new_bit_rate != self.current_bit_rate {
            tracing::info!(
                from = self.current_bit_rate,
                to = new_bit_rate,
                queue_length,
                data_rate,
                "bitrate change"
            );
            self.current_bit_rate = new_bit_rate;
            Some(new_bit_rate as u32)
        } else {
            None
        }
    }

    fn next_step(&mut self, action: Action, data_rate_delta: Option<i64>) -> i64 {
        if action != self.action {
            let steady_bit_rate = self.steady.average_bit_rate();
            self.bit_rate_step = match action {
                Action::Downgrade => Self::DOWNGRADE_STEP,
                Action::Upgrade => {
                    if steady_bit_rate > 0
                        && self.current_bit_rate + Self::UPGRADE_STEP > steady_bit_rate
                    {
                        Self::UPGRADE_ABOVE_STEADY_STEP
                    } else {
                        Self::UPGRADE_STEP
                    }
                }
                Action::None => 0,
            };
            self.action = action;
        } else {
            let attenuation = match action {
                Action::Downgrade => Self::DOWNGRADE_ATTENUATION,
                Action::Upgrade => Self::UPGRADE_ATTENUATION,
                Action::None => 0.0,
            };
            self.bit_rate_step =
                ((attenuation * self.bit_rate_step as f64) as i64).max(Self::MINIMAL_STEP);
        }

        let mut step = self.bit_rate_step;
        if let Some(delta) = data_rate_delta {
            // A step smaller than the measured shortfall would chase the
            // congestion instead of getting ahead of it.
            if step < delta {
                step = (delta as f64 * Self::DOWNGRADE_FACTOR) as i64;
            }
        }
        step
    }
}

/// The QoS controller.
pub struct QosPolicy {
    events: Sender<QosEvent>,

    queue_count: i64,
    last_queued_pts: i64,
    average_frame_duration: i64,
    frame_duration_seeded: bool,

    queue_length_average: i64,
    queue_length_average_start_us: Option<i64>,
    data_rate: VecDeque<(i64, u32)>,
    emergency_count: u32,
    emergency_watermark: i64,
    last_bit_rate_check_us: i64,

    buffering: BufferingPolicy,
    bit_rate: BitRatePolicy,
}

impl QosPolicy {
    /// Create a policy with default watermarks; decisions arrive on the
    /// returned channel.
    pub fn new() -> (QosPolicy, Receiver<QosEvent>) {
        let (tx, rx) = kanal::unbounded();
        let mut policy = QosPolicy {
            events: tx,
            queue_count: 0,
            last_queued_pts: -IGNORE_STARTUP_PTS_COUNT,
            average_frame_duration: INITIAL_FRAME_DURATION_US,
            frame_duration_seeded: false,
            queue_length_average: 0,
            queue_length_average_start_us: None,
            data_rate: VecDeque::new(),
            emergency_count: 0,
            emergency_watermark: 0,
            last_bit_rate_check_us: 0,
            buffering: BufferingPolicy::new(),
            bit_rate: BitRatePolicy::new(),
        };
        policy.set_policy(
            LOW_BUFFERING_WATERMARK_DEFAULT,
            HIGH_BUFFERING_WATERMARK_DEFAULT,
        );
        (policy, rx)
    }

    /// The bitrate ceiling the operator allows.
    pub fn set_target_bit_rate(&mut self, bit_rate: u32) {
        self.bit_rate.set_target_bit_rate(bit_rate);
    }

    /// Replace both watermarks (microseconds of queue depth) and reset the
    /// derived state.
    pub fn set_policy(&mut self, low_watermark_us: i64, high_watermark_us: i64) {
        self.emergency_watermark = (high_watermark_us as f64 * 0.75) as i64;
        self.buffering.set_policy(low_watermark_us, high_watermark_us);
        self.bit_rate.set_policy(low_watermark_us, high_watermark_us);
        self.reset_stream_statistics(self.last_bit_rate_check_us);
    }

    fn reset_stream_statistics(&mut self, now_us: i64) {
        self.data_rate.clear();
        self.queue_length_average_start_us = None;
        self.queue_length_average = 0;
        self.last_bit_rate_check_us = now_us;
        self.emergency_count = 0;
    }

    /// A fresh frame entered the send queue.
    pub fn report_queued_packet(&mut self, _now_us: i64, pts_us: i64) {
        self.queue_count += 1;
        self.update_frame_duration(pts_us);
        if let Some(event) = self
            .buffering
            .check_policy(Edge::Rise, self.queue_length())
        {
            self.emit(event);
        }
    }

    /// A frame left the send queue.
    pub fn report_sent_packet(&mut self, now_us: i64, _pts_us: i64, packet_size: u32) {
        self.queue_count -= 1;

        self.update_data_rate(now_us, packet_size);
        self.update_queue_length_average(now_us);
        self.check_for_emergency(now_us);

        if let Some(event) = self
            .buffering
            .check_policy(Edge::Fall, self.queue_length())
        {
            self.emit(event);
        }
        self.check_bit_rate_policy(now_us);
    }

    fn emit(&self, event: QosEvent) {
        match event {
            QosEvent::ChangeBitRate(_) => {
                metrics::counter!(crate::observability::QOS_BITRATE_CHANGES).increment(1)
            }
            _ => metrics::counter!(crate::observability::QOS_BUFFERING_EDGES).increment(1),
        }
        if self.events.send(event).is_err() {
            tracing::warn!(?event, "QoS event dropped, receiver gone");
        }
    }

    fn update_frame_duration(&mut self, pts_us: i64) {
        if self.last_queued_pts < 0 {
            // Startup skip: the first timestamps out of a fresh encoder are
            // not trustworthy spacing samples.
            self.last_queued_pts += 1;
            if self.last_queued_pts < 0 {
                return;
            }
        } else {
            let duration = pts_us - self.last_queued_pts;
            if !self.frame_duration_seeded {
                self.average_frame_duration = duration.max(1);
                self.frame_duration_seeded = true;
            } else {
                let delta = (duration - self.average_frame_duration).abs();
                // Running average with an adaptive factor: samples close to
                // the average weigh 1/16, big PTS jumps as little as 1/1024.
                let factor = (delta / (2 * self.average_frame_duration) + 4).min(10);
                self.average_frame_duration = ((self.average_frame_duration
                    * ((1 << factor) - 1))
                    + duration)
                    >> factor;
            }
        }
        self.last_queued_pts = pts_us;
    }

    /// Estimated queue depth in microseconds. The frame currently being
    /// sent is not counted.
    pub fn queue_length(&self) -> i64 {
        ((self.queue_count - 1) * self.average_frame_duration).max(0)
    }

    /// The smoothed inter-frame spacing in microseconds.
    pub fn average_frame_duration(&self) -> i64 {
        self.average_frame_duration
    }

    fn update_queue_length_average(&mut self, now_us: i64) {
        let queue_length = self.queue_length();
        match self.queue_length_average_start_us {
            None => {
                self.queue_length_average_start_us = Some(now_us);
                self.queue_length_average = queue_length;
            }
            Some(_) => {
                // Asymmetric EWMA: growth is tracked faster than decay.
                self.queue_length_average = if queue_length > self.queue_length_average {
                    (self.queue_length_average * 11 + queue_length * 5) / 16
                } else {
                    (self.queue_length_average * 15 + queue_length) / 16
                };
            }
        }
    }

    fn queue_length_average(&self, now_us: i64) -> Option<i64> {
        let interval = self
            .queue_length_average_start_us
            .map_or(0, |start| now_us - start);
        if self.is_emergency() || interval >= MIN_ESTIMATION_INTERVAL_US {
            Some(self.queue_length_average)
        } else {
            None
        }
    }

    fn update_data_rate(&mut self, now_us: i64, packet_size: u32) {
        self.data_rate.push_back((now_us, packet_size));
        // Trim to the estimation horizon, keeping one sample beyond it so
        // the measured interval always spans the full window.
        while self.data_rate.len() >= 2 {
            let second_time = self.data_rate[1].0;
            if now_us - second_time >= DATA_RATE_ESTIMATION_INTERVAL_US {
                self.data_rate.pop_front();
            } else {
                break;
            }
        }
    }

    fn data_rate(&self) -> Option<i64> {
        let first = self.data_rate.front()?;
        let last = self.data_rate.back()?;
        let interval = last.0 - first.0;
        if (self.is_emergency() && interval > 0) || interval >= MIN_ESTIMATION_INTERVAL_US {
            let accumulated: i64 = self.data_rate.iter().map(|&(_, size)| size as i64).sum();
            Some(accumulated * 8 * 1_000_000 / interval)
        } else {
            None
        }
    }

    fn check_for_emergency(&mut self, now_us: i64) {
        if self.queue_length_average > self.emergency_watermark {
            if self.emergency_count == 0 {
                let sustained = self
                    .queue_length_average_start_us
                    .is_some_and(|start| now_us - start >= MIN_EMERGENCY_ESTIMATION_INTERVAL_US);
                if sustained {
                    self.emergency_count += 1;
                }
            } else {
                self.emergency_count += 1;
            }
        } else {
            self.emergency_count = 0;
        }
    }

    /// True exactly once per sustained overload, triggering an immediate
    /// bitrate check.
    pub fn is_emergency(&self) -> bool {
        self.emergency_count == 1
    }

    fn check_bit_rate_policy(&mut self, now_us: i64) {
        if !(self.is_emergency()
            || now_us - self.last_bit_rate_check_us >= BIT_RATE_CHECK_PERIOD_US)
        {
            return;
        }

        let queue_length = self.queue_length_average(now_us);
        let data_rate = self.data_rate();
        if let (Some(queue_length), Some(data_rate)) = (queue_length, data_rate) {
            if let Some(new_bit_rate) = self.bit_rate.check_policy(queue_length, data_rate) {
                self.emit(QosEvent::ChangeBitRate(new_bit_rate));
                // Fresh statistics after a change, so the next decision
                // measures the new operating point instead of thrashing.
                self.reset_stream_statistics(now_us);
            }
        }
        self.last_bit_rate_check_us = now_us;
    }
}
