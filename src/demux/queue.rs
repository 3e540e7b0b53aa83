//! Per-codec elementary stream queues.
//!
//! PES payloads arrive as byte ranges tagged with a media time. Each queue
//! kind knows how to cut those bytes into decoder-consumable access units
//! and how to recognize the stream format from the first decodable unit.
//! A queue whose format has been cleared (after a format-change
//! discontinuity) keeps cutting units but reports no format until it can
//! re-detect one.

use crate::clock::MediaTime;
use crate::demux::source::AccessUnit;

use bytes::Bytes;
use std::collections::VecDeque;

/// ADTS sampling_frequency_index table.
const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// MPEG-1 audio sample rates; MPEG-2 halves them, MPEG-2.5 quarters them.
const MPEG_AUDIO_SAMPLE_RATES: [u32; 3] = [44100, 48000, 32000];

/// MPEG-1 bitrate tables (kbit/s) indexed by layer (I, II, III).
const MPEG1_BITRATES: [[u32; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];

/// MPEG-2/2.5 bitrate tables (kbit/s): layer I, then layers II+III.
const MPEG2_BITRATES: [[u32; 15]; 2] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

/// The format detected on an elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFormat {
    /// H.264/AVC video.
    H264 {
        /// profile_idc from the active SPS.
        profile_idc: u8,
        /// level_idc from the active SPS.
        level_idc: u8,
    },
    /// AAC audio in an ADTS envelope.
    Aac {
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Channel configuration.
        channels: u32,
    },
    /// MPEG-1/2 audio (layers I-III).
    MpegAudio {
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Channel count.
        channels: u32,
        /// Layer number (1-3).
        layer: u8,
    },
    /// MPEG-1/2 video.
    MpegVideo {
        /// Horizontal size from the sequence header.
        width: u32,
        /// Vertical size from the sequence header.
        height: u32,
    },
    /// MPEG-4 part 2 video.
    Mpeg4Video,
    /// Uncompressed PCM audio.
    PcmAudio {
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Channel count.
        channels: u32,
        /// Bits per sample.
        bits_per_sample: u32,
    },
}

impl StreamFormat {
    /// True for the audio formats.
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            StreamFormat::Aac { .. } | StreamFormat::MpegAudio { .. } | StreamFormat::PcmAudio { .. }
        )
    }
}

/// Queue kind, selected by the PMT stream_type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// stream_type 0x1B.
    H264,
    /// stream_type 0x0F (ADTS).
    AacAdts,
    /// stream_type 0x03 / 0x04.
    MpegAudio,
    /// stream_type 0x01 / 0x02.
    MpegVideo,
    /// stream_type 0x10.
    Mpeg4Video,
    /// stream_type 0x83.
    PcmAudio,
}

impl QueueKind {
    /// Map a PMT stream_type to a queue kind. Unknown types carry no queue
    /// and their packets are skipped.
    pub fn from_stream_type(stream_type: u8) -> Option<QueueKind> {
        match stream_type {
            0x01 | 0x02 => Some(QueueKind::MpegVideo),
            0x03 | 0x04 => Some(QueueKind::MpegAudio),
            0x0F => Some(QueueKind::AacAdts),
            0x10 => Some(QueueKind::Mpeg4Video),
            0x1B => Some(QueueKind::H264),
            0x83 => Some(QueueKind::PcmAudio),
            _ => None,
        }
    }

    /// True for the audio kinds.
    pub fn is_audio(self) -> bool {
        matches!(
            self,
            QueueKind::AacAdts | QueueKind::MpegAudio | QueueKind::PcmAudio
        )
    }
}

/// An elementary stream queue for one PID.
pub struct ElementaryQueue {
    kind: QueueKind,
    /// When set, every appended range is a complete access unit (the Wi-Fi
    /// Display source emits PES-aligned video).
    aligned: bool,
    buffer: Vec<u8>,
    /// `(offset, time)` of each appended PES range still in `buffer`.
    /// The front entry always describes offset 0.
    marks: VecDeque<(usize, Option<MediaTime>)>,
    format: Option<StreamFormat>,
}

impl ElementaryQueue {
    /// Create a queue of the given kind.
    pub fn new(kind: QueueKind, aligned: bool) -> Self {
        ElementaryQueue {
            kind,
            aligned,
            buffer: Vec::new(),
            marks: VecDeque::new(),
            format: None,
        }
    }

    /// The detected format, once a decodable unit has been seen.
    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    /// Append one PES payload range.
    pub fn append(&mut self, data: &[u8], time: Option<MediaTime>) {
        if data.is_empty() {
            return;
        }
        self.marks.push_back((self.buffer.len(), time));
        self.buffer.extend_from_slice(data);
    }

    /// Drop buffered bytes; `clear_format` also forgets the detected
    /// format (used on format-change discontinuities).
    pub fn clear(&mut self, clear_format: bool) {
        self.buffer.clear();
        self.marks.clear();
        if clear_format {
            self.format = None;
        }
    }

    /// Cut the next whole access unit off the front of the buffer, if one
    /// is complete.
    pub fn dequeue_access_unit(&mut self) -> Option<AccessUnit> {
        match self.kind {
            QueueKind::PcmAudio => self.dequeue_pcm(),
            QueueKind::AacAdts => self.dequeue_aac(),
            QueueKind::MpegAudio => self.dequeue_mpeg_audio(),
            QueueKind::H264 => self.dequeue_h264(),
            QueueKind::MpegVideo => self.dequeue_mpeg_video(),
            QueueKind::Mpeg4Video => self.dequeue_mpeg4_video(),
        }
    }

    /// Remove `n` front bytes and emit them as an access unit stamped with
    /// the time of the range the unit starts in.
    fn take_front(&mut self, n: usize) -> AccessUnit {
        let time = self.marks.front().and_then(|&(_, t)| t);
        let data = Bytes::copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        self.shift_marks(n);
        AccessUnit { data, time }
    }

    /// Remove `n` front bytes without emitting them (resync).
    fn discard_front(&mut self, n: usize) {
        self.buffer.drain(..n);
        self.shift_marks(n);
    }

    fn shift_marks(&mut self, n: usize) {
        let mut carry = None;
        while let Some(&(off, t)) = self.marks.front() {
            if off < n {
                carry = Some(t);
                self.marks.pop_front();
            } else {
                break;
            }
        }
        for mark in self.marks.iter_mut() {
            mark.0 -= n;
        }
        if !self.buffer.is_empty() && self.marks.front().map(|&(off, _)| off) != Some(0) {
            // The new front starts mid-range; it inherits that range's time.
            self.marks.push_front((0, carry.flatten()));
        }
        if self.buffer.is_empty() {
            self.marks.clear();
        }
    }

    fn dequeue_pcm(&mut self) -> Option<AccessUnit> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.format.is_none() {
            self.format = Some(StreamFormat::PcmAudio {
                sample_rate: 48000,
                channels: 2,
                bits_per_sample: 16,
            });
        }
        let n = self.buffer.len();
        Some(self.take_front(n))
    }

    fn dequeue_aac(&mut self) -> Option<AccessUnit> {
        loop {
            if self.buffer.len() < 7 {
                return None;
            }
            let b = &self.buffer;
            // ADTS syncword: 12 bits of 1, layer must be 0.
            if !(b[0] == 0xFF && (b[1] & 0xF6) == 0xF0) {
                let skip = next_adts_sync(b).unwrap_or(b.len());
                tracing::warn!(skip, "AAC queue lost sync, discarding");
                self.discard_front(skip);
                continue;
            }
            let frame_length =
                ((b[3] as usize & 0x03) << 11) | ((b[4] as usize) << 3) | (b[5] as usize >> 5);
            if frame_length < 7 {
                self.discard_front(1);
                continue;
            }
            if self.buffer.len() < frame_length {
                return None;
            }
            if self.format.is_none() {
                let sr_index = (self.buffer[2] >> 2) & 0x0F;
                let channels =
                    (((self.buffer[2] & 0x01) as u32) << 2) | ((self.buffer[3] >> 6) as u32);
                if let Some(&sample_rate) = AAC_SAMPLE_RATES.get(sr_index as usize) {
                    self.format = Some(StreamFormat::Aac {
                        sample_rate,
                        channels,
                    });
                }
            }
            return Some(self.take_front(frame_length));
        }
    }

    fn dequeue_mpeg_audio(&mut self) -> Option<AccessUnit> {
        loop {
            if self.buffer.len() < 4 {
                return None;
            }
            let Some(header) = MpegAudioHeader::parse(&self.buffer) else {
                tracing::warn!("MPEG audio queue lost sync, discarding one byte");
                self.discard_front(1);
                continue;
            };
            if self.buffer.len() < header.frame_length {
                return None;
            }
            if self.format.is_none() {
                self.format = Some(StreamFormat::MpegAudio {
                    sample_rate: header.sample_rate,
                    channels: header.channels,
                    layer: header.layer,
                });
            }
            return Some(self.take_front(header.frame_length));
        }
    }

    fn dequeue_h264(&mut self) -> Option<AccessUnit> {
        if self.buffer.is_empty() {
            return None;
        }

        if self.aligned {
            if self.format.is_none() {
                self.format = detect_h264_format(&self.buffer);
            }
            let n = self.buffer.len();
            return Some(self.take_front(n));
        }

        // Unaligned: an access unit ends where a new AUD, parameter set or
        // picture NAL begins after picture data.
        let mut saw_vcl = false;
        let mut boundary = None;
        for (pos, nal_type) in NalIter::new(&self.buffer) {
            let is_vcl = (1..=5).contains(&nal_type);
            if saw_vcl && (is_vcl || nal_type == 7 || nal_type == 8 || nal_type == 9) {
                boundary = Some(pos);
                break;
            }
            if is_vcl {
                saw_vcl = true;
            }
        }
        let boundary = boundary?;
        if self.format.is_none() {
            self.format = detect_h264_format(&self.buffer[..boundary]);
        }
        Some(self.take_front(boundary))
    }

    fn dequeue_mpeg_video(&mut self) -> Option<AccessUnit> {
        let mut picture_at = None;
        let mut boundary = None;
        let mut detected = None;
        for (pos, code) in StartCodeIter::new(&self.buffer) {
            match code {
                0xB3 => {
                    if detected.is_none() && self.format.is_none() {
                        let d = &self.buffer[pos..];
                        if d.len() >= 8 {
                            let width = ((d[4] as u32) << 4) | ((d[5] as u32) >> 4);
                            let height = (((d[5] as u32) & 0x0F) << 8) | (d[6] as u32);
                            detected = Some(StreamFormat::MpegVideo { width, height });
                        }
                    }
                    if picture_at.is_some() {
                        boundary = Some(pos);
                        break;
                    }
                }
                // A second picture or a GOP start closes the unit.
                0x00 | 0xB8 if picture_at.is_some() => {
                    boundary = Some(pos);
                    break;
                }
                0x00 => picture_at = Some(pos),
                _ => {}
            }
        }
        if self.format.is_none() {
            self.format = detected;
        }
        boundary.map(|pos| self.take_front(pos))
    }

    fn dequeue_mpeg4_video(&mut self) -> Option<AccessUnit> {
        let mut vop_at = None;
        let mut boundary = None;
        let mut saw_vol = false;
        for (pos, code) in StartCodeIter::new(&self.buffer) {
            match code {
                0x20..=0x2F => {
                    saw_vol = true;
                    if vop_at.is_some() {
                        boundary = Some(pos);
                        break;
                    }
                }
                0xB6 if vop_at.is_some() => {
                    boundary = Some(pos);
                    break;
                }
                0xB6 => vop_at = Some(pos),
                0xB0 | 0xB5 if vop_at.is_some() => {
                    boundary = Some(pos);
                    break;
                }
                _ => {}
            }
        }
        if saw_vol && self.format.is_none() {
            self.format = Some(StreamFormat::Mpeg4Video);
        }
        boundary.map(|pos| self.take_front(pos))
    }
}

struct MpegAudioHeader {
    frame_length: usize,
    sample_rate: u32,
    channels: u32,
    layer: u8,
}

impl MpegAudioHeader {
    fn parse(b: &[u8]) -> Option<MpegAudioHeader> {
        if b.len() < 4 || b[0] != 0xFF || (b[1] & 0xE0) != 0xE0 {
            return None;
        }
        let version_bits = (b[1] >> 3) & 0x03; // 3 = MPEG1, 2 = MPEG2, 0 = MPEG2.5
        let layer_bits = (b[1] >> 1) & 0x03; // 3 = I, 2 = II, 1 = III
        if version_bits == 1 || layer_bits == 0 {
            return None;
        }
        let bitrate_index = (b[2] >> 4) & 0x0F;
        let sr_index = (b[2] >> 2) & 0x03;
        if bitrate_index == 0 || bitrate_index == 0x0F || sr_index == 3 {
            return None;
        }
        let padding = ((b[2] >> 1) & 0x01) as usize;

        let layer = 4 - layer_bits; // 1, 2 or 3
        let mut sample_rate = MPEG_AUDIO_SAMPLE_RATES[sr_index as usize];
        match version_bits {
            2 => sample_rate /= 2,
            0 => sample_rate /= 4,
            _ => {}
        }

        let bitrate = if version_bits == 3 {
            MPEG1_BITRATES[(layer - 1) as usize][bitrate_index as usize]
        } else {
            MPEG2_BITRATES[if layer == 1 { 0 } else { 1 }][bitrate_index as usize]
        } * 1000;

        let frame_length = match layer {
            1 => (12 * bitrate as usize / sample_rate as usize + padding) * 4,
            2 => 144 * bitrate as usize / sample_rate as usize + padding,
            _ => {
                // Layer III halves the samples per frame for MPEG-2/2.5.
                let coefficient = if version_bits == 3 { 144 } else { 72 };
                coefficient * bitrate as usize / sample_rate as usize + padding
            }
        };
        if frame_length < 4 {
            return None;
        }

        let channel_mode = (b[3] >> 6) & 0x03;
        Some(MpegAudioHeader {
            frame_length,
            sample_rate,
            channels: if channel_mode == 3 { 1 } else { 2 },
            layer,
        })
    }
}

fn next_adts_sync(b: &[u8]) -> Option<usize> {
    (1..b.len().saturating_sub(1)).find(|&i| b[i] == 0xFF && (b[i + 1] & 0xF6) == 0xF0)
}

/// Iterate `(position_of_start_code, nal_type)` over Annex-B data.
struct NalIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NalIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        NalIter { data, pos: 0 }
    }
}

impl Iterator for NalIter<'_> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<(usize, u8)> {
        while self.pos + 3 < self.data.len() {
            let d = self.data;
            let i = self.pos;
            if d[i] == 0 && d[i + 1] == 0 && d[i + 2] == 1 {
                // Fold a preceding zero (4-byte start code) into the match.
                let start = if i > 0 && d[i - 1] == 0 { i - 1 } else { i };
                let nal_type = d[i + 3] & 0x1F;
                self.pos = i + 3;
                return Some((start, nal_type));
            }
            self.pos += 1;
        }
        None
    }
}

/// Iterate `(position, code)` over MPEG start codes `00 00 01 xx`.
struct StartCodeIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StartCodeIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        StartCodeIter { data, pos: 0 }
    }
}

impl Iterator for StartCodeIter<'_> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<(usize, u8)> {
        while self.pos + 3 < self.data.len() {
            let d = self.data;
            let i = self.pos;
            if d[i] == 0 && d[i + 1] == 0 && d[i + 2] == 1 {
                self.pos = i + 3;
                return Some((i, d[i + 3]));
            }
            self.pos += 1;
        }
        None
    }
}

fn detect_h264_format(data: &[u8]) -> Option<StreamFormat> {
    let mut sps = None;
    let mut has_pps = false;
    for (pos, nal_type) in NalIter::new(data) {
        match nal_type {
            7 => {
                // Profile and level sit right after the NAL header.
                let start = pos + if data[pos] == 0 && data.get(pos + 3) == Some(&1) { 4 } else { 3 };
                if data.len() > start + 3 {
                    sps = Some((data[start + 1], data[start + 3]));
                }
            }
            8 => has_pps = true,
            _ => {}
        }
    }
    match (sps, has_pps) {
        (Some((profile_idc, level_idc)), true) => Some(StreamFormat::H264 {
            profile_idc,
            level_idc,
        }),
        _ => None,
    }
}
