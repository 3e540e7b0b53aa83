//! Program and elementary stream state.
//!
//! A [`Program`] owns the streams announced by its PMT. Each [`Stream`]
//! reassembles PES packets from TS payloads, unpacks them, converts PTS to
//! media time through the program clock and feeds the per-codec elementary
//! queue, delivering finished access units to its packet source.

use crate::clock::{pts_to_micros, MediaTime};
use crate::demux::psi::{parse_pmt, PmtStreamInfo};
use crate::demux::queue::{ElementaryQueue, QueueKind};
use crate::demux::source::{
    DiscontinuityExtra, DiscontinuityType, PacketSource, PacketSourceHandle,
};
use crate::error::{Error, Result};

/// Stream IDs that carry section-style payloads rather than elementary
/// data: program_stream_map, padding, private_stream_2, ECM, EMM, DSMCC,
/// H.222.1 type E and program_stream_directory.
const NON_ES_STREAM_IDS: [u8; 8] = [0xBC, 0xBE, 0xBF, 0xF0, 0xF1, 0xF2, 0xF8, 0xFF];

/// Reassembly buffers grow in 64 KiB multiples.
const BUFFER_CHUNK: usize = 64 * 1024;

/// Timeline state shared by all streams of one program.
#[derive(Debug, Clone)]
pub(crate) struct ProgramClock {
    first_pts: Option<u64>,
    absolute_timestamps: bool,
    anchor_us: Option<i64>,
}

impl ProgramClock {
    pub(crate) fn new(absolute_timestamps: bool, anchor_us: Option<i64>) -> ProgramClock {
        ProgramClock {
            first_pts: None,
            absolute_timestamps,
            anchor_us,
        }
    }

    /// Convert a 90 kHz PTS to media time. The first observed PTS freezes
    /// the program anchor unless timestamps are configured absolute;
    /// earlier timestamps clamp to the anchor.
    pub(crate) fn convert_pts(&mut self, pts: u64) -> MediaTime {
        let mut pts = pts;
        if !self.absolute_timestamps {
            match self.first_pts {
                None => {
                    self.first_pts = Some(pts);
                    pts = 0;
                }
                Some(first) if pts < first => pts = 0,
                Some(first) => pts -= first,
            }
        }
        let mut time_us = pts_to_micros(pts);
        if let Some(anchor) = self.anchor_us {
            time_us += anchor;
        }
        MediaTime::from_micros(time_us)
    }

    pub(crate) fn pts_established(&self) -> bool {
        self.first_pts.is_some()
    }
}

/// One elementary stream within a program.
pub(crate) struct Stream {
    pid: u16,
    stream_type: u8,
    pcr_pid: u16,
    expected_continuity_counter: Option<u8>,
    payload_started: bool,
    buffer: Vec<u8>,
    queue: Option<ElementaryQueue>,
    source: Option<PacketSource>,
}

impl Stream {
    pub(crate) fn new(pid: u16, stream_type: u8, pcr_pid: u16, aligned_video: bool) -> Stream {
        let queue = QueueKind::from_stream_type(stream_type)
            .map(|kind| ElementaryQueue::new(kind, aligned_video && kind == QueueKind::H264));
        tracing::debug!(pid, stream_type, pcr_pid, "new stream");
        Stream {
            pid,
            stream_type,
            pcr_pid,
            expected_continuity_counter: None,
            payload_started: false,
            buffer: Vec::new(),
            queue,
            source: None,
        }
    }

    pub(crate) fn pid(&self) -> u16 {
        self.pid
    }

    pub(crate) fn set_pid(&mut self, pid: u16) {
        self.pid = pid;
    }

    pub(crate) fn stream_type(&self) -> u8 {
        self.stream_type
    }

    pub(crate) fn is_video(&self) -> bool {
        matches!(self.stream_type, 0x01 | 0x02 | 0x10 | 0x1B)
    }

    pub(crate) fn is_audio(&self) -> bool {
        matches!(self.stream_type, 0x03 | 0x04 | 0x0F | 0x83)
    }

    pub(crate) fn source_handle(&self) -> Option<PacketSourceHandle> {
        self.source.as_ref().map(|s| s.handle())
    }

    /// Consume one TS payload for this PID.
    pub(crate) fn parse(
        &mut self,
        continuity_counter: u8,
        payload_unit_start: bool,
        payload: &[u8],
        clock: &mut ProgramClock,
    ) -> Result<()> {
        if self.queue.is_none() {
            return Ok(());
        }

        if let Some(expected) = self.expected_continuity_counter {
            if expected != continuity_counter {
                tracing::info!(pid = self.pid, "continuity discontinuity, dropping PES");
                metrics::counter!(crate::observability::TS_CONTINUITY_ERRORS).increment(1);
                self.payload_started = false;
                self.buffer.clear();
                self.expected_continuity_counter = None;
                return Ok(());
            }
        }
        self.expected_continuity_counter = Some((continuity_counter + 1) & 0x0F);

        if payload_unit_start {
            if self.payload_started {
                // Flush the previous PES before starting a new one; without
                // this, trailing bytes of a unit whose start we never saw
                // could masquerade as a complete packet.
                self.flush(clock)?;
            }
            self.payload_started = true;
        }

        if !self.payload_started {
            return Ok(());
        }

        let needed = self.buffer.len() + payload.len();
        if self.buffer.capacity() < needed {
            let rounded = needed.div_ceil(BUFFER_CHUNK) * BUFFER_CHUNK;
            self.buffer.reserve_exact(rounded - self.buffer.len());
        }
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    /// Unpack the PES accumulated so far.
    pub(crate) fn flush(&mut self, clock: &mut ProgramClock) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffer);
        let result = self.parse_pes(&data, clock);
        self.buffer = data;
        self.buffer.clear();
        result
    }

    fn parse_pes(&mut self, data: &[u8], clock: &mut ProgramClock) -> Result<()> {
        if data.len() < 6 {
            return Err(Error::malformed("PES shorter than its fixed header", data.len()));
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 1 {
            return Err(Error::malformed("PES start code must be 0x000001", 0));
        }
        let stream_id = data[3];
        let pes_packet_length = ((data[4] as usize) << 8) | data[5] as usize;

        if NON_ES_STREAM_IDS.contains(&stream_id) {
            return Ok(());
        }

        if data.len() < 9 {
            return Err(Error::malformed("PES optional header truncated", data.len()));
        }
        let pts_dts_flags = data[7] >> 6;
        let escr_flag = data[7] & 0x20 != 0;
        let es_rate_flag = data[7] & 0x10 != 0;
        let header_data_length = data[8] as usize;
        let payload_offset = 9 + header_data_length;
        if data.len() < payload_offset {
            return Err(Error::malformed("PES header data truncated", data.len()));
        }

        let mut pts = 0u64;
        let mut optional = &data[9..payload_offset];
        if pts_dts_flags == 2 || pts_dts_flags == 3 {
            if optional.len() < 5 {
                return Err(Error::malformed("PES PTS truncated", 9));
            }
            // Three groups interleaved with marker bits; markers are
            // tolerated rather than enforced so damaged headers still
            // recover.
            pts = (((optional[0] >> 1) & 0x07) as u64) << 30
                | (optional[1] as u64) << 22
                | ((optional[2] >> 1) as u64) << 15
                | (optional[3] as u64) << 7
                | (optional[4] >> 1) as u64;
            optional = &optional[5..];

            if pts_dts_flags == 3 {
                if optional.len() < 5 {
                    return Err(Error::malformed("PES DTS truncated", 14));
                }
                // DTS is decoded the same way; the elementary queues work
                // in presentation order so its value is not used.
                optional = &optional[5..];
            }
        }
        if escr_flag {
            if optional.len() < 6 {
                return Err(Error::malformed("PES ESCR truncated", payload_offset));
            }
            optional = &optional[6..];
        }
        if es_rate_flag && optional.len() < 3 {
            return Err(Error::malformed("PES ES_rate truncated", payload_offset));
        }

        metrics::counter!(crate::observability::TS_PES_PACKETS).increment(1);

        let payload = if pes_packet_length != 0 {
            let data_length = pes_packet_length
                .checked_sub(3 + header_data_length)
                .ok_or_else(|| Error::malformed("PES_packet_length inconsistent", 4))?;
            if data.len() - payload_offset < data_length {
                tracing::warn!(
                    have = data.len() - payload_offset,
                    want = data_length,
                    "PES packet does not carry enough data for its payload"
                );
                return Err(Error::malformed("PES payload truncated", payload_offset));
            }
            &data[payload_offset..payload_offset + data_length]
        } else {
            // Zero means "payload runs to the end of the packet".
            &data[payload_offset..]
        };

        let time = if pts_dts_flags == 2 || pts_dts_flags == 3 {
            Some(clock.convert_pts(pts))
        } else {
            None
        };
        self.deliver_payload(payload, time);
        Ok(())
    }

    fn deliver_payload(&mut self, payload: &[u8], time: Option<MediaTime>) {
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        queue.append(payload, time);

        while let Some(unit) = queue.dequeue_access_unit() {
            match (&mut self.source, queue.format()) {
                (None, Some(format)) => {
                    tracing::debug!(
                        pid = self.pid,
                        stream_type = self.stream_type,
                        ?format,
                        "stream now has data"
                    );
                    let source = PacketSource::new(format.clone());
                    source.queue_access_unit(unit);
                    self.source = Some(source);
                }
                (None, None) => {
                    // Units before the format is known cannot be decoded.
                }
                (Some(source), Some(format)) => {
                    // After a discontinuity the queue's format was cleared;
                    // once it re-establishes one, re-latch it on the source.
                    if source.format().is_none() {
                        source.set_format(format.clone());
                    }
                    source.queue_access_unit(unit);
                }
                (Some(_), None) => {
                    // Suspended until the queue reports a new format.
                }
            }
        }
    }

    pub(crate) fn signal_discontinuity(
        &mut self,
        kind: DiscontinuityType,
        extra: &mut DiscontinuityExtra,
        clock: &mut ProgramClock,
    ) {
        self.expected_continuity_counter = None;

        let clear_format = if self.is_audio() {
            kind.contains(DiscontinuityType::AUDIO_FORMAT)
        } else {
            kind.contains(DiscontinuityType::VIDEO_FORMAT)
        };

        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        self.payload_started = false;
        self.buffer.clear();
        queue.clear(clear_format);

        if kind.contains(DiscontinuityType::TIME) {
            if let Some(resume_at) = extra.resume_at_pts {
                extra.resume_at_media_time = Some(clock.convert_pts(resume_at));
            }
        }

        if let Some(source) = &self.source {
            source.queue_discontinuity(kind, extra.clone());
        }
    }

    pub(crate) fn signal_eos(&self, reason: &str) {
        if let Some(source) = &self.source {
            source.signal_eos(reason);
        }
    }
}

/// One program announced by the PAT.
pub(crate) struct Program {
    number: u16,
    program_map_pid: u16,
    clock: ProgramClock,
    streams: Vec<Stream>,
    aligned_video: bool,
}

impl Program {
    pub(crate) fn new(
        number: u16,
        program_map_pid: u16,
        clock: ProgramClock,
        aligned_video: bool,
    ) -> Program {
        tracing::debug!(number, program_map_pid, "new program");
        Program {
            number,
            program_map_pid,
            clock,
            streams: Vec::new(),
            aligned_video,
        }
    }

    pub(crate) fn number(&self) -> u16 {
        self.number
    }

    pub(crate) fn update_program_map_pid(&mut self, pid: u16) {
        self.program_map_pid = pid;
    }

    pub(crate) fn pts_established(&self) -> bool {
        self.clock.pts_established()
    }

    /// Whether any stream of this program designates `pid` as its PCR PID.
    pub(crate) fn uses_pcr_pid(&self, pid: u16) -> bool {
        self.streams.iter().any(|s| s.pcr_pid == pid)
    }

    /// Offer a complete PSI section; claims it when the PID is this
    /// program's map PID.
    pub(crate) fn parse_psi_section(&mut self, pid: u16, data: &[u8]) -> Option<Result<()>> {
        if pid != self.program_map_pid {
            return None;
        }
        Some(self.parse_program_map(data))
    }

    /// Offer a TS payload; claims it when some stream owns the PID.
    pub(crate) fn handle_pid(
        &mut self,
        pid: u16,
        continuity_counter: u8,
        payload_unit_start: bool,
        payload: &[u8],
    ) -> Option<Result<()>> {
        let clock = &mut self.clock;
        self.streams
            .iter_mut()
            .find(|s| s.pid() == pid)
            .map(|s| s.parse(continuity_counter, payload_unit_start, payload, clock))
    }

    fn parse_program_map(&mut self, data: &[u8]) -> Result<()> {
        let section = parse_pmt(data)?;

        let type_changed = |streams: &[Stream], info: &PmtStreamInfo| {
            streams
                .iter()
                .find(|s| s.pid() == info.elementary_pid)
                .is_some_and(|s| s.stream_type() != info.stream_type)
        };
        let pids_changed = section
            .streams
            .iter()
            .any(|info| type_changed(&self.streams, info));

        if pids_changed {
            tracing::info!(program = self.number, "stream PIDs have changed");
            // The only recoverable shape: exactly two streams whose
            // (PID, type) pairs swapped. Their buffers and sources are kept.
            let recovered = if self.streams.len() == 2 && section.streams.len() == 2 {
                let info1 = section.streams[0];
                let info2 = section.streams[1];
                let (s1_pid, s1_type) = (self.streams[0].pid, self.streams[0].stream_type);
                let (s2_pid, s2_type) = (self.streams[1].pid, self.streams[1].stream_type);

                let case_a = info1.elementary_pid == s1_pid
                    && info1.stream_type == s2_type
                    && info2.elementary_pid == s2_pid
                    && info2.stream_type == s1_type;
                let case_b = info1.elementary_pid == s2_pid
                    && info1.stream_type == s1_type
                    && info2.elementary_pid == s1_pid
                    && info2.stream_type == s2_type;

                if case_a || case_b {
                    self.streams[0].set_pid(s2_pid);
                    self.streams[1].set_pid(s1_pid);
                    true
                } else {
                    false
                }
            } else {
                false
            };

            if !recovered {
                tracing::warn!(program = self.number, "PID change is not recoverable");
                return Err(Error::malformed("stream PIDs changed irrecoverably", 0));
            }
        }

        for info in &section.streams {
            if !self.streams.iter().any(|s| s.pid == info.elementary_pid) {
                self.streams.push(Stream::new(
                    info.elementary_pid,
                    info.stream_type,
                    section.pcr_pid,
                    self.aligned_video,
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn signal_discontinuity(
        &mut self,
        kind: DiscontinuityType,
        extra: &mut DiscontinuityExtra,
    ) {
        let clock = &mut self.clock;
        for stream in &mut self.streams {
            stream.signal_discontinuity(kind, extra, clock);
        }
    }

    pub(crate) fn signal_eos(&self, reason: &str) {
        for stream in &self.streams {
            stream.signal_eos(reason);
        }
    }

    /// The first video (or audio) source that exists.
    pub(crate) fn source(&self, want_audio: bool) -> Option<PacketSourceHandle> {
        self.streams
            .iter()
            .filter(|s| if want_audio { s.is_audio() } else { s.is_video() })
            .find_map(|s| s.source_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::psi::testutil::make_pmt;
    use crate::demux::source::SourceItem;

    fn clock() -> ProgramClock {
        ProgramClock::new(false, None)
    }

    /// A PES packet with one ADTS frame and a PTS.
    fn pes_with_adts(pts: u64, frame_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; frame_len];
        frame[0] = 0xFF;
        frame[1] = 0xF1;
        frame[2] = 0x4C;
        frame[3] = 0x80 | ((frame_len >> 11) as u8 & 0x03);
        frame[4] = (frame_len >> 3) as u8;
        frame[5] = ((frame_len & 0x07) as u8) << 5;
        frame[6] = 0xFC;

        let mut pes = vec![0x00, 0x00, 0x01, 0xC0];
        let pes_len = 3 + 5 + frame.len(); // flags + PTS + payload
        pes.push((pes_len >> 8) as u8);
        pes.push(pes_len as u8);
        pes.push(0x80);
        pes.push(0x80); // PTS only
        pes.push(5);
        pes.push(0x21 | (((pts >> 30) as u8 & 0x07) << 1));
        pes.push((pts >> 22) as u8);
        pes.push(0x01 | (((pts >> 15) as u8 & 0x7F) << 1));
        pes.push((pts >> 7) as u8);
        pes.push(0x01 | (((pts) as u8 & 0x7F) << 1));
        pes.extend_from_slice(&frame);
        pes
    }

    #[test]
    fn test_pts_anchoring_is_relative_and_monotone() {
        let mut clock = clock();
        assert_eq!(clock.convert_pts(90_000), MediaTime::ZERO);
        assert!(clock.pts_established());
        assert_eq!(clock.convert_pts(180_000), MediaTime::from_secs(1));
        // Earlier than the anchor clamps to zero.
        assert_eq!(clock.convert_pts(100), MediaTime::ZERO);
    }

    #[test]
    fn test_absolute_timestamps_skip_anchoring() {
        let mut clock = ProgramClock::new(true, Some(500_000));
        assert_eq!(
            clock.convert_pts(90_000),
            MediaTime::from_micros(1_500_000)
        );
    }

    #[test]
    fn test_stream_delivers_access_unit() {
        let mut clock = clock();
        let mut stream = Stream::new(0x102, 0x0F, 0x101, false);
        let pes = pes_with_adts(90_000, 32);

        stream.parse(0, true, &pes, &mut clock).unwrap();
        // Nothing is delivered until the PES is flushed.
        assert!(stream.source_handle().is_none());

        stream.flush(&mut clock).unwrap();
        let handle = stream.source_handle().unwrap();
        match handle.try_dequeue().unwrap() {
            SourceItem::AccessUnit(unit) => {
                assert_eq!(unit.data.len(), 32);
                assert_eq!(unit.time, Some(MediaTime::ZERO));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_continuity_mismatch_drops_pes() {
        let mut clock = clock();
        let mut stream = Stream::new(0x102, 0x0F, 0x101, false);
        let pes = pes_with_adts(90_000, 64);

        stream.parse(0, true, &pes[..40], &mut clock).unwrap();
        // Counter jumps from 0 to 2: the partial PES must be dropped, not
        // stitched together.
        stream.parse(2, false, &pes[40..], &mut clock).unwrap();
        stream.flush(&mut clock).unwrap();
        assert!(stream.source_handle().is_none());

        // The stream re-arms on the next payload start.
        stream.parse(3, true, &pes, &mut clock).unwrap();
        stream.flush(&mut clock).unwrap();
        assert!(stream.source_handle().is_some());
    }

    #[test]
    fn test_payload_without_start_is_ignored() {
        let mut clock = clock();
        let mut stream = Stream::new(0x102, 0x0F, 0x101, false);
        let pes = pes_with_adts(90_000, 32);

        // Trailing bytes of a PES whose start we never saw.
        stream.parse(5, false, &pes[10..], &mut clock).unwrap();
        stream.flush(&mut clock).unwrap();
        assert!(stream.source_handle().is_none());
    }

    #[test]
    fn test_bad_start_code_is_malformed() {
        let mut clock = clock();
        let mut stream = Stream::new(0x102, 0x0F, 0x101, false);
        stream.parse(0, true, &[0xFF; 32], &mut clock).unwrap();
        assert!(stream.flush(&mut clock).is_err());
    }

    #[test]
    fn test_program_pid_swap_preserves_sources() {
        let mut program = Program::new(1, 0x100, clock(), true);
        program
            .parse_psi_section(0x100, &make_pmt(1, 0x101, &[(0x1B, 0x101), (0x0F, 0x102)]))
            .unwrap()
            .unwrap();

        // Deliver one audio PES so the audio stream latches a source.
        let pes = pes_with_adts(90_000, 32);
        program.handle_pid(0x102, 0, true, &pes).unwrap().unwrap();
        // A second payload start flushes the first PES.
        program.handle_pid(0x102, 1, true, &pes).unwrap().unwrap();
        let handle = program.source(true).unwrap();
        assert!(matches!(
            handle.try_dequeue().unwrap(),
            SourceItem::AccessUnit(_)
        ));

        // The two streams swap PIDs in a new PMT revision.
        program
            .parse_psi_section(0x100, &make_pmt(1, 0x101, &[(0x0F, 0x101), (0x1B, 0x102)]))
            .unwrap()
            .unwrap();

        // The audio source survived the swap and now answers on PID 0x101.
        let handle = program.source(true).unwrap();
        program.handle_pid(0x101, 2, true, &pes).unwrap().unwrap();
        program.handle_pid(0x101, 3, true, &pes).unwrap().unwrap();
        assert!(matches!(
            handle.try_dequeue().unwrap(),
            SourceItem::AccessUnit(_)
        ));
    }

    #[test]
    fn test_program_rejects_unrecoverable_pid_change() {
        let mut program = Program::new(1, 0x100, clock(), true);
        program
            .parse_psi_section(0x100, &make_pmt(1, 0x101, &[(0x1B, 0x101), (0x0F, 0x102)]))
            .unwrap()
            .unwrap();

        // Type change without a matching swap.
        let result = program
            .parse_psi_section(0x100, &make_pmt(1, 0x101, &[(0x0F, 0x101), (0x0F, 0x102)]))
            .unwrap();
        assert!(result.is_err());
        // No mutation happened: the original types are still in place.
        assert_eq!(program.streams[0].stream_type(), 0x1B);
        assert_eq!(program.streams[0].pid(), 0x101);
    }

    #[test]
    fn test_format_discontinuity_suspends_delivery() {
        let mut clock = clock();
        let mut stream = Stream::new(0x102, 0x0F, 0x101, false);
        let pes = pes_with_adts(90_000, 32);
        stream.parse(0, true, &pes, &mut clock).unwrap();
        stream.flush(&mut clock).unwrap();
        let handle = stream.source_handle().unwrap();
        let _ = handle.try_dequeue();

        let mut extra = DiscontinuityExtra::default();
        stream.signal_discontinuity(DiscontinuityType::AUDIO_FORMAT, &mut extra, &mut clock);
        assert!(handle.format().is_none());
        assert!(matches!(
            handle.try_dequeue().unwrap(),
            SourceItem::Discontinuity { .. }
        ));

        // New decodable data re-latches the format and delivery resumes.
        stream.parse(5, true, &pes, &mut clock).unwrap();
        stream.flush(&mut clock).unwrap();
        assert!(handle.format().is_some());
        assert!(matches!(
            handle.try_dequeue().unwrap(),
            SourceItem::AccessUnit(_)
        ));
    }

    #[test]
    fn test_time_discontinuity_converts_resume_pts() {
        let mut clock = clock();
        // Anchor the program clock at PTS 90000.
        clock.convert_pts(90_000);

        let mut stream = Stream::new(0x102, 0x0F, 0x101, false);
        let pes = pes_with_adts(180_000, 32);
        stream.parse(0, true, &pes, &mut clock).unwrap();
        stream.flush(&mut clock).unwrap();

        let mut extra = DiscontinuityExtra {
            resume_at_pts: Some(270_000),
            resume_at_media_time: None,
        };
        stream.signal_discontinuity(DiscontinuityType::TIME, &mut extra, &mut clock);
        assert_eq!(extra.resume_at_media_time, Some(MediaTime::from_secs(2)));
    }
}
