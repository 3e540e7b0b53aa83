//! MPEG-2 transport stream demultiplexer.
//!
//! A byte-oriented parser over 188-byte TS packets: PAT/PMT discovery,
//! per-PID elementary stream reassembly, PES unpacking with PTS→media-time
//! conversion, and PCR-based transport rate estimation. Finished access
//! units leave through [`PacketSourceHandle`]s shared with the decoders.
//!
//! # Example
//!
//! ```rust,ignore
//! use aircast::demux::{TsParser, TsFlags, SourceKind};
//!
//! let mut parser = TsParser::new(TsFlags::default());
//! while let Some(chunk) = rtp_depacketizer.next_chunk() {
//!     parser.feed(&chunk)?;
//! }
//! if let Some(video) = parser.source(SourceKind::Video) {
//!     decoder.attach(video);
//! }
//! ```

pub mod psi;
pub mod queue;
pub mod source;
mod stream;

pub use queue::{QueueKind, StreamFormat};
pub use source::{
    AccessUnit, DiscontinuityExtra, DiscontinuityType, PacketSourceHandle, SourceItem,
};

use crate::demux::psi::{parse_pat, PsiSection};
use crate::demux::stream::{Program, ProgramClock};
use crate::error::{Error, Result};

use std::collections::HashMap;

/// Size of a single TS packet.
pub const TS_PACKET_SIZE: usize = 188;

const SYNC_BYTE: u8 = 0x47;

/// Which media kind a source is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A video elementary stream.
    Video,
    /// An audio elementary stream.
    Audio,
}

/// Parser configuration flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsFlags {
    /// Treat PES timestamps as absolute instead of anchoring on the first
    /// observed PTS per program.
    pub timestamps_are_absolute: bool,
    /// Video PES payloads are access-unit aligned (one unit per PES), as
    /// emitted by Wi-Fi Display sources.
    pub aligned_video_data: bool,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TsStats {
    /// Packets accepted and parsed.
    pub packets_parsed: u64,
    /// Bytes skipped while searching for a sync byte.
    pub sync_errors: u64,
    /// Packets dropped for transport_error_indicator.
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
struct PcrEstimator {
    samples: [(u64, u64); 2], // (PCR in 27 MHz ticks, byte offset)
    count: usize,
}

impl PcrEstimator {
    fn update(&mut self, pcr: u64, byte_offset: u64) {
        if self.count == 2 {
            self.samples[0] = self.samples[1];
            self.count = 1;
        }
        self.samples[self.count] = (pcr, byte_offset);
        self.count += 1;
    }

    fn transport_rate(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let (pcr0, bytes0) = self.samples[0];
        let (pcr1, bytes1) = self.samples[1];
        if pcr1 <= pcr0 {
            return None;
        }
        Some((bytes1 - bytes0) as f64 * 27e6 / (pcr1 - pcr0) as f64)
    }
}

/// The transport stream parser.
pub struct TsParser {
    flags: TsFlags,
    programs: Vec<Program>,
    psi_sections: HashMap<u16, PsiSection>,
    absolute_time_anchor_us: Option<i64>,
    partial_packet: Vec<u8>,
    pcr: PcrEstimator,
    stats: TsStats,
}

impl TsParser {
    /// Create a parser. A PSI slot for the PAT (PID 0) exists from the
    /// start.
    pub fn new(flags: TsFlags) -> TsParser {
        let mut psi_sections = HashMap::new();
        psi_sections.insert(0u16, PsiSection::new());
        TsParser {
            flags,
            programs: Vec::new(),
            psi_sections,
            absolute_time_anchor_us: None,
            partial_packet: Vec::new(),
            pcr: PcrEstimator::default(),
            stats: TsStats::default(),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> TsStats {
        self.stats
    }

    /// Estimated transport rate in bytes per second, once two PCR samples
    /// have been observed.
    pub fn transport_rate(&self) -> Option<f64> {
        self.pcr.transport_rate()
    }

    /// Whether the first program has anchored its timeline.
    pub fn pts_established(&self) -> bool {
        self.programs.first().is_some_and(|p| p.pts_established())
    }

    /// Feed exactly one 188-byte packet.
    ///
    /// A fatal parse error is signalled as end-of-stream to every
    /// downstream source (unblocking their consumers) before it is
    /// returned.
    pub fn feed_packet(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() != TS_PACKET_SIZE {
            return Err(Error::malformed("TS packet must be 188 bytes", packet.len()));
        }
        self.checked_parse(packet)
    }

    fn checked_parse(&mut self, packet: &[u8]) -> Result<()> {
        match self.parse_packet(packet) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.signal_eos(&err.to_string());
                Err(err)
            }
        }
    }

    /// Feed an arbitrary byte chunk. Input is aligned to sync bytes;
    /// leading garbage is skipped and a trailing partial packet is kept for
    /// the next call.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        let combined;
        let mut input = if self.partial_packet.is_empty() {
            data
        } else {
            let mut buf = std::mem::take(&mut self.partial_packet);
            buf.extend_from_slice(data);
            combined = buf;
            &combined[..]
        };

        loop {
            let start = input.iter().position(|&b| b == SYNC_BYTE);
            match start {
                Some(0) => {}
                Some(skip) => {
                    self.stats.sync_errors += skip as u64;
                    metrics::counter!(crate::observability::TS_SYNC_ERRORS)
                        .increment(skip as u64);
                    input = &input[skip..];
                }
                None => {
                    self.stats.sync_errors += input.len() as u64;
                    return Ok(());
                }
            }
            if input.len() < TS_PACKET_SIZE {
                self.partial_packet = input.to_vec();
                return Ok(());
            }
            self.checked_parse(&input[..TS_PACKET_SIZE])?;
            input = &input[TS_PACKET_SIZE..];
            if input.is_empty() {
                return Ok(());
            }
        }
    }

    fn parse_packet(&mut self, packet: &[u8]) -> Result<()> {
        if packet[0] != SYNC_BYTE {
            return Err(Error::malformed("TS sync byte must be 0x47", 0));
        }
        if packet[1] & 0x80 != 0 {
            self.stats.transport_errors += 1;
            metrics::counter!(crate::observability::TS_TRANSPORT_ERRORS).increment(1);
            return Ok(());
        }

        let payload_unit_start = packet[1] & 0x40 != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let adaptation_field_control = (packet[3] >> 4) & 0x03;
        let continuity_counter = packet[3] & 0x0F;

        let mut offset = 4usize;
        if adaptation_field_control & 0x02 != 0 {
            offset += self.parse_adaptation_field(&packet[4..], pid)?;
        }

        if adaptation_field_control & 0x01 != 0 {
            if offset > packet.len() {
                return Err(Error::malformed("adaptation field overruns packet", offset));
            }
            self.parse_pid(
                pid,
                continuity_counter,
                payload_unit_start,
                &packet[offset..],
            )?;
        }

        self.stats.packets_parsed += 1;
        metrics::counter!(crate::observability::TS_PACKETS).increment(1);
        Ok(())
    }

    /// Returns the number of bytes the adaptation field occupies.
    fn parse_adaptation_field(&mut self, data: &[u8], pid: u16) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::malformed("missing adaptation_field_length", 4));
        }
        let length = data[0] as usize;
        if length == 0 {
            return Ok(1);
        }
        if data.len() < 1 + length {
            return Err(Error::malformed("adaptation field overruns packet", 4));
        }
        let flags = data[1];

        if flags & 0x80 != 0 {
            // discontinuity_indicator set by the muxer
            tracing::debug!("adaptation field signals discontinuity");
            self.signal_discontinuity(
                DiscontinuityType::FORMAT_CHANGE,
                DiscontinuityExtra::default(),
            );
        }

        let is_pcr_pid = self.programs.iter().any(|p| p.uses_pcr_pid(pid));
        if flags & 0x10 != 0 && length >= 7 && is_pcr_pid {
            // PCR: 33-bit base, 6 reserved bits, 9-bit extension.
            let base = ((data[2] as u64) << 25)
                | ((data[3] as u64) << 17)
                | ((data[4] as u64) << 9)
                | ((data[5] as u64) << 1)
                | ((data[6] as u64) >> 7);
            let ext = ((data[6] as u64 & 0x01) << 8) | data[7] as u64;
            let pcr = base * 300 + ext;
            let byte_offset = self.stats.packets_parsed * TS_PACKET_SIZE as u64;
            self.pcr.update(pcr, byte_offset);
            if let Some(rate) = self.pcr.transport_rate() {
                tracing::trace!(rate, "transport rate estimate");
            }
        }

        Ok(1 + length)
    }

    fn parse_pid(
        &mut self,
        pid: u16,
        continuity_counter: u8,
        payload_unit_start: bool,
        payload: &[u8],
    ) -> Result<()> {
        if self.psi_sections.contains_key(&pid) {
            return self.parse_psi_pid(pid, payload_unit_start, payload);
        }

        let mut handled = false;
        for program in &mut self.programs {
            if let Some(result) =
                program.handle_pid(pid, continuity_counter, payload_unit_start, payload)
            {
                result?;
                handled = true;
                break;
            }
        }
        if !handled {
            tracing::trace!(pid, "PID not handled");
        }
        Ok(())
    }

    fn parse_psi_pid(&mut self, pid: u16, payload_unit_start: bool, payload: &[u8]) -> Result<()> {
        let section = self.psi_sections.get_mut(&pid).expect("checked by caller");
        let mut payload = payload;

        if payload_unit_start {
            if !section.is_empty() {
                tracing::warn!(pid, "PSI section restarted before completion");
                section.clear();
            }
            if payload.is_empty() {
                return Err(Error::malformed("PSI pointer_field missing", 4));
            }
            let skip = payload[0] as usize + 1;
            if payload.len() < skip {
                return Err(Error::malformed("PSI pointer_field overruns packet", 4));
            }
            payload = &payload[skip..];
        }

        section.append(payload);
        if !section.is_complete() {
            return Ok(());
        }

        let data = std::mem::take(section).into_data();

        if pid == 0 {
            self.parse_program_association_table(&data)?;
        } else {
            let mut handled = false;
            for program in &mut self.programs {
                if let Some(result) = program.parse_psi_section(pid, &data) {
                    result?;
                    handled = true;
                    break;
                }
            }
            if !handled {
                // A stale program-map PID nothing claims any more.
                self.psi_sections.remove(&pid);
            }
        }
        Ok(())
    }

    fn parse_program_association_table(&mut self, data: &[u8]) -> Result<()> {
        for entry in parse_pat(data)? {
            if entry.program_number == 0 {
                tracing::trace!(pid = entry.program_map_pid, "network PID ignored");
                continue;
            }

            match self
                .programs
                .iter_mut()
                .find(|p| p.number() == entry.program_number)
            {
                Some(program) => program.update_program_map_pid(entry.program_map_pid),
                None => self.programs.push(Program::new(
                    entry.program_number,
                    entry.program_map_pid,
                    ProgramClock::new(
                        self.flags.timestamps_are_absolute,
                        self.absolute_time_anchor_us,
                    ),
                    self.flags.aligned_video_data,
                )),
            }

            self.psi_sections
                .entry(entry.program_map_pid)
                .or_insert_with(PsiSection::new);
        }
        Ok(())
    }

    /// Dispatch a discontinuity to every program.
    ///
    /// `ABSOLUTE_TIME` must arrive before any program exists and sets the
    /// anchor added to all converted timestamps.
    pub fn signal_discontinuity(&mut self, kind: DiscontinuityType, extra: DiscontinuityExtra) {
        if kind.contains(DiscontinuityType::ABSOLUTE_TIME) {
            if !self.programs.is_empty() {
                tracing::warn!("absolute time anchor ignored: programs already exist");
                return;
            }
            if let Some(time) = extra.resume_at_media_time {
                self.absolute_time_anchor_us = Some(time.as_micros());
            }
            return;
        }

        let mut extra = extra;
        for program in &mut self.programs {
            program.signal_discontinuity(kind, &mut extra);
        }
    }

    /// Signal end-of-stream to every downstream source.
    pub fn signal_eos(&self, reason: &str) {
        for program in &self.programs {
            program.signal_eos(reason);
        }
    }

    /// The first source of the requested kind across all programs, once a
    /// format has been detected on it.
    pub fn source(&self, kind: SourceKind) -> Option<PacketSourceHandle> {
        self.programs
            .iter()
            .find_map(|p| p.source(kind == SourceKind::Audio))
    }
}

impl PsiSection {
    fn into_data(self) -> Vec<u8> {
        // Sections are consumed whole after completion.
        let mut data = Vec::new();
        data.extend_from_slice(self.data());
        data
    }
}
