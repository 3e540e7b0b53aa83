//! wfd_video_formats: parsing, generation, matching and best-mode selection.
//!
//! A capability line advertises one or more H.264 codec configurations, each
//! carrying three resolution bitmasks (CEA, VESA, HH) over fixed tables
//! defined by the Wi-Fi Display spec. Source and sink negotiate by
//! intersecting these masks.

use crate::caps::parser::{
    bit_index, BitCardinality, BitIndex, LineParser, COMMA_SPACE, END_OF_LINE, SPACE,
};
use crate::error::Result;

use std::fmt;

const NATIVE_LEN: usize = 2;
const NATIVE_MAX: u32 = 255;
const NATIVE_TABLE_MASK: u32 = 0x07;
const NATIVE_MODE_OFFSET: u32 = 3;

const PREF_DISP_LEN: usize = 2;
const PREF_DISP_MAX: u32 = 1;

const PROFILE_LEN: usize = 2;
/// Valid profile bits: CBP (0x01) and CHP (0x02).
pub const PROFILE_MASK: u32 = 0x03;

const LEVEL_LEN: usize = 2;
/// Valid level bits: 3.1, 3.2, 4, 4.1, 4.2.
pub const LEVEL_MASK: u32 = 0x1F;

const CEA_LEN: usize = 8;
/// Valid CEA resolution bits (17 table entries).
pub const CEA_MASK: u32 = 0x0001_FFFF;

const VESA_LEN: usize = 8;
/// Valid VESA resolution bits (30 table entries).
pub const VESA_MASK: u32 = 0x3FFF_FFFF;

const HH_LEN: usize = 8;
/// Valid handheld resolution bits (12 table entries).
pub const HH_MASK: u32 = 0x0000_0FFF;

const LATENCY_LEN: usize = 2;
const LATENCY_MAX: u32 = 255;

const MIN_SLICE_SIZE_LEN: usize = 4;
const MIN_SLICE_SIZE_MAX: u32 = 0xFFFF;

const SLICE_ENC_LEN: usize = 4;
const SLICE_ENC_MASK: u32 = 0x1FFF;

const FRAME_RATE_CONTROL_LEN: usize = 2;
const FRAME_RATE_CONTROL_MASK: u32 = 0x1F;

const MAX_RES_LEN: usize = 4;
const MAX_RES_MAX: u32 = 0xFFFF;

/// H.264 profile advertised on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum H264Profile {
    /// Constrained Baseline (wire bit 0x01).
    ConstrainedBaseline,
    /// Constrained High (wire bit 0x02).
    ConstrainedHigh,
}

impl H264Profile {
    fn from_bit_index(idx: u32) -> Option<Self> {
        match idx {
            0 => Some(H264Profile::ConstrainedBaseline),
            1 => Some(H264Profile::ConstrainedHigh),
            _ => None,
        }
    }

    /// The single-bit wire encoding.
    pub fn wire_bit(self) -> u32 {
        match self {
            H264Profile::ConstrainedBaseline => 0x01,
            H264Profile::ConstrainedHigh => 0x02,
        }
    }
}

/// H.264 level advertised on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum H264Level {
    /// Level 3.1 (wire bit 0x01).
    L31,
    /// Level 3.2 (wire bit 0x02).
    L32,
    /// Level 4 (wire bit 0x04).
    L40,
    /// Level 4.1 (wire bit 0x08).
    L41,
    /// Level 4.2 (wire bit 0x10).
    L42,
}

impl H264Level {
    const ALL: [H264Level; 5] = [
        H264Level::L31,
        H264Level::L32,
        H264Level::L40,
        H264Level::L41,
        H264Level::L42,
    ];

    /// Lookup by bit position in the wire mask.
    pub fn from_bit_index(idx: u32) -> Option<Self> {
        Self::ALL.get(idx as usize).copied()
    }

    /// Lookup by presentation string ("3.1" .. "4.2").
    pub fn from_str_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.as_str() == name)
    }

    /// The single-bit wire encoding.
    pub fn wire_bit(self) -> u32 {
        1 << self as u32
    }

    /// Presentation string.
    pub fn as_str(self) -> &'static str {
        match self {
            H264Level::L31 => "3.1",
            H264Level::L32 => "3.2",
            H264Level::L40 => "4",
            H264Level::L41 => "4.1",
            H264Level::L42 => "4.2",
        }
    }
}

/// One entry of a fixed resolution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMode {
    /// Horizontal resolution.
    pub width: u32,
    /// Vertical resolution.
    pub height: u32,
    /// Frame rate in Hz.
    pub frame_rate: u32,
    /// Progressive (vs interlaced) scan.
    pub progressive: bool,
}

impl TableMode {
    const fn p(width: u32, height: u32, frame_rate: u32) -> Self {
        TableMode {
            width,
            height,
            frame_rate,
            progressive: true,
        }
    }

    const fn i(width: u32, height: u32, frame_rate: u32) -> Self {
        TableMode {
            width,
            height,
            frame_rate,
            progressive: false,
        }
    }

    /// The `WxHpR` / `WxHiR` name used by config documents.
    pub fn resolution_name(&self) -> String {
        format!(
            "{}x{}{}{}",
            self.width,
            self.height,
            if self.progressive { 'p' } else { 'i' },
            self.frame_rate
        )
    }
}

pub(crate) const CEA_TABLE: [TableMode; 17] = [
    TableMode::p(640, 480, 60),
    TableMode::p(720, 480, 60),
    TableMode::i(720, 480, 60),
    TableMode::p(720, 576, 50),
    TableMode::i(720, 576, 50),
    TableMode::p(1280, 720, 30),
    TableMode::p(1280, 720, 60),
    TableMode::p(1920, 1080, 30),
    TableMode::p(1920, 1080, 60),
    TableMode::i(1920, 1080, 60),
    TableMode::p(1280, 720, 25),
    TableMode::p(1280, 720, 50),
    TableMode::p(1920, 1080, 25),
    TableMode::p(1920, 1080, 50),
    TableMode::i(1920, 1080, 50),
    TableMode::p(1280, 720, 24),
    TableMode::p(1920, 1080, 24),
];

pub(crate) const VESA_TABLE: [TableMode; 30] = [
    TableMode::p(800, 600, 30),
    TableMode::p(800, 600, 60),
    TableMode::p(1024, 768, 30),
    TableMode::p(1024, 768, 60),
    TableMode::p(1152, 864, 30),
    TableMode::p(1152, 864, 60),
    TableMode::p(1280, 768, 30),
    TableMode::p(1280, 768, 60),
    TableMode::p(1280, 800, 30),
    TableMode::p(1280, 800, 60),
    TableMode::p(1360, 768, 30),
    TableMode::p(1360, 768, 60),
    TableMode::p(1366, 768, 30),
    TableMode::p(1366, 768, 60),
    TableMode::p(1280, 1024, 30),
    TableMode::p(1280, 1024, 60),
    TableMode::p(1400, 1050, 30),
    TableMode::p(1400, 1050, 60),
    TableMode::p(1440, 900, 30),
    TableMode::p(1440, 900, 60),
    TableMode::p(1600, 900, 30),
    TableMode::p(1600, 900, 60),
    TableMode::p(1600, 1200, 30),
    TableMode::p(1600, 1200, 60),
    TableMode::p(1680, 1024, 30),
    TableMode::p(1680, 1024, 60),
    TableMode::p(1680, 1050, 30),
    TableMode::p(1680, 1050, 60),
    TableMode::p(1920, 1200, 30),
    TableMode::p(1920, 1200, 60),
];

pub(crate) const HH_TABLE: [TableMode; 12] = [
    TableMode::p(800, 480, 30),
    TableMode::p(800, 480, 60),
    TableMode::p(854, 480, 30),
    TableMode::p(854, 480, 60),
    TableMode::p(864, 480, 30),
    TableMode::p(864, 480, 60),
    TableMode::p(640, 360, 30),
    TableMode::p(640, 360, 60),
    TableMode::p(960, 540, 30),
    TableMode::p(960, 540, 60),
    TableMode::p(848, 480, 30),
    TableMode::p(848, 480, 60),
];

/// One of the three fixed resolution tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTable {
    /// CEA-861 television timings.
    Cea,
    /// VESA monitor timings.
    Vesa,
    /// Handheld timings.
    Hh,
}

impl ResolutionTable {
    /// All three tables, in native-field index order.
    pub const ALL: [ResolutionTable; 3] =
        [ResolutionTable::Cea, ResolutionTable::Vesa, ResolutionTable::Hh];

    /// Index as encoded in the native field.
    pub fn index(self) -> u32 {
        match self {
            ResolutionTable::Cea => 0,
            ResolutionTable::Vesa => 1,
            ResolutionTable::Hh => 2,
        }
    }

    fn from_index(idx: u32) -> Option<Self> {
        match idx {
            0 => Some(ResolutionTable::Cea),
            1 => Some(ResolutionTable::Vesa),
            2 => Some(ResolutionTable::Hh),
            _ => None,
        }
    }

    /// The table entries.
    pub fn entries(self) -> &'static [TableMode] {
        match self {
            ResolutionTable::Cea => &CEA_TABLE,
            ResolutionTable::Vesa => &VESA_TABLE,
            ResolutionTable::Hh => &HH_TABLE,
        }
    }

    /// Wire bitmask covering all valid entries.
    pub fn mask(self) -> u32 {
        match self {
            ResolutionTable::Cea => CEA_MASK,
            ResolutionTable::Vesa => VESA_MASK,
            ResolutionTable::Hh => HH_MASK,
        }
    }
}

/// One H.264 codec configuration from a wfd_video_formats line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Codec {
    /// Codec profile (single bit on the wire).
    pub profile: H264Profile,
    /// Codec level (single bit on the wire).
    pub level: H264Level,
    /// CEA resolution bitmask.
    pub cea: u32,
    /// VESA resolution bitmask.
    pub vesa: u32,
    /// Handheld resolution bitmask.
    pub hh: u32,
    /// Decoder latency in units of 5 ms.
    pub latency: u8,
    /// Minimum slice size in macroblocks.
    pub min_slice_size: u16,
    /// Slice encoding parameter bitmap.
    pub slice_enc_params: u16,
    /// Frame-rate-control support bitmap.
    pub frame_rate_control: u8,
    /// Maximum horizontal resolution, when advertised.
    pub max_hres: Option<u16>,
    /// Maximum vertical resolution, when advertised.
    pub max_vres: Option<u16>,
}

impl H264Codec {
    fn table_mask(&self, table: ResolutionTable) -> u32 {
        match table {
            ResolutionTable::Cea => self.cea,
            ResolutionTable::Vesa => self.vesa,
            ResolutionTable::Hh => self.hh,
        }
    }
}

/// A concrete negotiated video mode.
#[derive(Debug, Clone, Eq)]
pub struct VideoMode {
    /// Constrained High (vs Constrained Baseline) profile.
    pub high_profile: bool,
    /// H.264 level.
    pub level: H264Level,
    /// Horizontal resolution.
    pub width: u32,
    /// Vertical resolution.
    pub height: u32,
    /// Frame rate in Hz.
    pub frame_rate: u32,
    /// Progressive scan.
    pub progressive: bool,
}

impl PartialEq for VideoMode {
    // Level is negotiated independently of the resolution choice and does
    // not participate in mode identity.
    fn eq(&self, other: &Self) -> bool {
        self.high_profile == other.high_profile
            && self.width == other.width
            && self.height == other.height
            && self.frame_rate == other.frame_rate
    }
}

impl VideoMode {
    /// Proper dominance: every axis at least equal and at least one axis
    /// strictly greater. The axes are width, height, frame rate and
    /// profile rank (high > baseline).
    pub fn dominates(&self, other: &VideoMode) -> bool {
        let ge = self.width >= other.width
            && self.height >= other.height
            && self.frame_rate >= other.frame_rate
            && (self.high_profile || !other.high_profile);
        let gt = self.width > other.width
            || self.height > other.height
            || self.frame_rate > other.frame_rate
            || (self.high_profile && !other.high_profile);
        ge && gt
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}x{}{}{}",
            if self.high_profile { "CHP" } else { "CBP" },
            self.level.as_str(),
            self.width,
            self.height,
            if self.progressive { 'p' } else { 'i' },
            self.frame_rate
        )
    }
}

/// A full wfd_video_formats capability set.
#[derive(Debug, Clone)]
pub struct VideoParameters {
    native: u8,
    native_mode: TableMode,
    pref_disp_mode_supported: bool,
    codecs: Vec<H264Codec>,
}

impl VideoParameters {
    /// Parse a wfd_video_formats line.
    pub fn parse(data: &str) -> Result<Self> {
        let mut parser = LineParser::new(data);

        // Native resolution/refresh rate designator
        // 00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none
        // ^
        let native = parser
            .parse_hex_value(NATIVE_LEN, NATIVE_MAX, SPACE)
            .ok_or_else(|| parser.malformed("invalid wfd_video_formats native field"))?;

        let table = ResolutionTable::from_index(native & NATIVE_TABLE_MASK);
        let mode_idx = (native >> NATIVE_MODE_OFFSET) as usize;
        let native_mode = table
            .and_then(|t| t.entries().get(mode_idx))
            .copied()
            .ok_or_else(|| parser.malformed("invalid wfd_video_formats native field"))?;

        // Preferred display mode support
        // 00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none
        //    ^
        let pref_disp = parser
            .parse_hex_value(PREF_DISP_LEN, PREF_DISP_MAX, SPACE)
            .ok_or_else(|| parser.malformed("invalid preferred display mode field"))?;
        if pref_disp != 0 {
            // Preferred display mode negotiation is not supported.
            return Err(parser.malformed("preferred display mode is not supported"));
        }

        let mut codecs = Vec::new();
        loop {
            let profile = parser
                .parse_hex_bit_field(PROFILE_LEN, PROFILE_MASK, BitCardinality::SingleBit, SPACE)
                .ok_or_else(|| parser.malformed("invalid H264 codec profile"))?;
            let level = parser
                .parse_hex_bit_field(LEVEL_LEN, LEVEL_MASK, BitCardinality::SingleBit, SPACE)
                .ok_or_else(|| parser.malformed("invalid H264 codec level"))?;
            let cea = parser
                .parse_hex_bit_field(CEA_LEN, CEA_MASK, BitCardinality::MultiBits, SPACE)
                .ok_or_else(|| parser.malformed("invalid CEA resolution bitmap"))?;
            let vesa = parser
                .parse_hex_bit_field(VESA_LEN, VESA_MASK, BitCardinality::MultiBits, SPACE)
                .ok_or_else(|| parser.malformed("invalid VESA resolution bitmap"))?;
            let hh = parser
                .parse_hex_bit_field(HH_LEN, HH_MASK, BitCardinality::MultiBits, SPACE)
                .ok_or_else(|| parser.malformed("invalid HH resolution bitmap"))?;

            if cea == 0 && vesa == 0 && hh == 0 {
                return Err(parser.malformed("none of CEA, VESA and HH resolutions set"));
            }

            let latency = parser
                .parse_hex_value(LATENCY_LEN, LATENCY_MAX, SPACE)
                .ok_or_else(|| parser.malformed("invalid decoder latency"))?;
            let min_slice_size = parser
                .parse_hex_value(MIN_SLICE_SIZE_LEN, MIN_SLICE_SIZE_MAX, SPACE)
                .ok_or_else(|| parser.malformed("invalid min-slice-size"))?;
            let slice_enc_params = parser
                .parse_hex_bit_field(SLICE_ENC_LEN, SLICE_ENC_MASK, BitCardinality::MultiBits, SPACE)
                .ok_or_else(|| parser.malformed("invalid slice encoding parameters"))?;
            let frame_rate_control = parser
                .parse_hex_bit_field(
                    FRAME_RATE_CONTROL_LEN,
                    FRAME_RATE_CONTROL_MASK,
                    BitCardinality::MultiBits,
                    SPACE,
                )
                .ok_or_else(|| parser.malformed("invalid frame rate control bitmap"))?;

            let max_hres = if parser.check_string_field("none", SPACE) {
                None
            } else {
                Some(
                    parser
                        .parse_hex_value(MAX_RES_LEN, MAX_RES_MAX, SPACE)
                        .ok_or_else(|| parser.malformed("invalid max-hres"))?
                        as u16,
                )
            };
            let max_vres = if parser.check_string_field("none", END_OF_LINE | COMMA_SPACE) {
                None
            } else {
                Some(
                    parser
                        .parse_hex_value(MAX_RES_LEN, MAX_RES_MAX, END_OF_LINE | COMMA_SPACE)
                        .ok_or_else(|| parser.malformed("invalid max-vres"))?
                        as u16,
                )
            };

            let profile_idx = match bit_index(profile, PROFILE_MASK) {
                BitIndex::Index(i) => i,
                _ => unreachable!("single-bit enforced by parse"),
            };
            let level_idx = match bit_index(level, LEVEL_MASK) {
                BitIndex::Index(i) => i,
                _ => unreachable!("single-bit enforced by parse"),
            };

            codecs.push(H264Codec {
                profile: H264Profile::from_bit_index(profile_idx).expect("masked"),
                level: H264Level::from_bit_index(level_idx).expect("masked"),
                cea,
                vesa,
                hh,
                latency: latency as u8,
                min_slice_size: min_slice_size as u16,
                slice_enc_params: slice_enc_params as u16,
                frame_rate_control: frame_rate_control as u8,
                max_hres,
                max_vres,
            });

            if parser.last_delimiter() == END_OF_LINE {
                break;
            }
        }

        Ok(VideoParameters {
            native: native as u8,
            native_mode,
            pref_disp_mode_supported: false,
            codecs,
        })
    }

    /// Build parameters from already-validated parts (used by the config
    /// loader).
    pub(crate) fn from_parts(native: u8, native_mode: TableMode, codecs: Vec<H264Codec>) -> Self {
        VideoParameters {
            native,
            native_mode,
            pref_disp_mode_supported: false,
            codecs,
        }
    }

    /// The advertised codec configurations, in wire order.
    pub fn codecs(&self) -> &[H264Codec] {
        &self.codecs
    }

    /// The native display mode designated by the native field.
    pub fn native_mode(&self) -> TableMode {
        self.native_mode
    }

    /// Whether the peer claims preferred-display-mode support. Always false
    /// after a successful parse.
    pub fn pref_disp_mode_supported(&self) -> bool {
        self.pref_disp_mode_supported
    }

    fn generate_codec(codec: &H264Codec) -> String {
        let mut s = format!(
            "{:02x} {:02x} {:08x} {:08x} {:08x} {:02x} {:04x} {:04x} {:02x} ",
            codec.profile.wire_bit(),
            codec.level.wire_bit(),
            codec.cea,
            codec.vesa,
            codec.hh,
            codec.latency,
            codec.min_slice_size,
            codec.slice_enc_params,
            codec.frame_rate_control,
        );
        match codec.max_hres {
            Some(v) => s.push_str(&format!("{:04x} ", v)),
            None => s.push_str("none "),
        }
        match codec.max_vres {
            Some(v) => s.push_str(&format!("{:04x}", v)),
            None => s.push_str("none"),
        }
        s
    }

    /// Regenerate the full capability line. `parse` followed by this is
    /// byte-identical for lines this crate emits.
    pub fn generate_video_formats(&self) -> String {
        let mut s = format!(
            "{:02x} {:02x} ",
            self.native,
            u8::from(self.pref_disp_mode_supported)
        );
        for (i, codec) in self.codecs.iter().enumerate() {
            if i > 0 {
                s.push_str(", ");
            }
            s.push_str(&Self::generate_codec(codec));
        }
        s
    }

    /// Generate the single-mode line a source proposes via SET_PARAMETER.
    /// Returns None when the mode is not present in any resolution table.
    pub fn generate_video_mode(mode: &VideoMode) -> Option<String> {
        let (table, idx) = lookup_resolution(mode)?;
        let mut codec = H264Codec {
            profile: if mode.high_profile {
                H264Profile::ConstrainedHigh
            } else {
                H264Profile::ConstrainedBaseline
            },
            level: mode.level,
            cea: 0,
            vesa: 0,
            hh: 0,
            latency: 0,
            min_slice_size: 0,
            slice_enc_params: 0,
            frame_rate_control: 0,
            max_hres: None,
            max_vres: None,
        };
        match table {
            ResolutionTable::Cea => codec.cea = 1 << idx,
            ResolutionTable::Vesa => codec.vesa = 1 << idx,
            ResolutionTable::Hh => codec.hh = 1 << idx,
        }
        Some(format!("00 00 {}", Self::generate_codec(&codec)))
    }

    /// Validate a peer-proposed single-mode line against this capability
    /// set.
    ///
    /// Grammar violations surface as `Malformed`; a well-formed proposal
    /// that this set cannot satisfy (multiple codec entries, ambiguous
    /// resolution bits, or no intersection) yields `Ok(None)`.
    pub fn apply_video_mode(&self, data: &str) -> Result<Option<VideoMode>> {
        let proposal = VideoParameters::parse(data)?;

        // A SET_PARAMETER proposal must carry exactly one codec entry.
        if proposal.codecs.len() != 1 {
            tracing::warn!(
                entries = proposal.codecs.len(),
                "video mode proposal must use a single codec entry"
            );
            return Ok(None);
        }
        let new = &proposal.codecs[0];

        // Exactly one of the three tables must designate exactly one mode;
        // native, latency, slice and max-res fields are ignored here.
        let mut designated = None;
        for table in ResolutionTable::ALL {
            match bit_index(new.table_mask(table), table.mask()) {
                BitIndex::Index(idx) => {
                    if designated.is_some() {
                        tracing::warn!("video mode proposal sets bits in several tables");
                        return Ok(None);
                    }
                    designated = Some((table, idx));
                }
                BitIndex::MultiBits => {
                    tracing::warn!("video mode proposal sets several resolution bits");
                    return Ok(None);
                }
                BitIndex::NoBits => {}
            }
        }
        let Some((table, idx)) = designated else {
            return Ok(None);
        };

        let supported = self.codecs.iter().any(|cap| {
            cap.profile == new.profile
                && cap.level == new.level
                && cap.table_mask(table) & (1 << idx) != 0
        });
        if !supported {
            return Ok(None);
        }

        let entry = table.entries()[idx as usize];
        Ok(Some(VideoMode {
            high_profile: new.profile == H264Profile::ConstrainedHigh,
            level: new.level,
            width: entry.width,
            height: entry.height,
            frame_rate: entry.frame_rate,
            progressive: entry.progressive,
        }))
    }

    /// Every mode both sides can handle: the union over codec pairs with
    /// matching profile of the per-table bitmask intersections, at the
    /// lower of the two levels.
    pub fn matching_modes(&self, sink: &VideoParameters) -> Vec<VideoMode> {
        let mut modes = Vec::new();
        for own in &self.codecs {
            for remote in &sink.codecs {
                if own.profile != remote.profile {
                    continue;
                }
                let level = own.level.min(remote.level);
                for table in ResolutionTable::ALL {
                    let mut matching = own.table_mask(table) & remote.table_mask(table);
                    let mut idx = 0usize;
                    while matching != 0 {
                        if matching & 1 != 0 {
                            let entry = table.entries()[idx];
                            modes.push(VideoMode {
                                high_profile: own.profile == H264Profile::ConstrainedHigh,
                                level,
                                width: entry.width,
                                height: entry.height,
                                frame_rate: entry.frame_rate,
                                progressive: entry.progressive,
                            });
                        }
                        matching >>= 1;
                        idx += 1;
                    }
                }
            }
        }
        modes
    }

    /// Pick the mode to drive: the desired mode when both sides can handle
    /// it, else the sink's native mode, else the dominance maximum of the
    /// matching set. Deterministic for fixed inputs.
    pub fn get_best_video_mode(
        &self,
        sink: &VideoParameters,
        desired: Option<&VideoMode>,
    ) -> Option<VideoMode> {
        let modes = self.matching_modes(sink);

        if let Some(desired) = desired {
            if let Some(found) = modes.iter().find(|m| *m == desired) {
                return Some(found.clone());
            }
        }

        let native = sink.native_mode;
        if let Some(found) = modes.iter().find(|m| {
            m.width == native.width
                && m.height == native.height
                && m.frame_rate == native.frame_rate
        }) {
            return Some(found.clone());
        }

        let mut iter = modes.into_iter();
        let mut best = iter.next()?;
        for mode in iter {
            if mode.dominates(&best) {
                best = mode;
            }
        }
        Some(best)
    }
}

/// Find the `(table, index)` of a mode in the fixed tables.
pub(crate) fn lookup_resolution(mode: &VideoMode) -> Option<(ResolutionTable, u32)> {
    for table in ResolutionTable::ALL {
        for (idx, entry) in table.entries().iter().enumerate() {
            if entry.width == mode.width
                && entry.height == mode.height
                && entry.frame_rate == mode.frame_rate
                && entry.progressive == mode.progressive
            {
                return Some((table, idx as u32));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINK_SINGLE: &str =
        "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none";
    const SINK_FULL: &str =
        "00 00 01 01 0001ffff 3fffffff 00000fff 00 0000 0000 00 none none, \
         02 02 00000001 00000033 00000044 00 0000 0000 00 none none";

    #[test]
    fn test_parse_generate_roundtrip() {
        for line in [SINK_SINGLE, SINK_FULL] {
            let params = VideoParameters::parse(line).unwrap();
            assert_eq!(params.generate_video_formats(), line);
        }
    }

    #[test]
    fn test_parse_native_designates_table_entry() {
        // native 0x30 = mode index 6 in the CEA table (1280x720p60).
        let line = "30 00 02 02 00000040 00000000 00000000 00 0000 0000 00 none none";
        let params = VideoParameters::parse(line).unwrap();
        assert_eq!(params.native_mode().width, 1280);
        assert_eq!(params.native_mode().frame_rate, 60);
    }

    #[test]
    fn test_parse_max_res_values() {
        let line = "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 0780 0438";
        let params = VideoParameters::parse(line).unwrap();
        assert_eq!(params.codecs()[0].max_hres, Some(0x0780));
        assert_eq!(params.codecs()[0].max_vres, Some(0x0438));
        assert_eq!(params.generate_video_formats(), line);
    }

    #[test]
    fn test_parse_rejects_pref_disp_mode() {
        let line = "00 01 01 01 00000001 00000000 00000000 00 0000 0000 00 none none";
        assert!(VideoParameters::parse(line).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_resolution_set() {
        let line = "00 00 01 01 00000000 00000000 00000000 00 0000 0000 00 none none";
        assert!(VideoParameters::parse(line).is_err());
    }

    #[test]
    fn test_negative_corpus() {
        let bad = [
            // profile: no bits, multi bits, out of mask, wrong width
            "00 00 00 01 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 03 01 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 04 01 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 05 01 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 1 01 00000001 00000000 00000000 00 0000 0000 00 none none",
            // level
            "00 00 01 00 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 03 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 20 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 21 00000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 1 00000001 00000000 00000000 00 0000 0000 00 none none",
            // cea/vesa/hh masks and widths
            "00 00 01 01 00020000 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 01 00020001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 01 0000001 00000000 00000000 00 0000 0000 00 none none",
            "00 00 01 01 00000000 40000000 00000000 00 0000 0000 00 none none",
            "00 00 01 01 00000000 40000001 00000000 00 0000 0000 00 none none",
            "00 00 01 01 00000000 0000001 00000000 00 0000 0000 00 none none",
            "00 00 01 01 00000000 00000000 00001000 00 0000 0000 00 none none",
            "00 00 01 01 00000000 00000000 00001001 00 0000 0000 00 none none",
            "00 00 01 01 00000000 00000000 0000001 00 0000 0000 00 none none",
            // latency / slice / frame-rate-control
            "00 00 01 01 00000001 00000000 00000000 0 0000 0000 00 none none",
            "00 00 01 01 00000001 00000000 00000000 00 000 0000 00 none none",
            "00 00 01 01 00000001 00000000 00000000 00 0000 2000 00 none none",
            "00 00 01 01 00000001 00000000 00000000 00 0000 000 00 none none",
            "00 00 01 01 00000001 00000000 00000000 00 0000 0000 20 none none",
            "00 00 01 01 00000001 00000000 00000000 00 0000 0000 0 none none",
            // max hres / vres
            "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 011h none",
            "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 nane none",
            "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none 123h",
            "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none nona",
        ];
        for line in bad {
            assert!(
                VideoParameters::parse(line).is_err(),
                "expected Malformed: {line}"
            );
        }
    }

    #[test]
    fn test_apply_video_mode() {
        let sink = VideoParameters::parse(SINK_SINGLE).unwrap();

        // CEA bit 2 (720x480i60) is not in the sink's mask.
        let unsupported = "00 00 01 01 00000004 00000000 00000000 00 0000 0000 00 none none";
        assert!(sink.apply_video_mode(unsupported).unwrap().is_none());

        // CEA bit 0 (640x480p60) is supported.
        let supported = "00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none";
        let mode = sink.apply_video_mode(supported).unwrap().unwrap();
        assert_eq!((mode.width, mode.height, mode.frame_rate), (640, 480, 60));
        assert!(!mode.high_profile);
        assert_eq!(mode.level, H264Level::L31);
    }

    #[test]
    fn test_apply_video_mode_rejects_two_tables() {
        let sink = VideoParameters::parse(SINK_FULL).unwrap();
        let ambiguous = "00 00 01 01 00000001 00000001 00000000 00 0000 0000 00 none none";
        assert!(sink.apply_video_mode(ambiguous).unwrap().is_none());
    }

    #[test]
    fn test_best_mode_level_floor_and_resolution() {
        // Source: CBP 4.2 with full CEA; sink: CBP 3.1 with CEA bit 0 only.
        let source =
            VideoParameters::parse("00 00 01 10 0001ffff 00000000 00000000 00 0000 0000 00 none none")
                .unwrap();
        let sink = VideoParameters::parse(SINK_SINGLE).unwrap();
        let best = source.get_best_video_mode(&sink, None).unwrap();
        assert_eq!((best.width, best.height, best.frame_rate), (640, 480, 60));
        assert!(!best.high_profile);
        assert_eq!(best.level, H264Level::L31);
        assert!(best.progressive);
    }

    #[test]
    fn test_best_mode_prefers_desired() {
        let both = VideoParameters::parse(SINK_FULL).unwrap();
        let desired = VideoMode {
            high_profile: false,
            level: H264Level::L31,
            width: 1280,
            height: 720,
            frame_rate: 30,
            progressive: true,
        };
        let best = both.get_best_video_mode(&both, Some(&desired)).unwrap();
        assert_eq!(best, desired);
    }

    #[test]
    fn test_best_mode_prefers_sink_native() {
        // Sink's native field designates CEA index 6 (1280x720p60).
        let sink =
            VideoParameters::parse("30 00 01 01 0001ffff 00000000 00000000 00 0000 0000 00 none none")
                .unwrap();
        let source =
            VideoParameters::parse("00 00 01 01 0001ffff 00000000 00000000 00 0000 0000 00 none none")
                .unwrap();
        let best = source.get_best_video_mode(&sink, None).unwrap();
        assert_eq!((best.width, best.height, best.frame_rate), (1280, 720, 60));
    }

    #[test]
    fn test_best_mode_is_deterministic() {
        let source = VideoParameters::parse(SINK_FULL).unwrap();
        let sink = VideoParameters::parse(SINK_FULL).unwrap();
        let first = source.get_best_video_mode(&sink, None).unwrap();
        for _ in 0..8 {
            assert_eq!(source.get_best_video_mode(&sink, None).unwrap(), first);
        }
    }

    #[test]
    fn test_no_matching_modes() {
        let cbp = VideoParameters::parse(SINK_SINGLE).unwrap();
        let chp =
            VideoParameters::parse("00 00 02 01 00000001 00000000 00000000 00 0000 0000 00 none none")
                .unwrap();
        assert!(cbp.get_best_video_mode(&chp, None).is_none());
    }

    #[test]
    fn test_dominance_laws() {
        let base = VideoMode {
            high_profile: false,
            level: H264Level::L31,
            width: 1280,
            height: 720,
            frame_rate: 30,
            progressive: true,
        };
        let wider = VideoMode {
            width: 1920,
            height: 1080,
            ..base.clone()
        };
        assert!(wider.dominates(&base));
        assert!(!base.dominates(&wider));
        // Equal on every axis: neither dominates.
        assert!(!base.dominates(&base.clone()));
        // Incomparable: higher rate but lower resolution.
        let faster = VideoMode {
            width: 640,
            height: 480,
            frame_rate: 60,
            ..base.clone()
        };
        assert!(!faster.dominates(&wider));
        assert!(!wider.dominates(&faster));
    }

    #[test]
    fn test_generate_video_mode_line() {
        let mode = VideoMode {
            high_profile: false,
            level: H264Level::L31,
            width: 1680,
            height: 1024,
            frame_rate: 60,
            progressive: true,
        };
        let line = VideoParameters::generate_video_mode(&mode).unwrap();
        assert_eq!(
            line,
            "00 00 01 01 00000000 02000000 00000000 00 0000 0000 00 none none"
        );
    }
}
