//! wfd_audio_codecs: parsing, generation, matching and best-mode selection.

use crate::caps::parser::{
    bit_index, BitCardinality, BitIndex, LineParser, COMMA_SPACE, END_OF_LINE, SPACE,
};
use crate::error::Result;

use std::fmt;

const MODES_LEN: usize = 8;
const LATENCY_LEN: usize = 2;
const LATENCY_MAX: u32 = 255;

const FORMAT_NAMES: [&str; 3] = ["LPCM", "AAC", "AC3"];

/// Audio codec family advertised on the wire. The ordering is the
/// preference rank used by mode dominance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AudioFormat {
    /// Uncompressed 16-bit PCM.
    Lpcm,
    /// AAC-LC.
    Aac,
    /// Dolby AC-3.
    Ac3,
}

impl AudioFormat {
    const ALL: [AudioFormat; 3] = [AudioFormat::Lpcm, AudioFormat::Aac, AudioFormat::Ac3];

    fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    /// Wire name ("LPCM", "AAC", "AC3").
    pub fn as_str(self) -> &'static str {
        FORMAT_NAMES[self as usize]
    }

    /// Lookup by wire name.
    pub fn from_str_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == name)
    }

    /// Valid mode bits for this format.
    pub fn modes_mask(self) -> u32 {
        match self {
            AudioFormat::Lpcm => 0x0000_0003,
            AudioFormat::Aac => 0x0000_000F,
            AudioFormat::Ac3 => 0x0000_0007,
        }
    }

    /// The fixed mode table for this format: `(sample_rate, sample_size,
    /// channel_num)` per bit position.
    pub fn mode_table(self) -> &'static [(u32, u32, u32)] {
        match self {
            AudioFormat::Lpcm => &[(44100, 16, 2), (48000, 16, 2)],
            AudioFormat::Aac => &[(48000, 16, 2), (48000, 16, 4), (48000, 16, 6), (48000, 16, 8)],
            AudioFormat::Ac3 => &[(48000, 16, 2), (48000, 16, 4), (48000, 16, 6)],
        }
    }
}

/// One codec entry from a wfd_audio_codecs line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    /// Codec family.
    pub format: AudioFormat,
    /// Supported mode bitmask (never zero).
    pub modes: u32,
    /// Decoder latency in units of 5 ms.
    pub latency: u8,
}

/// A concrete negotiated audio mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioMode {
    /// Codec family.
    pub format: AudioFormat,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bits per sample.
    pub sample_size: u32,
    /// Channel count.
    pub channel_num: u32,
}

impl AudioMode {
    /// Proper dominance over `(format, sample_rate, sample_size,
    /// channel_num)`: every axis at least equal and one strictly greater.
    pub fn dominates(&self, other: &AudioMode) -> bool {
        let ge = self.format >= other.format
            && self.sample_rate >= other.sample_rate
            && self.sample_size >= other.sample_size
            && self.channel_num >= other.channel_num;
        let gt = self.format > other.format
            || self.sample_rate > other.sample_rate
            || self.sample_size > other.sample_size
            || self.channel_num > other.channel_num;
        ge && gt
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}bit {}ch",
            self.format.as_str(),
            self.sample_rate,
            self.sample_size,
            self.channel_num
        )
    }
}

/// A full wfd_audio_codecs capability set.
#[derive(Debug, Clone)]
pub struct AudioParameters {
    codecs: Vec<AudioCodec>,
}

impl AudioParameters {
    /// Parse a wfd_audio_codecs line.
    pub fn parse(data: &str) -> Result<Self> {
        let mut parser = LineParser::new(data);
        let mut codecs = Vec::new();

        loop {
            // LPCM 00000003 00
            // ^
            let format_idx = parser
                .parse_string_field(&FORMAT_NAMES, SPACE)
                .ok_or_else(|| parser.malformed("invalid wfd_audio_codecs format"))?;
            let format = AudioFormat::from_index(format_idx).expect("table-bounded");

            // LPCM 00000003 00
            //      ^
            let modes = parser
                .parse_hex_bit_field(MODES_LEN, format.modes_mask(), BitCardinality::MultiBits, SPACE)
                .filter(|&m| m != 0)
                .ok_or_else(|| parser.malformed("invalid audio modes bitmap"))?;

            // LPCM 00000003 00
            //               ^
            let latency = parser
                .parse_hex_value(LATENCY_LEN, LATENCY_MAX, END_OF_LINE | COMMA_SPACE)
                .ok_or_else(|| parser.malformed("invalid audio latency"))?;

            codecs.push(AudioCodec {
                format,
                modes,
                latency: latency as u8,
            });

            if parser.last_delimiter() == END_OF_LINE {
                break;
            }
        }

        Ok(AudioParameters { codecs })
    }

    /// Build parameters from already-validated parts (used by the config
    /// loader).
    pub(crate) fn from_parts(codecs: Vec<AudioCodec>) -> Self {
        AudioParameters { codecs }
    }

    /// The advertised codec entries, in wire order.
    pub fn codecs(&self) -> &[AudioCodec] {
        &self.codecs
    }

    fn generate_codec(codec: &AudioCodec) -> String {
        format!(
            "{} {:08x} {:02x}",
            codec.format.as_str(),
            codec.modes,
            codec.latency
        )
    }

    /// Regenerate the full capability line.
    pub fn generate_audio_formats(&self) -> String {
        let mut s = String::new();
        for (i, codec) in self.codecs.iter().enumerate() {
            if i > 0 {
                s.push_str(", ");
            }
            s.push_str(&Self::generate_codec(codec));
        }
        s
    }

    /// Generate the single-mode line a source proposes via SET_PARAMETER.
    /// Returns None when the mode is not in the fixed tables.
    pub fn generate_audio_mode(mode: &AudioMode) -> Option<String> {
        let idx = mode.format.mode_table().iter().position(|&(rate, size, ch)| {
            rate == mode.sample_rate && size == mode.sample_size && ch == mode.channel_num
        })?;
        Some(Self::generate_codec(&AudioCodec {
            format: mode.format,
            modes: 1 << idx,
            latency: 0,
        }))
    }

    /// Validate a peer-proposed single-mode line against this capability
    /// set. Grammar violations are `Malformed`; a well-formed proposal this
    /// set cannot satisfy yields `Ok(None)`.
    pub fn apply_audio_mode(&self, data: &str) -> Result<Option<AudioMode>> {
        let proposal = AudioParameters::parse(data)?;

        if proposal.codecs.len() != 1 {
            tracing::warn!(
                entries = proposal.codecs.len(),
                "audio mode proposal must use a single codec entry"
            );
            return Ok(None);
        }
        let new = &proposal.codecs[0];

        let idx = match bit_index(new.modes, new.format.modes_mask()) {
            BitIndex::Index(idx) => idx,
            _ => {
                tracing::warn!("audio mode proposal must set exactly one mode bit");
                return Ok(None);
            }
        };

        let supported = self
            .codecs
            .iter()
            .any(|cap| cap.format == new.format && cap.modes & new.modes != 0);
        if !supported {
            tracing::debug!(format = new.format.as_str(), "no suitable audio profile");
            return Ok(None);
        }

        let (sample_rate, sample_size, channel_num) = new.format.mode_table()[idx as usize];
        Ok(Some(AudioMode {
            format: new.format,
            sample_rate,
            sample_size,
            channel_num,
        }))
    }

    /// Every mode both sides can handle.
    pub fn matching_modes(&self, sink: &AudioParameters) -> Vec<AudioMode> {
        let mut modes = Vec::new();
        for own in &self.codecs {
            for remote in &sink.codecs {
                if own.format != remote.format {
                    continue;
                }
                let mut matching = own.modes & remote.modes;
                let mut idx = 0usize;
                while matching != 0 {
                    if matching & 1 != 0 {
                        let (sample_rate, sample_size, channel_num) =
                            own.format.mode_table()[idx];
                        modes.push(AudioMode {
                            format: own.format,
                            sample_rate,
                            sample_size,
                            channel_num,
                        });
                    }
                    matching >>= 1;
                    idx += 1;
                }
            }
        }
        modes
    }

    /// Pick the mode to drive: the desired mode when available, else the
    /// dominance maximum of the matching set.
    pub fn get_best_audio_mode(
        &self,
        sink: &AudioParameters,
        desired: Option<&AudioMode>,
    ) -> Option<AudioMode> {
        let modes = self.matching_modes(sink);

        if let Some(desired) = desired {
            if modes.iter().any(|m| m == desired) {
                return Some(desired.clone());
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    const SINK_LPCM: &str = "LPCM 00000002 00";
    const SINK_ALL: &str = "LPCM 00000002 00, AAC 00000003 00, AC3 00000007 00";

    #[test]
    fn test_parse_generate_roundtrip() {
        for line in [SINK_LPCM, SINK_ALL, "AAC 00000002 00"] {
            let params = AudioParameters::parse(line).unwrap();
            assert_eq!(params.generate_audio_formats(), line);
        }
    }

    #[test]
    fn test_negative_corpus() {
        let bad = [
            "LPCN 00000002 00",
            "LPCM 00000000 00",
            "LPCM 00000004 00",
            "LPCM 00000005 00",
            "LPCM 0000002 00",
            "AAC 00000010 00",
            "AC3 00000008 00",
            "LPCM 00000002 0",
        ];
        for line in bad {
            assert!(
                AudioParameters::parse(line).is_err(),
                "expected Malformed: {line}"
            );
        }
    }

    #[test]
    fn test_apply_audio_mode() {
        let sink = AudioParameters::parse(SINK_LPCM).unwrap();

        // AAC is not offered by the sink.
        assert!(sink.apply_audio_mode("AAC 00000002 00").unwrap().is_none());

        // LPCM mode bit 1 = 48 kHz stereo.
        let mode = sink.apply_audio_mode("LPCM 00000002 00").unwrap().unwrap();
        assert_eq!(mode.format, AudioFormat::Lpcm);
        assert_eq!(mode.sample_rate, 48000);
        assert_eq!(mode.channel_num, 2);

        // Multiple mode bits are not a valid proposal.
        let full = AudioParameters::parse(SINK_ALL).unwrap();
        assert!(full.apply_audio_mode("AC3 00000003 00").unwrap().is_none());
    }

    #[test]
    fn test_best_mode_dominance() {
        let source = AudioParameters::parse("LPCM 00000003 00, AAC 0000000f 00, AC3 00000007 00")
            .unwrap();
        let sink = AudioParameters::parse(SINK_ALL).unwrap();
        let best = source.get_best_audio_mode(&sink, None).unwrap();
        // AC3 48k/16/6 dominates every other shared mode.
        assert_eq!(best.format, AudioFormat::Ac3);
        assert_eq!(best.channel_num, 6);
    }

    #[test]
    fn test_best_mode_prefers_desired() {
        let source = AudioParameters::parse(SINK_ALL).unwrap();
        let sink = AudioParameters::parse(SINK_ALL).unwrap();
        let desired = AudioMode {
            format: AudioFormat::Lpcm,
            sample_rate: 48000,
            sample_size: 16,
            channel_num: 2,
        };
        let best = source.get_best_audio_mode(&sink, Some(&desired)).unwrap();
        assert_eq!(best, desired);
    }

    #[test]
    fn test_no_common_format() {
        let lpcm = AudioParameters::parse(SINK_LPCM).unwrap();
        let aac = AudioParameters::parse("AAC 00000001 00").unwrap();
        assert!(lpcm.get_best_audio_mode(&aac, None).is_none());
    }

    #[test]
    fn test_generate_audio_mode_line() {
        let mode = AudioMode {
            format: AudioFormat::Aac,
            sample_rate: 48000,
            sample_size: 16,
            channel_num: 4,
        };
        assert_eq!(
            AudioParameters::generate_audio_mode(&mode).unwrap(),
            "AAC 00000002 00"
        );
    }
}
