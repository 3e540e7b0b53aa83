//! Device-keyed capability configuration documents.
//!
//! A deployment describes per-device Wi-Fi Display capabilities in a small
//! XML document; the loader resolves it into the wire-format capability
//! lines and parameter objects the RTSP layer negotiates with:
//!
//! ```xml
//! <WFDSettings>
//!   <Settings device="Tablet2">
//!     <VideoCodingCap profile="CBP" level="3.1">
//!       <VideoMode resolution="1280x720p30" native="yes"/>
//!       <VideoMode resolution="640x480p60"/>
//!     </VideoCodingCap>
//!     <AudioCodingCap audio_format="LPCM">
//!       <AudioMode sample_rate="48000" channels_num="2"/>
//!     </AudioCodingCap>
//!     <UibcCap port="1512">
//!       <Input type="Mouse"/>
//!       <Input type="RemoteControl" path="No-SP"/>
//!     </UibcCap>
//!   </Settings>
//! </WFDSettings>
//! ```
//!
//! Reading the file off disk is the embedder's business; the loader takes
//! the document text.

use crate::caps::uibc::NUM_INPUT_TYPES;
use crate::caps::{
    AudioFormat, AudioParameters, H264Level, InputPath, InputType, ResolutionTable,
    UibcParameters, VideoMode, VideoParameters,
};
use crate::error::{Error, Result};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const VIDEO_PROFILES: usize = 2;
const PROFILE_NAMES: [&str; VIDEO_PROFILES] = ["CBP", "CHP"];
const AUDIO_FORMATS: usize = 3;

#[derive(Debug, Clone)]
struct VideoProfileEntry {
    valid: bool,
    level: Option<H264Level>,
    formats: [u32; 3],
    latency: u8,
    min_slice_size: u16,
    slice_enc_params: u16,
    frame_rate_control: u8,
    max_hres: Option<u16>,
    max_vres: Option<u16>,
}

impl Default for VideoProfileEntry {
    fn default() -> Self {
        VideoProfileEntry {
            valid: false,
            level: None,
            formats: [0; 3],
            latency: 0,
            min_slice_size: 0,
            slice_enc_params: 0,
            frame_rate_control: 0,
            max_hres: None,
            max_vres: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AudioFormatEntry {
    valid: bool,
    modes: u32,
    latency: u8,
}

#[derive(Debug, Clone)]
struct UibcEntry {
    generic: [bool; NUM_INPUT_TYPES],
    hidc: [Option<InputPath>; NUM_INPUT_TYPES],
    port: u16,
}

/// Parsed capability configuration for one device.
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    native_video: Option<u8>,
    video_profiles: [VideoProfileEntry; VIDEO_PROFILES],
    audio_formats: [AudioFormatEntry; AUDIO_FORMATS],
    uibc: Option<UibcEntry>,
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Config(format!("bad attribute: {err}")))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| Error::Config(format!("bad \"{name}\" value: {err}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn dec_attr(e: &BytesStart<'_>, name: &str, mandatory: bool) -> Result<Option<u32>> {
    match attr_value(e, name)? {
        Some(text) => text
            .parse::<u32>()
            .map(Some)
            .map_err(|_| Error::Config(format!("\"{name}\" field value is invalid ({text})"))),
        None if mandatory => Err(Error::Config(format!("mandatory \"{name}\" field is absent"))),
        None => Ok(None),
    }
}

impl CapabilityConfig {
    /// Parse the configuration document, keeping only the `<Settings>`
    /// section whose `device` attribute equals `device`.
    pub fn parse(xml: &str, device: &str) -> Result<Self> {
        let mut config = CapabilityConfig {
            native_video: None,
            video_profiles: Default::default(),
            audio_formats: Default::default(),
            uibc: None,
        };

        let mut reader = Reader::from_str(xml);
        let mut in_device = false;
        let mut device_seen = false;
        let mut current_video: Option<usize> = None;
        let mut current_audio: Option<usize> = None;
        let mut in_uibc = false;

        loop {
            let event = reader
                .read_event()
                .map_err(|err| Error::Config(format!("XML error: {err}")))?;
            match event {
                Event::Start(e) | Event::Empty(e) => {
                    match e.name().as_ref() {
                        b"Settings" => {
                            in_device = attr_value(&e, "device")?.as_deref() == Some(device);
                            device_seen |= in_device;
                        }
                        b"VideoCodingCap" if in_device => {
                            current_video = Some(config.begin_video_cap(&e)?);
                        }
                        b"VideoMode" if in_device => {
                            if let Some(profile) = current_video {
                                config.parse_video_mode(&e, profile)?;
                            }
                        }
                        b"AudioCodingCap" if in_device => {
                            current_audio = Some(config.begin_audio_cap(&e)?);
                        }
                        b"AudioMode" if in_device => {
                            if let Some(format) = current_audio {
                                config.parse_audio_mode(&e, format)?;
                            }
                        }
                        b"UibcCap" if in_device => {
                            in_uibc = true;
                            config.begin_uibc_cap(&e)?;
                        }
                        b"Input" if in_device && in_uibc => {
                            config.parse_uibc_input(&e)?;
                        }
                        _ => {}
                    }
                }
                Event::End(e) => match e.name().as_ref() {
                    b"Settings" => in_device = false,
                    b"VideoCodingCap" => {
                        if let Some(profile) = current_video.take() {
                            let entry = &mut config.video_profiles[profile];
                            entry.valid = entry.formats.iter().any(|&f| f != 0);
                        }
                    }
                    b"AudioCodingCap" => {
                        if let Some(format) = current_audio.take() {
                            let entry = &mut config.audio_formats[format];
                            entry.valid = entry.modes != 0;
                        }
                    }
                    b"UibcCap" => in_uibc = false,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if !device_seen {
            return Err(Error::Config(format!("device \"{device}\" not found")));
        }
        Ok(config)
    }

    fn begin_video_cap(&mut self, e: &BytesStart<'_>) -> Result<usize> {
        let profile_name = attr_value(e, "profile")?
            .ok_or_else(|| Error::Config("mandatory \"profile\" field is absent".into()))?;
        let profile = PROFILE_NAMES
            .iter()
            .position(|p| p.eq_ignore_ascii_case(&profile_name))
            .ok_or_else(|| {
                Error::Config(format!("mandatory \"profile\" field value is invalid ({profile_name})"))
            })?;
        if self.video_profiles[profile].valid || self.video_profiles[profile].level.is_some() {
            return Err(Error::Config(format!(
                "duplicated video profile {} is not acceptable",
                PROFILE_NAMES[profile]
            )));
        }

        let level_name = attr_value(e, "level")?
            .ok_or_else(|| Error::Config("mandatory \"level\" field is absent".into()))?;
        let level = H264Level::from_str_name(level_name.trim()).ok_or_else(|| {
            Error::Config(format!("mandatory \"level\" field value is invalid ({level_name})"))
        })?;

        let entry = &mut self.video_profiles[profile];
        entry.level = Some(level);
        entry.latency = dec_attr(e, "decoder_latency", false)?.unwrap_or(0) as u8;
        entry.min_slice_size = dec_attr(e, "min_slice_size", false)?.unwrap_or(0) as u16;
        entry.slice_enc_params = dec_attr(e, "slice_enc_params", false)?.unwrap_or(0) as u16;
        entry.frame_rate_control =
            dec_attr(e, "frame_rate_control_support", false)?.unwrap_or(0) as u8;
        entry.max_hres = dec_attr(e, "max_hres", false)?.map(|v| v as u16);
        entry.max_vres = dec_attr(e, "max_vres", false)?.map(|v| v as u16);
        Ok(profile)
    }

    fn parse_video_mode(&mut self, e: &BytesStart<'_>, profile: usize) -> Result<()> {
        let resolution = attr_value(e, "resolution")?
            .ok_or_else(|| Error::Config("mandatory \"resolution\" field is absent".into()))?;

        let mut found = None;
        'tables: for table in ResolutionTable::ALL {
            for (idx, entry) in table.entries().iter().enumerate() {
                if entry.resolution_name().eq_ignore_ascii_case(resolution.trim()) {
                    found = Some((table, idx as u32));
                    break 'tables;
                }
            }
        }
        let (table, idx) = found.ok_or_else(|| {
            Error::Config(format!(
                "mandatory \"resolution\" field value is invalid ({resolution})"
            ))
        })?;
        self.video_profiles[profile].formats[table.index() as usize] |= 1 << idx;

        if let Some(native) = attr_value(e, "native")? {
            if native.eq_ignore_ascii_case("yes") {
                if self.native_video.is_some() {
                    return Err(Error::Config(
                        "optional \"native\" field must carry \"yes\" only once".into(),
                    ));
                }
                self.native_video = Some(((idx << 3) | table.index()) as u8);
            }
        }
        Ok(())
    }

    fn begin_audio_cap(&mut self, e: &BytesStart<'_>) -> Result<usize> {
        let format_name = attr_value(e, "audio_format")?
            .ok_or_else(|| Error::Config("mandatory \"audio_format\" field is absent".into()))?;
        let format = AudioFormat::from_str_name(format_name.trim().to_ascii_uppercase().as_str())
            .ok_or_else(|| {
                Error::Config(format!(
                    "mandatory \"audio_format\" field value is invalid ({format_name})"
                ))
            })?;
        let idx = format as usize;
        if self.audio_formats[idx].valid {
            return Err(Error::Config(format!(
                "duplicated audio format {} is not acceptable",
                format.as_str()
            )));
        }
        self.audio_formats[idx].latency = dec_attr(e, "latency", false)?.unwrap_or(0) as u8;
        Ok(idx)
    }

    fn parse_audio_mode(&mut self, e: &BytesStart<'_>, format_idx: usize) -> Result<()> {
        let sample_rate = dec_attr(e, "sample_rate", true)?.expect("mandatory");
        let channels = dec_attr(e, "channels_num", true)?.expect("mandatory");

        let format = [AudioFormat::Lpcm, AudioFormat::Aac, AudioFormat::Ac3][format_idx];
        let bit = format
            .mode_table()
            .iter()
            .position(|&(rate, _, ch)| rate == sample_rate && ch == channels)
            .ok_or_else(|| {
                Error::Config(format!(
                    "unsupported audio mode {sample_rate} Hz {channels}ch"
                ))
            })?;
        self.audio_formats[format_idx].modes |= 1 << bit;
        Ok(())
    }

    fn begin_uibc_cap(&mut self, e: &BytesStart<'_>) -> Result<()> {
        if self.uibc.is_some() {
            return Err(Error::Config("duplicated UibcCap section".into()));
        }
        let port = match dec_attr(e, "port", false)? {
            Some(p) if (1..=65535).contains(&p) => p as u16,
            Some(p) => {
                return Err(Error::Config(format!("\"port\" field value is invalid ({p})")));
            }
            None => 0,
        };
        self.uibc = Some(UibcEntry {
            generic: [false; NUM_INPUT_TYPES],
            hidc: [None; NUM_INPUT_TYPES],
            port,
        });
        Ok(())
    }

    fn parse_uibc_input(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let type_name = attr_value(e, "type")?
            .ok_or_else(|| Error::Config("mandatory \"type\" field is absent".into()))?;
        let ty = InputType::ALL
            .iter()
            .position(|t| t.as_str().eq_ignore_ascii_case(type_name.trim()))
            .ok_or_else(|| {
                Error::Config(format!("mandatory \"type\" field value is invalid ({type_name})"))
            })?;

        let uibc = self.uibc.as_mut().expect("inside UibcCap");
        match attr_value(e, "path")? {
            Some(path_name) => {
                let path = [
                    InputPath::Infrared,
                    InputPath::Usb,
                    InputPath::Bt,
                    InputPath::Zigbee,
                    InputPath::WiFi,
                    InputPath::NoSp,
                ]
                .into_iter()
                .find(|p| p.as_str().eq_ignore_ascii_case(path_name.trim()))
                .ok_or_else(|| {
                    Error::Config(format!("\"path\" field value is invalid ({path_name})"))
                })?;
                if uibc.hidc[ty].is_some() {
                    return Err(Error::Config(format!("duplicated input type {type_name}")));
                }
                uibc.hidc[ty] = Some(path);
            }
            None => {
                if uibc.generic[ty] {
                    return Err(Error::Config(format!("duplicated input type {type_name}")));
                }
                uibc.generic[ty] = true;
            }
        }
        Ok(())
    }

    fn generate_video_profile(&self, profile: usize) -> Option<String> {
        let entry = &self.video_profiles[profile];
        if !entry.valid {
            return None;
        }
        let mut s = format!(
            "{:02x} {:02x} {:08x} {:08x} {:08x} {:02x} {:04x} {:04x} {:02x}",
            profile as u32 + 1,
            entry.level.expect("valid entry has level").wire_bit(),
            entry.formats[0],
            entry.formats[1],
            entry.formats[2],
            entry.latency,
            entry.min_slice_size,
            entry.slice_enc_params,
            entry.frame_rate_control,
        );
        match entry.max_hres {
            Some(v) => s.push_str(&format!(" {:04x}", v)),
            None => s.push_str(" none"),
        }
        match entry.max_vres {
            Some(v) => s.push_str(&format!(" {:04x}", v)),
            None => s.push_str(" none"),
        }
        Some(s)
    }

    /// The wfd_video_formats line for this device, or None when no video
    /// capability was configured.
    pub fn generate_video_caps(&self) -> Option<String> {
        let profiles: Vec<String> = (0..VIDEO_PROFILES)
            .filter_map(|p| self.generate_video_profile(p))
            .collect();
        if profiles.is_empty() {
            tracing::warn!("config video capabilities are empty");
            return None;
        }
        Some(format!(
            "{:02x} 00 {}",
            self.native_video.unwrap_or(0),
            profiles.join(", ")
        ))
    }

    /// The wfd_audio_codecs line for this device, or None when no audio
    /// capability was configured.
    pub fn generate_audio_caps(&self) -> Option<String> {
        let formats: Vec<String> = (0..AUDIO_FORMATS)
            .filter(|&idx| self.audio_formats[idx].valid)
            .map(|idx| {
                let entry = &self.audio_formats[idx];
                let format = [AudioFormat::Lpcm, AudioFormat::Aac, AudioFormat::Ac3][idx];
                format!("{} {:08x} {:02x}", format.as_str(), entry.modes, entry.latency)
            })
            .collect();
        if formats.is_empty() {
            return None;
        }
        Some(formats.join(", "))
    }

    /// The wfd_uibc_capability line for this device, or None when no UIBC
    /// section was configured.
    pub fn generate_uibc_caps(&self) -> Option<String> {
        self.uibc_parameters().map(|p| p.generate_uibc_capability())
    }

    /// The parsed video capability set.
    pub fn video_parameters(&self) -> Result<Option<VideoParameters>> {
        match self.generate_video_caps() {
            Some(caps) => Ok(Some(VideoParameters::parse(&caps)?)),
            None => Ok(None),
        }
    }

    /// The parsed audio capability set.
    pub fn audio_parameters(&self) -> Result<Option<AudioParameters>> {
        match self.generate_audio_caps() {
            Some(caps) => Ok(Some(AudioParameters::parse(&caps)?)),
            None => Ok(None),
        }
    }

    /// The parsed UIBC capability set.
    pub fn uibc_parameters(&self) -> Option<UibcParameters> {
        self.uibc
            .as_ref()
            .map(|u| UibcParameters::from_parts(u.generic, u.hidc, u.port))
    }

    /// The native video mode, when one `<VideoMode>` carried
    /// `native="yes"`.
    pub fn native_video_mode(&self) -> Option<VideoMode> {
        let native = self.native_video?;
        let table = ResolutionTable::ALL[(native & 0x07) as usize];
        let entry = *table.entries().get((native >> 3) as usize)?;
        let profile = self
            .video_profiles
            .iter()
            .position(|p| p.valid)
            .unwrap_or(0);
        Some(VideoMode {
            high_profile: profile == 1,
            level: self.video_profiles[profile].level.unwrap_or(H264Level::L31),
            width: entry.width,
            height: entry.height,
            frame_rate: entry.frame_rate,
            progressive: entry.progressive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<WFDSettings>
  <Settings device="Tablet2">
    <VideoCodingCap profile="CBP" level="3.1" decoder_latency="0">
      <VideoMode resolution="1280x720p30" native="yes"/>
      <VideoMode resolution="640x480p60"/>
    </VideoCodingCap>
    <VideoCodingCap profile="CHP" level="4.2">
      <VideoMode resolution="1920x1080p30"/>
    </VideoCodingCap>
    <AudioCodingCap audio_format="LPCM">
      <AudioMode sample_rate="48000" channels_num="2"/>
    </AudioCodingCap>
    <AudioCodingCap audio_format="AAC" latency="10">
      <AudioMode sample_rate="48000" channels_num="2"/>
      <AudioMode sample_rate="48000" channels_num="6"/>
    </AudioCodingCap>
    <UibcCap port="1512">
      <Input type="Mouse"/>
      <Input type="Keyboard"/>
      <Input type="RemoteControl" path="No-SP"/>
    </UibcCap>
  </Settings>
  <Settings device="Other">
    <VideoCodingCap profile="CBP" level="3.2">
      <VideoMode resolution="800x600p30"/>
    </VideoCodingCap>
  </Settings>
</WFDSettings>
"#;

    #[test]
    fn test_video_caps_generation() {
        let config = CapabilityConfig::parse(DOC, "Tablet2").unwrap();
        // 1280x720p30 is CEA index 5, native = (5 << 3) | 0 = 0x28;
        // 640x480p60 is CEA index 0; 1920x1080p30 is CEA index 7.
        let caps = config.generate_video_caps().unwrap();
        assert_eq!(
            caps,
            "28 00 01 01 00000021 00000000 00000000 00 0000 0000 00 none none, \
             02 10 00000080 00000000 00000000 00 0000 0000 00 none none"
        );
        let params = config.video_parameters().unwrap().unwrap();
        assert_eq!(params.native_mode().width, 1280);
        assert_eq!(params.codecs().len(), 2);
    }

    #[test]
    fn test_audio_caps_generation() {
        let config = CapabilityConfig::parse(DOC, "Tablet2").unwrap();
        assert_eq!(
            config.generate_audio_caps().unwrap(),
            "LPCM 00000002 00, AAC 00000005 0a"
        );
        let params = config.audio_parameters().unwrap().unwrap();
        assert_eq!(params.codecs().len(), 2);
    }

    #[test]
    fn test_uibc_caps_generation() {
        let config = CapabilityConfig::parse(DOC, "Tablet2").unwrap();
        assert_eq!(
            config.generate_uibc_caps().unwrap(),
            "input_category_list=GENERIC, HIDC; generic_cap_list=Keyboard, Mouse; \
             hidc_cap_list=RemoteControl/No-SP; port=1512"
        );
    }

    #[test]
    fn test_device_keying() {
        let config = CapabilityConfig::parse(DOC, "Other").unwrap();
        let caps = config.generate_video_caps().unwrap();
        // 800x600p30 is VESA index 0; no native mark.
        assert_eq!(
            caps,
            "00 00 01 02 00000000 00000001 00000000 00 0000 0000 00 none none"
        );
        assert!(config.generate_audio_caps().is_none());

        assert!(CapabilityConfig::parse(DOC, "Phone9").is_err());
    }

    #[test]
    fn test_native_video_mode() {
        let config = CapabilityConfig::parse(DOC, "Tablet2").unwrap();
        let native = config.native_video_mode().unwrap();
        assert_eq!((native.width, native.height, native.frame_rate), (1280, 720, 30));
    }

    #[test]
    fn test_rejects_duplicate_profile() {
        let doc = r#"<WFDSettings><Settings device="X">
            <VideoCodingCap profile="CBP" level="3.1">
              <VideoMode resolution="640x480p60"/>
            </VideoCodingCap>
            <VideoCodingCap profile="cbp" level="3.2">
              <VideoMode resolution="640x480p60"/>
            </VideoCodingCap>
        </Settings></WFDSettings>"#;
        assert!(CapabilityConfig::parse(doc, "X").is_err());
    }

    #[test]
    fn test_rejects_unknown_resolution() {
        let doc = r#"<WFDSettings><Settings device="X">
            <VideoCodingCap profile="CBP" level="3.1">
              <VideoMode resolution="123x456p78"/>
            </VideoCodingCap>
        </Settings></WFDSettings>"#;
        assert!(CapabilityConfig::parse(doc, "X").is_err());
    }

    #[test]
    fn test_rejects_missing_level() {
        let doc = r#"<WFDSettings><Settings device="X">
            <VideoCodingCap profile="CBP">
              <VideoMode resolution="640x480p60"/>
            </VideoCodingCap>
        </Settings></WFDSettings>"#;
        assert!(CapabilityConfig::parse(doc, "X").is_err());
    }

    #[test]
    fn test_rejects_two_native_marks() {
        let doc = r#"<WFDSettings><Settings device="X">
            <VideoCodingCap profile="CBP" level="3.1">
              <VideoMode resolution="640x480p60" native="yes"/>
              <VideoMode resolution="720x480p60" native="yes"/>
            </VideoCodingCap>
        </Settings></WFDSettings>"#;
        assert!(CapabilityConfig::parse(doc, "X").is_err());
    }

    #[test]
    fn test_rejects_unknown_audio_mode() {
        let doc = r#"<WFDSettings><Settings device="X">
            <AudioCodingCap audio_format="LPCM">
              <AudioMode sample_rate="96000" channels_num="2"/>
            </AudioCodingCap>
        </Settings></WFDSettings>"#;
        assert!(CapabilityConfig::parse(doc, "X").is_err());
    }
}
