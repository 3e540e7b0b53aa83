//! wfd_uibc_capability: parsing, generation and capability intersection.
//!
//! UIBC (User Input Back Channel) capabilities enumerate which input types a
//! device handles generically and which it routes over a hardware input
//! distribution path (HIDC), plus the TCP port the channel runs on.

use crate::caps::parser::{
    LineParser, COMMA_SPACE, END_OF_LINE, EQUAL_SIGN, SEMICOLON_SPACE, SLASH,
};
use crate::error::Result;

/// Number of UIBC input types.
pub const NUM_INPUT_TYPES: usize = 8;

const CATEGORY_NAMES: [&str; 3] = ["GENERIC", "HIDC", "none"];
const CATEGORY_GENERIC: usize = 0;
const CATEGORY_HIDC: usize = 1;
const CATEGORY_NONE: usize = 2;

const INPUT_TYPE_NAMES: [&str; NUM_INPUT_TYPES] = [
    "Keyboard",
    "Mouse",
    "SingleTouch",
    "MultiTouch",
    "Joystick",
    "Camera",
    "Gesture",
    "RemoteControl",
];

const INPUT_PATH_NAMES: [&str; 6] = ["Infrared", "USB", "BT", "Zigbee", "Wi-Fi", "No-SP"];

/// A UIBC input type. The discriminant is the wire bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputType {
    /// Keyboard events.
    Keyboard,
    /// Mouse events.
    Mouse,
    /// Single-touch events.
    SingleTouch,
    /// Multi-touch events.
    MultiTouch,
    /// Joystick events.
    Joystick,
    /// Camera control.
    Camera,
    /// Gesture events.
    Gesture,
    /// Remote-control events.
    RemoteControl,
}

impl InputType {
    /// All input types in wire order.
    pub const ALL: [InputType; NUM_INPUT_TYPES] = [
        InputType::Keyboard,
        InputType::Mouse,
        InputType::SingleTouch,
        InputType::MultiTouch,
        InputType::Joystick,
        InputType::Camera,
        InputType::Gesture,
        InputType::RemoteControl,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        INPUT_TYPE_NAMES[self as usize]
    }
}

/// The distribution path of a HIDC input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputPath {
    /// Infrared.
    Infrared,
    /// USB.
    Usb,
    /// Bluetooth.
    Bt,
    /// Zigbee.
    Zigbee,
    /// Wi-Fi.
    WiFi,
    /// No specific path.
    NoSp,
}

impl InputPath {
    fn from_index(idx: usize) -> Option<Self> {
        [
            InputPath::Infrared,
            InputPath::Usb,
            InputPath::Bt,
            InputPath::Zigbee,
            InputPath::WiFi,
            InputPath::NoSp,
        ]
        .get(idx)
        .copied()
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        INPUT_PATH_NAMES[self as usize]
    }
}

/// A full wfd_uibc_capability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UibcParameters {
    generic: [bool; NUM_INPUT_TYPES],
    hidc: [Option<InputPath>; NUM_INPUT_TYPES],
    port: u16,
    supported: bool,
}

impl Default for UibcParameters {
    fn default() -> Self {
        UibcParameters {
            generic: [false; NUM_INPUT_TYPES],
            hidc: [None; NUM_INPUT_TYPES],
            port: 0,
            supported: false,
        }
    }
}

impl UibcParameters {
    /// Parse a wfd_uibc_capability line.
    pub fn parse(data: &str) -> Result<Self> {
        let mut params = UibcParameters::default();
        params.parse_into(data)?;
        Ok(params)
    }

    /// Build parameters from already-validated parts (used by the config
    /// loader).
    pub(crate) fn from_parts(
        generic: [bool; NUM_INPUT_TYPES],
        hidc: [Option<InputPath>; NUM_INPUT_TYPES],
        port: u16,
    ) -> Self {
        UibcParameters {
            generic,
            hidc,
            port,
            supported: true,
        }
    }

    fn parse_into(&mut self, data: &str) -> Result<()> {
        let mut parser = LineParser::new(data);

        // A lone "none" disables the whole channel.
        if parser.check_string_field("none", END_OF_LINE) {
            return Ok(());
        }

        // input_category_list=GENERIC, HIDC;
        if !parser.check_string_field("input_category_list", EQUAL_SIGN) {
            return Err(parser.malformed("tag \"input_category_list=\" is absent"));
        }
        let category = parser
            .parse_string_field(&CATEGORY_NAMES, COMMA_SPACE | SEMICOLON_SPACE)
            .ok_or_else(|| parser.malformed("expected GENERIC, HIDC or none"))?;

        let mut generic_support = false;
        let mut hidc_support = false;
        match category {
            CATEGORY_NONE => {
                if parser.last_delimiter() != SEMICOLON_SPACE {
                    return Err(parser.malformed("category none must be closed by \"; \""));
                }
            }
            CATEGORY_GENERIC => generic_support = true,
            _ => hidc_support = true,
        }

        if category != CATEGORY_NONE && parser.last_delimiter() == COMMA_SPACE {
            let second = parser
                .parse_string_field(&CATEGORY_NAMES, SEMICOLON_SPACE)
                .filter(|&c| c != CATEGORY_NONE)
                .ok_or_else(|| parser.malformed("expected GENERIC or HIDC"))?;
            match second {
                CATEGORY_GENERIC if generic_support => {
                    return Err(parser.malformed("duplicated GENERIC category"));
                }
                CATEGORY_GENERIC => generic_support = true,
                _ if hidc_support => {
                    return Err(parser.malformed("duplicated HIDC category"));
                }
                _ => hidc_support = true,
            }
        }

        // generic_cap_list=Mouse, SingleTouch;
        if !parser.check_string_field("generic_cap_list", EQUAL_SIGN) {
            return Err(parser.malformed("tag \"generic_cap_list=\" is absent"));
        }
        if !generic_support {
            if !parser.check_string_field("none", SEMICOLON_SPACE) {
                return Err(parser.malformed("generic_cap_list must be \"none; \""));
            }
        } else {
            loop {
                let ty = parser
                    .parse_string_field(&INPUT_TYPE_NAMES, COMMA_SPACE | SEMICOLON_SPACE)
                    .ok_or_else(|| parser.malformed("unknown generic input type"))?;
                if self.generic[ty] {
                    return Err(parser.malformed("duplicated generic input type"));
                }
                self.generic[ty] = true;
                if parser.last_delimiter() != COMMA_SPACE {
                    break;
                }
            }
        }

        // hidc_cap_list=Mouse/BT, RemoteControl/Infrared;
        if !parser.check_string_field("hidc_cap_list", EQUAL_SIGN) {
            return Err(parser.malformed("tag \"hidc_cap_list=\" is absent"));
        }
        if !hidc_support {
            if !parser.check_string_field("none", SEMICOLON_SPACE) {
                return Err(parser.malformed("hidc_cap_list must be \"none; \""));
            }
        } else {
            loop {
                let ty = parser
                    .parse_string_field(&INPUT_TYPE_NAMES, SLASH)
                    .ok_or_else(|| parser.malformed("unknown HIDC input type"))?;
                if self.hidc[ty].is_some() {
                    return Err(parser.malformed("duplicated HIDC input type"));
                }
                let path = parser
                    .parse_string_field(&INPUT_PATH_NAMES, COMMA_SPACE | SEMICOLON_SPACE)
                    .ok_or_else(|| parser.malformed("unknown HIDC input path"))?;
                self.hidc[ty] = InputPath::from_index(path);
                if parser.last_delimiter() != COMMA_SPACE {
                    break;
                }
            }
        }

        // port=1512
        if !parser.check_string_field("port", EQUAL_SIGN) {
            return Err(parser.malformed("tag \"port=\" is absent"));
        }
        if parser.check_string_field("none", END_OF_LINE) {
            self.port = 0;
        } else {
            self.port = parser
                .parse_dec_value(1, 65535, END_OF_LINE)
                .ok_or_else(|| parser.malformed("invalid port value"))? as u16;
        }

        self.supported = true;
        Ok(())
    }

    /// Whether the channel is supported at all.
    pub fn supported(&self) -> bool {
        self.supported
    }

    /// The advertised UIBC TCP port (0 = none).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether `ty` is advertised in the generic list.
    pub fn generic(&self, ty: InputType) -> bool {
        self.generic[ty as usize]
    }

    /// The HIDC path advertised for `ty`, if any.
    pub fn hidc_path(&self, ty: InputType) -> Option<InputPath> {
        self.hidc[ty as usize]
    }

    fn is_generic_used(&self) -> bool {
        self.generic.iter().any(|&g| g)
    }

    fn is_hidc_used(&self) -> bool {
        self.hidc.iter().any(|h| h.is_some())
    }

    /// Bitset over the 8 input types advertised generically.
    pub fn generic_mask(&self) -> u8 {
        let mut mask = 0u8;
        for (i, &g) in self.generic.iter().enumerate() {
            if g {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Regenerate the capability text.
    pub fn generate_uibc_capability(&self) -> String {
        if !self.supported {
            return "none".to_owned();
        }

        let mut s = String::from("input_category_list=");
        match (self.is_generic_used(), self.is_hidc_used()) {
            (true, true) => s.push_str("GENERIC, HIDC; "),
            (true, false) => s.push_str("GENERIC; "),
            (false, true) => s.push_str("HIDC; "),
            (false, false) => s.push_str("none; "),
        }

        s.push_str("generic_cap_list=");
        let mut any = false;
        for (i, &g) in self.generic.iter().enumerate() {
            if g {
                if any {
                    s.push_str(", ");
                }
                any = true;
                s.push_str(INPUT_TYPE_NAMES[i]);
            }
        }
        s.push_str(if any { "; " } else { "none; " });

        s.push_str("hidc_cap_list=");
        let mut any = false;
        for (i, path) in self.hidc.iter().enumerate() {
            if let Some(path) = path {
                if any {
                    s.push_str(", ");
                }
                any = true;
                s.push_str(INPUT_TYPE_NAMES[i]);
                s.push('/');
                s.push_str(path.as_str());
            }
        }
        s.push_str(if any { "; " } else { "none; " });

        s.push_str("port=");
        if self.port > 0 {
            s.push_str(&self.port.to_string());
        } else {
            s.push_str("none");
        }
        s
    }

    /// Validate a peer-proposed capability line against this set.
    ///
    /// Every proposed capability must be advertised here: generic types by
    /// presence, HIDC entries by an identical path. Grammar violations are
    /// `Malformed`; an unacceptable proposal yields `Ok(None)`.
    pub fn apply_uibc_parameters(&self, data: &str) -> Result<Option<UibcParameters>> {
        if !self.supported {
            return Ok(None);
        }
        let new = UibcParameters::parse(data)?;
        if !new.supported {
            return Ok(None);
        }

        for i in 0..NUM_INPUT_TYPES {
            if new.generic[i] && !self.generic[i] {
                tracing::warn!(
                    input = INPUT_TYPE_NAMES[i],
                    "generic input type not advertised by this side"
                );
                return Ok(None);
            }
            if let Some(path) = new.hidc[i] {
                if self.hidc[i] != Some(path) {
                    tracing::warn!(
                        input = INPUT_TYPE_NAMES[i],
                        path = path.as_str(),
                        "HIDC input type/path not advertised by this side"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(new))
    }

    /// Intersect a source's capabilities (self) with a sink's.
    ///
    /// Generic types are AND-combined; HIDC entries survive when both sides
    /// carry the type, taking the sink's path. The source's port is kept.
    pub fn select_uibc_params(&self, sink: &UibcParameters) -> Option<UibcParameters> {
        if !sink.supported {
            return None;
        }

        let mut selected = UibcParameters::default();
        for i in 0..NUM_INPUT_TYPES {
            selected.generic[i] = self.generic[i] && sink.generic[i];
            if self.hidc[i].is_some() && sink.hidc[i].is_some() {
                selected.hidc[i] = sink.hidc[i];
            }
        }
        selected.port = self.port;
        selected.supported = true;
        Some(selected)
    }
}
