//! Wi-Fi Display capability grammars.
//!
//! Three closely related line grammars are exchanged over RTSP during
//! session negotiation: `wfd_video_formats`, `wfd_audio_codecs` and
//! `wfd_uibc_capability`. All of them are built on the same tokenizer
//! ([`parser::LineParser`]) and all obey the round-trip law
//! `generate(parse(s)) == s` for lines this crate emits.

pub mod audio;
pub mod parser;
pub mod uibc;
pub mod video;

pub use audio::{AudioCodec, AudioFormat, AudioMode, AudioParameters};
pub use uibc::{InputPath, InputType, UibcParameters};
pub use video::{H264Codec, H264Level, H264Profile, ResolutionTable, TableMode, VideoMode, VideoParameters};
