//! RTSP/1.0 message framing and the `text/parameters` body format.

use crate::error::{Error, Result};

use std::fmt::Write as _;

/// Case-insensitive RTSP header collection, preserving insertion order.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Look up a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn push(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }
}

/// A parsed RTSP message.
#[derive(Debug, Clone)]
pub enum RtspMessage {
    /// A request from the peer.
    Request {
        /// RTSP method.
        method: String,
        /// Request URI.
        uri: String,
        /// Header fields.
        headers: Headers,
        /// Message body (empty when absent).
        body: String,
    },
    /// A response to one of our requests.
    Response {
        /// Status code.
        status: u16,
        /// Reason phrase.
        reason: String,
        /// Header fields.
        headers: Headers,
        /// Message body (empty when absent).
        body: String,
    },
}

impl RtspMessage {
    /// The message's headers.
    pub fn headers(&self) -> &Headers {
        match self {
            RtspMessage::Request { headers, .. } | RtspMessage::Response { headers, .. } => headers,
        }
    }

    /// The message body.
    pub fn body(&self) -> &str {
        match self {
            RtspMessage::Request { body, .. } | RtspMessage::Response { body, .. } => body,
        }
    }

    /// The CSeq header, when present and numeric.
    pub fn cseq(&self) -> Option<u32> {
        self.headers().get("CSeq")?.trim().parse().ok()
    }

    /// Status code for responses.
    pub fn status(&self) -> Option<u16> {
        match self {
            RtspMessage::Response { status, .. } => Some(*status),
            RtspMessage::Request { .. } => None,
        }
    }
}

/// Accumulates socket bytes and cuts complete RTSP messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: Vec<u8>,
}

impl MessageAssembler {
    /// Create an empty assembler.
    pub fn new() -> MessageAssembler {
        MessageAssembler::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Cut the next complete message, if the buffer holds one.
    pub fn next_message(&mut self) -> Result<Option<RtspMessage>> {
        let Some(header_end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            return Ok(None);
        };

        let header_text = std::str::from_utf8(&self.buffer[..header_end])
            .map_err(|_| Error::malformed("RTSP header is not UTF-8", 0))?
            .to_owned();

        let mut lines = header_text.split("\r\n");
        let start_line = lines
            .next()
            .ok_or_else(|| Error::malformed("empty RTSP message", 0))?
            .to_owned();

        let mut headers = Headers::default();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::malformed("RTSP header without colon", 0))?;
            headers.push(name.trim().to_owned(), value.trim().to_owned());
        }

        let content_length: usize = match headers.get("Content-Length") {
            Some(text) => text
                .trim()
                .parse()
                .map_err(|_| Error::malformed("bad Content-Length", 0))?,
            None => 0,
        };

        let body_start = header_end + 4;
        if self.buffer.len() < body_start + content_length {
            return Ok(None);
        }
        let body = String::from_utf8_lossy(&self.buffer[body_start..body_start + content_length])
            .into_owned();
        self.buffer.drain(..body_start + content_length);

        let message = if let Some(rest) = start_line.strip_prefix("RTSP/1.0 ") {
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = code
                .parse()
                .map_err(|_| Error::malformed("bad RTSP status code", 0))?;
            RtspMessage::Response {
                status,
                reason: reason.to_owned(),
                headers,
                body,
            }
        } else {
            let mut parts = start_line.split(' ');
            let method = parts
                .next()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| Error::malformed("missing RTSP method", 0))?;
            let uri = parts
                .next()
                .ok_or_else(|| Error::malformed("missing RTSP request URI", 0))?;
            match parts.next() {
                Some("RTSP/1.0") => {}
                _ => return Err(Error::malformed("bad RTSP version", 0)),
            }
            RtspMessage::Request {
                method: method.to_owned(),
                uri: uri.to_owned(),
                headers,
                body,
            }
        };
        Ok(Some(message))
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

const USER_AGENT: &str = concat!("aircast/", env!("CARGO_PKG_VERSION"));

/// Builder for outgoing RTSP requests and responses.
pub struct MessageBuilder {
    start_line: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl MessageBuilder {
    /// Start a request line.
    pub fn request(method: &str, uri: &str) -> MessageBuilder {
        MessageBuilder {
            start_line: format!("{method} {uri} RTSP/1.0"),
            headers: vec![("User-Agent".into(), USER_AGENT.into())],
            body: None,
        }
    }

    /// Start a response status line.
    pub fn response(status: u16, reason: &str) -> MessageBuilder {
        MessageBuilder {
            start_line: format!("RTSP/1.0 {status} {reason}"),
            headers: vec![("Server".into(), USER_AGENT.into())],
            body: None,
        }
    }

    /// Add the CSeq header.
    pub fn cseq(self, cseq: u32) -> MessageBuilder {
        self.header("CSeq", cseq.to_string())
    }

    /// Add an arbitrary header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> MessageBuilder {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a `text/parameters` body.
    pub fn parameters_body(mut self, body: impl Into<String>) -> MessageBuilder {
        self.body = Some(body.into());
        self.headers
            .push(("Content-Type".into(), "text/parameters".into()));
        self
    }

    /// Serialize the message.
    pub fn build(self) -> String {
        let mut out = self.start_line;
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if let Some(body) = &self.body {
            let _ = write!(out, "Content-Length: {}\r\n", body.len());
        }
        out.push_str("\r\n");
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out
    }
}

/// A `text/parameters` body: one `name` or `name: value` per line.
#[derive(Debug, Clone, Default)]
pub struct Parameters(Vec<(String, Option<String>)>);

impl Parameters {
    /// Parse a body. Blank lines are skipped.
    pub fn parse(body: &str) -> Parameters {
        let mut entries = Vec::new();
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    entries.push((name.trim().to_owned(), Some(value.trim().to_owned())));
                }
                None => entries.push((line.trim().to_owned(), None)),
            }
        }
        Parameters(entries)
    }

    /// The value of a `name: value` entry.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether `name` appears at all (with or without a value).
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k == name)
    }

    /// All entry names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// True when the body carried no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_cuts_complete_request() {
        let mut assembler = MessageAssembler::new();
        assembler.push(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.wfa.wfd1.0\r\n\r\n");
        let msg = assembler.next_message().unwrap().unwrap();
        match msg {
            RtspMessage::Request { method, uri, headers, body } => {
                assert_eq!(method, "OPTIONS");
                assert_eq!(uri, "*");
                assert_eq!(headers.get("require"), Some("org.wfa.wfd1.0"));
                assert!(body.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(assembler.next_message().unwrap().is_none());
    }

    #[test]
    fn test_assembler_waits_for_body() {
        let mut assembler = MessageAssembler::new();
        assembler.push(b"SET_PARAMETER rtsp://x/wfd1.0 RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 27\r\n\r\n");
        assert!(assembler.next_message().unwrap().is_none());

        assembler.push(b"wfd_trigger_method: SETUP\r\n");
        let msg = assembler.next_message().unwrap().unwrap();
        assert_eq!(msg.cseq(), Some(2));
        assert_eq!(msg.body(), "wfd_trigger_method: SETUP\r\n");
    }

    #[test]
    fn test_assembler_parses_response_and_pipelining() {
        let mut assembler = MessageAssembler::new();
        assembler.push(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\nRTSP/1.0 404 Not Found\r\nCSeq: 4\r\n\r\n");

        let first = assembler.next_message().unwrap().unwrap();
        assert_eq!(first.status(), Some(200));
        assert_eq!(first.cseq(), Some(3));

        let second = assembler.next_message().unwrap().unwrap();
        assert_eq!(second.status(), Some(404));
        assert_eq!(second.cseq(), Some(4));
    }

    #[test]
    fn test_assembler_rejects_garbage() {
        let mut assembler = MessageAssembler::new();
        assembler.push(b"not an rtsp line\r\nstill not\r\n\r\n");
        assert!(assembler.next_message().is_err());
    }

    #[test]
    fn test_builder_request_with_body() {
        let text = MessageBuilder::request("SET_PARAMETER", "rtsp://localhost/wfd1.0")
            .cseq(7)
            .parameters_body("wfd_trigger_method: PLAY\r\n")
            .build();
        assert!(text.starts_with("SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n"));
        assert!(text.contains("CSeq: 7\r\n"));
        assert!(text.contains("Content-Type: text/parameters\r\n"));
        assert!(text.contains("Content-Length: 26\r\n"));
        assert!(text.ends_with("\r\n\r\nwfd_trigger_method: PLAY\r\n"));

        // What we build, we can parse.
        let mut assembler = MessageAssembler::new();
        assembler.push(text.as_bytes());
        let msg = assembler.next_message().unwrap().unwrap();
        assert_eq!(msg.cseq(), Some(7));
    }

    #[test]
    fn test_parameters_names_and_values() {
        let params = Parameters::parse(
            "wfd_video_formats\r\nwfd_audio_codecs\r\nwfd_presentation_URL: rtsp://1.2.3.4/wfd1.0/streamid=0 none\r\n",
        );
        assert!(params.contains("wfd_video_formats"));
        assert!(params.get("wfd_video_formats").is_none());
        assert_eq!(
            params.get("wfd_presentation_URL"),
            Some("rtsp://1.2.3.4/wfd1.0/streamid=0 none")
        );
        assert!(!params.is_empty());
        assert_eq!(params.names().count(), 3);
    }

    #[test]
    fn test_parameters_empty_body() {
        assert!(Parameters::parse("").is_empty());
        assert!(Parameters::parse("\r\n").is_empty());
    }
}
