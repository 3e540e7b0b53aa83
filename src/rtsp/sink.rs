//! The Wi-Fi Display RTSP sink session.
//!
//! [`WfdSink`] is a message-driven state machine: the embedder owns the
//! socket and the timers, feeds received bytes into [`WfdSink::on_data`]
//! and timer expiries into [`WfdSink::on_keep_alive_timeout`], and watches
//! the [`SinkEvent`] channel for everything the session wants done.
//! Outbound bytes leave through the [`RtspTransport`] the sink was built
//! with.
//!
//! Session establishment runs OPTIONS → DESCRIBE → SETUP → PLAY; the peer
//! drives capability exchange (GET_PARAMETER) and mode selection
//! (SET_PARAMETER) against the sink's advertised capability sets, and polls
//! keep-alive at the cadence negotiated during DESCRIBE.

use crate::caps::{AudioMode, AudioParameters, UibcParameters, VideoMode, VideoParameters};
use crate::error::{Error, Result};
use crate::rtsp::message::{MessageAssembler, MessageBuilder, Parameters, RtspMessage};

use kanal::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const KEEP_ALIVE_DEFAULT_SECS: u64 = 60;
const KEEP_ALIVE_MIN_SECS: u64 = 10;

const PUBLIC_METHODS: &str =
    "org.wfa.wfd1.0, OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

/// Byte sink for outgoing RTSP data; the embedder's socket.
pub trait RtspTransport {
    /// Queue bytes for transmission. An error counts as socket loss.
    fn send(&mut self, data: &[u8]) -> Result<()>;
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// No session.
    Undefined,
    /// Socket connect in progress.
    Connecting,
    /// Socket up, nothing sent yet.
    Connected,
    /// OPTIONS exchange in flight.
    Options,
    /// DESCRIBE exchange in flight.
    GetParameter,
    /// SETUP exchange in flight.
    SetParameter,
    /// Streaming.
    Playing,
    /// Stream paused.
    Paused,
}

/// What the session asks of its embedder.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// The RTSP dialogue reached the peer (OPTIONS succeeded).
    Connected,
    /// SETUP succeeded.
    SessionEstablished {
        /// Where the stream is presented from.
        presentation_url: String,
        /// The peer's session identifier.
        session_id: String,
    },
    /// PLAY succeeded; the TS stream is (about to be) flowing.
    PlaybackStarted,
    /// PAUSE succeeded.
    PlaybackPaused,
    /// A mid-session mode change was accepted; reconfigure the renderer
    /// before data in the new format arrives.
    ReconfigureRenderer {
        /// The new video mode, when video changed.
        video: Option<VideoMode>,
        /// The new audio mode, when audio changed.
        audio: Option<AudioMode>,
    },
    /// The peer accepted a UIBC configuration.
    UibcConfigured(UibcParameters),
    /// (Re-)arm the keep-alive timer; expiry without a new arm tears the
    /// session down.
    ArmKeepAlive(Duration),
    /// The session is gone; emitted exactly once per session.
    TornDown,
}

/// Capability sets the sink advertises.
#[derive(Debug, Clone)]
pub struct SinkCapabilities {
    /// Advertised wfd_video_formats.
    pub video: VideoParameters,
    /// Advertised wfd_audio_codecs.
    pub audio: AudioParameters,
    /// Advertised wfd_uibc_capability.
    pub uibc: UibcParameters,
    /// Local RTP port announced in wfd_client_rtp_ports.
    pub rtp_port: u16,
}

/// User-initiated operations, bound at the next state boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkAction {
    Play,
    Pause,
    Teardown,
}

type ResponseHandler<T> = fn(&mut WfdSink<T>, &RtspMessage) -> Result<()>;

/// The RTSP sink state machine.
pub struct WfdSink<T: RtspTransport> {
    state: SinkState,
    transport: T,
    events: Sender<SinkEvent>,
    capabilities: SinkCapabilities,
    server_uri: String,

    session_id: u32,
    next_cseq: u32,
    response_handlers: HashMap<(u32, u32), ResponseHandler<T>>,
    assembler: MessageAssembler,
    pending_actions: VecDeque<SinkAction>,

    presentation_url: Option<String>,
    playback_session_id: Option<String>,
    keep_alive_interval: Duration,

    video_mode: Option<VideoMode>,
    audio_mode: Option<AudioMode>,
    uibc_params: Option<UibcParameters>,
}

impl<T: RtspTransport> WfdSink<T> {
    /// Create a sink over `transport`, targeting `server_uri`
    /// (e.g. `rtsp://192.168.173.1/wfd1.0`).
    pub fn new(
        transport: T,
        capabilities: SinkCapabilities,
        server_uri: impl Into<String>,
    ) -> (WfdSink<T>, Receiver<SinkEvent>) {
        let (tx, rx) = kanal::unbounded();
        (
            WfdSink {
                state: SinkState::Undefined,
                transport,
                events: tx,
                capabilities,
                server_uri: server_uri.into(),
                session_id: 1,
                next_cseq: 1,
                response_handlers: HashMap::new(),
                assembler: MessageAssembler::new(),
                pending_actions: VecDeque::new(),
                presentation_url: None,
                playback_session_id: None,
                keep_alive_interval: Duration::from_secs(KEEP_ALIVE_DEFAULT_SECS),
                video_mode: None,
                audio_mode: None,
                uibc_params: None,
            },
            rx,
        )
    }

    /// Current state.
    pub fn state(&self) -> SinkState {
        self.state
    }

    /// The negotiated video mode, once a SET_PARAMETER selected one.
    pub fn video_mode(&self) -> Option<&VideoMode> {
        self.video_mode.as_ref()
    }

    /// The negotiated audio mode.
    pub fn audio_mode(&self) -> Option<&AudioMode> {
        self.audio_mode.as_ref()
    }

    /// Begin a session; the embedder opens the socket and calls
    /// [`WfdSink::on_connected`] when it is up.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != SinkState::Undefined {
            return Err(Error::InvalidState(format!(
                "connect() in state {:?}",
                self.state
            )));
        }
        self.state = SinkState::Connecting;
        Ok(())
    }

    /// The socket is up: open the dialogue with OPTIONS.
    pub fn on_connected(&mut self) -> Result<()> {
        if self.state != SinkState::Connecting {
            return Err(Error::InvalidState(format!(
                "on_connected() in state {:?}",
                self.state
            )));
        }
        self.state = SinkState::Connected;
        self.send_options()
    }

    /// The socket failed or closed.
    pub fn on_socket_error(&mut self) {
        tracing::warn!("socket loss, tearing session down");
        self.finish_teardown();
    }

    /// The keep-alive window expired without the peer polling us.
    pub fn on_keep_alive_timeout(&mut self) {
        tracing::warn!("keep-alive timeout, tearing session down");
        self.finish_teardown();
    }

    /// Request playback resume. Queued until the session is idle.
    pub fn play(&mut self) {
        self.pending_actions.push_back(SinkAction::Play);
        self.run_pending_actions();
    }

    /// Request pause. Queued until the session is idle.
    pub fn pause(&mut self) {
        self.pending_actions.push_back(SinkAction::Pause);
        self.run_pending_actions();
    }

    /// Request session teardown. Queued until the session is idle.
    pub fn teardown(&mut self) {
        self.pending_actions.push_back(SinkAction::Teardown);
        self.run_pending_actions();
    }

    /// Feed received socket bytes. Any protocol failure tears the session
    /// down before the error is returned.
    pub fn on_data(&mut self, data: &[u8]) -> Result<()> {
        self.assembler.push(data);
        loop {
            let message = match self.assembler.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.finish_teardown();
                    return Err(err);
                }
            };
            metrics::counter!(crate::observability::RTSP_MESSAGES).increment(1);
            if let Err(err) = self.dispatch(message) {
                self.finish_teardown();
                return Err(err);
            }
            self.run_pending_actions();
        }
    }

    fn dispatch(&mut self, message: RtspMessage) -> Result<()> {
        match &message {
            RtspMessage::Response { .. } => {
                let cseq = message
                    .cseq()
                    .ok_or_else(|| Error::malformed("response without CSeq", 0))?;
                let handler = self
                    .response_handlers
                    .remove(&(self.session_id, cseq))
                    .ok_or_else(|| Error::malformed("unsolicited response", 0))?;
                handler(self, &message)
            }
            RtspMessage::Request { method, .. } => {
                let cseq = message
                    .cseq()
                    .ok_or_else(|| Error::malformed("request without CSeq", 0))?;
                match method.as_str() {
                    "OPTIONS" => self.on_options_request(cseq),
                    "GET_PARAMETER" => self.on_get_parameter_request(cseq, &message),
                    "SET_PARAMETER" => self.on_set_parameter_request(cseq, &message),
                    other => {
                        tracing::warn!(method = other, "unsupported inbound method");
                        self.send_error(cseq, 501, "Not Implemented")
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound dialogue
    // ------------------------------------------------------------------

    fn send_request(
        &mut self,
        request: MessageBuilder,
        handler: ResponseHandler<T>,
    ) -> Result<()> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        let text = request.cseq(cseq).build();
        self.transport.send(text.as_bytes())?;
        self.response_handlers.insert((self.session_id, cseq), handler);
        Ok(())
    }

    fn send_options(&mut self) -> Result<()> {
        self.state = SinkState::Options;
        let request =
            MessageBuilder::request("OPTIONS", "*").header("Require", "org.wfa.wfd1.0");
        self.send_request(request, Self::on_options_response)
    }

    fn on_options_response(&mut self, message: &RtspMessage) -> Result<()> {
        require_ok(message, "OPTIONS")?;
        self.events_send(SinkEvent::Connected);
        self.send_describe()
    }

    fn send_describe(&mut self) -> Result<()> {
        self.state = SinkState::GetParameter;
        let uri = self.server_uri.clone();
        let request = MessageBuilder::request("DESCRIBE", &uri).header("Accept", "application/sdp");
        self.send_request(request, Self::on_describe_response)
    }

    fn on_describe_response(&mut self, message: &RtspMessage) -> Result<()> {
        require_ok(message, "DESCRIBE")?;

        let url = message
            .headers()
            .get("Content-Base")
            .map(str::to_owned)
            .unwrap_or_else(|| self.server_uri.clone());
        self.presentation_url = Some(url);

        // Session: <id>[;timeout=<secs>] — the timeout drives keep-alive.
        let mut timeout_secs = KEEP_ALIVE_DEFAULT_SECS;
        if let Some(session) = message.headers().get("Session") {
            if let Some((_, timeout)) = session.split_once(";timeout=") {
                if let Ok(value) = timeout.trim().parse::<u64>() {
                    timeout_secs = value;
                }
            }
        }
        self.keep_alive_interval = Duration::from_secs(
            timeout_secs.clamp(KEEP_ALIVE_MIN_SECS, KEEP_ALIVE_DEFAULT_SECS),
        );
        self.events_send(SinkEvent::ArmKeepAlive(self.keep_alive_interval));

        self.send_setup()
    }

    fn send_setup(&mut self) -> Result<()> {
        self.state = SinkState::SetParameter;
        let uri = self
            .presentation_url
            .clone()
            .unwrap_or_else(|| self.server_uri.clone());
        let transport = format!(
            "RTP/AVP/TCP;unicast;client_port={}",
            self.capabilities.rtp_port
        );
        let request = MessageBuilder::request("SETUP", &uri).header("Transport", transport);
        self.send_request(request, Self::on_setup_response)
    }

    fn on_setup_response(&mut self, message: &RtspMessage) -> Result<()> {
        require_ok(message, "SETUP")?;

        let session = message
            .headers()
            .get("Session")
            .ok_or_else(|| Error::malformed("SETUP response without Session", 0))?;
        let session_id = session
            .split(';')
            .next()
            .unwrap_or(session)
            .trim()
            .to_owned();
        self.playback_session_id = Some(session_id.clone());

        self.events_send(SinkEvent::SessionEstablished {
            presentation_url: self
                .presentation_url
                .clone()
                .unwrap_or_else(|| self.server_uri.clone()),
            session_id,
        });

        self.send_play()
    }

    fn send_play(&mut self) -> Result<()> {
        let request = self.session_request("PLAY")?;
        self.send_request(request, Self::on_play_response)
    }

    fn on_play_response(&mut self, message: &RtspMessage) -> Result<()> {
        require_ok(message, "PLAY")?;
        self.state = SinkState::Playing;
        self.events_send(SinkEvent::PlaybackStarted);
        Ok(())
    }

    fn send_pause(&mut self) -> Result<()> {
        let request = self.session_request("PAUSE")?;
        self.send_request(request, Self::on_pause_response)
    }

    fn on_pause_response(&mut self, message: &RtspMessage) -> Result<()> {
        require_ok(message, "PAUSE")?;
        self.state = SinkState::Paused;
        self.events_send(SinkEvent::PlaybackPaused);
        Ok(())
    }

    fn send_teardown(&mut self) -> Result<()> {
        let request = self.session_request("TEARDOWN")?;
        self.send_request(request, Self::on_teardown_response)
    }

    fn on_teardown_response(&mut self, _message: &RtspMessage) -> Result<()> {
        // Regardless of the status the session is over.
        self.finish_teardown();
        Ok(())
    }

    fn session_request(&self, method: &str) -> Result<MessageBuilder> {
        let uri = self
            .presentation_url
            .clone()
            .unwrap_or_else(|| self.server_uri.clone());
        let session = self
            .playback_session_id
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("{method} without a session")))?;
        Ok(MessageBuilder::request(method, &uri).header("Session", session))
    }

    // ------------------------------------------------------------------
    // Inbound dialogue
    // ------------------------------------------------------------------

    fn on_options_request(&mut self, cseq: u32) -> Result<()> {
        let response = MessageBuilder::response(200, "OK")
            .cseq(cseq)
            .header("Public", PUBLIC_METHODS)
            .build();
        self.transport.send(response.as_bytes())
    }

    fn on_get_parameter_request(&mut self, cseq: u32, message: &RtspMessage) -> Result<()> {
        let params = Parameters::parse(message.body());

        // An empty body (or a bare wfd_standby probe) is the keep-alive
        // poll; answer and re-arm the window.
        if params.is_empty() || params.contains("wfd_standby") {
            self.events_send(SinkEvent::ArmKeepAlive(self.keep_alive_interval));
            let response = MessageBuilder::response(200, "OK").cseq(cseq).build();
            return self.transport.send(response.as_bytes());
        }

        let mut body = String::new();
        for name in params.names() {
            let value = match name {
                "wfd_video_formats" => self.capabilities.video.generate_video_formats(),
                "wfd_audio_codecs" => self.capabilities.audio.generate_audio_formats(),
                "wfd_uibc_capability" => self.capabilities.uibc.generate_uibc_capability(),
                "wfd_client_rtp_ports" => format!(
                    "RTP/AVP/TCP;unicast {} 0 mode=play",
                    self.capabilities.rtp_port
                ),
                "wfd_content_protection" => "none".to_owned(),
                other => {
                    tracing::debug!(parameter = other, "unknown GET_PARAMETER name");
                    "none".to_owned()
                }
            };
            body.push_str(name);
            body.push_str(": ");
            body.push_str(&value);
            body.push_str("\r\n");
        }

        let response = MessageBuilder::response(200, "OK")
            .cseq(cseq)
            .parameters_body(body)
            .build();
        self.transport.send(response.as_bytes())
    }

    fn on_set_parameter_request(&mut self, cseq: u32, message: &RtspMessage) -> Result<()> {
        let params = Parameters::parse(message.body());

        if let Some(trigger) = params.get("wfd_trigger_method") {
            return self.on_trigger(cseq, trigger.to_owned());
        }

        // Mode proposals: validate everything before mutating anything.
        let mut new_video = None;
        let mut new_audio = None;
        let mut new_uibc = None;

        if let Some(line) = params.get("wfd_video_formats") {
            match self.capabilities.video.apply_video_mode(line) {
                Ok(Some(mode)) => new_video = Some(mode),
                Ok(None) => return self.send_error(cseq, 415, "Unsupported Media Type"),
                Err(err) => {
                    tracing::warn!(%err, "malformed wfd_video_formats proposal");
                    return self.send_error(cseq, 400, "Bad Request");
                }
            }
        }
        if let Some(line) = params.get("wfd_audio_codecs") {
            match self.capabilities.audio.apply_audio_mode(line) {
                Ok(Some(mode)) => new_audio = Some(mode),
                Ok(None) => return self.send_error(cseq, 415, "Unsupported Media Type"),
                Err(err) => {
                    tracing::warn!(%err, "malformed wfd_audio_codecs proposal");
                    return self.send_error(cseq, 400, "Bad Request");
                }
            }
        }
        if let Some(line) = params.get("wfd_uibc_capability") {
            match self.capabilities.uibc.apply_uibc_parameters(line) {
                Ok(Some(selected)) => new_uibc = Some(selected),
                Ok(None) => return self.send_error(cseq, 415, "Unsupported Media Type"),
                Err(err) => {
                    tracing::warn!(%err, "malformed wfd_uibc_capability proposal");
                    return self.send_error(cseq, 400, "Bad Request");
                }
            }
        }
        if let Some(url) = params.get("wfd_presentation_URL") {
            let url = url.split(' ').next().unwrap_or(url);
            if url != "none" {
                self.presentation_url = Some(url.to_owned());
            }
        }

        // Accepted: schedule the renderer reconfiguration, then answer.
        if new_video.is_some() || new_audio.is_some() {
            self.video_mode = new_video.clone().or(self.video_mode.take());
            self.audio_mode = new_audio.clone().or(self.audio_mode.take());
            self.events_send(SinkEvent::ReconfigureRenderer {
                video: new_video,
                audio: new_audio,
            });
        }
        if let Some(selected) = new_uibc {
            self.uibc_params = Some(selected.clone());
            self.events_send(SinkEvent::UibcConfigured(selected));
        }

        let response = MessageBuilder::response(200, "OK").cseq(cseq).build();
        self.transport.send(response.as_bytes())
    }

    fn on_trigger(&mut self, cseq: u32, trigger: String) -> Result<()> {
        tracing::info!(trigger, "peer trigger");
        let response = MessageBuilder::response(200, "OK").cseq(cseq).build();
        self.transport.send(response.as_bytes())?;

        match trigger.as_str() {
            "SETUP" => self.send_setup(),
            "PLAY" => self.send_play(),
            "PAUSE" => self.send_pause(),
            "TEARDOWN" => self.send_teardown(),
            other => {
                tracing::warn!(trigger = other, "unknown trigger method ignored");
                Ok(())
            }
        }
    }

    fn send_error(&mut self, cseq: u32, status: u16, reason: &str) -> Result<()> {
        tracing::info!(status, reason, "refusing peer request");
        let response = MessageBuilder::response(status, reason).cseq(cseq).build();
        self.transport.send(response.as_bytes())
    }

    // ------------------------------------------------------------------
    // Action queue and teardown
    // ------------------------------------------------------------------

    /// Queued user actions bind at the next state boundary: never while an
    /// exchange is in flight, and only in a state where they make sense.
    fn run_pending_actions(&mut self) {
        while self.response_handlers.is_empty() {
            let Some(action) = self.pending_actions.pop_front() else {
                return;
            };
            let result = match (action, self.state) {
                (SinkAction::Play, SinkState::Paused) => self.send_play(),
                (SinkAction::Pause, SinkState::Playing) => self.send_pause(),
                (SinkAction::Teardown, SinkState::Undefined) => Ok(()),
                (SinkAction::Teardown, _) => {
                    if self.playback_session_id.is_some() {
                        self.send_teardown()
                    } else {
                        self.finish_teardown();
                        Ok(())
                    }
                }
                (action, state) => {
                    tracing::warn!(?action, ?state, "action dropped in incompatible state");
                    Ok(())
                }
            };
            if let Err(err) = result {
                tracing::warn!(%err, "action failed, tearing down");
                self.finish_teardown();
                return;
            }
        }
    }

    fn finish_teardown(&mut self) {
        if self.state == SinkState::Undefined {
            return;
        }
        self.state = SinkState::Undefined;
        self.response_handlers.clear();
        self.pending_actions.clear();
        self.playback_session_id = None;
        self.presentation_url = None;
        self.events_send(SinkEvent::TornDown);
    }

    fn events_send(&self, event: SinkEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("sink event dropped, receiver gone");
        }
    }
}

fn require_ok(message: &RtspMessage, what: &str) -> Result<()> {
    match message.status() {
        Some(200) => Ok(()),
        Some(status) => Err(Error::Unsupported(format!(
            "{what} answered with status {status}"
        ))),
        None => Err(Error::malformed("expected a response", 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport that records everything the sink sends.
    #[derive(Default)]
    struct RecordingTransport {
        sent: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        fail: bool,
    }

    impl RtspTransport for RecordingTransport {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            if self.fail {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "gone",
                )));
            }
            self.sent
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }
    }

    fn capabilities() -> SinkCapabilities {
        SinkCapabilities {
            video: VideoParameters::parse(
                "00 00 01 01 0001ffff 00000000 00000000 00 0000 0000 00 none none",
            )
            .unwrap(),
            audio: AudioParameters::parse("LPCM 00000002 00, AAC 00000001 00").unwrap(),
            uibc: UibcParameters::parse(
                "input_category_list=GENERIC; generic_cap_list=Mouse, Keyboard; \
                 hidc_cap_list=none; port=1512",
            )
            .unwrap(),
            rtp_port: 19000,
        }
    }

    struct Harness {
        sink: WfdSink<RecordingTransport>,
        events: Receiver<SinkEvent>,
        sent: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Harness {
            let transport = RecordingTransport::default();
            let sent = transport.sent.clone();
            let (sink, events) =
                WfdSink::new(transport, capabilities(), "rtsp://192.168.173.1/wfd1.0");
            Harness { sink, events, sent }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        fn last_sent(&self) -> String {
            self.sent().last().cloned().unwrap_or_default()
        }

        fn respond_ok(&mut self, cseq: u32, extra_headers: &str) {
            let text = format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra_headers}\r\n");
            self.sink.on_data(text.as_bytes()).unwrap();
        }

        fn events(&mut self) -> Vec<SinkEvent> {
            let mut out = Vec::new();
            while let Ok(Some(event)) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Run the establishment dialogue up to Playing.
        fn establish(&mut self) {
            self.sink.connect().unwrap();
            self.sink.on_connected().unwrap();
            self.respond_ok(1, ""); // OPTIONS
            self.respond_ok(2, "Session: 6F34;timeout=30\r\n"); // DESCRIBE
            self.respond_ok(3, "Session: 6F34\r\n"); // SETUP
            self.respond_ok(4, ""); // PLAY
        }
    }

    #[test]
    fn test_establishment_dialogue_reaches_playing() {
        let mut h = Harness::new();
        h.sink.connect().unwrap();
        assert_eq!(h.sink.state(), SinkState::Connecting);

        h.sink.on_connected().unwrap();
        assert_eq!(h.sink.state(), SinkState::Options);
        assert!(h.last_sent().starts_with("OPTIONS * RTSP/1.0"));
        assert!(h.last_sent().contains("Require: org.wfa.wfd1.0"));

        h.respond_ok(1, "");
        assert_eq!(h.sink.state(), SinkState::GetParameter);
        assert!(h.last_sent().starts_with("DESCRIBE rtsp://192.168.173.1/wfd1.0"));

        h.respond_ok(2, "Session: 6F34;timeout=30\r\n");
        assert_eq!(h.sink.state(), SinkState::SetParameter);
        assert!(h.last_sent().starts_with("SETUP"));
        assert!(h.last_sent().contains("Transport: RTP/AVP/TCP;unicast;client_port=19000"));

        h.respond_ok(3, "Session: 6F34\r\n");
        assert!(h.last_sent().starts_with("PLAY"));
        assert!(h.last_sent().contains("Session: 6F34"));

        h.respond_ok(4, "");
        assert_eq!(h.sink.state(), SinkState::Playing);

        let events = h.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SinkEvent::PlaybackStarted)));
        assert!(events
            .iter()
            .any(|e| matches!(e, SinkEvent::ArmKeepAlive(d) if *d == Duration::from_secs(30))));
        assert!(events
            .iter()
            .any(|e| matches!(e, SinkEvent::SessionEstablished { .. })));
    }

    #[test]
    fn test_keep_alive_interval_is_clamped() {
        for (peer_timeout, expected) in [(5u64, 10u64), (30, 30), (600, 60)] {
            let mut h = Harness::new();
            h.sink.connect().unwrap();
            h.sink.on_connected().unwrap();
            h.respond_ok(1, "");
            h.respond_ok(2, &format!("Session: 1;timeout={peer_timeout}\r\n"));
            let armed = h.events().into_iter().find_map(|e| match e {
                SinkEvent::ArmKeepAlive(d) => Some(d),
                _ => None,
            });
            assert_eq!(armed, Some(Duration::from_secs(expected)), "timeout {peer_timeout}");
        }
    }

    #[test]
    fn test_get_parameter_returns_capabilities() {
        let mut h = Harness::new();
        h.establish();

        let body = "wfd_video_formats\r\nwfd_audio_codecs\r\nwfd_uibc_capability\r\n";
        let request = format!(
            "GET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\nCSeq: 10\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        h.sink.on_data(request.as_bytes()).unwrap();

        let reply = h.last_sent();
        assert!(reply.starts_with("RTSP/1.0 200 OK"));
        assert!(reply.contains(
            "wfd_video_formats: 00 00 01 01 0001ffff 00000000 00000000 00 0000 0000 00 none none"
        ));
        assert!(reply.contains("wfd_audio_codecs: LPCM 00000002 00, AAC 00000001 00"));
        assert!(reply.contains("wfd_uibc_capability: input_category_list=GENERIC"));
    }

    #[test]
    fn test_empty_get_parameter_rearms_keep_alive() {
        let mut h = Harness::new();
        h.establish();
        h.events();

        let request = "GET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\nCSeq: 11\r\n\r\n";
        h.sink.on_data(request.as_bytes()).unwrap();

        assert!(h.last_sent().starts_with("RTSP/1.0 200 OK"));
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SinkEvent::ArmKeepAlive(_))));
    }

    #[test]
    fn test_set_parameter_mode_change_accepted() {
        let mut h = Harness::new();
        h.establish();
        h.events();

        // 640x480p60 CBP 3.1, inside the advertised CEA mask.
        let body = "wfd_video_formats: 00 00 01 01 00000001 00000000 00000000 00 0000 0000 00 none none\r\n";
        let request = format!(
            "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\nCSeq: 12\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        h.sink.on_data(request.as_bytes()).unwrap();

        assert!(h.last_sent().starts_with("RTSP/1.0 200 OK"));
        let events = h.events();
        match events
            .iter()
            .find(|e| matches!(e, SinkEvent::ReconfigureRenderer { .. }))
        {
            Some(SinkEvent::ReconfigureRenderer { video: Some(mode), .. }) => {
                assert_eq!((mode.width, mode.height), (640, 480));
            }
            other => panic!("expected reconfigure event, got {other:?}"),
        }
        assert_eq!(h.sink.video_mode().unwrap().width, 640);
    }

    #[test]
    fn test_set_parameter_unsupported_mode_refused() {
        let mut h = Harness::new();
        h.establish();
        h.events();

        // CHP is not advertised; the sink must refuse and keep its state.
        let body = "wfd_video_formats: 00 00 02 01 00000001 00000000 00000000 00 0000 0000 00 none none\r\n";
        let request = format!(
            "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\nCSeq: 13\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        h.sink.on_data(request.as_bytes()).unwrap();

        assert!(h.last_sent().starts_with("RTSP/1.0 415 Unsupported Media Type"));
        assert!(h.sink.video_mode().is_none());
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_set_parameter_malformed_mode_is_bad_request() {
        let mut h = Harness::new();
        h.establish();

        let body = "wfd_video_formats: zz zz\r\n";
        let request = format!(
            "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\nCSeq: 14\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        h.sink.on_data(request.as_bytes()).unwrap();
        assert!(h.last_sent().starts_with("RTSP/1.0 400 Bad Request"));
        // A refused proposal does not kill the session.
        assert_eq!(h.sink.state(), SinkState::Playing);
    }

    #[test]
    fn test_trigger_pause_and_play() {
        let mut h = Harness::new();
        h.establish();
        h.events();

        let body = "wfd_trigger_method: PAUSE\r\n";
        let request = format!(
            "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\nCSeq: 15\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        h.sink.on_data(request.as_bytes()).unwrap();
        // 200 for the trigger, then our PAUSE request.
        assert!(h.last_sent().starts_with("PAUSE "));

        // Find the PAUSE CSeq and answer it.
        let pause_cseq = extract_cseq(&h.last_sent());
        h.respond_ok(pause_cseq, "");
        assert_eq!(h.sink.state(), SinkState::Paused);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SinkEvent::PlaybackPaused)));
    }

    #[test]
    fn test_user_actions_bind_at_state_boundary() {
        let mut h = Harness::new();
        h.sink.connect().unwrap();
        h.sink.on_connected().unwrap();

        // A pause during establishment is queued, not executed: the OPTIONS
        // exchange is still in flight.
        h.sink.pause();
        assert!(h.last_sent().starts_with("OPTIONS"));

        h.respond_ok(1, "");
        h.respond_ok(2, "Session: 1;timeout=30\r\n");
        h.respond_ok(3, "Session: 1\r\n");
        h.respond_ok(4, "");
        // Now the session is Playing and the queued pause ran.
        assert!(h.last_sent().starts_with("PAUSE"));

        let pause_cseq = extract_cseq(&h.last_sent());
        h.respond_ok(pause_cseq, "");
        assert_eq!(h.sink.state(), SinkState::Paused);

        h.sink.play();
        assert!(h.last_sent().starts_with("PLAY"));
        let play_cseq = extract_cseq(&h.last_sent());
        h.respond_ok(play_cseq, "");
        assert_eq!(h.sink.state(), SinkState::Playing);
    }

    #[test]
    fn test_teardown_emits_single_torn_down() {
        let mut h = Harness::new();
        h.establish();
        h.events();

        h.sink.teardown();
        assert!(h.last_sent().starts_with("TEARDOWN"));
        let cseq = extract_cseq(&h.last_sent());
        h.respond_ok(cseq, "");

        assert_eq!(h.sink.state(), SinkState::Undefined);
        let torn: usize = h
            .events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::TornDown))
            .count();
        assert_eq!(torn, 1);

        // Further socket errors do not emit a second TornDown.
        h.sink.on_socket_error();
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_error_response_tears_down() {
        let mut h = Harness::new();
        h.sink.connect().unwrap();
        h.sink.on_connected().unwrap();

        let text = "RTSP/1.0 503 Service Unavailable\r\nCSeq: 1\r\n\r\n";
        assert!(h.sink.on_data(text.as_bytes()).is_err());
        assert_eq!(h.sink.state(), SinkState::Undefined);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SinkEvent::TornDown)));
    }

    #[test]
    fn test_unsolicited_response_tears_down() {
        let mut h = Harness::new();
        h.establish();

        let text = "RTSP/1.0 200 OK\r\nCSeq: 99\r\n\r\n";
        assert!(h.sink.on_data(text.as_bytes()).is_err());
        assert_eq!(h.sink.state(), SinkState::Undefined);
    }

    #[test]
    fn test_keep_alive_timeout_tears_down() {
        let mut h = Harness::new();
        h.establish();
        h.events();

        h.sink.on_keep_alive_timeout();
        assert_eq!(h.sink.state(), SinkState::Undefined);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SinkEvent::TornDown)));
    }

    #[test]
    fn test_inbound_options_lists_methods() {
        let mut h = Harness::new();
        h.establish();

        let request = "OPTIONS * RTSP/1.0\r\nCSeq: 20\r\n\r\n";
        h.sink.on_data(request.as_bytes()).unwrap();
        let reply = h.last_sent();
        assert!(reply.starts_with("RTSP/1.0 200 OK"));
        assert!(reply.contains("Public: org.wfa.wfd1.0, OPTIONS"));
        assert!(reply.contains("GET_PARAMETER, SET_PARAMETER"));
    }

    fn extract_cseq(message: &str) -> u32 {
        message
            .lines()
            .find_map(|l| l.strip_prefix("CSeq: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }
}
