// ABOUTME: Viewer client: mirror state machine, reconnect backoff, epoch gate, talkback
// ABOUTME: Server STREAM_STATE is authoritative once seen; otherwise streaming is inferred

use crate::codec::ControlMessage;
use crate::connection::{Connection, ConnectionReader, ConnectionWriter, WireEvent};
use crate::datatypes::{
    AudioFrame, ConnectionState, Epoch, StreamConfig, StreamStateCode, ViewerConfig,
};
use crate::media::VideoSink;
use crate::server::auth;
use crate::viewer::error::{ViewerError, ViewerResult};
use crate::viewer::jitter::{DecodeQueue, PressureSignal};
use crate::viewer::watchdog::{Backoff, PING_INTERVAL, WatchdogAction, Watchdogs};
use bytes::Bytes;
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// TCP connect attempt bound; failures feed the reconnect backoff.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Watchdog evaluation cadence.
const WATCHDOG_TICK: Duration = Duration::from_millis(250);

/// Overall bound on the handshake dialogue (HELLO through AUTH_OK).
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Commands the embedding application posts to a running client.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerCommand {
    SetStream(StreamConfig),
    RequestKeyframe,
    StartRecording,
    StopRecording,
    SwitchCamera,
    /// One push-to-talk PCM16LE chunk (mono, 48 kHz).
    Talkback(Bytes),
    /// App went to background: close the socket deliberately.
    Background,
    Foreground,
    Shutdown,
}

/// Cloneable control surface over a running [`ViewerClient`].
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    commands: mpsc::Sender<ViewerCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ViewerHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Block until the client reaches `target` (or the client is gone).
    pub async fn wait_for_state(&mut self, target: ConnectionState) {
        loop {
            if *self.state.borrow_and_update() == target {
                return;
            }
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn post(&self, command: ViewerCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    pub fn set_stream(&self, config: StreamConfig) -> bool {
        self.post(ViewerCommand::SetStream(config))
    }

    pub fn request_keyframe(&self) -> bool {
        self.post(ViewerCommand::RequestKeyframe)
    }

    pub fn talkback(&self, pcm: Bytes) -> bool {
        self.post(ViewerCommand::Talkback(pcm))
    }

    pub fn background(&self) -> bool {
        self.post(ViewerCommand::Background)
    }

    pub fn foreground(&self) -> bool {
        self.post(ViewerCommand::Foreground)
    }

    pub fn shutdown(&self) -> bool {
        self.post(ViewerCommand::Shutdown)
    }
}

/// Why an established connection ended.
enum EndReason {
    Reconnect,
    Stopped,
    Background,
    Shutdown,
}

/// Per-connection machinery that dies with the socket.
struct ActiveSession {
    writer: ConnectionWriter,
    dogs: Watchdogs,
    decode_queue: DecodeQueue,
    /// Once true, the server's `STREAM_STATE` owns the UI state.
    stream_state_seen: bool,
    /// Epoch whose CSD has been delivered to the sink.
    csd_epoch: Option<Epoch>,
    first_frame_at: Option<Instant>,
}

/// The viewer-side client. Connects, authenticates, negotiates a stream,
/// and feeds decodable media to the sink; reconnects with capped backoff
/// until a server `Stopped` or an application `Shutdown`.
pub struct ViewerClient {
    core: ClientCore,
    commands: mpsc::Receiver<ViewerCommand>,
}

impl ViewerClient {
    pub fn new(config: ViewerConfig, sink: Box<dyn VideoSink>) -> (Self, ViewerHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let client = Self {
            core: ClientCore {
                config,
                sink,
                state_tx,
                session_id: None,
                current_epoch: 0,
                origin: Instant::now(),
            },
            commands: command_rx,
        };
        let handle = ViewerHandle {
            commands: command_tx,
            state: state_rx,
        };
        (client, handle)
    }

    pub async fn run(self) -> ViewerResult<()> {
        let Self {
            mut core,
            mut commands,
        } = self;
        core.run(&mut commands).await
    }
}

struct ClientCore {
    config: ViewerConfig,
    sink: Box<dyn VideoSink>,
    state_tx: watch::Sender<ConnectionState>,
    session_id: Option<String>,
    current_epoch: Epoch,
    origin: Instant,
}

impl ClientCore {
    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?state, "viewer state");
            *current = state;
            true
        });
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Outer connection loop: exponential backoff capped at 10 s, reset on
    /// every successful authentication, permanently disabled by a server
    /// `Stopped`.
    async fn run(&mut self, commands: &mut mpsc::Receiver<ViewerCommand>) -> ViewerResult<()> {
        let mut backoff = Backoff::new();
        let mut foreground = true;

        loop {
            if !foreground {
                // Socket is deliberately closed; wait for the app to come
                // back rather than burning radio on reconnects.
                match commands.recv().await {
                    Some(ViewerCommand::Foreground) => {
                        foreground = true;
                        backoff.reset();
                    }
                    Some(ViewerCommand::Shutdown) | None => return Ok(()),
                    Some(_) => {}
                }
                continue;
            }

            self.set_state(ConnectionState::Connecting);
            match self.connect_once(commands, &mut backoff).await {
                Ok(EndReason::Shutdown) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Ok(EndReason::Stopped) => {
                    // Server-authoritative stop: no reconnect for the
                    // lifetime of this client.
                    self.set_state(ConnectionState::Idle);
                    loop {
                        match commands.recv().await {
                            Some(ViewerCommand::Shutdown) | None => return Ok(()),
                            Some(other) => {
                                tracing::debug!(?other, "ignoring command while stopped");
                            }
                        }
                    }
                }
                Ok(EndReason::Background) => {
                    self.set_state(ConnectionState::Disconnected);
                    foreground = false;
                    continue;
                }
                Ok(EndReason::Reconnect) => {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(err) => {
                    tracing::info!("connection ended: {err}");
                    self.set_state(ConnectionState::Disconnected);
                    if matches!(err, ViewerError::AuthRejected) && !self.config.auto_reconnect {
                        return Err(err);
                    }
                }
            }

            if !self.config.auto_reconnect {
                return Ok(());
            }
            let delay = backoff.next_delay();
            tracing::debug!(delay_s = delay.as_secs(), "reconnect backoff");
            match timeout(delay, commands.recv()).await {
                Ok(Some(ViewerCommand::Shutdown)) | Ok(None) => return Ok(()),
                Ok(Some(ViewerCommand::Background)) => foreground = false,
                Ok(Some(_)) | Err(_) => {}
            }
        }
    }

    async fn connect_once(
        &mut self,
        commands: &mut mpsc::Receiver<ViewerCommand>,
        backoff: &mut Backoff,
    ) -> ViewerResult<EndReason> {
        let socket = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.config.addr()))
            .await
            .map_err(|_| {
                ViewerError::Connection(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })??;
        let mut conn = Connection::new(socket);
        self.set_state(ConnectionState::Connected);

        let mut dogs = Watchdogs::new(Instant::now());
        match timeout(HANDSHAKE_DEADLINE, self.handshake(&mut conn, &mut dogs)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::info!("handshake watchdog fired");
                return Ok(EndReason::Reconnect);
            }
        }
        backoff.reset();

        let (reader, writer) = conn.split();
        let mut session = ActiveSession {
            writer,
            dogs,
            decode_queue: DecodeQueue::new(self.config.tier.frame_queue_depth()),
            stream_state_seen: false,
            csd_epoch: None,
            first_frame_at: None,
        };
        self.event_loop(commands, reader, &mut session).await
    }

    /// Client half of the handshake. Attempts `RESUME` with the previous
    /// session id first; falls back to a full challenge/response round.
    async fn handshake(
        &mut self,
        conn: &mut Connection,
        dogs: &mut Watchdogs,
    ) -> ViewerResult<()> {
        conn.write_control(&ControlMessage::Hello {
            client: "viewer".into(),
            version: self.config.protocol_version,
        })
        .await?;

        let salt = loop {
            match conn.read_event().await? {
                Some(WireEvent::Control(ControlMessage::Proto { version })) => {
                    tracing::debug!(version, "server acknowledged protocol version");
                }
                Some(WireEvent::Control(ControlMessage::AuthChallenge { salt, .. })) => break salt,
                Some(WireEvent::Control(ControlMessage::AuthFail)) => {
                    return Err(ViewerError::AuthRejected);
                }
                Some(_) => {}
                None => return Err(ViewerError::ConnectionClosed),
            }
        };

        let mut resumed = false;
        if let Some(session) = self.session_id.clone() {
            conn.write_control(&ControlMessage::Resume { session }).await?;
            loop {
                match conn.read_event().await? {
                    Some(WireEvent::Control(ControlMessage::ResumeOk)) => {
                        tracing::info!("session resumed");
                        resumed = true;
                        break;
                    }
                    Some(WireEvent::Control(ControlMessage::ResumeFail)) => {
                        tracing::debug!("resume refused, re-authenticating");
                        self.session_id = None;
                        break;
                    }
                    Some(_) => {}
                    None => return Err(ViewerError::ConnectionClosed),
                }
            }
        }

        if !resumed {
            conn.write_control(&ControlMessage::AuthResponse {
                hash: auth::response_hash(&self.config.password, &salt),
            })
            .await?;
            loop {
                match conn.read_event().await? {
                    Some(WireEvent::Control(ControlMessage::AuthOk)) => break,
                    Some(WireEvent::Control(ControlMessage::AuthFail)) => {
                        return Err(ViewerError::AuthRejected);
                    }
                    Some(_) => {}
                    None => return Err(ViewerError::ConnectionClosed),
                }
            }
        }

        self.set_state(ConnectionState::Authenticated);
        dogs.on_authenticated(Instant::now());

        if !resumed {
            conn.write_control(&ControlMessage::Caps(self.config.caps)).await?;
            conn.write_control(&ControlMessage::SetStream(self.config.requested_stream))
                .await?;
        }
        Ok(())
    }

    async fn event_loop(
        &mut self,
        commands: &mut mpsc::Receiver<ViewerCommand>,
        mut reader: ConnectionReader,
        session: &mut ActiveSession,
    ) -> ViewerResult<EndReason> {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        let mut tick = tokio::time::interval(WATCHDOG_TICK);

        loop {
            tokio::select! {
                event = reader.read_event() => match event? {
                    None => return Ok(EndReason::Reconnect),
                    Some(event) => {
                        if let Some(end) = self.handle_event(event, session).await? {
                            return Ok(end);
                        }
                    }
                },
                _ = ping.tick() => {
                    session
                        .writer
                        .write_control(&ControlMessage::Ping { ts_ms: self.now_ms() })
                        .await?;
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    for action in session.dogs.poll(self.state(), now) {
                        match action {
                            WatchdogAction::SoftDowngrade => {
                                self.set_state(ConnectionState::Connected);
                            }
                            WatchdogAction::RequestKeyframe => {
                                session
                                    .writer
                                    .write_control(&ControlMessage::ReqKeyframe)
                                    .await?;
                            }
                            WatchdogAction::Reconnect => {
                                tracing::info!("watchdog forcing reconnect");
                                return Ok(EndReason::Reconnect);
                            }
                        }
                    }
                }
                command = commands.recv() => match command {
                    None => return Ok(EndReason::Shutdown),
                    Some(command) => {
                        if let Some(end) = self.handle_command(command, session).await? {
                            return Ok(end);
                        }
                    }
                },
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: WireEvent,
        session: &mut ActiveSession,
    ) -> ViewerResult<Option<EndReason>> {
        let now = Instant::now();
        match event {
            WireEvent::Control(message) => return self.handle_control(message, session, now),
            WireEvent::CodecData(csd) => {
                // Epoch gate: parameter sets from another epoch are poison
                // for the decoder.
                if csd.epoch != self.current_epoch {
                    tracing::debug!(
                        csd_epoch = csd.epoch,
                        current = self.current_epoch,
                        "dropping mismatched CSD"
                    );
                    return Ok(None);
                }
                session.csd_epoch = Some(csd.epoch);
                self.sink.on_codec_data(&csd);
            }
            WireEvent::Video(frame) => {
                if frame.epoch != self.current_epoch {
                    return Ok(None);
                }
                session.dogs.on_frame(now);
                if session.first_frame_at.is_none() {
                    session.first_frame_at = Some(now);
                }
                let is_keyframe = frame.is_keyframe;

                if let Some(signal) = session.decode_queue.push(frame, now) {
                    let message = match signal {
                        PressureSignal::Backpressure => ControlMessage::Backpressure,
                        PressureSignal::Clear => ControlMessage::PressureClear,
                    };
                    session.writer.write_control(&message).await?;
                }

                // Hold the first frames briefly so some panels do not
                // flash green while the decoder warms up.
                let warm = session
                    .first_frame_at
                    .is_some_and(|first| now.duration_since(first) >= self.config.render_warmup);
                if warm {
                    while session.decode_queue.depth() > session.decode_queue.target_depth() {
                        if let Some(ready) = session.decode_queue.pop() {
                            self.sink.on_frame(&ready);
                        }
                    }
                }

                // Legacy servers never send STREAM_STATE; infer streaming
                // from CSD plus a keyframe of the current epoch.
                if !session.stream_state_seen
                    && is_keyframe
                    && session.csd_epoch == Some(self.current_epoch)
                {
                    self.set_state(ConnectionState::Streaming);
                }
            }
            WireEvent::Audio(frame) => {
                session.dogs.on_audio(now);
                self.sink.on_audio(&frame);
            }
        }
        Ok(None)
    }

    fn handle_control(
        &mut self,
        message: ControlMessage,
        session: &mut ActiveSession,
        now: Instant,
    ) -> ViewerResult<Option<EndReason>> {
        match message {
            ControlMessage::Session { id } => {
                self.session_id = Some(id);
            }
            ControlMessage::StreamAccepted { epoch, config } => {
                if epoch != self.current_epoch {
                    self.current_epoch = epoch;
                    session.decode_queue.clear();
                    // Force a decoder reset on the next CSD.
                    session.csd_epoch = None;
                    session.dogs.on_reconfigure(now);
                }
                // The server's echo is authoritative even when it
                // disagrees with our SET_STREAM (buffer-mode encoders).
                self.sink.on_stream_params(&config);
                tracing::info!(
                    epoch,
                    width = config.width,
                    height = config.height,
                    "stream accepted"
                );
            }
            ControlMessage::StreamState { code, epoch } => {
                if epoch < self.current_epoch {
                    return Ok(None);
                }
                if epoch > self.current_epoch {
                    self.current_epoch = epoch;
                    session.decode_queue.clear();
                    session.csd_epoch = None;
                }
                session.stream_state_seen = true;
                match code {
                    StreamStateCode::Stopped => {
                        tracing::info!("server stopped the stream");
                        return Ok(Some(EndReason::Stopped));
                    }
                    StreamStateCode::Reconfiguring => {
                        session.dogs.on_reconfigure(now);
                        self.set_state(ConnectionState::Recovering);
                    }
                    StreamStateCode::Active => self.set_state(ConnectionState::Streaming),
                    StreamStateCode::Paused => self.set_state(ConnectionState::Connected),
                }
            }
            ControlMessage::Pong { .. } => session.dogs.on_pong(now),
            ControlMessage::EncRot { degrees } => self.sink.on_rotation(degrees),
            ControlMessage::Recording { active } => {
                tracing::info!(active, "primary recording state");
            }
            ControlMessage::Camera { front } => {
                tracing::info!(front, "primary camera facing");
            }
            ControlMessage::Comm { enabled } => {
                tracing::debug!(enabled, "talkback availability");
            }
            ControlMessage::CapsOk => {}
            ControlMessage::Error { code, msg } => {
                tracing::warn!(code, %msg, "server reported an error");
            }
            other => {
                tracing::debug!(?other, "ignoring control message");
            }
        }
        Ok(None)
    }

    async fn handle_command(
        &mut self,
        command: ViewerCommand,
        session: &mut ActiveSession,
    ) -> ViewerResult<Option<EndReason>> {
        match command {
            ViewerCommand::SetStream(config) => {
                session
                    .writer
                    .write_control(&ControlMessage::SetStream(config))
                    .await?;
            }
            ViewerCommand::RequestKeyframe => {
                session
                    .writer
                    .write_control(&ControlMessage::ReqKeyframe)
                    .await?;
            }
            ViewerCommand::StartRecording => {
                session
                    .writer
                    .write_control(&ControlMessage::StartRecording)
                    .await?;
            }
            ViewerCommand::StopRecording => {
                session
                    .writer
                    .write_control(&ControlMessage::StopRecording)
                    .await?;
            }
            ViewerCommand::SwitchCamera => {
                // The flag is advisory; the server toggles whichever lens
                // is inactive.
                session
                    .writer
                    .write_control(&ControlMessage::Camera { front: true })
                    .await?;
            }
            ViewerCommand::Talkback(pcm) => {
                session
                    .writer
                    .write_audio(&AudioFrame::talkback(pcm, self.now_us()))
                    .await?;
            }
            ViewerCommand::Background => {
                tracing::info!("app backgrounded, closing connection");
                return Ok(Some(EndReason::Background));
            }
            ViewerCommand::Foreground => {}
            ViewerCommand::Shutdown => return Ok(Some(EndReason::Shutdown)),
        }
        Ok(None)
    }
}
