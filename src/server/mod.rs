// ABOUTME: The primary-side stream server: accept loop, fan-out, control loop, epoch authority
// ABOUTME: Sessions post intents to the command bus; only the control loop touches the encoder

pub mod auth;
pub mod session;

pub use session::{SendQueue, SendQueueStats, SessionError, SessionHandle};

use crate::bus::{FrameBus, FrameBusStats};
use crate::codec::ControlMessage;
use crate::command::{CommandBus, StreamCommand};
use crate::datatypes::{
    AudioFrame, CodecSpecificData, EncodedFrame, Epoch, ServerConfig, StreamConfig,
    StreamStateCode, ViewerCaps,
};
use crate::media::{CameraController, Clock, Encoder, Recorder, SystemClock, TalkbackSink};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

/// Fan-out poll tick; also the upper bound on shutdown observation there.
const FANOUT_POLL: Duration = Duration::from_millis(100);

/// Control-loop tick used for the idle governor and shutdown checks.
const CONTROL_TICK: Duration = Duration::from_millis(250);

/// Encoder stop/start recovery is rate-limited to a cooldown, doubled on
/// low-tier devices.
const RECOVER_COOLDOWN: Duration = Duration::from_secs(90);
const RECOVER_COOLDOWN_LOW_TIER: Duration = Duration::from_secs(180);

/// Idle-governor floor.
const LOW_POWER_BITRATE: u32 = 300_000;
const LOW_POWER_FPS: u8 = 5;

/// A disconnected session kept warm for `RESUME`.
struct ResumeEntry {
    id: Uuid,
    caps: Option<ViewerCaps>,
    expires_at: Instant,
}

pub(crate) struct ResumedSession {
    pub id: Uuid,
    pub caps: Option<ViewerCaps>,
}

/// State shared between the accept loop, sessions, fan-out, and control
/// loop. Mutable pieces sit behind short lock-and-release critical
/// sections; the epoch and flags are atomics.
pub struct ServerShared {
    config: ServerConfig,
    epoch: AtomicU32,
    stream_config: Mutex<StreamConfig>,
    stream_state: Mutex<StreamStateCode>,
    /// Set once the first keyframe of the current epoch reaches fan-out.
    active_epoch_started: AtomicBool,
    rotation: Mutex<Option<u16>>,
    recording: AtomicBool,
    ui_visible: AtomicBool,
    front_camera: AtomicBool,
    registry: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
    resume: Mutex<HashMap<Uuid, ResumeEntry>>,
    frame_bus: FrameBus,
    commands: CommandBus,
    talkback: Mutex<Option<Box<dyn TalkbackSink>>>,
    clock: Box<dyn Clock>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl ServerShared {
    fn new(config: ServerConfig, commands: CommandBus, clock: Box<dyn Clock>) -> Self {
        let initial = config.initial_stream;
        Self {
            config,
            epoch: AtomicU32::new(1),
            stream_config: Mutex::new(initial),
            stream_state: Mutex::new(StreamStateCode::Reconfiguring),
            active_epoch_started: AtomicBool::new(false),
            rotation: Mutex::new(None),
            recording: AtomicBool::new(false),
            ui_visible: AtomicBool::new(true),
            front_camera: AtomicBool::new(false),
            registry: Mutex::new(HashMap::new()),
            resume: Mutex::new(HashMap::new()),
            frame_bus: FrameBus::new(),
            commands,
            talkback: Mutex::new(None),
            clock,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let (commands, _rx) = CommandBus::new();
        Self::new(
            ServerConfig::default(),
            commands,
            Box::new(SystemClock::new()),
        )
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn stream_config(&self) -> StreamConfig {
        *self.stream_config.lock().expect("stream config lock poisoned")
    }

    fn set_stream_config(&self, config: StreamConfig) {
        *self.stream_config.lock().expect("stream config lock poisoned") = config;
    }

    pub fn stream_state(&self) -> StreamStateCode {
        *self.stream_state.lock().expect("stream state lock poisoned")
    }

    fn set_stream_state(&self, state: StreamStateCode) {
        *self.stream_state.lock().expect("stream state lock poisoned") = state;
    }

    pub fn cached_csd(&self) -> Option<CodecSpecificData> {
        self.frame_bus
            .pending_csd()
            .filter(|csd| csd.epoch == self.current_epoch())
    }

    pub fn rotation(&self) -> Option<u16> {
        *self.rotation.lock().expect("rotation lock poisoned")
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn front_camera(&self) -> bool {
        self.front_camera.load(Ordering::SeqCst)
    }

    pub fn has_talkback(&self) -> bool {
        self.talkback
            .lock()
            .expect("talkback lock poisoned")
            .is_some()
    }

    pub fn ui_visible(&self) -> bool {
        self.ui_visible.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().expect("registry lock poisoned").len()
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_us() / 1_000
    }

    pub fn now_us(&self) -> i64 {
        self.clock.now_us()
    }

    pub fn frame_bus_stats(&self) -> FrameBusStats {
        self.frame_bus.stats()
    }

    fn sessions_snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn register_session(&self, handle: Arc<SessionHandle>) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .insert(handle.id, handle);
    }

    pub(crate) fn unregister_session(&self, handle: &Arc<SessionHandle>) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .remove(&handle.id);
        // Remember the identity for a short window so the viewer can
        // short-circuit its next handshake.
        self.resume.lock().expect("resume lock poisoned").insert(
            handle.id,
            ResumeEntry {
                id: handle.id,
                caps: handle.caps(),
                expires_at: Instant::now() + self.config.resume_window,
            },
        );
    }

    pub(crate) fn take_resume(&self, id: &Uuid) -> Option<ResumedSession> {
        let mut resume = self.resume.lock().expect("resume lock poisoned");
        let now = Instant::now();
        resume.retain(|_, entry| entry.expires_at > now);
        resume.remove(id).map(|entry| ResumedSession {
            id: entry.id,
            caps: entry.caps,
        })
    }

    /// Arbitrate a `SET_STREAM` request: clamp against the advertised
    /// capabilities of every connected session so one strong viewer never
    /// forces a stream a weaker one cannot decode.
    pub(crate) fn arbitrate_stream_request(
        &self,
        request: StreamConfig,
        _requester: &Arc<SessionHandle>,
    ) -> StreamConfig {
        let mut arbitrated = request;
        for handle in self.sessions_snapshot() {
            if let Some(caps) = handle.caps() {
                arbitrated = arbitrated.clamped_to(&caps);
            }
        }
        arbitrated
    }

    pub(crate) fn deliver_talkback(&self, frame: &AudioFrame) {
        if let Some(sink) = self
            .talkback
            .lock()
            .expect("talkback lock poisoned")
            .as_mut()
        {
            sink.on_talkback(frame);
        }
    }

    fn broadcast_control(&self, message: ControlMessage) {
        for handle in self.sessions_snapshot() {
            handle.enqueue_control(message.clone());
        }
    }

    fn broadcast_csd(&self, csd: &CodecSpecificData) {
        for handle in self.sessions_snapshot() {
            handle.enqueue_csd(csd.clone());
        }
    }

    /// Fan one downstream audio packet out to every session.
    pub fn broadcast_audio(&self, frame: &AudioFrame) {
        for handle in self.sessions_snapshot() {
            handle.enqueue_audio(frame.clone());
        }
    }

    /// Begin a new epoch: bump the counter, abandon buffered frames of
    /// the old epoch, flip to `Reconfiguring`, and notify every session.
    fn begin_epoch(&self) -> Epoch {
        let new_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_epoch_started.store(false, Ordering::SeqCst);
        self.set_stream_state(StreamStateCode::Reconfiguring);
        self.frame_bus.clear();
        self.broadcast_control(ControlMessage::StreamState {
            code: StreamStateCode::Reconfiguring,
            epoch: new_epoch,
        });
        for handle in self.sessions_snapshot() {
            handle.begin_reconfigure();
        }
        tracing::info!(epoch = new_epoch, "epoch started");
        new_epoch
    }

    fn set_rotation(&self, degrees: u16) {
        *self.rotation.lock().expect("rotation lock poisoned") = Some(degrees);
        self.broadcast_control(ControlMessage::EncRot { degrees });
    }

    pub fn set_ui_visible(&self, visible: bool) {
        self.ui_visible.store(visible, Ordering::SeqCst);
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) async fn shutdown_signalled(&self) {
        while !self.is_shutdown() {
            self.shutdown_notify.notified().await;
        }
    }
}

/// Producer-side entry point handed to the encoder output task. Frames
/// and CSD are stamped with the current epoch on their way in.
#[derive(Clone)]
pub struct ProducerHandle {
    shared: Arc<ServerShared>,
}

impl ProducerHandle {
    pub fn current_epoch(&self) -> Epoch {
        self.shared.current_epoch()
    }

    /// Offer an encoded frame to the bus. `false` is backpressure, not an
    /// error.
    pub fn publish_frame(&self, payload: Bytes, is_keyframe: bool, pts_us: i64) -> bool {
        let frame = EncodedFrame::new(payload, is_keyframe, pts_us, self.shared.current_epoch());
        self.shared.frame_bus.publish(frame)
    }

    /// New parameter sets from the encoder. Cached for joiners and pushed
    /// to every live session ahead of the frames that need them.
    pub fn publish_csd(&self, sps: Bytes, pps: Bytes) {
        let csd = CodecSpecificData {
            sps,
            pps,
            epoch: self.shared.current_epoch(),
        };
        self.shared.frame_bus.set_pending_csd(csd.clone());
        self.shared.broadcast_csd(&csd);
    }

    /// Downstream audio, already AAC; ADTS wrapping happens here so the
    /// wire always carries self-describing packets.
    pub fn publish_audio_aac(&self, raw_aac: Bytes, ts_us: i64, sample_rate: u32, channels: u8) {
        let Some(wrapped) = crate::audio::adts_wrap(&raw_aac, sample_rate, channels) else {
            tracing::warn!(sample_rate, "cannot ADTS-wrap audio packet");
            return;
        };
        self.shared.broadcast_audio(&AudioFrame {
            payload: wrapped,
            direction: crate::datatypes::AudioDirection::Down,
            format: crate::datatypes::AudioFormat::Aac,
            ts_us,
            sample_rate,
            channels,
        });
    }

    /// Upstream signal that the encoder is stalled (keyframe drought or
    /// output silence); the control loop recovers under cooldown.
    pub fn recovery_needed(&self) {
        self.shared.commands().post(StreamCommand::RecoverEncoder);
    }

    pub fn now_us(&self) -> i64 {
        self.shared.now_us()
    }
}

/// Cloneable administrative handle: shutdown, UI visibility, counters.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
    }

    pub fn set_ui_visible(&self, visible: bool) {
        self.shared.set_ui_visible(visible);
    }

    pub fn session_count(&self) -> usize {
        self.shared.session_count()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.shared.current_epoch()
    }

    pub fn frame_bus_stats(&self) -> FrameBusStats {
        self.shared.frame_bus_stats()
    }

    /// Post a lens zoom to the control loop.
    pub fn zoom(&self, factor: f32) {
        self.shared.commands().post(StreamCommand::Zoom(factor));
    }

    /// Post a lens switch to the control loop.
    pub fn switch_camera(&self) {
        self.shared.commands().post(StreamCommand::SwitchCamera);
    }
}

/// Jobs executed on the dedicated recording task, the only place that
/// may touch the filesystem.
enum RecordingJob {
    Start { include_audio: bool },
    Stop,
    CameraSwitched,
}

/// The primary-side server. Owns the listener, buses, registry, and the
/// collaborator seams; `run` drives it until shutdown.
pub struct StreamServer {
    shared: Arc<ServerShared>,
    listener: TcpListener,
    local_addr: SocketAddr,
    encoder: Box<dyn Encoder>,
    recorder: Option<Box<dyn Recorder>>,
    camera: Option<Box<dyn CameraController>>,
    command_rx: mpsc::Receiver<StreamCommand>,
}

impl StreamServer {
    /// Bind the listener and assemble the server around an encoder seam.
    pub async fn bind(config: ServerConfig, encoder: Box<dyn Encoder>) -> crate::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let local_addr = listener.local_addr()?;
        let (commands, command_rx) = CommandBus::new();
        let shared = Arc::new(ServerShared::new(
            config,
            commands,
            Box::new(SystemClock::new()),
        ));
        Ok(Self {
            shared,
            listener,
            local_addr,
            encoder,
            recorder: None,
            camera: None,
            command_rx,
        })
    }

    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_camera(mut self, camera: Box<dyn CameraController>) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_talkback(self, sink: Box<dyn TalkbackSink>) -> Self {
        *self.shared.talkback.lock().expect("talkback lock poisoned") = Some(sink);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn producer(&self) -> ProducerHandle {
        ProducerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn commands(&self) -> CommandBus {
        self.shared.commands.clone()
    }

    /// Run until shutdown. Spawns the accept, fan-out, and recording
    /// tasks and drives the control loop on this task.
    pub async fn run(mut self) -> crate::Result<()> {
        tracing::info!(addr = %self.local_addr, "stream server listening");
        self.encoder.start(&self.shared.stream_config())?;

        let fanout = tokio::spawn(fanout_loop(self.shared.clone()));
        let accept = tokio::spawn(accept_loop(self.shared.clone(), self.listener));

        let (recording_tx, recording_rx) = mpsc::channel(8);
        let recording = self
            .recorder
            .take()
            .map(|recorder| tokio::spawn(recording_loop(self.shared.clone(), recording_rx, recorder)));

        control_loop(
            self.shared.clone(),
            self.command_rx,
            self.encoder,
            self.camera,
            recording_tx,
        )
        .await;

        self.shared.begin_shutdown();
        for handle in self.shared.sessions_snapshot() {
            handle.close();
        }
        let _ = fanout.await;
        let _ = accept.await;
        if let Some(recording) = recording {
            recording.abort();
        }
        tracing::info!("stream server stopped");
        Ok(())
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown_signalled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(%peer, "connection accepted");
                    tokio::spawn(session::serve(shared.clone(), socket));
                }
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// Fan-out: the single consumer of the frame bus. Stale-epoch frames are
/// dropped here; the first keyframe of an epoch flips the global state to
/// `Active` (per-session `STREAM_STATE|1` lines are emitted by each
/// sender directly after that keyframe's bytes).
async fn fanout_loop(shared: Arc<ServerShared>) {
    loop {
        if shared.is_shutdown() {
            break;
        }
        let Some(frame) = shared.frame_bus.poll(FANOUT_POLL).await else {
            continue;
        };
        if frame.epoch < shared.current_epoch() {
            continue;
        }
        if frame.is_keyframe && !shared.active_epoch_started.swap(true, Ordering::SeqCst) {
            shared.set_stream_state(StreamStateCode::Active);
        }
        for handle in shared.sessions_snapshot() {
            handle.enqueue_frame(&frame, &shared);
        }
    }
}

/// The control loop: single consumer of the command bus and the only code
/// that touches the encoder or camera. Recording work is re-posted to the
/// recording task so nothing here waits on the filesystem.
async fn control_loop(
    shared: Arc<ServerShared>,
    mut commands: mpsc::Receiver<StreamCommand>,
    mut encoder: Box<dyn Encoder>,
    mut camera: Option<Box<dyn CameraController>>,
    recording_tx: mpsc::Sender<RecordingJob>,
) {
    let mut last_recover: Option<Instant> = None;
    let mut idle_since: Option<Instant> = None;
    let mut saved_config: Option<StreamConfig> = None;

    loop {
        let tick = tokio::time::timeout(CONTROL_TICK, commands.recv()).await;
        match tick {
            Ok(Some(command)) => handle_command(
                &shared,
                command,
                encoder.as_mut(),
                &mut camera,
                &recording_tx,
                &mut last_recover,
            ),
            Ok(None) => break,
            Err(_) => {}
        }
        if shared.is_shutdown() {
            break;
        }
        idle_governor_tick(&shared, encoder.as_mut(), &mut idle_since, &mut saved_config);
    }

    encoder.stop();
}

fn handle_command(
    shared: &Arc<ServerShared>,
    command: StreamCommand,
    encoder: &mut dyn Encoder,
    camera: &mut Option<Box<dyn CameraController>>,
    recording_tx: &mpsc::Sender<RecordingJob>,
    last_recover: &mut Option<Instant>,
) {
    let camera = camera.as_deref_mut();
    match command {
        StreamCommand::RequestKeyframe => encoder.request_keyframe(),
        StreamCommand::ReconfigureStream(request) => {
            apply_reconfigure(shared, encoder, request);
        }
        StreamCommand::AdjustBitrate(bitrate_bps) => {
            if !shared.config().profile.allow_dynamic_bitrate {
                tracing::debug!("dynamic bitrate disabled by device profile");
                return;
            }
            encoder.set_bitrate(bitrate_bps);
            let mut config = shared.stream_config();
            config.bitrate_bps = bitrate_bps;
            shared.set_stream_config(config);
        }
        StreamCommand::StartRecording => {
            if recording_tx
                .try_send(RecordingJob::Start { include_audio: true })
                .is_err()
            {
                tracing::warn!("no recorder attached, START_RECORDING ignored");
            }
        }
        StreamCommand::StopRecording => {
            if recording_tx.try_send(RecordingJob::Stop).is_err() {
                tracing::warn!("no recorder attached, STOP_RECORDING ignored");
            }
        }
        StreamCommand::SwitchCamera => {
            let Some(camera) = camera else {
                tracing::warn!("no camera controller attached");
                return;
            };
            let front = camera.switch();
            shared.front_camera.store(front, Ordering::SeqCst);
            shared.broadcast_control(ControlMessage::Camera { front });
            let _ = recording_tx.try_send(RecordingJob::CameraSwitched);
            // Viewers need a fresh entry point after the lens flip.
            encoder.request_keyframe();
        }
        StreamCommand::Zoom(factor) => {
            if let Some(camera) = camera {
                camera.zoom(factor);
            }
        }
        StreamCommand::Backpressure(session) => {
            tracing::info!(%session, "session shedding frames");
        }
        StreamCommand::PressureClear(session) => {
            tracing::info!(%session, "session pressure cleared");
        }
        StreamCommand::RecoverEncoder => {
            let cooldown = match shared.config().profile.tier {
                crate::datatypes::DeviceTier::Low => RECOVER_COOLDOWN_LOW_TIER,
                _ => RECOVER_COOLDOWN,
            };
            let now = Instant::now();
            if let Some(last) = *last_recover {
                if now.duration_since(last) < cooldown {
                    tracing::warn!("encoder recovery requested within cooldown, skipping");
                    return;
                }
            }
            *last_recover = Some(now);
            let config = shared.stream_config();
            let epoch = shared.begin_epoch();
            encoder.stop();
            if let Err(err) = encoder.start(&config) {
                tracing::error!("encoder restart failed: {err}");
                return;
            }
            shared.broadcast_control(ControlMessage::StreamAccepted { epoch, config });
        }
    }
}

/// Apply an arbitrated stream request. Identical parameters do not bump
/// the epoch; bitrate-only changes retune in place; dimension/fps changes
/// restart the encoder under a fresh epoch.
fn apply_reconfigure(shared: &Arc<ServerShared>, encoder: &mut dyn Encoder, request: StreamConfig) {
    let current = shared.stream_config();
    let mut target = request;

    // Buffer-mode encoders pin their own geometry; only bitrate follows
    // the request.
    if shared.config().profile.prefer_buffer_mode {
        target.width = current.width;
        target.height = current.height;
        target.fps = current.fps;
    }

    if target == current {
        shared.broadcast_control(ControlMessage::StreamAccepted {
            epoch: shared.current_epoch(),
            config: current,
        });
        return;
    }

    if !current.needs_restart(&target) {
        encoder.set_bitrate(target.bitrate_bps);
        shared.set_stream_config(target);
        shared.broadcast_control(ControlMessage::StreamAccepted {
            epoch: shared.current_epoch(),
            config: target,
        });
        return;
    }

    let epoch = shared.begin_epoch();
    if let Err(err) = encoder.reconfigure(&target) {
        tracing::error!("encoder reconfigure failed: {err}");
    }
    // The encoder may not honor requested dimensions exactly; the reply
    // is authoritative either way.
    if let Some((width, height)) = encoder.active_dimensions() {
        target.width = width;
        target.height = height;
    }
    shared.set_stream_config(target);
    shared.broadcast_control(ControlMessage::StreamAccepted {
        epoch,
        config: target,
    });
}

/// Idle governor: with zero sessions, no recording, and the UI hidden for
/// the grace window, drop to a low-power stream; restore when any
/// condition reverses.
fn idle_governor_tick(
    shared: &Arc<ServerShared>,
    encoder: &mut dyn Encoder,
    idle_since: &mut Option<Instant>,
    saved_config: &mut Option<StreamConfig>,
) {
    let idle = shared.session_count() == 0 && !shared.is_recording() && !shared.ui_visible();

    if !idle {
        *idle_since = None;
        if let Some(restore) = saved_config.take() {
            tracing::info!("idle governor: restoring stream configuration");
            apply_reconfigure(shared, encoder, restore);
        }
        return;
    }

    if saved_config.is_some() {
        return;
    }
    match *idle_since {
        None => *idle_since = Some(Instant::now()),
        Some(since) if since.elapsed() >= shared.config().idle_grace => {
            let current = shared.stream_config();
            let mut low = current;
            low.bitrate_bps = low.bitrate_bps.min(LOW_POWER_BITRATE);
            if shared.config().profile.allow_fps_governor {
                low.fps = LOW_POWER_FPS;
            }
            tracing::info!("idle governor: entering low-power stream");
            *saved_config = Some(current);
            apply_reconfigure(shared, encoder, low);
        }
        Some(_) => {}
    }
}

/// Recording task: owns the recorder, absorbs filesystem latency, and
/// reports state changes back through session metadata.
async fn recording_loop(
    shared: Arc<ServerShared>,
    mut jobs: mpsc::Receiver<RecordingJob>,
    mut recorder: Box<dyn Recorder>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            RecordingJob::Start { include_audio } => match recorder.start(include_audio) {
                Ok(()) => {
                    shared.recording.store(true, Ordering::SeqCst);
                    shared.broadcast_control(ControlMessage::Recording { active: true });
                    tracing::info!("recording started");
                }
                Err(err) => tracing::error!("recording start failed: {err}"),
            },
            RecordingJob::Stop => {
                recorder.stop();
                shared.recording.store(false, Ordering::SeqCst);
                shared.broadcast_control(ControlMessage::Recording { active: false });
                tracing::info!("recording stopped");
            }
            RecordingJob::CameraSwitched => recorder.on_camera_switched(),
        }
    }
}

/// Operator-driven stream lifecycle and platform metadata. These arrive
/// from the app layer, not the wire.
impl ServerHandle {
    pub fn set_rotation(&self, degrees: u16) {
        if matches!(degrees, 0 | 90 | 180 | 270) {
            self.shared.set_rotation(degrees);
        } else {
            tracing::warn!(degrees, "ignoring non-quadrant rotation");
        }
    }

    /// Tell every viewer the stream is over. Clients disable their
    /// reconnect and go idle; the sockets are theirs to close.
    pub fn stop_streaming(&self) {
        let epoch = self.shared.current_epoch();
        self.shared.set_stream_state(StreamStateCode::Stopped);
        self.shared.broadcast_control(ControlMessage::StreamState {
            code: StreamStateCode::Stopped,
            epoch,
        });
    }

    /// Pause/unpause without tearing sessions down. Unpausing requests a
    /// keyframe so viewers re-enter the stream immediately.
    pub fn set_paused(&self, paused: bool) {
        let epoch = self.shared.current_epoch();
        if paused {
            self.shared.set_stream_state(StreamStateCode::Paused);
            self.shared.broadcast_control(ControlMessage::StreamState {
                code: StreamStateCode::Paused,
                epoch,
            });
        } else {
            self.shared.set_stream_state(StreamStateCode::Reconfiguring);
            self.shared.broadcast_control(ControlMessage::StreamState {
                code: StreamStateCode::Reconfiguring,
                epoch,
            });
            self.shared.commands().post(StreamCommand::RequestKeyframe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_entries_expire() {
        let shared = ServerShared::for_tests();
        let id = Uuid::new_v4();
        shared.resume.lock().unwrap().insert(
            id,
            ResumeEntry {
                id,
                caps: None,
                // Already at its deadline; by lookup time it has lapsed.
                expires_at: Instant::now(),
            },
        );
        assert!(shared.take_resume(&id).is_none());

        let fresh = Uuid::new_v4();
        shared.resume.lock().unwrap().insert(
            fresh,
            ResumeEntry {
                id: fresh,
                caps: Some(ViewerCaps::default()),
                expires_at: Instant::now() + Duration::from_secs(30),
            },
        );
        let entry = shared.take_resume(&fresh).expect("fresh entry resumable");
        assert_eq!(entry.id, fresh);
        assert_eq!(entry.caps, Some(ViewerCaps::default()));
        // One-shot: taking it again fails.
        assert!(shared.take_resume(&fresh).is_none());
    }

    #[test]
    fn epoch_bump_is_monotonic_and_resets_active_flag() {
        let shared = ServerShared::for_tests();
        assert_eq!(shared.current_epoch(), 1);
        shared.active_epoch_started.store(true, Ordering::SeqCst);

        let next = shared.begin_epoch();
        assert_eq!(next, 2);
        assert_eq!(shared.current_epoch(), 2);
        assert!(!shared.active_epoch_started.load(Ordering::SeqCst));
        assert_eq!(shared.stream_state(), StreamStateCode::Reconfiguring);
    }

    #[test]
    fn cached_csd_is_epoch_gated() {
        let shared = ServerShared::for_tests();
        shared.frame_bus.set_pending_csd(CodecSpecificData {
            sps: Bytes::from_static(&[1]),
            pps: Bytes::from_static(&[2]),
            epoch: 1,
        });
        assert!(shared.cached_csd().is_some());

        shared.begin_epoch();
        // Stale-epoch CSD must not be replayed to joiners.
        assert!(shared.cached_csd().is_none());
    }
}
