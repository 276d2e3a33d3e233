// ABOUTME: Per-viewer session: handshake, authentication, and the split outbound queues
// ABOUTME: One reader task and one sender task per session; nothing here touches the encoder

use crate::codec::{CodecError, ControlMessage};
use crate::command::StreamCommand;
use crate::connection::{Connection, ConnectionReader, ConnectionWriter, WireEvent};
use crate::datatypes::{
    AudioDirection, AudioFrame, CodecSpecificData, EncodedFrame, Epoch, SessionState,
    StreamStateCode, ViewerCaps,
};
use crate::server::{ServerShared, auth};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

/// Depth of the drain-preferred control queue. Control traffic is tiny;
/// a full queue means the socket is dead, not busy.
pub const CONTROL_QUEUE_DEPTH: usize = 64;

/// Depth of the audio queue; oldest packets are shed first.
pub const AUDIO_QUEUE_DEPTH: usize = 30;

/// Errors that terminate a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("authentication failed")]
    AuthFailed,

    #[error("no inbound traffic within the heartbeat window")]
    HeartbeatTimeout,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// One item on a session's outbound path.
#[derive(Debug, Clone)]
pub enum Outbound {
    Control(ControlMessage),
    /// CSD rides the control queue: it must not sit behind a frame backlog.
    Csd(CodecSpecificData),
    Audio(AudioFrame),
    Frame(EncodedFrame),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendQueueStats {
    pub control_dropped: u64,
    pub audio_shed: u64,
    pub frames_shed: u64,
    pub keyframe_clears: u64,
}

struct SendQueueInner {
    control: VecDeque<Outbound>,
    audio: VecDeque<AudioFrame>,
    frames: VecDeque<EncodedFrame>,
    closed: bool,
    stats: SendQueueStats,
}

/// The session's bounded outbound queues, drained by a single sender task.
///
/// Drain order per iteration: all queued control items, then one audio
/// packet, then one video frame — so `STREAM_STATE` and `CSD` are never
/// blocked behind a frame backlog. Frame shedding mirrors the frame bus:
/// non-keyframes are refused when full, a keyframe clears the queue.
pub struct SendQueue {
    inner: Mutex<SendQueueInner>,
    notify: Notify,
    frame_capacity: usize,
}

impl SendQueue {
    pub fn new(frame_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SendQueueInner {
                control: VecDeque::new(),
                audio: VecDeque::new(),
                frames: VecDeque::new(),
                closed: false,
                stats: SendQueueStats::default(),
            }),
            notify: Notify::new(),
            frame_capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SendQueueInner> {
        self.inner.lock().expect("send queue lock poisoned")
    }

    pub fn push_control(&self, message: ControlMessage) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if inner.control.len() >= CONTROL_QUEUE_DEPTH {
            inner.stats.control_dropped += 1;
            tracing::warn!("control queue full, dropping outbound message");
            return false;
        }
        inner.control.push_back(Outbound::Control(message));
        drop(inner);
        self.notify.notify_one();
        true
    }

    pub fn push_csd(&self, csd: CodecSpecificData) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if inner.control.len() >= CONTROL_QUEUE_DEPTH {
            inner.stats.control_dropped += 1;
            return false;
        }
        inner.control.push_back(Outbound::Csd(csd));
        drop(inner);
        self.notify.notify_one();
        true
    }

    pub fn push_audio(&self, frame: AudioFrame) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if inner.audio.len() >= AUDIO_QUEUE_DEPTH {
            inner.audio.pop_front();
            inner.stats.audio_shed += 1;
        }
        inner.audio.push_back(frame);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Offer a video frame under the load-shed policy. `false` means the
    /// frame was refused (backpressure signal for the caller).
    pub fn push_frame(&self, frame: EncodedFrame) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if inner.frames.len() >= self.frame_capacity {
            if frame.is_keyframe {
                inner.frames.clear();
                inner.stats.keyframe_clears += 1;
            } else {
                inner.stats.frames_shed += 1;
                return false;
            }
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Next item in drain-preferred order, or `None` once closed and
    /// fully drained.
    pub async fn next(&self) -> Option<Outbound> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.control.pop_front() {
                    return Some(item);
                }
                if let Some(audio) = inner.audio.pop_front() {
                    return Some(Outbound::Audio(audio));
                }
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(Outbound::Frame(frame));
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn frame_depth(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn stats(&self) -> SendQueueStats {
        self.lock().stats
    }
}

/// Registry entry for one authenticated viewer. Fan-out and broadcast
/// paths talk to sessions exclusively through this handle.
pub struct SessionHandle {
    pub id: Uuid,
    pub protocol_version: u8,
    queue: Arc<SendQueue>,
    state: Mutex<SessionState>,
    caps: Mutex<Option<ViewerCaps>>,
    /// Epoch whose keyframe has been handed to this session's write path.
    /// P-frames of other epochs are useless to the decoder and skipped.
    keyframe_epoch: Mutex<Option<Epoch>>,
    shedding: AtomicBool,
}

impl SessionHandle {
    fn new(id: Uuid, protocol_version: u8, queue: Arc<SendQueue>) -> Self {
        Self {
            id,
            protocol_version,
            queue,
            state: Mutex::new(SessionState::Connecting),
            caps: Mutex::new(None),
            keyframe_epoch: Mutex::new(None),
            shedding: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    /// Apply a transition, enforcing the legality table. Illegal moves
    /// assert in dev builds and are refused (with a warning) in release.
    pub fn set_state(&self, to: SessionState) -> bool {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if !state.can_transition(to) {
            if *state != to {
                debug_assert!(false, "illegal session transition {:?} -> {to:?}", *state);
                tracing::warn!(session = %self.id, from = ?*state, ?to, "refusing illegal session transition");
            }
            return false;
        }
        tracing::debug!(session = %self.id, from = ?*state, ?to, "session transition");
        *state = to;
        true
    }

    pub fn caps(&self) -> Option<ViewerCaps> {
        *self.caps.lock().expect("session caps lock poisoned")
    }

    pub fn set_caps(&self, caps: ViewerCaps) {
        *self.caps.lock().expect("session caps lock poisoned") = Some(caps);
    }

    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.queue
    }

    pub fn enqueue_control(&self, message: ControlMessage) {
        self.queue.push_control(message);
    }

    pub fn enqueue_csd(&self, csd: CodecSpecificData) {
        self.queue.push_csd(csd);
    }

    pub fn enqueue_audio(&self, frame: AudioFrame) {
        self.queue.push_audio(frame);
    }

    /// Hand one fan-out frame to this session.
    ///
    /// The first keyframe of an epoch promotes the session to `Streaming`;
    /// until it arrives, non-keyframes of that epoch are skipped because
    /// the decoder cannot enter the stream mid-GOP. Shed/recover edges
    /// post `Backpressure`/`PressureClear` for observability.
    pub fn enqueue_frame(&self, frame: &EncodedFrame, shared: &ServerShared) {
        {
            let mut keyframe_epoch = self
                .keyframe_epoch
                .lock()
                .expect("keyframe epoch lock poisoned");
            if frame.is_keyframe {
                if *keyframe_epoch != Some(frame.epoch) {
                    *keyframe_epoch = Some(frame.epoch);
                }
            } else if *keyframe_epoch != Some(frame.epoch) {
                return;
            }
        }

        if self.queue.push_frame(frame.clone()) {
            if frame.is_keyframe {
                // Deferred Streaming entry: observable once the first
                // keyframe is in the write path.
                match self.state() {
                    SessionState::Authenticated | SessionState::Reconfiguring => {
                        self.set_state(SessionState::Streaming);
                    }
                    _ => {}
                }
            }
            if self.shedding.load(Ordering::Relaxed)
                && self.queue.frame_depth() <= self.queue.frame_capacity / 2
                && self.shedding.swap(false, Ordering::Relaxed)
            {
                shared.commands().post(StreamCommand::PressureClear(self.id));
            }
        } else if !self.shedding.swap(true, Ordering::Relaxed) {
            shared.commands().post(StreamCommand::Backpressure(self.id));
        }
    }

    /// Force the session into `Reconfiguring` for a new epoch.
    pub fn begin_reconfigure(&self) {
        if self.state() == SessionState::Streaming {
            self.set_state(SessionState::Reconfiguring);
        }
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

/// Outcome of the pre-registration handshake.
struct Admitted {
    handle: Arc<SessionHandle>,
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

/// Drive one accepted socket through handshake, registration, and the
/// reader/sender pair, then tear it down and leave a resume entry.
pub(crate) async fn serve(shared: Arc<ServerShared>, socket: TcpStream) {
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());

    let admitted = match timeout(
        shared.config().handshake_timeout,
        handshake(&shared, socket),
    )
    .await
    {
        Ok(Ok(admitted)) => admitted,
        Ok(Err(err)) => {
            tracing::info!(%peer, "handshake rejected: {err}");
            return;
        }
        Err(_) => {
            tracing::info!(%peer, "handshake timed out");
            return;
        }
    };

    let handle = admitted.handle;
    tracing::info!(%peer, session = %handle.id, version = handle.protocol_version, "viewer session established");
    shared.register_session(handle.clone());

    let sender = tokio::spawn(sender_loop(
        admitted.writer,
        handle.queue().clone(),
        handle.protocol_version,
    ));

    let reason = read_loop(&shared, &handle, admitted.reader).await;
    match &reason {
        Ok(()) => tracing::info!(session = %handle.id, "viewer disconnected"),
        Err(err) => tracing::info!(session = %handle.id, "session ended: {err}"),
    }

    handle.set_state(SessionState::Disconnected);
    handle.close();
    sender.abort();
    shared.unregister_session(&handle);
}

/// Server side of the handshake dialogue:
/// `HELLO` → (`PROTO` echo for v3) → `AUTH_CHALLENGE` → either
/// `AUTH_RESPONSE` or `RESUME`. On success the session is minted (or
/// restored) and primed with `STREAM_ACCEPTED`, current `STREAM_STATE`,
/// and cached CSD/metadata.
async fn handshake(
    shared: &Arc<ServerShared>,
    socket: TcpStream,
) -> Result<Admitted, SessionError> {
    let mut conn = Connection::new(socket);

    let version = match conn.read_event().await? {
        Some(WireEvent::Control(ControlMessage::Hello { version, .. })) => version,
        _ => return Err(SessionError::Protocol("expected HELLO".into())),
    };
    if version >= 3 {
        conn.write_control(&ControlMessage::Proto { version }).await?;
    }

    let salt = auth::mint_salt();
    conn.write_control(&ControlMessage::AuthChallenge {
        version: 2,
        salt: salt.clone(),
    })
    .await?;

    let (id, resumed_caps, resumed) = loop {
        match conn.read_event().await? {
            Some(WireEvent::Control(ControlMessage::AuthResponse { hash })) => {
                let ok = auth::verify_response(&shared.config().password, &salt, &hash);
                // The session cap hides behind the same AUTH_FAIL as a bad
                // password so the cap cannot be fingerprinted.
                if !ok || shared.session_count() >= shared.config().max_sessions {
                    conn.write_control(&ControlMessage::AuthFail).await?;
                    return Err(SessionError::AuthFailed);
                }
                break (Uuid::new_v4(), None, false);
            }
            Some(WireEvent::Control(ControlMessage::Resume { session })) => {
                match session.parse::<Uuid>().ok().and_then(|id| shared.take_resume(&id)) {
                    Some(entry) if shared.session_count() < shared.config().max_sessions => {
                        conn.write_control(&ControlMessage::ResumeOk).await?;
                        break (entry.id, entry.caps, true);
                    }
                    _ => {
                        conn.write_control(&ControlMessage::ResumeFail).await?;
                        // The challenge is still live; fall back to a full
                        // authentication round.
                    }
                }
            }
            Some(WireEvent::Control(other)) => {
                return Err(SessionError::Protocol(format!(
                    "unexpected {other:?} during authentication"
                )));
            }
            _ => return Err(SessionError::Protocol("connection closed during auth".into())),
        }
    };

    if !resumed {
        conn.write_control(&ControlMessage::AuthOk).await?;
        conn.write_control(&ControlMessage::Session { id: id.to_string() })
            .await?;
    }

    // Prime the viewer with the authoritative stream parameters and state.
    conn.write_control(&ControlMessage::StreamAccepted {
        epoch: shared.current_epoch(),
        config: shared.stream_config(),
    })
    .await?;
    conn.write_control(&ControlMessage::StreamState {
        code: shared.stream_state(),
        epoch: shared.current_epoch(),
    })
    .await?;
    if let Some(csd) = shared.cached_csd() {
        conn.write_csd(&csd).await?;
    }
    if let Some(rotation) = shared.rotation() {
        conn.write_control(&ControlMessage::EncRot { degrees: rotation })
            .await?;
    }
    if shared.is_recording() {
        conn.write_control(&ControlMessage::Recording { active: true })
            .await?;
    }
    if shared.front_camera() {
        conn.write_control(&ControlMessage::Camera { front: true })
            .await?;
    }
    if shared.has_talkback() {
        conn.write_control(&ControlMessage::Comm { enabled: true })
            .await?;
    }

    let queue = Arc::new(SendQueue::new(
        shared.config().profile.tier.frame_queue_depth(),
    ));
    let handle = Arc::new(SessionHandle::new(id, version, queue));
    handle.set_state(SessionState::Authenticated);
    if let Some(caps) = resumed_caps {
        handle.set_caps(caps);
    }
    if resumed {
        // Get the restored viewer rendering without waiting out the GOP.
        shared.commands().post(StreamCommand::RequestKeyframe);
    }

    let (reader, writer) = conn.split();
    Ok(Admitted {
        handle,
        reader,
        writer,
    })
}

/// Session reader: drains inbound control traffic until EOF, error, or
/// heartbeat silence. Posts intents to the command bus; never calls into
/// encoder/camera/recording code.
async fn read_loop(
    shared: &Arc<ServerShared>,
    handle: &Arc<SessionHandle>,
    mut reader: ConnectionReader,
) -> Result<(), SessionError> {
    let heartbeat = shared.config().heartbeat_timeout;
    loop {
        let event = tokio::select! {
            event = timeout(heartbeat, reader.read_event()) => match event {
                Ok(Ok(event)) => event,
                // A malformed control line is answered with ERROR and
                // otherwise ignored; session state does not change.
                Ok(Err(CodecError::Malformed(line))) => {
                    tracing::debug!(session = %handle.id, line = %line, "malformed control line");
                    handle.enqueue_control(ControlMessage::Error {
                        code: 400,
                        msg: "malformed control line".into(),
                    });
                    continue;
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(SessionError::HeartbeatTimeout),
            },
            _ = shared.shutdown_signalled() => return Ok(()),
        };

        let event = match event {
            Some(event) => event,
            None => return Ok(()),
        };

        match event {
            WireEvent::Control(message) => {
                handle_control(shared, handle, message);
            }
            WireEvent::Audio(frame) if frame.direction == AudioDirection::Up => {
                shared.deliver_talkback(&frame);
            }
            WireEvent::Audio(_) => {
                tracing::debug!(session = %handle.id, "ignoring downstream-direction audio from viewer");
            }
            WireEvent::Video(_) | WireEvent::CodecData(_) => {
                return Err(SessionError::Protocol(
                    "viewer sent media on the control path".into(),
                ));
            }
        }
    }
}

fn handle_control(shared: &Arc<ServerShared>, handle: &Arc<SessionHandle>, message: ControlMessage) {
    match message {
        ControlMessage::Ping { ts_ms } => {
            handle.enqueue_control(ControlMessage::Pong {
                ts_ms,
                srv_ms: shared.now_ms(),
            });
        }
        ControlMessage::Caps(caps) => {
            handle.set_caps(caps);
            handle.enqueue_control(ControlMessage::CapsOk);
        }
        ControlMessage::SetStream(request) => {
            let arbitrated = shared.arbitrate_stream_request(request, handle);
            shared
                .commands()
                .post(StreamCommand::ReconfigureStream(arbitrated));
        }
        ControlMessage::AdjustBitrate { bitrate_bps } => {
            shared.commands().post(StreamCommand::AdjustBitrate(bitrate_bps));
        }
        ControlMessage::ReqKeyframe => {
            shared.commands().post(StreamCommand::RequestKeyframe);
        }
        ControlMessage::StartRecording => {
            shared.commands().post(StreamCommand::StartRecording);
        }
        ControlMessage::StopRecording => {
            shared.commands().post(StreamCommand::StopRecording);
        }
        ControlMessage::Camera { .. } => {
            shared.commands().post(StreamCommand::SwitchCamera);
        }
        ControlMessage::Backpressure => {
            shared.commands().post(StreamCommand::Backpressure(handle.id));
        }
        ControlMessage::PressureClear => {
            shared.commands().post(StreamCommand::PressureClear(handle.id));
        }
        ControlMessage::Pong { .. } => {
            // Inbound traffic of any kind resets the heartbeat window.
        }
        other => {
            tracing::debug!(session = %handle.id, ?other, "ignoring control message in session state");
        }
    }
}

/// Session sender: single writer over the socket, alternating between a
/// full control drain and one media item per iteration.
///
/// `STREAM_STATE|Active` for an epoch is written here, directly after the
/// first keyframe of that epoch goes out, so a viewer can never observe
/// `Active` before a decodable entry point.
async fn sender_loop(
    mut writer: ConnectionWriter,
    queue: Arc<SendQueue>,
    protocol_version: u8,
) {
    let mut active_epoch_sent: Option<Epoch> = None;

    while let Some(item) = queue.next().await {
        let result = match &item {
            Outbound::Control(message) => writer.write_control(message).await,
            Outbound::Csd(csd) => writer.write_csd(csd).await,
            Outbound::Audio(frame) => writer.write_audio(frame).await,
            Outbound::Frame(frame) => {
                let write = if protocol_version >= 3 {
                    writer.write_frame_v3(frame).await
                } else {
                    writer.write_frame_v2(frame).await
                };
                if write.is_ok() && frame.is_keyframe && active_epoch_sent != Some(frame.epoch) {
                    active_epoch_sent = Some(frame.epoch);
                    writer
                        .write_control(&ControlMessage::StreamState {
                            code: StreamStateCode::Active,
                            epoch: frame.epoch,
                        })
                        .await
                } else {
                    write
                }
            }
        };

        if let Err(err) = result {
            tracing::debug!("session write failed: {err}");
            queue.close();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(is_keyframe: bool, epoch: Epoch, pts: i64) -> EncodedFrame {
        EncodedFrame::new(Bytes::from_static(&[9u8; 8]), is_keyframe, pts, epoch)
    }

    #[tokio::test]
    async fn control_is_drain_preferred() {
        let queue = SendQueue::new(8);
        assert!(queue.push_frame(frame(true, 1, 0)));
        assert!(queue.push_audio(AudioFrame::talkback(Bytes::from_static(&[0]), 0)));
        assert!(queue.push_control(ControlMessage::CapsOk));
        assert!(queue.push_control(ControlMessage::ReqKeyframe));

        // Both control items first, then the audio packet, then the frame.
        assert!(matches!(
            queue.next().await,
            Some(Outbound::Control(ControlMessage::CapsOk))
        ));
        assert!(matches!(
            queue.next().await,
            Some(Outbound::Control(ControlMessage::ReqKeyframe))
        ));
        assert!(matches!(queue.next().await, Some(Outbound::Audio(_))));
        assert!(matches!(queue.next().await, Some(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn frame_queue_load_shed_mirrors_bus_policy() {
        let queue = SendQueue::new(3);
        assert!(queue.push_frame(frame(true, 1, 0)));
        assert!(queue.push_frame(frame(false, 1, 1)));
        assert!(queue.push_frame(frame(false, 1, 2)));

        assert!(!queue.push_frame(frame(false, 1, 3)));
        assert_eq!(queue.stats().frames_shed, 1);

        assert!(queue.push_frame(frame(true, 2, 4)));
        assert_eq!(queue.frame_depth(), 1);
        assert_eq!(queue.stats().keyframe_clears, 1);
    }

    #[tokio::test]
    async fn audio_queue_sheds_oldest() {
        let queue = SendQueue::new(4);
        for i in 0..(AUDIO_QUEUE_DEPTH + 2) {
            queue.push_audio(AudioFrame::talkback(
                Bytes::from_static(&[0]),
                i as i64,
            ));
        }
        assert_eq!(queue.stats().audio_shed, 2);
        match queue.next().await {
            Some(Outbound::Audio(first)) => assert_eq!(first.ts_us, 2),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_and_drained_queue_yields_none() {
        let queue = SendQueue::new(4);
        queue.push_control(ControlMessage::AuthOk);
        queue.close();

        assert!(matches!(
            queue.next().await,
            Some(Outbound::Control(ControlMessage::AuthOk))
        ));
        assert!(queue.next().await.is_none());
        assert!(!queue.push_control(ControlMessage::AuthFail));
    }

    #[test]
    fn handle_skips_mid_gop_entry() {
        let shared = ServerShared::for_tests();
        let handle = SessionHandle::new(Uuid::new_v4(), 3, Arc::new(SendQueue::new(8)));
        handle.set_state(SessionState::Authenticated);

        // P-frames before the epoch's keyframe are useless and skipped.
        handle.enqueue_frame(&frame(false, 1, 0), &shared);
        assert_eq!(handle.queue().frame_depth(), 0);
        assert_eq!(handle.state(), SessionState::Authenticated);

        handle.enqueue_frame(&frame(true, 1, 1), &shared);
        handle.enqueue_frame(&frame(false, 1, 2), &shared);
        assert_eq!(handle.queue().frame_depth(), 2);
        assert_eq!(handle.state(), SessionState::Streaming);

        // A new epoch needs a new keyframe before its P-frames flow.
        handle.begin_reconfigure();
        assert_eq!(handle.state(), SessionState::Reconfiguring);
        handle.enqueue_frame(&frame(false, 2, 3), &shared);
        assert_eq!(handle.queue().frame_depth(), 2);
        handle.enqueue_frame(&frame(true, 2, 4), &shared);
        assert_eq!(handle.state(), SessionState::Streaming);
    }
}
