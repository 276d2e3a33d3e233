// ABOUTME: Collaborator seams the streaming core consumes but does not implement
// ABOUTME: Hardware codec wrapping, file muxing, rendering, and clocks live behind these traits

use crate::datatypes::{AudioFrame, CodecSpecificData, EncodedFrame, StreamConfig};

/// Hardware (or software) video encoder control surface.
///
/// The control loop is the only caller; it holds the encoder lock for the
/// duration of a single command and never across an await point. Encoded
/// output does not flow through this trait — the producer side pushes
/// frames and CSD into the server through
/// [`crate::server::ProducerHandle`].
pub trait Encoder: Send {
    fn start(&mut self, config: &StreamConfig) -> crate::Result<()>;

    fn stop(&mut self);

    fn set_bitrate(&mut self, bitrate_bps: u32);

    /// Ask for an IDR frame at the next opportunity.
    fn request_keyframe(&mut self);

    fn reconfigure(&mut self, config: &StreamConfig) -> crate::Result<()>;

    /// Dimensions actually in use. Buffer-mode encoders ignore requested
    /// dimensions; the server echoes these in `STREAM_ACCEPTED` instead
    /// of the request.
    fn active_dimensions(&self) -> Option<(u32, u32)>;
}

/// Camera lens control, distinct from the encoder: switching or zooming
/// does not restart encoding by itself.
pub trait CameraController: Send {
    /// Flip between front and back lens. Returns the new facing
    /// (`true` = front).
    fn switch(&mut self) -> bool;

    fn zoom(&mut self, factor: f32);
}

/// File recording collaborator. Runs exclusively on the recording task;
/// the control loop posts to it and never waits on filesystem I/O.
pub trait Recorder: Send {
    fn start(&mut self, include_audio: bool) -> crate::Result<()>;

    fn stop(&mut self);

    /// Recorder may need to cut a new segment when the camera flips.
    fn on_camera_switched(&mut self);
}

/// Where the viewer delivers decodable media. Rendering details
/// (TextureView vs SurfaceView and their quirks) stay behind this seam.
pub trait VideoSink: Send {
    /// New parameter sets; the decoder must be reset before the next frame.
    fn on_codec_data(&mut self, csd: &CodecSpecificData);

    fn on_frame(&mut self, frame: &EncodedFrame);

    /// Display rotation in degrees, from `ENC_ROT`.
    fn on_rotation(&mut self, degrees: u16);

    /// Downstream monitoring audio (ADTS-wrapped AAC). Video-only sinks
    /// can leave the default no-op in place.
    fn on_audio(&mut self, _frame: &AudioFrame) {}

    /// Authoritative stream parameters from `STREAM_ACCEPTED`. May differ
    /// from what was requested; the UI sizes its surface from this.
    fn on_stream_params(&mut self, _config: &StreamConfig) {}
}

/// Where the server delivers viewer talkback audio (PCM16LE mono 48 kHz).
pub trait TalkbackSink: Send {
    fn on_talkback(&mut self, frame: &AudioFrame);
}

/// Monotonic microsecond source for PTS values and deadlines. Injected so
/// tests can drive time.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Process-monotonic [`Clock`] used outside of tests.
#[derive(Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
