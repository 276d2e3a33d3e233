// ABOUTME: Encoded media units exchanged between the encoder producer, buses, and sessions
// ABOUTME: Every unit carries the epoch it was produced under so stale items can be dropped

use bytes::Bytes;

/// Monotonic counter identifying a contiguous run of frames produced with
/// the same encoder configuration. Starts at 1 and is bumped by the server
/// on every encoder restart or resolution/fps change.
pub type Epoch = u32;

/// One encoded video access unit as it travels from the encoder to the
/// per-session send queues.
///
/// The payload is reference-counted (`Bytes`), so fan-out to N sessions
/// clones a handle, never the frame data.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub payload: Bytes,
    /// IDR frames reset decoder context; the drop policies in the frame
    /// bus and send queues never shed these except for a newer keyframe.
    pub is_keyframe: bool,
    /// Presentation timestamp, microseconds on the producer's monotonic clock.
    pub pts_us: i64,
    pub epoch: Epoch,
}

impl EncodedFrame {
    pub fn new(payload: Bytes, is_keyframe: bool, pts_us: i64, epoch: Epoch) -> Self {
        Self {
            payload,
            is_keyframe,
            pts_us,
            epoch,
        }
    }
}

/// SPS/PPS parameter sets required before any decode of the matching epoch.
///
/// Cached by the server and replayed to every session that joins (or
/// resumes) after the encoder produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecSpecificData {
    pub sps: Bytes,
    pub pps: Bytes,
    pub epoch: Epoch,
}

/// Direction of an audio frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    /// Viewer-to-server talkback.
    Up,
    /// Server-to-viewer monitoring audio.
    Down,
}

impl AudioDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioDirection::Up => "up",
            AudioDirection::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(AudioDirection::Up),
            "down" => Some(AudioDirection::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm,
    Aac,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm => "pcm",
            AudioFormat::Aac => "aac",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pcm" => Some(AudioFormat::Pcm),
            "aac" => Some(AudioFormat::Aac),
            _ => None,
        }
    }
}

/// One audio packet, either AAC downstream or PCM16LE talkback upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub payload: Bytes,
    pub direction: AudioDirection,
    pub format: AudioFormat,
    pub ts_us: i64,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioFrame {
    /// Talkback frames are always PCM16LE mono at 48 kHz.
    pub fn talkback(payload: Bytes, ts_us: i64) -> Self {
        Self {
            payload,
            direction: AudioDirection::Up,
            format: AudioFormat::Pcm,
            ts_us,
            sample_rate: 48_000,
            channels: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_clone_shares_payload() {
        let payload = Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]);
        let frame = EncodedFrame::new(payload.clone(), true, 1_000, 1);
        let cloned = frame.clone();

        // Bytes clones are refcounted handles over the same region.
        assert_eq!(cloned.payload.as_ptr(), frame.payload.as_ptr());
        assert!(cloned.is_keyframe);
    }

    #[test]
    fn audio_direction_roundtrip() {
        for dir in [AudioDirection::Up, AudioDirection::Down] {
            assert_eq!(AudioDirection::parse(dir.as_str()), Some(dir));
        }
        assert_eq!(AudioDirection::parse("sideways"), None);
    }

    #[test]
    fn talkback_frame_shape() {
        let frame = AudioFrame::talkback(Bytes::from_static(&[0u8; 4]), 42);
        assert_eq!(frame.direction, AudioDirection::Up);
        assert_eq!(frame.format, AudioFormat::Pcm);
        assert_eq!(frame.sample_rate, 48_000);
        assert_eq!(frame.channels, 1);
    }
}
