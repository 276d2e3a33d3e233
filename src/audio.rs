// ABOUTME: AAC/ADTS packaging for downstream audio and the ref-counted microphone engine
// ABOUTME: The mic stays open exactly while streaming or recording holds a reference

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::broadcast;

/// Fixed ADTS header size; no CRC variant is ever emitted
/// (protection_absent = 1).
pub const ADTS_HEADER_LEN: usize = 7;

/// ADTS profile field for AAC-LC. This must be 1; decoders reject other
/// profiles for this stream.
const ADTS_PROFILE_LC: u8 = 1;

/// VBR marker for the buffer-fullness field.
const ADTS_FULLNESS_VBR: u16 = 0x7FF;

/// Sampling-frequency index per the AAC table (48 kHz → 3).
pub fn sample_rate_index(rate: u32) -> Option<u8> {
    match rate {
        96_000 => Some(0),
        88_200 => Some(1),
        64_000 => Some(2),
        48_000 => Some(3),
        44_100 => Some(4),
        32_000 => Some(5),
        24_000 => Some(6),
        22_050 => Some(7),
        16_000 => Some(8),
        12_000 => Some(9),
        11_025 => Some(10),
        8_000 => Some(11),
        7_350 => Some(12),
        _ => None,
    }
}

/// Prefix a raw AAC-LC payload with a 7-byte ADTS header. The length
/// field is patched per packet; `raw_data_blocks_in_frame` is 0.
///
/// Returns `None` for unsupported sample rates or payloads that cannot
/// fit the 13-bit frame-length field.
pub fn adts_wrap(payload: &[u8], sample_rate: u32, channels: u8) -> Option<Bytes> {
    let index = sample_rate_index(sample_rate)?;
    let frame_len = ADTS_HEADER_LEN + payload.len();
    if frame_len > 0x1FFF {
        return None;
    }
    let frame_len = frame_len as u16;

    let mut buf = BytesMut::with_capacity(frame_len as usize);
    buf.put_u8(0xFF);
    buf.put_u8(0xF1);
    buf.put_u8((ADTS_PROFILE_LC << 6) | (index << 2) | (channels >> 2));
    buf.put_u8(((channels & 0x3) << 6) | ((frame_len >> 11) as u8 & 0x3));
    buf.put_u8((frame_len >> 3) as u8);
    buf.put_u8((((frame_len & 0x7) as u8) << 5) | ((ADTS_FULLNESS_VBR >> 6) as u8 & 0x1F));
    buf.put_u8(((ADTS_FULLNESS_VBR & 0x3F) as u8) << 2);
    buf.put_slice(payload);
    Some(buf.freeze())
}

/// Hardware side of the microphone. Opened and closed only on reference
/// count edges.
pub trait AudioHardware: Send {
    fn open(&mut self) -> crate::Result<()>;
    fn close(&mut self);
}

/// Reference mark a consumer holds on the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicUse {
    Streaming,
    Recording,
}

/// Multi-consumer PCM broadcast with a ref-counted hardware lifecycle.
///
/// Streaming and recording each keep their own count; the microphone
/// opens on the first acquire of either kind and closes when both counts
/// reach zero. Captured PCM is fanned out over a broadcast channel so
/// slow consumers lag independently.
pub struct AudioSourceEngine {
    hardware: Box<dyn AudioHardware>,
    streaming_refs: usize,
    recording_refs: usize,
    pcm_tx: broadcast::Sender<Bytes>,
}

impl AudioSourceEngine {
    pub fn new(hardware: Box<dyn AudioHardware>) -> Self {
        let (pcm_tx, _) = broadcast::channel(32);
        Self {
            hardware,
            streaming_refs: 0,
            recording_refs: 0,
            pcm_tx,
        }
    }

    fn total_refs(&self) -> usize {
        self.streaming_refs + self.recording_refs
    }

    /// Take a reference; opens the hardware on the 0 → 1 edge.
    pub fn acquire(&mut self, usage: MicUse) -> crate::Result<()> {
        if self.total_refs() == 0 {
            self.hardware.open()?;
            tracing::debug!("microphone opened");
        }
        match usage {
            MicUse::Streaming => self.streaming_refs += 1,
            MicUse::Recording => self.recording_refs += 1,
        }
        Ok(())
    }

    /// Drop a reference; closes the hardware on the 1 → 0 edge. Releasing
    /// an unheld reference is a no-op.
    pub fn release(&mut self, usage: MicUse) {
        let count = match usage {
            MicUse::Streaming => &mut self.streaming_refs,
            MicUse::Recording => &mut self.recording_refs,
        };
        if *count == 0 {
            tracing::warn!(?usage, "release without matching acquire");
            return;
        }
        *count -= 1;
        if self.total_refs() == 0 {
            self.hardware.close();
            tracing::debug!("microphone closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.total_refs() > 0
    }

    /// Subscribe to captured PCM. Each subscriber sees every chunk
    /// published after it subscribed, subject to the channel's lag bound.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.pcm_tx.subscribe()
    }

    /// Called by the capture callback with a chunk of PCM16LE samples.
    pub fn publish_pcm(&self, chunk: Bytes) {
        // No receivers is normal when neither streaming nor recording
        // consumes audio right now.
        let _ = self.pcm_tx.send(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMic {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl AudioHardware for CountingMic {
        fn open(&mut self) -> crate::Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine() -> (AudioSourceEngine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let engine = AudioSourceEngine::new(Box::new(CountingMic {
            opens: opens.clone(),
            closes: closes.clone(),
        }));
        (engine, opens, closes)
    }

    #[test]
    fn adts_header_bytes_for_48k_mono() {
        let payload = vec![0xAAu8; 256];
        let wrapped = adts_wrap(&payload, 48_000, 1).unwrap();

        assert_eq!(wrapped.len(), ADTS_HEADER_LEN + 256);
        // frame_length = 263, index = 3, profile = LC, fullness = 0x7FF.
        assert_eq!(
            &wrapped[..ADTS_HEADER_LEN],
            &[0xFF, 0xF1, 0x4C, 0x40, 0x20, 0xFF, 0xFC]
        );
        assert_eq!(&wrapped[ADTS_HEADER_LEN..], payload.as_slice());
    }

    #[test]
    fn adts_rejects_unsupported_rate_and_oversize() {
        assert!(adts_wrap(&[0u8; 10], 48_001, 1).is_none());
        assert!(adts_wrap(&vec![0u8; 0x2000], 48_000, 1).is_none());
    }

    #[test]
    fn sample_rate_table() {
        assert_eq!(sample_rate_index(48_000), Some(3));
        assert_eq!(sample_rate_index(44_100), Some(4));
        assert_eq!(sample_rate_index(8_000), Some(11));
        assert_eq!(sample_rate_index(48_123), None);
    }

    #[test]
    fn mic_opens_once_across_both_uses() {
        let (mut engine, opens, closes) = engine();

        engine.acquire(MicUse::Streaming).unwrap();
        engine.acquire(MicUse::Recording).unwrap();
        engine.acquire(MicUse::Streaming).unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(engine.is_open());

        engine.release(MicUse::Streaming);
        engine.release(MicUse::Recording);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        engine.release(MicUse::Streaming);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!engine.is_open());

        // Unbalanced release does not close twice.
        engine.release(MicUse::Recording);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pcm_broadcast_reaches_every_subscriber() {
        let (engine, _, _) = engine();
        let mut a = engine.subscribe();
        let mut b = engine.subscribe();

        engine.publish_pcm(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(a.try_recv().unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert_eq!(b.try_recv().unwrap(), Bytes::from_static(&[1, 2, 3]));
    }
}
