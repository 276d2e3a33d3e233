// ABOUTME: Primary entry point: runs the stream server with a synthetic test-pattern encoder
// ABOUTME: Stands in for the camera-equipped device when developing against real viewers

use argh::FromArgs;
use bytes::Bytes;
use lookout::StreamServer;
use lookout::datatypes::{DeviceProfile, DeviceTier, ServerConfig, StreamConfig, parse_port};
use lookout::media::{Encoder, Recorder};
use lookout::server::ProducerHandle;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Surveillance primary with a synthetic encoder
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// listen port (default: 9090)
    #[argh(option)]
    port: Option<String>,

    /// viewer password
    #[argh(option)]
    password: String,

    /// treat this device as low tier (shallower queues)
    #[argh(switch)]
    low_tier: bool,
}

/// Synthetic encoder: no hardware behind it, but it honors every command
/// so the control loop behaves exactly as it would on a device.
struct SyntheticEncoder {
    running: Arc<AtomicBool>,
    keyframe_due: Arc<AtomicBool>,
    active: Option<StreamConfig>,
}

impl SyntheticEncoder {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            keyframe_due: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }
}

impl Encoder for SyntheticEncoder {
    fn start(&mut self, config: &StreamConfig) -> lookout::Result<()> {
        self.active = Some(*config);
        self.running.store(true, Ordering::SeqCst);
        self.keyframe_due.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_bitrate(&mut self, bitrate_bps: u32) {
        if let Some(config) = &mut self.active {
            config.bitrate_bps = bitrate_bps;
        }
    }

    fn request_keyframe(&mut self) {
        self.keyframe_due.store(true, Ordering::SeqCst);
    }

    fn reconfigure(&mut self, config: &StreamConfig) -> lookout::Result<()> {
        self.active = Some(*config);
        self.keyframe_due.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn active_dimensions(&self) -> Option<(u32, u32)> {
        self.active.map(|c| (c.width, c.height))
    }
}

/// Recorder stand-in; real muxing is a platform concern.
struct NullRecorder;

impl Recorder for NullRecorder {
    fn start(&mut self, include_audio: bool) -> lookout::Result<()> {
        info!(include_audio, "recorder started (null)");
        Ok(())
    }

    fn stop(&mut self) {
        info!("recorder stopped (null)");
    }

    fn on_camera_switched(&mut self) {}
}

/// Drive the producer side: one synthetic access unit per frame interval,
/// a keyframe at every GOP boundary or on request, and fresh CSD whenever
/// the epoch turns over.
async fn producer_loop(
    producer: ProducerHandle,
    running: Arc<AtomicBool>,
    keyframe_due: Arc<AtomicBool>,
) {
    const GOP: u32 = 30;
    let mut frame_index: u32 = 0;
    let mut csd_epoch = 0;

    loop {
        tokio::time::sleep(Duration::from_millis(33)).await;
        if !running.load(Ordering::SeqCst) {
            continue;
        }

        let epoch = producer.current_epoch();
        if epoch != csd_epoch {
            csd_epoch = epoch;
            frame_index = 0;
            producer.publish_csd(
                Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1f, 0x8c, 0x8d, 0x40]),
                Bytes::from_static(&[0x68, 0xce, 0x3c, 0x80]),
            );
        }

        let is_keyframe =
            frame_index % GOP == 0 || keyframe_due.swap(false, Ordering::SeqCst);
        let payload = synthetic_access_unit(frame_index, is_keyframe);
        if !producer.publish_frame(payload, is_keyframe, producer.now_us()) {
            tracing::debug!("frame bus shed a synthetic frame");
        }
        frame_index = frame_index.wrapping_add(1);
    }
}

fn synthetic_access_unit(index: u32, is_keyframe: bool) -> Bytes {
    // NAL-ish header plus a deterministic body; decodable by nothing,
    // useful for exercising the full wire path.
    let mut payload = vec![if is_keyframe { 0x65 } else { 0x41 }];
    payload.extend_from_slice(&index.to_be_bytes());
    payload.resize(if is_keyframe { 8 * 1024 } else { 2 * 1024 }, 0xA5);
    Bytes::from(payload)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args: CliArgs = argh::from_env();

    let level = if args.debugging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut profile = DeviceProfile::default();
    if args.low_tier {
        profile.tier = DeviceTier::Low;
    }
    let config = ServerConfig::new(args.password)
        .with_port(args.port.as_deref().map(parse_port).unwrap_or(9090))
        .with_profile(profile);

    let encoder = SyntheticEncoder::new();
    let running = encoder.running.clone();
    let keyframe_due = encoder.keyframe_due.clone();

    let server = StreamServer::bind(config, Box::new(encoder))
        .await?
        .with_recorder(Box::new(NullRecorder));
    info!(addr = %server.local_addr(), "primary ready");

    tokio::spawn(producer_loop(server.producer(), running, keyframe_due));
    server.run().await?;
    Ok(())
}
