// ABOUTME: Viewer entry point: connects to a primary and logs the received stream
// ABOUTME: Headless stand-in for the rendering client, handy for soak tests

use argh::FromArgs;
use lookout::ViewerClient;
use lookout::datatypes::{CodecSpecificData, ConnectionState, EncodedFrame, ViewerConfig, parse_port};
use lookout::media::VideoSink;
use std::error::Error;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Headless surveillance viewer
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// primary host (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// primary port (default: 9090)
    #[argh(option)]
    port: Option<String>,

    /// viewer password
    #[argh(option)]
    password: String,

    /// use legacy v2 text framing instead of v3 binary frames
    #[argh(switch)]
    legacy: bool,
}

/// Sink that counts instead of decoding.
#[derive(Default)]
struct LoggingSink {
    frames: u64,
    keyframes: u64,
    bytes: u64,
}

impl VideoSink for LoggingSink {
    fn on_codec_data(&mut self, csd: &CodecSpecificData) {
        info!(
            epoch = csd.epoch,
            sps = csd.sps.len(),
            pps = csd.pps.len(),
            "codec data"
        );
    }

    fn on_frame(&mut self, frame: &EncodedFrame) {
        self.frames += 1;
        self.bytes += frame.payload.len() as u64;
        if frame.is_keyframe {
            self.keyframes += 1;
        }
        if self.frames % 300 == 0 {
            info!(
                frames = self.frames,
                keyframes = self.keyframes,
                mib = self.bytes / (1024 * 1024),
                "stream progress"
            );
        }
    }

    fn on_rotation(&mut self, degrees: u16) {
        info!(degrees, "display rotation");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: CliArgs = argh::from_env();

    let level = if args.debugging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let host = args.host.unwrap_or_else(|| "localhost".to_string());
    let mut config = ViewerConfig::new(host, args.password)
        .with_port(args.port.as_deref().map(parse_port).unwrap_or(9090));
    if args.legacy {
        config = config.with_legacy_framing();
    }

    let (client, mut handle) = ViewerClient::new(config, Box::new(LoggingSink::default()));
    let state_task = tokio::spawn(async move {
        for state in [
            ConnectionState::Connected,
            ConnectionState::Authenticated,
            ConnectionState::Streaming,
        ] {
            handle.wait_for_state(state).await;
            info!(?state, "viewer reached state");
        }
    });

    client.run().await?;
    state_task.abort();
    Ok(())
}
