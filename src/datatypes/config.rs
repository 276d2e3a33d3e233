// ABOUTME: Stream/session configuration types, device profiles, and boundary parsers
// ABOUTME: The server holds the authoritative StreamConfig; viewers only request changes

use std::time::Duration;

/// Default TCP port for the primary's listener.
pub const DEFAULT_PORT: u16 = 9090;

/// Encoder output parameters. Requested by the viewer via `SET_STREAM`,
/// arbitrated by the server, echoed back in `STREAM_ACCEPTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u8,
    pub bitrate_bps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_bps: 2_000_000,
        }
    }
}

impl StreamConfig {
    /// True when applying `other` would require an encoder restart (and
    /// therefore an epoch bump). Bitrate alone can change in place.
    pub fn needs_restart(&self, other: &StreamConfig) -> bool {
        self.width != other.width || self.height != other.height || self.fps != other.fps
    }

    /// Clamp this request against a viewer's advertised capabilities.
    pub fn clamped_to(&self, caps: &ViewerCaps) -> StreamConfig {
        StreamConfig {
            width: self.width.min(caps.max_width),
            height: self.height.min(caps.max_height),
            fps: self.fps,
            bitrate_bps: self.bitrate_bps.min(caps.max_bitrate_bps),
        }
    }
}

/// Capabilities a viewer announces once per session via `CAPS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerCaps {
    pub max_width: u32,
    pub max_height: u32,
    pub max_bitrate_bps: u32,
}

impl Default for ViewerCaps {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            max_bitrate_bps: 4_000_000,
        }
    }
}

/// Rough device class used to size the bounded frame queues. Slower
/// devices get shallower queues so shedding starts before latency builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTier {
    Low,
    Mid,
    High,
}

impl DeviceTier {
    /// Depth of the per-session (server) and decode (viewer) frame queues.
    pub fn frame_queue_depth(&self) -> usize {
        match self {
            DeviceTier::Low => 15,
            DeviceTier::Mid => 25,
            DeviceTier::High => 30,
        }
    }
}

/// Probed device characteristics the core consumes as-is.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Encoder ignores requested dimensions and reports its own.
    pub prefer_buffer_mode: bool,
    /// Whether the idle governor may lower fps.
    pub allow_fps_governor: bool,
    pub allow_dynamic_bitrate: bool,
    /// Supported capture resolutions, largest first.
    pub ladder: Vec<(u32, u32)>,
    pub tier: DeviceTier,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            prefer_buffer_mode: false,
            allow_fps_governor: true,
            allow_dynamic_bitrate: true,
            ladder: vec![(1920, 1080), (1280, 720), (640, 480)],
            tier: DeviceTier::Mid,
        }
    }
}

/// Parse a port string. `0` and anything above 65535 (or non-numeric)
/// fall back to [`DEFAULT_PORT`].
pub fn parse_port(s: &str) -> u16 {
    match s.trim().parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => p as u16,
        _ => DEFAULT_PORT,
    }
}

/// Parse an fps string. Valid range is 1..=120; anything else is rejected.
pub fn parse_fps(s: &str) -> Option<u8> {
    match s.trim().parse::<u32>() {
        Ok(f) if (1..=120).contains(&f) => Some(f as u8),
        _ => None,
    }
}

/// Server-side configuration for [`crate::server::StreamServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub password: String,
    /// Authenticated-session cap; excess connections get `AUTH_FAIL`
    /// after the challenge so the cap is not fingerprintable.
    pub max_sessions: usize,
    /// How long a disconnected session id stays resumable.
    pub resume_window: Duration,
    /// Inbound silence tolerated before the server closes a session.
    pub heartbeat_timeout: Duration,
    /// Handshake must complete within this window.
    pub handshake_timeout: Duration,
    /// Idle-governor entry hysteresis.
    pub idle_grace: Duration,
    pub profile: DeviceProfile,
    pub initial_stream: StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            password: String::new(),
            max_sessions: 8,
            resume_window: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            idle_grace: Duration::from_secs(10),
            profile: DeviceProfile::default(),
            initial_stream: StreamConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = profile;
        self
    }
}

/// Viewer-side configuration for [`crate::viewer::ViewerClient`].
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Requested protocol version; the codec clamps it to `[2, 3]`.
    pub protocol_version: u8,
    pub tier: DeviceTier,
    pub caps: ViewerCaps,
    pub requested_stream: StreamConfig,
    pub auto_reconnect: bool,
    /// Warmup delay before handing the first decoded surface to the UI;
    /// suppresses the green-flash some panels show on decoder start.
    pub render_warmup: Duration,
}

impl ViewerConfig {
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            password: password.into(),
            protocol_version: 3,
            tier: DeviceTier::Mid,
            caps: ViewerCaps::default(),
            requested_stream: StreamConfig::default(),
            auto_reconnect: true,
            render_warmup: Duration::from_millis(120),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Pin the legacy text framing instead of v3 binary frames.
    pub fn with_legacy_framing(mut self) -> Self {
        self.protocol_version = 2;
        self
    }

    pub fn with_tier(mut self, tier: DeviceTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parser_boundaries() {
        assert_eq!(parse_port("1"), 1);
        assert_eq!(parse_port("65535"), 65535);
        assert_eq!(parse_port("9090"), 9090);

        assert_eq!(parse_port("0"), DEFAULT_PORT);
        assert_eq!(parse_port("65536"), DEFAULT_PORT);
        assert_eq!(parse_port("-1"), DEFAULT_PORT);
        assert_eq!(parse_port("http"), DEFAULT_PORT);
        assert_eq!(parse_port(""), DEFAULT_PORT);
    }

    #[test]
    fn fps_parser_boundaries() {
        assert_eq!(parse_fps("1"), Some(1));
        assert_eq!(parse_fps("30"), Some(30));
        assert_eq!(parse_fps("120"), Some(120));

        assert_eq!(parse_fps("0"), None);
        assert_eq!(parse_fps("121"), None);
        assert_eq!(parse_fps("abc"), None);
    }

    #[test]
    fn restart_detection() {
        let base = StreamConfig::default();

        let mut bitrate_only = base;
        bitrate_only.bitrate_bps = 500_000;
        assert!(!base.needs_restart(&bitrate_only));

        let mut resized = base;
        resized.width = 640;
        resized.height = 480;
        assert!(base.needs_restart(&resized));

        let mut fps_change = base;
        fps_change.fps = 15;
        assert!(base.needs_restart(&fps_change));
    }

    #[test]
    fn config_clamped_to_caps() {
        let request = StreamConfig {
            width: 3840,
            height: 2160,
            fps: 30,
            bitrate_bps: 8_000_000,
        };
        let caps = ViewerCaps::default();
        let clamped = request.clamped_to(&caps);

        assert_eq!(clamped.width, 1920);
        assert_eq!(clamped.height, 1080);
        assert_eq!(clamped.bitrate_bps, 4_000_000);
        assert_eq!(clamped.fps, 30);
    }

    #[test]
    fn tier_queue_depths() {
        assert_eq!(DeviceTier::Low.frame_queue_depth(), 15);
        assert_eq!(DeviceTier::Mid.frame_queue_depth(), 25);
        assert_eq!(DeviceTier::High.frame_queue_depth(), 30);
    }
}
