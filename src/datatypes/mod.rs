// ABOUTME: Shared domain types for the streaming core: frames, configuration, state machines
// ABOUTME: Exports everything the codec, server, and viewer modules exchange across layer seams

pub mod config;
pub mod frame;
pub mod state;

pub use config::{
    DEFAULT_PORT, DeviceProfile, DeviceTier, ServerConfig, StreamConfig, ViewerCaps, ViewerConfig,
    parse_fps, parse_port,
};
pub use frame::{AudioDirection, AudioFormat, AudioFrame, CodecSpecificData, EncodedFrame, Epoch};
pub use state::{ConnectionState, SessionState, StreamStateCode};
