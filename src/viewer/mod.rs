// ABOUTME: Viewer client module: connection state machine, jitter buffer, watchdogs
// ABOUTME: Mirrors the server's session machinery from the receiving side

pub mod client;
pub mod error;
pub mod jitter;
pub mod watchdog;

pub use client::{ViewerClient, ViewerCommand, ViewerHandle};
pub use error::{ViewerError, ViewerResult};
pub use jitter::{DecodeQueue, DecodeQueueStats, PressureSignal};
pub use watchdog::{Backoff, WatchdogAction, Watchdogs};
