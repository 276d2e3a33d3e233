// ABOUTME: Control intents posted from any task and drained by the single control loop
// ABOUTME: The only way session/IO code may reach encoder, camera, or recording state

use crate::datatypes::StreamConfig;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Bound of the command bus. Commands are rare relative to frames; a
/// full bus means the control loop is wedged and shedding is correct.
pub const COMMAND_BUS_DEPTH: usize = 64;

/// A control intent. Posting is non-blocking from any task; execution
/// happens exclusively on the control loop, which is the only code that
/// ever takes the encoder lock.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    RequestKeyframe,
    StartRecording,
    StopRecording,
    ReconfigureStream(StreamConfig),
    /// A session's send queue is shedding; sized for observability.
    Backpressure(Uuid),
    PressureClear(Uuid),
    AdjustBitrate(u32),
    SwitchCamera,
    Zoom(f32),
    /// Posted when the producer signals a stalled encoder; the control
    /// loop performs a cooldown-guarded stop/start and bumps the epoch.
    RecoverEncoder,
}

/// Cloneable posting handle for [`StreamCommand`]s.
#[derive(Debug, Clone)]
pub struct CommandBus {
    tx: mpsc::Sender<StreamCommand>,
}

impl CommandBus {
    /// Create the bus and hand back the single consumer end.
    pub fn new() -> (CommandBus, mpsc::Receiver<StreamCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUS_DEPTH);
        (CommandBus { tx }, rx)
    }

    /// Post a command without blocking. Returns `false` if the bus is
    /// full or the control loop is gone; both are logged, not fatal.
    pub fn post(&self, command: StreamCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                tracing::warn!(?cmd, "command bus full, shedding command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(cmd)) => {
                tracing::debug!(?cmd, "command bus closed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn posted_commands_arrive_in_order() {
        let (bus, mut rx) = CommandBus::new();
        assert!(bus.post(StreamCommand::RequestKeyframe));
        assert!(bus.post(StreamCommand::AdjustBitrate(500_000)));
        assert!(bus.post(StreamCommand::SwitchCamera));

        assert_eq!(rx.recv().await, Some(StreamCommand::RequestKeyframe));
        assert_eq!(rx.recv().await, Some(StreamCommand::AdjustBitrate(500_000)));
        assert_eq!(rx.recv().await, Some(StreamCommand::SwitchCamera));
    }

    #[tokio::test]
    async fn full_bus_sheds_instead_of_blocking() {
        let (bus, rx) = CommandBus::new();
        for _ in 0..COMMAND_BUS_DEPTH {
            assert!(bus.post(StreamCommand::RequestKeyframe));
        }
        assert!(!bus.post(StreamCommand::RequestKeyframe));
        drop(rx);
        assert!(!bus.post(StreamCommand::RequestKeyframe));
    }

    #[tokio::test]
    async fn posting_works_from_many_tasks() {
        let (bus, mut rx) = CommandBus::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                bus.post(StreamCommand::RequestKeyframe)
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        for _ in 0..8 {
            assert_eq!(rx.recv().await, Some(StreamCommand::RequestKeyframe));
        }
    }
}
