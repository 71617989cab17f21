use tokio::sync::mpsc;
use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::types::FireEvent;

/// Receives fire events. Implementations must not block the engine.
pub trait FireSink: Send + Sync + 'static {
    fn on_fire(&self, event: &FireEvent) -> Result<()>;
}

/// Forwards events over a bounded mpsc channel with `try_send`.
///
/// A full or closed channel drops the event and reports `SinkClosed`.
pub struct ChannelSink {
    tx: mpsc::Sender<FireEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<FireEvent>) -> Self {
        Self { tx }
    }

    /// Convenience: a sink plus the receiving half of a fresh channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FireEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl FireSink for ChannelSink {
    fn on_fire(&self, event: &FireEvent) -> Result<()> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SchedulerError::SinkClosed("channel full".into()),
            mpsc::error::TrySendError::Closed(_) => {
                SchedulerError::SinkClosed("receiver dropped".into())
            }
        })
    }
}

/// Writes each event to the log and nothing else.
#[derive(Debug, Default)]
pub struct LogSink;

impl FireSink for LogSink {
    fn on_fire(&self, event: &FireEvent) -> Result<()> {
        let next = event
            .next_alarm_time
            .map(|t| t.to_string())
            .unwrap_or_else(|| "never".to_string());
        info!(
            rule_id = %event.rule_id,
            rule_name = %event.rule_name,
            triggered_at = %event.triggered_at,
            next = %next,
            notify = event.notification_enabled,
            "alarm fired"
        );
        Ok(())
    }
}
