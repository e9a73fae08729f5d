use crate::types::{FlushedBatch, SessionId};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Downstream receiver of flushed batches.
///
/// The engine calls the sink after releasing its session lock, at most once
/// per flush cycle, and never concurrently for the same session. Errors and
/// panics are caught and logged by the engine; the batch is not redelivered.
#[async_trait]
pub trait FlushSink: Send + Sync {
    async fn on_flush(&self, batch: &FlushedBatch) -> Result<()>;

    /// A flush cycle whose text was blank. Nothing should be forwarded.
    async fn on_empty(&self, _session_id: &SessionId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Flushed(FlushedBatch),
    Empty(SessionId),
}

/// Sink that forwards every flush event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FlushSink for ChannelSink {
    async fn on_flush(&self, batch: &FlushedBatch) -> Result<()> {
        self.tx
            .send(SinkEvent::Flushed(batch.clone()))
            .map_err(|_| anyhow::anyhow!("flush channel closed"))
    }

    async fn on_empty(&self, session_id: &SessionId) -> Result<()> {
        self.tx
            .send(SinkEvent::Empty(session_id.clone()))
            .map_err(|_| anyhow::anyhow!("flush channel closed"))
    }
}
