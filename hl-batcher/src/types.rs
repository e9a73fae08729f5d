use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// Opaque key of one buffered conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<&SessionId> for SessionId {
    fn from(value: &SessionId) -> Self {
        value.clone()
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl Deref for SessionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Threshold,
    Timeout,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Threshold => f.write_str("threshold"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// One drained accumulation cycle, ready for the downstream responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushedBatch {
    pub session_id: SessionId,
    pub text: String,
    pub item_count: usize,
    pub truncated: bool,
    pub trigger: FlushTrigger,
    pub flushed_at: DateTime<Utc>,
}

/// Outcome of a single `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestResult {
    /// The item was appended and the session's debounce timer re-armed.
    Buffered,
    /// The item completed the batch; it was drained and handed to the sink.
    Flushed(FlushedBatch),
    /// The batch reached the threshold but its text was blank, so nothing was
    /// forwarded downstream.
    FlushedEmpty,
}

impl IngestResult {
    pub fn is_flush(&self) -> bool {
        !matches!(self, Self::Buffered)
    }

    pub fn batch(&self) -> Option<&FlushedBatch> {
        match self {
            Self::Flushed(batch) => Some(batch),
            _ => None,
        }
    }
}
