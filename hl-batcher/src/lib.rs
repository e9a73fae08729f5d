//! Per-session message batching for humanlike.
//!
//! Inbound chat messages are buffered per session and released as a single
//! batch once a count threshold is reached or the session has been quiet for
//! the configured timeout. Stale sessions are reaped without delivery.

mod buffer;
mod config;
mod engine;
mod error;
mod mention;
mod reaper;
mod sink;
mod types;

pub use buffer::truncate_chars;
pub use config::{EngineConfig, MentionCacheConfig};
pub use engine::{DebounceEngine, EngineStatsSnapshot};
pub use error::{BatcherError, Result, panic_payload_to_string};
pub use mention::{CachedMessage, MentionCache, render_history};
pub use reaper::ReapReport;
pub use sink::{ChannelSink, FlushSink, SinkEvent};
pub use types::{FlushTrigger, FlushedBatch, IngestResult, SessionId};
