//! Channel adapters for humanlike.
//!
//! Adapters are pure I/O: they convert platform messages to/from
//! `InboundMessage` / `OutboundMessage`. Batching happens downstream.

mod console;
mod traits;
mod types;

pub use console::{ConsoleAdapter, ConsoleLine, parse_console_line};
pub use traits::ChannelAdapter;
pub use types::{InboundMessage, OutboundMessage};
