use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::{Result, anyhow};
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

type LineReader = Box<dyn AsyncBufRead + Send + Unpin>;
type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-oriented channel over a reader/writer pair (stdin/stdout by default).
///
/// Each input line is one message:
/// - `alice: hello` is a private message from `alice`;
/// - `#room alice: hello` is a message from `alice` in group `room`.
#[derive(Clone)]
pub struct ConsoleAdapter {
    input: Arc<Mutex<Option<LineReader>>>,
    output: Arc<Mutex<LineWriter>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub group_id: Option<String>,
    pub sender_id: String,
    pub content: String,
}

impl ConsoleAdapter {
    pub fn stdio() -> Self {
        Self::with_io(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
    }

    pub fn with_io(
        input: impl AsyncBufRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            input: Arc::new(Mutex::new(Some(Box::new(input)))),
            output: Arc::new(Mutex::new(Box::new(output))),
        }
    }

    async fn read_loop(mut input: LineReader, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut line = String::new();
        let mut line_no = 0u64;
        loop {
            line.clear();
            if input.read_line(&mut line).await? == 0 {
                tracing::info!(lines = line_no, "console input closed");
                return Ok(());
            }
            line_no += 1;
            let raw = line.trim_end_matches(['\r', '\n']);
            if raw.trim().is_empty() {
                continue;
            }
            let Some(parsed) = parse_console_line(raw) else {
                tracing::warn!(line_no, "console line ignored; expected `[#group] sender: text`");
                continue;
            };
            let inbound = InboundMessage {
                message_id: Uuid::new_v4().to_string(),
                channel_id: "console".to_string(),
                sender_id: parsed.sender_id,
                group_id: parsed.group_id,
                content: parsed.content,
                metadata: serde_json::json!({ "line": line_no }),
                received_at: Utc::now(),
            };
            if tx.send(inbound).await.is_err() {
                return Err(anyhow!("console inbound queue closed"));
            }
        }
    }
}

/// Parses `[#group] sender: text`. Content keeps its inner whitespace, only the
/// single space after the colon is dropped.
pub fn parse_console_line(line: &str) -> Option<ConsoleLine> {
    let line = line.trim_start();
    let (group_id, rest) = match line.strip_prefix('#') {
        Some(grouped) => {
            let (group, rest) = grouped.split_once(char::is_whitespace)?;
            if group.is_empty() {
                return None;
            }
            (Some(group.to_string()), rest.trim_start())
        }
        None => (None, line),
    };
    let (sender, content) = rest.split_once(':')?;
    let sender = sender.trim();
    if sender.is_empty() || sender.contains(char::is_whitespace) {
        return None;
    }
    let content = content.strip_prefix(' ').unwrap_or(content);
    Some(ConsoleLine {
        group_id,
        sender_id: sender.to_string(),
        content: content.to_string(),
    })
}

#[async_trait::async_trait]
impl ChannelAdapter for ConsoleAdapter {
    fn channel_id(&self) -> &str {
        "console"
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let input = self
            .input
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("console adapter already started"))?;
        tokio::spawn(async move {
            if let Err(e) = Self::read_loop(input, tx).await {
                tracing::error!(%e, "console read loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let recipient_id = recipient_id.trim();
        if recipient_id.is_empty() {
            return Err(anyhow!("recipient_id is required"));
        }
        let rendered = format!("[to {recipient_id}] {}\n", message.content);
        let mut output = self.output.lock().await;
        output.write_all(rendered.as_bytes()).await?;
        output.flush().await?;
        Ok(())
    }
}
