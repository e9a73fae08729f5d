use crate::types::SessionId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatcherError>;

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("debounce engine must be created inside a tokio runtime")]
    NoRuntime,

    #[error("flush sink failed for session {session_id}: {message}")]
    Sink {
        session_id: SessionId,
        message: String,
    },

    #[error("debounce engine is shut down")]
    ShutDown,
}

impl BatcherError {
    pub(crate) fn sink(session_id: &SessionId, message: impl Into<String>) -> Self {
        Self::Sink {
            session_id: session_id.clone(),
            message: message.into(),
        }
    }
}

/// Message carried by a caught panic.
pub fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
