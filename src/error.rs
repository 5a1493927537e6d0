use thiserror::Error;

use crate::model::MessageId;

/// failures surfaced by the stream layer. aggregation itself never fails;
/// these cover the provider driver and lookups by id.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("provider error: {0}")]
    Provider(#[from] llm::error::LLMError),

    #[error("stream cancelled")]
    Cancelled,

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("stream inbox closed")]
    InboxClosed,

    #[error("stream inbox full")]
    InboxFull,
}
