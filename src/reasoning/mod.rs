//! reasoning trace ingestion: payload parsing and step display normalization.

pub mod display;
pub mod parser;

pub use display::{normalize_step_text, StepDisplay, MAX_TITLE_CHARS};
pub use parser::parse_reasoning_event;
