//! Agent Memory System
//!
//! Per-session turn history, the context store that owns live sessions,
//! and budget-driven compaction with model summarization

pub mod compactor;
pub mod context_store;
pub mod store;
pub mod summarizer;

pub use compactor::{CompactionConfig, CompactionReport, ContextCompactor};
pub use context_store::{ContextStore, SharedSession};
pub use store::{Session, Turn, TurnKind, TurnRole};
pub use summarizer::ContextSummarizer;
