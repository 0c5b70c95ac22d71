//! # Agent Conversations
//!
//! Protocol types and client-side state for the science agent backend.
//!
//! ## Overview
//!
//! The backend streams an LLM agent's reasoning over a WebSocket as
//! `response_chunk` deltas. Prose and generated programs arrive interleaved,
//! with ```` ```python ```` fences split at arbitrary chunk boundaries. This
//! library provides:
//! - Type-safe structures for the wire protocol ([`ServerEvent`], [`AgentCommand`])
//! - The stream reassembler that turns deltas into ordered text/code [`Block`]s
//! - A [`SessionView`] that applies push events in order (messages, execution
//!   log, code and output files, usage)
//! - Query helpers over a session
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_convo::{SessionView, ServerEvent, Block};
//!
//! let mut view = SessionView::new();
//! let events = [
//!     r#"{"type":"response_start","role":"assistant","id":"a1"}"#,
//!     r#"{"type":"response_chunk","id":"a1","text":"intro ```python\nprint(1"}"#,
//!     r#"{"type":"response_chunk","id":"a1","text":")\n``` outro"}"#,
//!     r#"{"type":"response_end","id":"a1"}"#,
//! ];
//! for raw in events {
//!     let event: ServerEvent = serde_json::from_str(raw).unwrap();
//!     view.apply(event).unwrap();
//! }
//!
//! let blocks = &view.message("a1").unwrap().blocks;
//! assert_eq!(blocks[0], Block::text("intro"));
//! assert_eq!(blocks[1].content(), "print(1)");
//! assert!(blocks[1].is_completed());
//! assert_eq!(blocks[2], Block::text("outro"));
//! ```

pub mod error;
pub mod execution;
pub mod protocol;
pub mod query;
pub mod reassembler;
pub mod session;
pub mod types;

pub use error::{ConvoError, Result};
pub use execution::ExecutionLog;
pub use protocol::{AgentCommand, CommandFrame, LlmOverride, ServerEvent};
pub use query::SessionQuery;
pub use reassembler::append_delta;
pub use session::{Change, SessionView};
pub use types::{
    AgentSession, Block, CodeFile, ExecutionLogEntry, HistoryItem, Message, MessageRole,
    OutputFile, SessionMetadata, SessionSource, Task, UploadedFile, UsageTotals,
};
