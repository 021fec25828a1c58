//! Sightline Collaborators
//!
//! Reference implementations of the collaborator traits defined by
//! `pipeline-engine`:
//!
//! - [`OpenAiClient`]: completion and structured extraction over any
//!   OpenAI-compatible chat API
//! - [`HttpQueryBackend`]: query execution against an HTTP query service
//! - [`InMemoryHistoryStore`]: per-session conversation history
//! - [`ChannelEventSink`] and [`JsonLinesEventSink`]: progress transports

pub mod history;
pub mod llm;
pub mod query_backend;
pub mod sinks;

pub use history::InMemoryHistoryStore;
pub use llm::{LlmConfig, OpenAiClient};
pub use query_backend::{HttpQueryBackend, QueryBackendConfig};
pub use sinks::{ChannelEventSink, JsonLinesEventSink};
