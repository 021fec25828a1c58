//! Sightline Session Service - Running question pipelines for many users
//!
//! Wraps the pipeline engine with everything a host needs to serve
//! concurrent questions:
//!
//! - `start_run` to begin a run and receive its progress stream
//! - `cancel_run` to stop a run by request ID
//! - `serve` to pump a run's events into an [`EventSink`](pipeline_engine::EventSink)
//! - A registry of live runs, one [`SessionHandle`] each
//!
//! Each run executes on its own tokio task. A panicking step fails only its
//! own run.

pub mod config;
pub mod error;
mod executor;
pub mod handle;
pub mod registry;
pub mod service;

pub use config::SessionServiceConfig;
pub use error::{Result, SessionServiceError};
pub use handle::SessionHandle;
pub use registry::{RegistrationGuard, SessionRegistry};
pub use service::{RunHandle, SessionService};
