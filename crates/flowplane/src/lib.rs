//! Flowplane - workflow execution engine.
//!
//! Executes versioned workflow definitions against business entities:
//! conditional branches, human tasks, delays, parallel fan-out/join,
//! outbound HTTP calls, and sub-workflows, all driven through a durable job
//! queue with worker leasing and optimistic concurrency on instance state.
//!
//! The [`engine::WorkflowEngine`] is the façade; persistence sits behind the
//! traits in [`store`], with in-memory implementations for tests and
//! embedded use. Background processing lives in [`runtime`].
//!
//! ```no_run
//! use flowplane::engine::{StartWorkflowRequest, WorkflowEngine};
//!
//! # async fn run() -> flowplane::error::EngineResult<()> {
//! let engine = WorkflowEngine::in_memory();
//! // ... create and publish a definition ...
//! # let definition_id = uuid::Uuid::new_v4();
//! let instance = engine
//!     .start_workflow(StartWorkflowRequest::new(definition_id))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod model;
pub mod notify;
pub mod runtime;
pub mod store;
pub mod template;

pub use engine::WorkflowEngine;
pub use error::{EngineError, EngineResult};

/// Initialize tracing from `RUST_LOG`, loading `.env` first.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
