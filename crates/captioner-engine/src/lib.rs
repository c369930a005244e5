//! captioner-engine — Result cache and pipeline orchestration.
//!
//! [`Orchestrator`] owns the extractor, the generator, the [`ResultCache`]
//! and the table store for the lifetime of the process. Each unique image is
//! computed at most once: cache hits return immediately, concurrent
//! duplicates share a single in-flight computation, and failures are never
//! cached.

pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;

pub use cache::{CacheConsistencyError, Lease, Reservation, ResultCache, Waiter};
pub use config::{Config, ConfigError};
pub use error::{EngineError, PipelineError};
pub use orchestrator::{Orchestrator, OrchestratorStats, Stage};
