//! # mediagrab
//!
//! Self-hosted media fetch service: a client submits a URL and a desired
//! output kind, then polls a task handle until the file is ready to
//! retrieve.
//!
//! ## Architecture
//!
//! ```text
//!        HTTP API (axum)
//!             |
//!             v
//!   TaskStore <---- Cleanup scheduler
//!             ^
//!             |  mutates in place
//!        Orchestrator (one worker per task, bounded pool)
//!             |
//!             v
//!   ExtractionEngine (yt-dlp subprocess, progress events)
//! ```
//!
//! ## Task Flow
//! 1. Submission creates a `Queued` task and spawns its worker
//! 2. The worker runs the attempt loop: fresh identity, metadata probe,
//!    download with live progress, artifact resolution
//! 3. Transient upstream failures retry with exponential backoff
//! 4. The cleanup scheduler evicts expired tasks and orphaned files
//!
//! ## Modules
//! - `task`: Task lifecycle, progress normalization, concurrent store
//! - `orchestrator`: attempt/retry state machine
//! - `engine`: extraction engine boundary and yt-dlp integration
//! - `resolver`: locating and normalizing produced files
//! - `cleanup`: time-based eviction
//! - `api`: HTTP surface

pub mod api;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod resolver;
pub mod task;

pub use config::Config;
pub use error::{ErrorKind, FetchError};
pub use orchestrator::Orchestrator;
pub use task::{MediaKind, Task, TaskId, TaskStage, TaskStore};
