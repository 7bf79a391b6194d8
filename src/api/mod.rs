//! HTTP API for mediagrab.
//!
//! ## Endpoints
//!
//! - `POST /api/download` - Submit a new download task
//! - `GET /api/status/{id}` - Poll task state and progress
//! - `GET /api/file/{id}` - Retrieve the finished file
//! - `DELETE /api/task/{id}` - Cancel/delete a task and its artifact
//! - `POST /api/info` - Probe media metadata without downloading
//! - `GET /api/health` - Health check

mod routes;
pub mod types;

pub use routes::{serve, AppState};
pub use types::*;
