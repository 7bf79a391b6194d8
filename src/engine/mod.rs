//! Extraction engine boundary.
//!
//! The engine resolves a source URL into retrievable media. It is a black
//! box to the orchestration core: it accepts a URL plus options and either
//! produces a file in the working directory or fails. The trait keeps the
//! core testable (tests drive it with a mock) and confines the real CLI
//! integration to [`ytdlp`].

pub mod events;
pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::FetchError;
use crate::identity::Identity;
use events::EngineEvent;

/// Per-attempt invocation options.
///
/// The output template embeds the task id so the produced file can be found
/// again; `retries`/`fragment_retries` are the engine's own partial-transfer
/// retries, distinct from the orchestrator's attempt-level retry.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub format: String,
    pub output_template: String,
    pub working_dir: PathBuf,
    pub user_agent: String,
    pub player_client: String,
    pub socket_timeout_secs: u64,
    pub retries: u32,
    pub fragment_retries: u32,
}

impl EngineOptions {
    pub fn new(working_dir: PathBuf, identity: &Identity) -> Self {
        Self {
            format: "best".to_string(),
            output_template: String::new(),
            working_dir,
            user_agent: identity.user_agent.to_string(),
            player_client: identity.player_client.to_string(),
            socket_timeout_secs: 30,
            retries: 10,
            fragment_retries: 10,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_output_template(mut self, template: impl Into<String>) -> Self {
        self.output_template = template.into();
        self
    }
}

/// Metadata returned by the engine's info-only query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
}

#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    /// Metadata-only query; no file is written.
    async fn probe(&self, url: &str, opts: &EngineOptions) -> Result<MediaInfo, FetchError>;

    /// Start a download. Progress arrives on the returned channel; the join
    /// handle resolves with the final outcome once the engine exits.
    async fn download(
        &self,
        url: &str,
        opts: &EngineOptions,
    ) -> Result<(mpsc::Receiver<EngineEvent>, JoinHandle<Result<(), FetchError>>), FetchError>;
}
