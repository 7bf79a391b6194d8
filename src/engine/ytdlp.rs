//! yt-dlp CLI integration.
//!
//! Spawns the yt-dlp binary per call and parses its line-oriented output:
//! the info query dumps one JSON document on stdout, the download emits one
//! JSON progress line per update through `--progress-template`. stderr is
//! drained on its own task (yt-dlp blocks when the pipe fills) and its tail
//! is kept for failure classification.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{classify_engine_failure, FetchError};

use super::events::EngineEvent;
use super::{EngineOptions, ExtractionEngine, MediaInfo};

/// One JSON object per progress update, keyed by the engine's phase.
const PROGRESS_TEMPLATE: &str = concat!(
    "download:{\"status\":\"%(progress.status)s\",",
    "\"downloaded_bytes\":%(progress.downloaded_bytes|0)d,",
    "\"total_bytes\":%(progress.total_bytes|0)d,",
    "\"total_bytes_estimate\":%(progress.total_bytes_estimate|0)d,",
    "\"speed\":\"%(progress._speed_str|)s\",",
    "\"eta\":\"%(progress._eta_str|)s\"}"
);

/// How many trailing stderr lines to keep for classification.
const STDERR_TAIL: usize = 20;

pub struct YtDlpEngine {
    cli_path: String,
}

impl YtDlpEngine {
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn base_command(&self, opts: &EngineOptions) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.current_dir(&opts.working_dir)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--socket-timeout")
            .arg(opts.socket_timeout_secs.to_string())
            .arg("--user-agent")
            .arg(&opts.user_agent)
            .arg("--extractor-args")
            .arg(format!("youtube:player_client={}", opts.player_client))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Callers run under timeouts and may drop us mid-flight; the
        // process must not linger past its owning future.
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    async fn probe(&self, url: &str, opts: &EngineOptions) -> Result<MediaInfo, FetchError> {
        let mut cmd = self.base_command(opts);
        cmd.arg("--dump-single-json").arg("--no-download").arg("--").arg(url);

        debug!("Probing media info: url={}", url);
        let output = cmd.output().await.map_err(|e| {
            FetchError::Storage(format!(
                "failed to spawn yt-dlp: {}. Is it installed at '{}'?",
                e, self.cli_path
            ))
        })?;

        if !output.status.success() {
            return Err(classify_engine_failure(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            FetchError::TransientUpstream(format!("unparseable metadata from engine: {}", e))
        })
    }

    async fn download(
        &self,
        url: &str,
        opts: &EngineOptions,
    ) -> Result<(mpsc::Receiver<EngineEvent>, JoinHandle<Result<(), FetchError>>), FetchError>
    {
        let (tx, rx) = mpsc::channel(256);

        let mut cmd = self.base_command(opts);
        cmd.arg("--newline")
            .arg("--quiet")
            .arg("--progress")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--continue")
            .arg("--retries")
            .arg(opts.retries.to_string())
            .arg("--fragment-retries")
            .arg(opts.fragment_retries.to_string())
            .arg("-f")
            .arg(&opts.format)
            .arg("-o")
            .arg(&opts.output_template)
            .arg("--")
            .arg(url);

        info!(
            "Spawning yt-dlp: format={}, player_client={}",
            opts.format, opts.player_client
        );

        let mut child = cmd.spawn().map_err(|e| {
            FetchError::Storage(format!(
                "failed to spawn yt-dlp: {}. Is it installed at '{}'?",
                e, self.cli_path
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Storage("failed to capture yt-dlp stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Storage("failed to capture yt-dlp stderr".to_string()))?;

        // Drain stderr so the child never blocks on a full pipe; keep the
        // tail for classification if the run fails.
        let stderr_handle = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                debug!("yt-dlp stderr: {}", line);
                if tail.len() == STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        });

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !trimmed.starts_with('{') {
                    debug!("yt-dlp: {}", trimmed);
                    continue;
                }
                match serde_json::from_str::<ProgressLine>(trimmed) {
                    Ok(parsed) => {
                        if let Some(event) = convert_progress_line(parsed) {
                            if tx.send(event).await.is_err() {
                                debug!("event receiver dropped, stopping yt-dlp");
                                let _ = child.kill().await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse progress line: {} - line: {}", e, trimmed);
                    }
                }
            }

            let status = child
                .wait()
                .await
                .map_err(|e| FetchError::Storage(format!("failed to wait for yt-dlp: {}", e)))?;
            let stderr_text = stderr_handle.await.unwrap_or_default();

            if status.success() {
                debug!("yt-dlp exited successfully");
                Ok(())
            } else {
                warn!("yt-dlp exited with status: {}", status);
                Err(classify_engine_failure(&stderr_text))
            }
        });

        Ok((rx, handle))
    }
}

/// One line of `--progress-template` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ProgressLine {
    Downloading {
        #[serde(default)]
        downloaded_bytes: u64,
        #[serde(default)]
        total_bytes: u64,
        #[serde(default)]
        total_bytes_estimate: u64,
        #[serde(default)]
        speed: String,
        #[serde(default)]
        eta: String,
    },
    Finished,
    Error,
    #[serde(other)]
    Unknown,
}

fn convert_progress_line(line: ProgressLine) -> Option<EngineEvent> {
    match line {
        ProgressLine::Downloading {
            downloaded_bytes,
            total_bytes,
            total_bytes_estimate,
            speed,
            eta,
        } => {
            // Announced size wins; the estimate fills in for fragmented
            // transfers that never announce one.
            let total = if total_bytes > 0 {
                Some(total_bytes)
            } else if total_bytes_estimate > 0 {
                Some(total_bytes_estimate)
            } else {
                None
            };
            Some(EngineEvent::Downloading {
                downloaded_bytes,
                total_bytes: total,
                speed: clean_telemetry(speed),
                eta: clean_telemetry(eta),
            })
        }
        ProgressLine::Finished => Some(EngineEvent::Finished),
        ProgressLine::Error => Some(EngineEvent::Error {
            message: "engine reported an error during transfer".to_string(),
        }),
        ProgressLine::Unknown => None,
    }
}

/// The engine renders unknown telemetry as empty or "Unknown ..." strings.
fn clean_telemetry(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "NA" || trimmed.starts_with("Unknown") {
        None
    } else {
        Some(trimmed.to_string())
    }
}
