//! Engine-agnostic transfer events.

/// Events emitted by an extraction engine while a download runs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Bytes are flowing. `total_bytes` is absent when the upstream does not
    /// announce a size; `speed`/`eta` are display-only telemetry.
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed: Option<String>,
        eta: Option<String>,
    },
    /// The transfer finished; the output file still has to be located.
    Finished,
    /// The engine reported an error mid-stream.
    Error { message: String },
}
