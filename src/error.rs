//! Failure taxonomy for fetch tasks.
//!
//! Every attempt-level failure is classified into one of a closed set of
//! kinds. Only `TransientUpstream` is retryable; everything else fails the
//! task immediately. The extraction engine only exposes failure text, so
//! [`classify_engine_failure`] is the single place where that text is
//! sniffed; callers only ever see the typed result.

use serde::Serialize;
use thiserror::Error;

/// Maximum length of a failure message exposed to clients.
const MAX_CLIENT_MESSAGE_LEN: usize = 256;

/// Machine-readable failure classification, reported alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unsupported source URL.
    InvalidInput,
    /// Rate limiting, bot challenges, socket timeouts. Retryable.
    TransientUpstream,
    /// Private, removed, or region-blocked content.
    ContentUnavailable,
    /// The engine reported success but no output file could be located.
    FileResolution,
    /// Disk full, permission denied, missing working directory.
    Storage,
}

/// A classified attempt-level failure.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    #[error("content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("could not resolve output file: {0}")]
    FileResolution(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::InvalidInput(_) => ErrorKind::InvalidInput,
            FetchError::TransientUpstream(_) => ErrorKind::TransientUpstream,
            FetchError::ContentUnavailable(_) => ErrorKind::ContentUnavailable,
            FetchError::FileResolution(_) => ErrorKind::FileResolution,
            FetchError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether a fresh attempt is worth making.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::TransientUpstream(_))
    }

    /// Message safe to show to a polling client: single line, length-capped,
    /// no stack traces or local paths beyond what the classifier kept.
    pub fn client_message(&self) -> String {
        let full = self.to_string();
        let line = full.lines().next().unwrap_or_default();
        if line.len() > MAX_CLIENT_MESSAGE_LEN {
            let mut end = MAX_CLIENT_MESSAGE_LEN;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &line[..end])
        } else {
            line.to_string()
        }
    }
}

/// Classify the engine's failure text into a [`FetchError`].
///
/// The extraction engine reports failures as free text on stderr. The
/// substring checks below are confined to this function; its output is a
/// closed enum from here on. Unrecognized failures default to
/// `TransientUpstream` so an unknown upstream hiccup still gets its retry
/// budget.
pub fn classify_engine_failure(stderr: &str) -> FetchError {
    let text = stderr.trim();
    let lower = text.to_lowercase();

    let summary = || {
        // Last non-empty line is where the engine puts its verdict.
        text.lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("extraction failed")
            .to_string()
    };

    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        return FetchError::InvalidInput(summary());
    }
    if lower.contains("private video")
        || lower.contains("requires login")
        || lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("not available in your country")
        || lower.contains("members-only")
    {
        return FetchError::ContentUnavailable(summary());
    }
    if lower.contains("no space left") || lower.contains("permission denied") {
        return FetchError::Storage(summary());
    }
    // 403/429, bot checks, and socket trouble are the transient bucket.
    FetchError::TransientUpstream(if text.is_empty() {
        "extraction engine failed without diagnostics".to_string()
    } else {
        summary()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unsupported_url_as_invalid_input() {
        let err = classify_engine_failure("ERROR: Unsupported URL: ftp://nope");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_private_video_as_unavailable() {
        let err = classify_engine_failure(
            "ERROR: [youtube] abc: Private video. Sign in if you've been granted access",
        );
        assert_eq!(err.kind(), ErrorKind::ContentUnavailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_http_403_as_transient() {
        let err = classify_engine_failure("ERROR: unable to download video data: HTTP Error 403: Forbidden");
        assert_eq!(err.kind(), ErrorKind::TransientUpstream);
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_disk_full_as_storage() {
        let err = classify_engine_failure("OSError: [Errno 28] No space left on device");
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_stderr_still_yields_a_message() {
        let err = classify_engine_failure("");
        assert_eq!(err.kind(), ErrorKind::TransientUpstream);
        assert!(!err.client_message().is_empty());
    }

    #[test]
    fn uses_last_nonempty_line_as_summary() {
        let err = classify_engine_failure(
            "[youtube] Extracting URL\n[youtube] abc: Downloading webpage\nERROR: Video unavailable\n",
        );
        assert!(err.client_message().contains("Video unavailable"));
    }

    #[test]
    fn client_message_is_length_capped_and_single_line() {
        let long = format!("boom {}", "x".repeat(1000));
        let err = FetchError::TransientUpstream(long);
        let msg = err.client_message();
        assert!(msg.len() <= MAX_CLIENT_MESSAGE_LEN + 3);
        assert!(!msg.contains('\n'));
    }
}
