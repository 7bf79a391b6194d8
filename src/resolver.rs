//! Artifact resolution.
//!
//! The engine writes its output through a template whose final extension it
//! negotiates with the upstream, so the exact filename is not knowable in
//! advance. Resolution tries three strategies in order: the task's id token
//! embedded in the output template, a sanitized prefix of the expected
//! title, and finally a before/after snapshot diff of the working
//! directory. An empty result is a hard `FileResolution` error, never a
//! silent best guess.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::task::Artifact;

/// Maximum length of a sanitized title, in characters.
const MAX_TITLE_LEN: usize = 80;

/// Extensions of in-flight engine bookkeeping files, never artifacts.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

/// Snapshot of the plain files currently in `dir`.
pub fn snapshot(dir: &Path) -> Result<HashSet<PathBuf>, FetchError> {
    Ok(list_files(dir)?.into_iter().map(|(p, _)| p).collect())
}

fn list_files(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, FetchError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| FetchError::Storage(format!("cannot read working directory: {}", e)))?;
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((path, modified));
    }
    Ok(files)
}

fn is_partial(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn newest(candidates: Vec<(PathBuf, SystemTime)>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .max_by_key(|(_, modified)| *modified)
        .map(|(p, _)| p)
}

/// Locate the file the engine produced for this task.
///
/// `before` is the directory snapshot taken just before the engine was
/// invoked; it powers the last-resort diff strategy.
pub fn resolve(
    dir: &Path,
    id_token: &str,
    title: Option<&str>,
    before: &HashSet<PathBuf>,
) -> Result<PathBuf, FetchError> {
    let files: Vec<(PathBuf, SystemTime)> = list_files(dir)?
        .into_iter()
        .filter(|(p, _)| !is_partial(p))
        .collect();

    // 1. The output template embeds the id token precisely so this works.
    let by_token: Vec<_> = files
        .iter()
        .filter(|(p, _)| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains(id_token))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if let Some(path) = newest(by_token) {
        return Ok(path);
    }

    // 2. Sanitized title prefix.
    if let Some(title) = title {
        let prefix = sanitize_title(title).to_lowercase();
        if !prefix.is_empty() {
            let by_title: Vec<_> = files
                .iter()
                .filter(|(p, _)| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.to_lowercase().starts_with(&prefix))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if let Some(path) = newest(by_title) {
                debug!("resolved artifact by title prefix: {}", path.display());
                return Ok(path);
            }
        }
    }

    // 3. Whatever appeared since the engine started, newest first.
    let appeared: Vec<_> = files
        .iter()
        .filter(|(p, _)| !before.contains(p))
        .cloned()
        .collect();
    if let Some(path) = newest(appeared) {
        debug!("resolved artifact by directory diff: {}", path.display());
        return Ok(path);
    }

    Err(FetchError::FileResolution(format!(
        "engine reported success but no output file matches task {}",
        id_token
    )))
}

/// Resolve the produced file and normalize it into an [`Artifact`]:
/// rename to `"<sanitized title><original extension>"`, collect size and
/// MIME type. A failed rename (destination taken, permissions) is
/// non-fatal; the original path is kept and reported instead.
pub fn finalize(
    dir: &Path,
    id_token: &str,
    title: Option<&str>,
    before: &HashSet<PathBuf>,
) -> Result<Artifact, FetchError> {
    let found = resolve(dir, id_token, title, before)?;

    let extension = found
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default();

    let clean_name = format!("{}{}", sanitize_title(title.unwrap_or("download")), extension);
    let destination = dir.join(&clean_name);

    let path = if destination == found {
        found
    } else if destination.exists() {
        warn!(
            "keeping engine filename, {} already exists",
            destination.display()
        );
        found
    } else {
        match fs::rename(&found, &destination) {
            Ok(()) => destination,
            Err(e) => {
                warn!("rename to {} failed: {}", destination.display(), e);
                found
            }
        }
    };

    let size_bytes = fs::metadata(&path)
        .map_err(|e| FetchError::Storage(format!("cannot stat artifact: {}", e)))?
        .len();
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&clean_name)
        .to_string();
    let mime_type = mime_for_extension(&extension).to_string();

    Ok(Artifact {
        path,
        filename,
        size_bytes,
        extension,
        mime_type,
    })
}

/// Clean a media title for use as a filename: strip filesystem-reserved and
/// control characters, collapse line breaks and runs of whitespace into
/// single spaces, cap the length.
pub fn sanitize_title(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(MAX_TITLE_LEN).collect();
    let trimmed = truncated.trim().to_string();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed
    }
}

/// Best-effort MIME type from the extension (leading dot accepted).
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_lowercase().as_str() {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "opus" => "audio/ogg",
        "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// Remove every file carrying the task's id token (partial transfers,
/// abandoned outputs). Best effort: deletes are existence-checked and
/// failures only logged, since the cleanup scheduler may be sweeping the
/// same directory concurrently.
pub fn remove_files_with_token(dir: &Path, id_token: &str) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("partial sweep skipped, cannot read {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(id_token))
            .unwrap_or(false);
        if !matches || !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!("removed partial file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove partial file {}: {}", path.display(), e),
        }
    }
}
