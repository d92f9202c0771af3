//! Job id sanitizing and artifact naming.
//!
//! Every artifact written by the worker, whether to object storage or
//! to the persistent volume, is addressed by a key that is a pure
//! function of `(sanitized job id, timestamp, original filename)`:
//!
//! ```text
//! {job_id}/{YYYYmmdd_HHMMSS_micros}_{filename}
//! ```
//!
//! The output directories are shared by every job a container runs (and
//! by every container mounting the same volume), so this scheme is the
//! only thing keeping writes from clobbering each other.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::types::Timestamp;

/// Runs of characters that are not allowed in a job token.
static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex is valid"));

/// Timestamp layout used in artifact keys (microsecond resolution).
const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// Rewrite an external job id into a filesystem-safe token.
///
/// Disallowed characters at either end are dropped, then every remaining
/// run of characters outside `[A-Za-z0-9_-]` becomes a single underscore.
/// An id that is already safe comes back unchanged.
/// Returns `None` for a missing or empty id, or when nothing usable
/// remains; the caller supplies its own fallback id in that case.
///
/// ```
/// use kiln_core::naming::sanitize_job_id;
///
/// assert_eq!(sanitize_job_id(Some("test-job-123")).as_deref(), Some("test-job-123"));
/// assert_eq!(sanitize_job_id(Some("test/job@123!")).as_deref(), Some("test_job_123"));
/// assert_eq!(sanitize_job_id(None), None);
/// ```
pub fn sanitize_job_id(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim_matches(|c: char| !is_allowed(c));
    if trimmed.is_empty() {
        return None;
    }

    Some(DISALLOWED.replace_all(trimmed, "_").into_owned())
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Whether `token` only contains characters the sanitizer would keep.
pub fn is_safe_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(is_allowed)
}

/// Format a timestamp the way it appears in artifact keys.
pub fn key_timestamp(at: &Timestamp) -> String {
    at.format(KEY_TIMESTAMP_FORMAT).to_string()
}

/// Compose the storage key for one artifact.
///
/// The same key is used as the object-storage key and as the path of the
/// volume backup relative to the volume output directory, which puts
/// every job's files under a job-scoped subdirectory.
pub fn artifact_key(job_id: &str, at: &Timestamp, filename: &str) -> Result<String, CoreError> {
    if !is_safe_token(job_id) {
        return Err(CoreError::Validation(format!(
            "Job id '{job_id}' is not a sanitized token"
        )));
    }
    validate_file_name(filename)?;

    Ok(format!("{job_id}/{}_{filename}", key_timestamp(at)))
}

/// A file name must be a single, non-empty path component.
fn validate_file_name(filename: &str) -> Result<(), CoreError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0');

    if invalid {
        Err(CoreError::InvalidFileName(filename.to_string()))
    } else {
        Ok(())
    }
}
