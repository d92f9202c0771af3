//! Artifact collection.
//!
//! Turns the engine's output references into validated files on disk.
//! Reported outputs are resolved under the engine output directory and
//! kept only if they exist with a non-zero size. When none survive, the
//! output directory is scanned for media written after the job arrived,
//! which covers nodes that save files without reporting them.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use kiln_comfyui::history::OutputRef;
use kiln_comfyui::poller::CompletionResult;
use kiln_core::content_type::is_media_file;
use kiln_core::types::{ArtifactRef, Timestamp};
use walkdir::WalkDir;

use crate::error::JobError;

/// Why a reported output was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Absolute path or `..` component.
    UnsafePath,
    Missing,
    Empty,
    NotAFile,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Rejection::UnsafePath => "path escapes the output directory",
            Rejection::Missing => "file does not exist",
            Rejection::Empty => "file is empty",
            Rejection::NotAFile => "not a regular file",
        })
    }
}

pub struct ArtifactCollector {
    output_dir: PathBuf,
}

impl ArtifactCollector {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Validated artifacts for a successful result, in engine order.
    ///
    /// Partially invalid output lists still succeed; only when neither the
    /// reported outputs nor the fallback scan yield a file does this fail
    /// with [`JobError::PartialArtifact`].
    pub async fn collect(&self, result: &CompletionResult, received_at: Timestamp) -> Result<Vec<ArtifactRef>, JobError> {
        let mut artifacts = Vec::with_capacity(result.outputs.len());
        let mut rejected = Vec::new();

        for output in &result.outputs {
            match self.validate(output).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(reason) => rejected.push(format!("{}: {reason}", display_ref(output))),
            }
        }

        if !rejected.is_empty() {
            tracing::warn!(
                rejected = rejected.len(),
                reported = result.outputs.len(),
                reasons = %rejected.join("; "),
                "Some reported outputs were not usable",
            );
        }

        if !artifacts.is_empty() {
            return Ok(artifacts);
        }

        tracing::warn!(
            output_dir = %self.output_dir.display(),
            "No reported output validated, scanning for recent media",
        );
        let recent = self.scan_recent(received_at).await;
        if !recent.is_empty() {
            tracing::info!(found = recent.len(), "Recovered outputs from the output directory");
            return Ok(recent);
        }

        let detail = if rejected.is_empty() {
            "engine reported no outputs and none were found on disk".to_string()
        } else {
            rejected.join("; ")
        };
        Err(JobError::PartialArtifact(detail))
    }

    async fn validate(&self, output: &OutputRef) -> Result<ArtifactRef, Rejection> {
        let path = self.resolve(output).ok_or(Rejection::UnsafePath)?;

        let meta = tokio::fs::metadata(&path).await.map_err(|_| Rejection::Missing)?;
        if !meta.is_file() {
            return Err(Rejection::NotAFile);
        }
        if meta.len() == 0 {
            return Err(Rejection::Empty);
        }

        Ok(ArtifactRef {
            local_path: path,
            filename: output.filename.clone(),
            size_bytes: meta.len(),
        })
    }

    /// `<output_dir>/<subfolder>/<filename>`, or `None` when either part
    /// could point outside the output directory.
    fn resolve(&self, output: &OutputRef) -> Option<PathBuf> {
        let subfolder = Path::new(&output.subfolder);
        let filename = Path::new(&output.filename);

        let subfolder_ok = subfolder.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let mut file_parts = filename.components();
        let filename_ok = matches!(
            (file_parts.next(), file_parts.next()),
            (Some(Component::Normal(_)), None)
        );

        (subfolder_ok && filename_ok).then(|| self.output_dir.join(subfolder).join(filename))
    }

    /// Media files under the output directory modified after `since`.
    async fn scan_recent(&self, since: Timestamp) -> Vec<ArtifactRef> {
        let root = self.output_dir.clone();
        let since = SystemTime::from(since);

        let scan = tokio::task::spawn_blocking(move || {
            let mut found: Vec<ArtifactRef> = WalkDir::new(&root)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file() && is_media_file(entry.path()))
                .filter_map(|entry| {
                    let meta = entry.metadata().ok()?;
                    let modified = meta.modified().ok()?;
                    (modified > since && meta.len() > 0).then(|| ArtifactRef {
                        local_path: entry.path().to_path_buf(),
                        filename: entry.file_name().to_string_lossy().into_owned(),
                        size_bytes: meta.len(),
                    })
                })
                .collect();
            found.sort_by(|a, b| a.local_path.cmp(&b.local_path));
            found
        });

        match scan.await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(error = %e, "Output directory scan failed");
                Vec::new()
            }
        }
    }
}

fn display_ref(output: &OutputRef) -> String {
    if output.subfolder.is_empty() {
        output.filename.clone()
    } else {
        format!("{}/{}", output.subfolder, output.filename)
    }
}

/// Delete delivered engine outputs. Returns how many files were removed.
pub async fn remove_outputs(artifacts: &[ArtifactRef]) -> usize {
    let mut removed = 0;
    for artifact in artifacts {
        match tokio::fs::remove_file(&artifact.local_path).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(
                path = %artifact.local_path.display(),
                error = %e,
                "Could not delete temporary output",
            ),
        }
    }
    if removed > 0 {
        tracing::info!(removed, "Cleaned up temporary outputs");
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::Utc;
    use kiln_comfyui::poller::CompletionStatus;

    use super::*;

    fn output(subfolder: &str, filename: &str) -> OutputRef {
        OutputRef {
            node_id: "9".into(),
            filename: filename.into(),
            subfolder: subfolder.into(),
        }
    }

    fn success(outputs: Vec<OutputRef>) -> CompletionResult {
        CompletionResult {
            status: CompletionStatus::Success,
            outputs,
            diagnostic: None,
            failed_node: None,
            elapsed: Duration::from_secs(3),
        }
    }

    fn backdate(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn valid_outputs_in_engine_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("batch")).unwrap();
        std::fs::write(dir.path().join("b.png"), b"bb").unwrap();
        std::fs::write(dir.path().join("batch/a.png"), b"a").unwrap();

        let collector = ArtifactCollector::new(dir.path());
        let result = success(vec![output("", "b.png"), output("batch", "a.png")]);
        let artifacts = collector.collect(&result, Utc::now()).await.unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].filename, "b.png");
        assert_eq!(artifacts[0].size_bytes, 2);
        assert_eq!(artifacts[1].local_path, dir.path().join("batch").join("a.png"));
    }

    #[tokio::test]
    async fn invalid_entries_are_dropped_when_one_survives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.png"), b"ok").unwrap();
        std::fs::write(dir.path().join("empty.png"), b"").unwrap();

        let collector = ArtifactCollector::new(dir.path());
        let result = success(vec![
            output("", "missing.png"),
            output("", "empty.png"),
            output("", "good.png"),
            output("..", "escape.png"),
        ]);
        let artifacts = collector.collect(&result, Utc::now()).await.unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "good.png");
    }

    #[tokio::test]
    async fn nothing_valid_is_partial_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.png"), b"").unwrap();

        let collector = ArtifactCollector::new(dir.path());
        let result = success(vec![output("", "empty.png"), output("", "gone.png")]);
        let err = collector.collect(&result, Utc::now()).await.unwrap_err();

        assert_matches!(err, JobError::PartialArtifact(msg) if msg.contains("gone.png") && msg.contains("empty"));
    }

    #[tokio::test]
    async fn fallback_scan_finds_media_newer_than_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let received_at = Utc::now() - chrono::Duration::seconds(60);

        std::fs::create_dir_all(dir.path().join("video")).unwrap();
        std::fs::write(dir.path().join("video/clip.mp4"), b"mp4").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not media").unwrap();
        std::fs::write(dir.path().join("old.png"), b"stale").unwrap();
        backdate(&dir.path().join("old.png"), Duration::from_secs(3600));

        let collector = ArtifactCollector::new(dir.path());
        let artifacts = collector
            .collect(&success(vec![output("", "unreported.png")]), received_at)
            .await
            .unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename, "clip.mp4");
    }

    #[test]
    fn resolve_rejects_escapes() {
        let collector = ArtifactCollector::new("/out");
        assert!(collector.resolve(&output("", "a.png")).is_some());
        assert!(collector.resolve(&output("sub/dir", "a.png")).is_some());
        assert!(collector.resolve(&output("/etc", "a.png")).is_none());
        assert!(collector.resolve(&output("../x", "a.png")).is_none());
        assert!(collector.resolve(&output("", "../a.png")).is_none());
        assert!(collector.resolve(&output("", "/abs.png")).is_none());
        assert!(collector.resolve(&output("", "")).is_none());
    }

    #[tokio::test]
    async fn remove_outputs_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"x").unwrap();
        let artifacts = vec![ArtifactRef {
            local_path: path.clone(),
            filename: "a.png".into(),
            size_bytes: 1,
        }];

        assert_eq!(remove_outputs(&artifacts).await, 1);
        assert!(!path.exists());
    }
}
