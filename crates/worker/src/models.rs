//! Volume model linking.
//!
//! Model weights live on the persistent volume so every container sees
//! the same set without baking them into the image. Before the engine
//! starts, its `models` directory is replaced by a symlink into the volume.

use std::io;
use std::path::{Path, PathBuf};

/// Volume locations searched for a models directory, first match wins.
const VOLUME_MODEL_DIRS: &[&str] = &["ComfyUI/models", "models", "comfyui_models"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// `models` already resolves to a directory; nothing was changed.
    AlreadyLinked,
    /// A new symlink now points at this volume directory.
    Linked(PathBuf),
    /// The volume directory is the engine's own models directory.
    SelfReferential,
    /// No models directory on the volume.
    NoVolumeModels,
}

/// Point `<install_dir>/models` at the volume's models directory.
pub async fn link_volume_models(install_dir: &Path, volume_root: &Path) -> io::Result<LinkOutcome> {
    let models = install_dir.join("models");

    if let Ok(meta) = tokio::fs::symlink_metadata(&models).await {
        if meta.file_type().is_symlink() && tokio::fs::metadata(&models).await.is_ok_and(|m| m.is_dir()) {
            return Ok(LinkOutcome::AlreadyLinked);
        }
    }

    let Some(source) = find_volume_models(volume_root).await else {
        tracing::warn!(
            volume = %volume_root.display(),
            searched = ?VOLUME_MODEL_DIRS,
            "No models directory found on the volume",
        );
        return Ok(LinkOutcome::NoVolumeModels);
    };

    let source = tokio::fs::canonicalize(&source).await?;
    if let Ok(local) = tokio::fs::canonicalize(&models).await {
        if local == source {
            tracing::info!(path = %models.display(), "Volume models are the engine's own directory, not linking");
            return Ok(LinkOutcome::SelfReferential);
        }
    }

    match tokio::fs::symlink_metadata(&models).await {
        Ok(meta) if meta.file_type().is_symlink() || meta.is_file() => {
            tracing::info!(path = %models.display(), "Removing stale models link");
            tokio::fs::remove_file(&models).await?;
        }
        Ok(_) => {
            tracing::info!(path = %models.display(), "Replacing local models directory");
            tokio::fs::remove_dir_all(&models).await?;
        }
        Err(_) => tokio::fs::create_dir_all(install_dir).await?,
    }

    symlink_dir(&source, &models).await?;
    tracing::info!(link = %models.display(), target = %source.display(), "Linked volume models");
    Ok(LinkOutcome::Linked(source))
}

async fn find_volume_models(volume_root: &Path) -> Option<PathBuf> {
    for relative in VOLUME_MODEL_DIRS {
        let candidate = volume_root.join(relative);
        if tokio::fs::metadata(&candidate).await.is_ok_and(|m| m.is_dir()) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink_dir(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "model linking needs symlink support"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_local_directory_with_link() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("ComfyUI");
        std::fs::create_dir_all(install.join("models/checkpoints")).unwrap();
        let volume = tmp.path().join("volume");
        std::fs::create_dir_all(volume.join("models/checkpoints")).unwrap();
        std::fs::write(volume.join("models/checkpoints/sdxl.safetensors"), b"w").unwrap();

        let outcome = link_volume_models(&install, &volume).await.unwrap();

        assert_eq!(outcome, LinkOutcome::Linked(volume.join("models").canonicalize().unwrap()));
        assert!(std::fs::symlink_metadata(install.join("models")).unwrap().file_type().is_symlink());
        assert!(install.join("models/checkpoints/sdxl.safetensors").exists());

        let again = link_volume_models(&install, &volume).await.unwrap();
        assert_eq!(again, LinkOutcome::AlreadyLinked);
    }

    #[tokio::test]
    async fn prefers_comfyui_layout_on_volume() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("ComfyUI");
        let volume = tmp.path().join("volume");
        std::fs::create_dir_all(volume.join("ComfyUI/models")).unwrap();
        std::fs::create_dir_all(volume.join("models")).unwrap();

        let outcome = link_volume_models(&install, &volume).await.unwrap();
        assert_eq!(outcome, LinkOutcome::Linked(volume.join("ComfyUI/models").canonicalize().unwrap()));
    }

    #[tokio::test]
    async fn broken_link_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("ComfyUI");
        std::fs::create_dir_all(&install).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("nowhere"), install.join("models")).unwrap();
        let volume = tmp.path().join("volume");
        std::fs::create_dir_all(volume.join("comfyui_models")).unwrap();

        let outcome = link_volume_models(&install, &volume).await.unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked(_)));
        assert!(install.join("models").is_dir());
    }

    #[tokio::test]
    async fn missing_volume_models_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("ComfyUI");
        std::fs::create_dir_all(install.join("models")).unwrap();

        let outcome = link_volume_models(&install, &tmp.path().join("volume")).await.unwrap();
        assert_eq!(outcome, LinkOutcome::NoVolumeModels);
        assert!(install.join("models").is_dir());
    }

    #[tokio::test]
    async fn volume_at_install_location_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        // Volume root doubles as the install parent: <volume>/ComfyUI/models.
        let install = tmp.path().join("ComfyUI");
        std::fs::create_dir_all(install.join("models")).unwrap();

        let outcome = link_volume_models(&install, tmp.path()).await.unwrap();
        assert_eq!(outcome, LinkOutcome::SelfReferential);
        assert!(!std::fs::symlink_metadata(install.join("models")).unwrap().file_type().is_symlink());
    }
}
