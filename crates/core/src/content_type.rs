//! MIME type detection for uploaded artifacts.

use std::path::Path;

/// Returned when nothing better is known.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Image and video formats the engine commonly writes.
const FALLBACK_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("mp4", "video/mp4"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
];

/// Extensions (lowercase, no dot) treated as media output.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "webp", "gif", "mp4", "webm", "mov", "avi",
];

/// Guess the content type of `path` from its extension.
pub fn content_type_for(path: &Path) -> String {
    if let Some(mime) = mime_guess::from_path(path).first() {
        return mime.essence_str().to_string();
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    ext.and_then(|ext| {
        FALLBACK_TYPES
            .iter()
            .find(|(known, _)| *known == ext)
            .map(|(_, mime)| (*mime).to_string())
    })
    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// Whether `path` has one of the [`MEDIA_EXTENSIONS`].
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_images() {
        assert_eq!(content_type_for(Path::new("a.png")), "image/png");
        assert_eq!(content_type_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a.webp")), "image/webp");
    }

    #[test]
    fn common_videos() {
        assert_eq!(content_type_for(Path::new("clip.mp4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("clip.webm")), "video/webm");
        assert_eq!(content_type_for(Path::new("clip.mov")), "video/quicktime");
    }

    #[test]
    fn unknown_extension_defaults() {
        assert_eq!(content_type_for(Path::new("blob.kiln")), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type_for(Path::new("no_extension")), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn media_detection() {
        assert!(is_media_file(Path::new("out/ComfyUI_00001_.PNG")));
        assert!(is_media_file(Path::new("video.mp4")));
        assert!(!is_media_file(Path::new("workflow.json")));
        assert!(!is_media_file(Path::new("README")));
    }
}
