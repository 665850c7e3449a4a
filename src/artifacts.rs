//! # Artifacts — Filesystem Store for Generated and Reference Images
//!
//! Generated images land in `<output>/images/gen_<ns>.<ext>` and uploaded
//! reference images in `<upload>/uploads/ref_<ns>_<name>`. Callers only ever
//! see the relative form (`images/...`, `uploads/...`); `urls::UrlRewriter`
//! turns it into a client-facing URL at read time.
//!
//! File names embed a nanosecond timestamp that is forced strictly increasing
//! within the process, so two writes in the same clock tick never collide.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

static LAST_NANOS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock nanoseconds, bumped past the previous value when the clock has
/// not advanced.
pub fn unique_nanos() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_NANOS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_NANOS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// File extension for a `data:image/<subtype>` URL.
pub fn extension_for_subtype(subtype: &str) -> String {
    match subtype {
        "jpeg" => "jpg".to_string(),
        other => other.to_string(),
    }
}

/// File extension for a downloaded image, from its `Content-Type`.
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    if content_type.contains("png") {
        "png"
    } else if content_type.contains("webp") {
        "webp"
    } else if content_type.contains("gif") {
        "gif"
    } else {
        "jpg"
    }
}

/// MIME type sent upstream for an uploaded reference image.
pub fn reference_mime(file_name: &str) -> &'static str {
    if file_name.to_lowercase().ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    images_dir: PathBuf,
    uploads_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(images_dir: PathBuf, uploads_dir: PathBuf) -> Self {
        ArtifactStore {
            images_dir,
            uploads_dir,
        }
    }

    /// Create both directories. Failure here is fatal at startup.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.images_dir).with_context(|| {
            format!("failed to create images directory {}", self.images_dir.display())
        })?;
        std::fs::create_dir_all(&self.uploads_dir).with_context(|| {
            format!("failed to create uploads directory {}", self.uploads_dir.display())
        })?;
        Ok(())
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Write a generated image and return its relative URL (`images/gen_<ns>.<ext>`).
    pub async fn save_generated(&self, bytes: &[u8], ext: &str) -> Result<String> {
        let file_name = format!("gen_{}.{}", unique_nanos(), ext);
        let path = self.images_dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(file = %file_name, bytes = bytes.len(), "generated image saved");
        Ok(format!("images/{}", file_name))
    }

    /// Reserve a name for an uploaded reference image. Returns the on-disk
    /// file name and the relative URL recorded in the task.
    pub fn reference_name(&self, original: &str) -> (String, String) {
        let base = Path::new(original)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("upload");
        let file_name = format!("ref_{}_{}", unique_nanos(), base);
        let relative = format!("uploads/{}", file_name);
        (file_name, relative)
    }

    pub async fn save_reference(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.uploads_dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Unlink the generated image a stored URL points at. Accepts the
    /// relative form, `/images/...` and legacy absolute URLs. A missing file
    /// is not an error.
    pub async fn remove_generated(&self, url: &str) {
        let name = if let Some(rest) = url.strip_prefix("images/") {
            rest
        } else if let Some(idx) = url.rfind("/images/") {
            &url[idx + "/images/".len()..]
        } else {
            ""
        };
        let Some(name) = Path::new(name).file_name() else {
            debug!(url, "no file name in image url");
            return;
        };
        let path = self.images_dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "image file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "image file already gone")
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove image file"),
        }
    }
}
