//! Image loading capability for delivery payloads.
//!
//! Detections may reference an image by path instead of carrying the encoded
//! bytes inline. The delivery worker loads those through this seam so tests
//! can substitute a fixture store. Images above the configured cap are
//! refused; the event is still delivered, just without the picture.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::Error;

#[async_trait]
pub trait ImageLoader: Send + Sync + 'static {
    /// Reads the image at `path` and returns it base64-encoded.
    async fn load_base64(&self, path: &str, max_kb: u64) -> Result<String, Error>;
}

/// Filesystem-backed image store rooted at the capture directory.
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

#[async_trait]
impl ImageLoader for FsImageStore {
    async fn load_base64(&self, path: &str, max_kb: u64) -> Result<String, Error> {
        let full = self.resolve(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| Error::io(full.display().to_string(), e))?;

        let size_kb = meta.len() / 1024;
        if size_kb > max_kb {
            return Err(Error::ImageTooLarge {
                path: path.to_string(),
                size_kb,
                max_kb,
            });
        }

        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| Error::io(full.display().to_string(), e))?;
        Ok(STANDARD.encode(bytes))
    }
}
