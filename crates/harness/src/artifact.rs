use std::{
    fs, io,
    path::{Path, PathBuf},
};

use kasane_core::onnx::save::external_data_path;

/// Owns an exported model file and its external data sidecar. Both are
/// removed when the guard is dropped, whether or not they were ever written.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: PathBuf,
    data_path: PathBuf,
}

impl ArtifactGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data_path = external_data_path(&path);
        Self { path, data_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        for path in [&self.path, &self.data_path] {
            match fs::remove_file(path) {
                Ok(()) => log::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}
