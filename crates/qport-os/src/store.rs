use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use qport::config::ConfigStore;
use qport::{Error, ErrorKind, Result};

use tracing::debug;

/// A [`ConfigStore`] keeping the image in a file.
///
/// The image is first written next to the file, then renamed over it, so
/// an interrupted save leaves the previous image intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a [`FileStore`] for the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, action: &str, e: &std::io::Error) -> Error {
        Error::new(
            ErrorKind::Storage,
            format!("cannot {action} `{}`: {e}", self.path.display()),
        )
    }
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                debug!("Read {} bytes from {}", bytes.len(), self.path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.storage_error("read", &e)),
        }
    }

    fn save(&mut self, image: &[u8]) -> Result<()> {
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, image).map_err(|e| self.storage_error("write", &e))?;
        fs::rename(&staging, &self.path).map_err(|e| self.storage_error("replace", &e))
    }

    fn erase(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.storage_error("erase", &e)),
        }
    }
}
