use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Exclusive ownership of a dataset for one enrichment run, held as
/// `<store>.lock` and released on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(store_path: &Path) -> Result<Self> {
        let path = super::sidecar(store_path, "lock");
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                anyhow::bail!(
                    "{:?} is locked by another run ({:?}). If no enrichment is running, delete the lock file",
                    store_path,
                    path
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lock {:?}", path));
            }
        };

        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("Failed to write lock {:?}", path))?;
        debug!("Acquired {:?}", path);
        Ok(Self { path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not release {:?}: {}", self.path, e);
        }
    }
}
