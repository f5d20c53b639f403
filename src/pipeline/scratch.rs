use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Tracks every intermediate directory of a run and removes them on drop.
///
/// With `keep` set (debug runs) nothing is removed and the location is
/// logged instead. Removal failures are logged, never raised.
#[derive(Debug)]
pub struct ScratchSpace {
    root: PathBuf,
    tracked: Mutex<Vec<PathBuf>>,
    keep: bool,
}

impl ScratchSpace {
    pub fn new(keep: bool) -> io::Result<Self> {
        Self::new_in(&std::env::temp_dir(), keep)
    }

    pub fn new_in(base: &Path, keep: bool) -> io::Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("framecull-")
            .disable_cleanup(true)
            .tempdir_in(base)?
            .path()
            .to_path_buf();
        log::debug!("Scratch space at {}", root.display());
        Ok(Self {
            tracked: Mutex::new(vec![root.clone()]),
            root,
            keep,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keeps_files(&self) -> bool {
        self.keep
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a fresh directory named `name` (suffixed when taken).
    pub fn allocate(&self, name: &str) -> io::Result<PathBuf> {
        let mut path = self.root.join(name);
        let mut attempt = 1;
        while path.exists() {
            path = self.root.join(format!("{name}-{attempt}"));
            attempt += 1;
        }
        fs::create_dir_all(&path)?;
        self.track(path.clone());
        Ok(path)
    }

    pub fn track(&self, path: PathBuf) {
        self.lock().push(path);
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    /// Remove all tracked paths, newest first. Returns how many were removed.
    pub fn release(&self) -> usize {
        let paths: Vec<PathBuf> = self.lock().drain(..).rev().collect();
        let mut removed = 0;
        for path in paths {
            if !path.exists() {
                continue;
            }
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("Failed to clean up {}: {}", path.display(), e),
            }
        }
        removed
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        if self.keep {
            log::info!("Keeping intermediate files in {}", self.root.display());
        } else {
            self.release();
        }
    }
}
