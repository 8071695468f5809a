//! On-disk resource cache with atomic publication.
//!
//! A cache entry is a plain file at `{cache_dir}/{resource}`.  Entries are
//! written by first streaming into a temp file under `{temp_dir}` (same
//! filesystem as the cache, so the final rename is atomic) and then persisted
//! into place.  A file visible under a cache path is always a complete copy
//! of the upstream resource; entries are never mutated or deleted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

/// Resource path of the consolidated registry listing.
pub const LISTING_RESOURCE: &str = "/registries";

/// Owns the cache and temp directories and the tmp+rename publish protocol.
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    temp_dir: PathBuf,
}

impl CacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    /// Create the cache and temp directories if they do not exist yet.
    pub fn bootstrap(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir).with_context(|| {
            format!("failed to create cache dir: {}", self.cache_dir.display())
        })?;
        std::fs::create_dir_all(&self.temp_dir).with_context(|| {
            format!("failed to create temp dir: {}", self.temp_dir.display())
        })?;
        Ok(())
    }

    /// The canonical on-disk path for a resource such as
    /// `/artifact/{hash}` or `/registry/{uuid}/{hash}`.
    pub fn cache_path(&self, resource: &str) -> PathBuf {
        self.cache_dir.join(resource.trim_start_matches('/'))
    }

    /// Path of the published registry listing (`{cache_dir}/registries`).
    pub fn listing_path(&self) -> PathBuf {
        self.cache_path(LISTING_RESOURCE)
    }

    /// Whether a complete copy of `resource` is already cached.
    pub fn exists(&self, resource: &str) -> bool {
        self.cache_path(resource).is_file()
    }

    /// Open a scratch file in the temp directory.  Callers stream the
    /// download into it and hand it back to [`CacheStore::publish`]; if it is
    /// dropped instead, tempfile removes it.
    pub fn temp_file(&self) -> Result<NamedTempFile> {
        NamedTempFile::new_in(&self.temp_dir).with_context(|| {
            format!(
                "failed to create temp file in {}",
                self.temp_dir.display()
            )
        })
    }

    /// Atomically move a completed temp file to the cache path for
    /// `resource`, creating parent directories as needed and replacing any
    /// existing file.
    pub fn publish(&self, tmp: NamedTempFile, resource: &str) -> Result<PathBuf> {
        let dest = self.cache_path(resource);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache subdir: {}", parent.display())
            })?;
        }
        tmp.persist(&dest)
            .with_context(|| format!("failed to publish {}", dest.display()))?;
        debug!(resource, path = %dest.display(), "published cache entry");
        Ok(dest)
    }

    /// Write `contents` to a temp file and publish it under `resource`.
    /// Used by the convergence loop for the registry listing.
    pub fn publish_bytes(&self, contents: &[u8], resource: &str) -> Result<PathBuf> {
        use std::io::Write;

        let mut tmp = self.temp_file()?;
        tmp.write_all(contents)
            .context("failed to write temp file")?;
        tmp.flush().context("failed to flush temp file")?;
        self.publish(tmp, resource)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"), dir.path().join("temp"));
        store.bootstrap().unwrap();
        (dir, store)
    }

    #[test]
    fn cache_path_strips_leading_slash() {
        let (_dir, store) = store();
        let path = store.cache_path("/artifact/da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert!(path.ends_with("cache/artifact/da39a3ee5e6b4b0d3255bfef95601890afd80709"));
    }

    #[test]
    fn publish_creates_parents_and_replaces() {
        let (_dir, store) = store();
        let resource = "/registry/0f8fad5b-d9cb-469f-a165-70867728950e/da39a3ee5e6b4b0d3255bfef95601890afd80709";

        assert!(!store.exists(resource));
        store.publish_bytes(b"first", resource).unwrap();
        assert!(store.exists(resource));
        assert_eq!(std::fs::read(store.cache_path(resource)).unwrap(), b"first");

        // Publishing again replaces the file in place.
        store.publish_bytes(b"second", resource).unwrap();
        assert_eq!(std::fs::read(store.cache_path(resource)).unwrap(), b"second");
    }

    #[test]
    fn dropped_temp_file_leaves_no_cache_entry() {
        let (_dir, store) = store();
        {
            let mut tmp = store.temp_file().unwrap();
            use std::io::Write;
            tmp.write_all(b"partial download").unwrap();
            // Dropped without publish.
        }
        assert!(!store.exists("/artifact/da39a3ee5e6b4b0d3255bfef95601890afd80709"));
        let leftovers: Vec<_> = std::fs::read_dir(store.cache_dir()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
