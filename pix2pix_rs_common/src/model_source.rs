use std::{
    fmt::{Debug, Display},
    path::PathBuf,
    sync::Arc,
};

use crate::{ArtifactStore, CacheError, CheckpointCache, HttpStore, HubStore, TokenSource};

/// Source from which to load a checkpoint. This is easiest to create with the various constructor functions.
pub enum CheckpointSource {
    /// A checkpoint already on local disk.
    Path(PathBuf),
    /// A checkpoint file held by an artifact store, cached locally.
    Store {
        store: Arc<dyn ArtifactStore>,
        filename: String,
        cache: CheckpointCache,
    },
    /// A zip bundle held by an artifact store; the checkpoint is a file inside it.
    Bundle {
        store: Arc<dyn ArtifactStore>,
        archive: String,
        checkpoint: String,
        cache: CheckpointCache,
    },
}

impl Display for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "path: {}", path.display()),
            Self::Store {
                store, filename, ..
            } => write!(f, "store: {}/{filename}", store.location()),
            Self::Bundle {
                store,
                archive,
                checkpoint,
                ..
            } => write!(
                f,
                "bundle: {}/{archive}, checkpoint: {checkpoint}",
                store.location()
            ),
        }
    }
}

impl Debug for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl CheckpointSource {
    /// Load the checkpoint from a local file.
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Self {
        Self::Path(path.into())
    }

    /// Load the checkpoint `filename` from `store`, caching it in the default cache directory.
    pub fn from_store<S: ToString>(
        store: Arc<dyn ArtifactStore>,
        filename: S,
    ) -> Result<Self, CacheError> {
        Ok(Self::Store {
            store,
            filename: filename.to_string(),
            cache: CheckpointCache::from_env()?,
        })
    }

    /// Load the checkpoint from an object store reachable over HTTP(S).
    ///
    /// ```rust,no_run
    /// use pix2pix_rs_common::CheckpointSource;
    ///
    /// let source = CheckpointSource::from_bucket_url(
    ///     "https://my-bucket.s3.eu-west-2.amazonaws.com/model_assets",
    ///     "instruct-pix2pix-00-22000.ckpt",
    /// )?;
    /// let path = source.resolve()?;
    ///
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_bucket_url<S: ToString, F: ToString>(base: S, filename: F) -> anyhow::Result<Self> {
        Ok(Self::from_store(Arc::new(HttpStore::new(base)?), filename)?)
    }

    /// Load the checkpoint from a Hugging Face model repository.
    pub fn from_hub<S: ToString, F: ToString>(
        repo_id: S,
        filename: F,
        token: TokenSource,
        revision: Option<String>,
    ) -> Result<Self, CacheError> {
        Self::from_store(
            Arc::new(HubStore::new(repo_id, revision, token, false)),
            filename,
        )
    }

    /// Use a specific cache directory instead of the default one.
    pub fn with_cache(self, new_cache: CheckpointCache) -> Self {
        match self {
            Self::Path(path) => Self::Path(path),
            Self::Store {
                store, filename, ..
            } => Self::Store {
                store,
                filename,
                cache: new_cache,
            },
            Self::Bundle {
                store,
                archive,
                checkpoint,
                ..
            } => Self::Bundle {
                store,
                archive,
                checkpoint,
                cache: new_cache,
            },
        }
    }

    /// Make the checkpoint available on local disk and return its path.
    ///
    /// Retrieval failures are returned immediately; there are no retries.
    pub fn resolve(&self) -> Result<PathBuf, CacheError> {
        match self {
            Self::Path(path) => Ok(path.clone()),
            Self::Store {
                store,
                filename,
                cache,
            } => cache.ensure(store.as_ref(), filename),
            Self::Bundle {
                store,
                archive,
                checkpoint,
                cache,
            } => Ok(cache
                .ensure_extracted(store.as_ref(), archive)?
                .join(checkpoint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::LocalStore;

    #[test]
    fn store_sources_resolve_into_the_cache() -> anyhow::Result<()> {
        let bucket = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        fs::write(bucket.path().join("model.ckpt"), b"weights")?;

        let source = CheckpointSource::Store {
            store: Arc::new(LocalStore::new(bucket.path())),
            filename: "model.ckpt".to_string(),
            cache: CheckpointCache::new(cache_dir.path()),
        };

        let path = source.resolve()?;
        assert_eq!(path, cache_dir.path().join("model.ckpt"));
        assert_eq!(fs::read(path)?, b"weights");
        assert!(source.to_string().ends_with("/model.ckpt"));
        Ok(())
    }

    #[test]
    fn local_paths_resolve_to_themselves() -> anyhow::Result<()> {
        let source = CheckpointSource::from_path("/models/model.ckpt");
        assert_eq!(source.resolve()?, PathBuf::from("/models/model.ckpt"));
        Ok(())
    }
}
