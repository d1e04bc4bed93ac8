use std::{
    env,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::info;
use zip::ZipArchive;

use crate::{
    artifact::{check_id, ArtifactStore, FetchError},
    CacheLock,
};

/// Environment variable overriding the default cache directory.
pub const CACHE_DIR_ENV: &str = "PIX2PIX_CACHE_DIR";

const EXTRACTED_MARKER: &str = ".extracted";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to extract `{id}`: {source}")]
    Extract {
        id: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("no cache directory could be determined, set `{CACHE_DIR_ENV}`")]
    NoCacheDir,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A local directory of downloaded model artifacts, keyed by file name.
///
/// All mutations of an entry happen under the [`CacheLock`] of that entry, so concurrent requests
/// (threads or processes) download and extract each artifact at most once.
#[derive(Debug, Clone)]
pub struct CheckpointCache {
    dir: PathBuf,
}

impl CheckpointCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// `$PIX2PIX_CACHE_DIR`, falling back to `<user cache dir>/pix2pix_rs/model_assets`.
    pub fn from_env() -> Result<Self, CacheError> {
        if let Ok(dir) = env::var(CACHE_DIR_ENV) {
            return Ok(Self::new(dir));
        }
        let dir = dirs::cache_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(Self::new(dir.join("pix2pix_rs").join("model_assets")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `filename` lives once cached.
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    fn lock(&self, filename: &str) -> Result<CacheLock, CacheError> {
        Ok(CacheLock::acquire(
            self.dir.join(format!("{filename}.lock")),
        )?)
    }

    /// Return the cached path of `filename`, downloading it from `store` if it is absent.
    ///
    /// Downloads land in a `.partial` file which is renamed into place once complete, so an
    /// interrupted download never looks cached.
    pub fn ensure(&self, store: &dyn ArtifactStore, filename: &str) -> Result<PathBuf, CacheError> {
        check_id(filename)?;
        let _lock = self.lock(filename)?;

        let dest = self.path_for(filename);
        if dest.is_file() {
            info!("`{filename}` already downloaded.");
            return Ok(dest);
        }

        info!("downloading `{filename}` from {}.", store.location());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = PathBuf::from(format!("{}.partial", dest.display()));
        if let Err(e) = store.fetch_to(filename, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        }
        fs::rename(&partial, &dest)?;
        info!("downloaded `{filename}`.");

        Ok(dest)
    }

    /// Download the zip bundle `filename` if needed and unpack it next to itself, once.
    ///
    /// Returns the directory holding the unpacked files.
    pub fn ensure_extracted(
        &self,
        store: &dyn ArtifactStore,
        filename: &str,
    ) -> Result<PathBuf, CacheError> {
        check_id(filename)?;
        let _lock = self.lock(filename)?;
        let archive = self.ensure(store, filename)?;

        let target = self.path_for(filename).with_extension("");
        let marker = target.join(EXTRACTED_MARKER);
        if marker.is_file() {
            info!("`{filename}` already extracted.");
            return Ok(target);
        }

        info!("extracting `{filename}`.");
        let extract_err = |source| CacheError::Extract {
            id: filename.to_string(),
            source,
        };
        let mut zip = ZipArchive::new(File::open(&archive)?).map_err(extract_err)?;
        zip.extract(&target).map_err(extract_err)?;
        fs::write(&marker, b"")?;
        info!("extracted `{filename}`.");

        Ok(target)
    }
}
