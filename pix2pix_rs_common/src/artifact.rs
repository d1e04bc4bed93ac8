//! Stores which hold model artifacts (checkpoints, VAE weights, zipped bundles).
//!
//! Every store answers the same question: given an artifact identifier (a file name), return
//! its bytes. Caching is layered on top by [`crate::CheckpointCache`].

use std::{
    fmt::{self, Display},
    fs::{self, File},
    path::{Component, Path, PathBuf},
};

use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use reqwest::{blocking::Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::{get_token, TokenSource};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("artifact `{0}` was not found")]
    NotFound(String),

    #[error("artifact id `{0}` must be a plain relative file name")]
    InvalidId(String),

    #[error("request for `{id}` failed: {source}")]
    Http {
        id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request for `{id}` returned status {status}")]
    Status { id: String, status: StatusCode },

    #[error("hub request for `{id}` failed: {message}")]
    Hub { id: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Collaborator which retrieves artifacts by identifier.
pub trait ArtifactStore: Send + Sync {
    /// Human readable location of the store, used in logs.
    fn location(&self) -> String;

    /// Return the bytes of the artifact `id`.
    fn fetch(&self, id: &str) -> Result<Vec<u8>, FetchError>;

    /// Write the artifact `id` to `dest`. Stores which can stream should override this.
    fn fetch_to(&self, id: &str, dest: &Path) -> Result<(), FetchError> {
        let bytes = self.fetch(id)?;
        fs::write(dest, bytes)?;
        Ok(())
    }
}

impl Display for dyn ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location())
    }
}

/// Artifact ids are file names (optionally nested) and must never escape the store root.
pub(crate) fn check_id(id: &str) -> Result<(), FetchError> {
    let path = Path::new(id);
    if id.is_empty()
        || !path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(FetchError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(format!("pix2pix_rs/{}", env!("CARGO_PKG_VERSION")))
        .build()
}

fn send(client: &Client, url: &str) -> Result<reqwest::blocking::Response, FetchError> {
    let response = client.get(url).send().map_err(|source| FetchError::Http {
        id: url.to_string(),
        source,
    })?;
    match response.status() {
        StatusCode::NOT_FOUND => Err(FetchError::NotFound(url.to_string())),
        status if !status.is_success() => Err(FetchError::Status {
            id: url.to_string(),
            status,
        }),
        _ => Ok(response),
    }
}

/// Blocking GET of an arbitrary URL.
pub fn http_get(url: &str) -> Result<Vec<u8>, FetchError> {
    let client = http_client().map_err(|source| FetchError::Http {
        id: url.to_string(),
        source,
    })?;
    debug!("fetching {url}");
    let bytes = send(&client, url)?
        .bytes()
        .map_err(|source| FetchError::Http {
            id: url.to_string(),
            source,
        })?;
    Ok(bytes.to_vec())
}

/// An object store reachable over HTTP(S), such as a public bucket. Artifacts live at `<base>/<id>`.
pub struct HttpStore {
    base: String,
    client: Client,
}

impl HttpStore {
    pub fn new<S: ToString>(base: S) -> Result<Self, FetchError> {
        let base = base.to_string();
        let client = http_client().map_err(|source| FetchError::Http {
            id: base.clone(),
            source,
        })?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, id: &str) -> String {
        format!("{}/{id}", self.base)
    }
}

impl ArtifactStore for HttpStore {
    fn location(&self) -> String {
        self.base.clone()
    }

    fn fetch(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        check_id(id)?;
        let url = self.url(id);
        let bytes = send(&self.client, &url)?
            .bytes()
            .map_err(|source| FetchError::Http { id: url, source })?;
        Ok(bytes.to_vec())
    }

    fn fetch_to(&self, id: &str, dest: &Path) -> Result<(), FetchError> {
        check_id(id)?;
        let url = self.url(id);
        let mut response = send(&self.client, &url)?;
        let mut file = File::create(dest)?;
        response
            .copy_to(&mut file)
            .map_err(|source| FetchError::Http { id: url, source })?;
        Ok(())
    }
}

/// A Hugging Face Hub model repository.
pub struct HubStore {
    repo_id: String,
    revision: String,
    token: TokenSource,
    silent: bool,
}

impl HubStore {
    /// Note: `revision` defaults to `main`.
    pub fn new<S: ToString>(
        repo_id: S,
        revision: Option<String>,
        token: TokenSource,
        silent: bool,
    ) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            revision: revision.unwrap_or_else(|| "main".to_string()),
            token,
            silent,
        }
    }

    fn get(&self, id: &str) -> Result<PathBuf, FetchError> {
        let hub_err = |message: String| FetchError::Hub {
            id: id.to_string(),
            message,
        };
        let api = ApiBuilder::new()
            .with_progress(!self.silent)
            .with_token(get_token(&self.token).map_err(|e| hub_err(e.to_string()))?)
            .build()
            .map_err(|e| hub_err(e.to_string()))?;
        let repo = api.repo(Repo::with_revision(
            self.repo_id.clone(),
            RepoType::Model,
            self.revision.clone(),
        ));
        repo.get(id).map_err(|e| hub_err(e.to_string()))
    }
}

impl ArtifactStore for HubStore {
    fn location(&self) -> String {
        format!("hf://{}@{}", self.repo_id, self.revision)
    }

    fn fetch(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        check_id(id)?;
        Ok(fs::read(self.get(id)?)?)
    }

    fn fetch_to(&self, id: &str, dest: &Path) -> Result<(), FetchError> {
        check_id(id)?;
        fs::copy(self.get(id)?, dest)?;
        Ok(())
    }
}

/// A directory on a mounted volume.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, id: &str) -> Result<PathBuf, FetchError> {
        check_id(id)?;
        let path = self.root.join(id);
        if !path.is_file() {
            return Err(FetchError::NotFound(path.display().to_string()));
        }
        Ok(path)
    }
}

impl ArtifactStore for LocalStore {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn fetch(&self, id: &str) -> Result<Vec<u8>, FetchError> {
        Ok(fs::read(self.path(id)?)?)
    }

    fn fetch_to(&self, id: &str, dest: &Path) -> Result<(), FetchError> {
        fs::copy(self.path(id)?, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_cannot_escape_the_store() {
        assert!(check_id("instruct-pix2pix-00-22000.ckpt").is_ok());
        assert!(check_id("weights/vae.safetensors").is_ok());
        assert!(matches!(check_id(""), Err(FetchError::InvalidId(_))));
        assert!(matches!(
            check_id("../secrets"),
            Err(FetchError::InvalidId(_))
        ));
        assert!(matches!(
            check_id("/etc/passwd"),
            Err(FetchError::InvalidId(_))
        ));
    }

    #[test]
    fn local_store_reads_and_copies() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        fs::write(root.path().join("model.ckpt"), b"weights")?;
        let store = LocalStore::new(root.path());

        assert_eq!(store.fetch("model.ckpt")?, b"weights");

        let dest = root.path().join("copy.ckpt");
        store.fetch_to("model.ckpt", &dest)?;
        assert_eq!(fs::read(dest)?, b"weights");

        assert!(matches!(
            store.fetch("missing.ckpt"),
            Err(FetchError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn http_store_joins_urls() -> anyhow::Result<()> {
        let store = HttpStore::new("https://bucket.example.com/model_assets/")?;
        assert_eq!(
            store.url("model.ckpt"),
            "https://bucket.example.com/model_assets/model.ckpt"
        );
        assert_eq!(store.location(), "https://bucket.example.com/model_assets");
        Ok(())
    }
}
