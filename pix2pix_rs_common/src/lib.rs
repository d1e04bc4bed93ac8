//! Shared plumbing for pix2pix_rs: artifact stores, the local checkpoint cache, checkpoint
//! loading and progress reporting.

mod artifact;
mod cache;
mod checkpoint;
mod lock;
mod model_source;
mod progress;
mod tokens;

pub use artifact::{http_get, ArtifactStore, FetchError, HttpStore, HubStore, LocalStore};
pub use cache::{CacheError, CheckpointCache, CACHE_DIR_ENV};
pub use checkpoint::{KeyReport, StateDict, FIRST_STAGE_PREFIX};
pub use lock::CacheLock;
pub use model_source::CheckpointSource;
pub use progress::{IterWithProgress, NiceProgressBar};
pub use tokens::{get_token, TokenSource};

pub use candle_core as core;
