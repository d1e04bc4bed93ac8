use pix2pix_rs_common::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EditError {
    #[error("invalid edit parameters: {0}")]
    InvalidParams(String),

    #[error("a {width}x{height} image cannot be edited at resolution {resolution}: a side would be zero or too large")]
    InvalidDimensions {
        width: u32,
        height: u32,
        resolution: u32,
    },

    #[error("failed to retrieve `{input}`: {source}")]
    Retrieval {
        input: String,
        #[source]
        source: FetchError,
    },

    #[error("failed to decode `{input}`: {source}")]
    Decode {
        input: String,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
