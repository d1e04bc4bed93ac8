use std::{fs, io, path::Path};

use anyhow::Result;
use image::DynamicImage;
use pix2pix_rs_common::{http_get, CheckpointSource, FetchError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{models::Loader, EditError, EditOutput, EditParams, Pipeline, TryIntoDType};

/// One edit request: where to find the source image and what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EditRequest {
    /// `http(s)://` URL, `file://` URL or local path of the source image.
    pub input: String,
    /// The edit instruction, e.g. "make it look like a watercolor".
    pub edit: String,
}

/// Retrieve and decode a source image. The format is guessed from the bytes.
pub fn fetch_image(input: &str) -> std::result::Result<DynamicImage, EditError> {
    let retrieval = |source: FetchError| EditError::Retrieval {
        input: input.to_string(),
        source,
    };
    let bytes = if input.starts_with("http://") || input.starts_with("https://") {
        http_get(input).map_err(retrieval)?
    } else {
        let path = Path::new(input.strip_prefix("file://").unwrap_or(input));
        fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => retrieval(FetchError::NotFound(input.to_string())),
            _ => retrieval(FetchError::Io(e)),
        })?
    };
    let image = image::load_from_memory(&bytes).map_err(|source| EditError::Decode {
        input: input.to_string(),
        source,
    })?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Request-level entry point: a pipeline loaded once, serving edits with fixed parameters.
pub struct Predictor {
    pipeline: Pipeline,
    params: EditParams,
}

impl Predictor {
    pub fn new(pipeline: Pipeline, params: EditParams) -> Self {
        Self { pipeline, params }
    }

    /// Retrieve the checkpoint (and optional VAE) into the local cache and load the pipeline.
    pub fn setup(
        checkpoint: &CheckpointSource,
        vae: Option<&CheckpointSource>,
        loader: &dyn Loader,
        dtype: &dyn TryIntoDType,
        params: EditParams,
        silent: bool,
    ) -> Result<Self> {
        let pipeline = Pipeline::load(checkpoint, vae, loader, silent, dtype)?;
        Ok(Self::new(pipeline, params))
    }

    pub fn params(&self) -> &EditParams {
        &self.params
    }

    pub fn predict(&self, request: &EditRequest) -> Result<EditOutput> {
        info!("editing `{}`: {:?}", request.input, request.edit);
        let image = fetch_image(&request.input)?;
        self.pipeline.edit(&image, &request.edit, &self.params)
    }

    /// [`Predictor::predict`] on a JSON encoded [`EditRequest`].
    pub fn predict_json(&self, request: &str) -> Result<EditOutput> {
        let request: EditRequest = serde_json::from_str(request)?;
        self.predict(&request)
    }
}
