// Request parsing utilities for HTTP handlers

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hyper::body::HttpBody;
use hyper::{Body, Response, StatusCode};
use meshgen_types::{GenerationInput, GenerationRequest, InputImage, Seed, ViewName};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::response_helpers::json_error;

/// Parse JSON request body into a typed structure.
///
/// Returns the deserialized value on success, or an error Response on failure.
/// Bodies over `limit` bytes are refused with 413 before they are buffered
/// when a length is declared, and as soon as they cross it otherwise.
/// An empty body parses as `{}` so endpoints with all-default fields accept it.
pub async fn parse_json_body<T: DeserializeOwned>(mut body: Body, limit: u64) -> Result<T, Response<Body>> {
    let too_large = || {
        log::warn!(target: "server", "[REQUEST] Body over the {limit} byte limit rejected");
        json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("Request body exceeds the {} MiB limit", limit.div_ceil(1024 * 1024)),
        )
    };

    let declared = body.size_hint().lower();
    if declared > limit {
        return Err(too_large());
    }
    let mut body_bytes = Vec::with_capacity(usize::try_from(declared).unwrap_or(0));
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|_| json_error(StatusCode::BAD_REQUEST, "Failed to read request body"))?;
        if (body_bytes.len() + chunk.len()) as u64 > limit {
            return Err(too_large());
        }
        body_bytes.extend_from_slice(&chunk);
    }

    let raw: &[u8] = if body_bytes.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &body_bytes
    };
    log::debug!(target: "server", "[REQUEST] Body of {} bytes", body_bytes.len());

    serde_json::from_slice::<T>(raw).map_err(|e| {
        log::error!(target: "server", "[REQUEST] JSON parsing error: {e}");
        json_error(StatusCode::BAD_REQUEST, &format!("Invalid JSON format: {e}"))
    })
}

/// Decode a base64 PNG/JPEG payload, with or without a `data:` URI prefix.
pub fn decode_image(field: &str, encoded: &str) -> Result<InputImage, String> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| format!("{field}: invalid base64 ({e})"))?;
    InputImage::decode(&bytes).map_err(|e| format!("{field}: not a PNG or JPEG image ({e})"))
}

/// JSON body of the generation endpoints. Omitted fields take the UI defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenerateBody {
    pub image: Option<String>,
    pub views: Option<BTreeMap<String, String>>,
    pub caption: Option<String>,
    pub steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub seed: Option<u64>,
    pub randomize_seed: bool,
    pub octree_resolution: Option<u32>,
    pub remove_background: Option<bool>,
    pub num_chunks: Option<u32>,
}

impl GenerateBody {
    /// Build the request. `image` wins over `views`, which win over `caption`.
    pub fn into_request(self, default_steps: u32) -> Result<GenerationRequest, String> {
        let input = if let Some(image) = self.image.as_deref() {
            GenerationInput::Image(decode_image("image", image)?)
        } else if let Some(views) = self.views {
            let mut decoded = BTreeMap::new();
            for (name, encoded) in views {
                let view: ViewName = name.parse()?;
                decoded.insert(view, decode_image(&name, &encoded)?);
            }
            GenerationInput::MultiView(decoded)
        } else if let Some(caption) = self.caption {
            GenerationInput::Caption(caption)
        } else {
            return Err("provide an image, views or a caption".to_string());
        };

        let mut request = GenerationRequest::new(input).with_steps(self.steps.unwrap_or(default_steps));
        if let Some(guidance_scale) = self.guidance_scale {
            request = request.with_guidance_scale(guidance_scale);
        }
        if self.randomize_seed {
            request = request.with_seed(Seed::Randomize);
        } else if let Some(seed) = self.seed {
            request = request.with_seed(Seed::Fixed(seed));
        }
        if let Some(octree_resolution) = self.octree_resolution {
            request = request.with_octree_resolution(octree_resolution);
        }
        if let Some(remove_background) = self.remove_background {
            request = request.with_remove_background(remove_background);
        }
        if let Some(num_chunks) = self.num_chunks {
            request = request.with_num_chunks(num_chunks);
        }
        Ok(request)
    }
}

/// JSON body of `POST /api/export`.
#[derive(Debug, Deserialize)]
pub struct ExportBody {
    pub folder_id: String,
    #[serde(flatten)]
    pub options: meshgen_engine::ExportOptions,
}
