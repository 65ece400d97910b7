//! Functional validation of a defense container (Phase F).
//!
//! Two checks, in order: the uncompressed image stays under the configured
//! bound, and a canonical probe POST honours the wire contract. The error
//! text becomes the submission's `functional_error` verbatim, so it is
//! written for the submitting user, not for operators.

use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crucible_protocol::wire::PredictionError;
use crucible_protocol::{parse_prediction, probe_payload, WorkerSettings};

use crate::gateway::Gateway;
use crate::sandbox::ContainerRuntime;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("image size {actual_mb} MB exceeds limit of {limit_mb} MB")]
    ImageTooLarge { actual_mb: u64, limit_mb: u64 },

    #[error("image could not be inspected: {0}")]
    ImageUnreadable(String),

    #[error("could not POST to the defense endpoint: {0}")]
    Unreachable(String),

    #[error("POST / returned HTTP {0}")]
    BadStatus(u16),

    #[error("expected application/json response, got {0}")]
    BadContentType(String),

    #[error("failed to parse JSON response: {0}")]
    BadBody(String),

    #[error("result must be 0 or 1, got {0}")]
    BadPrediction(serde_json::Value),
}

/// Run both functional checks against a live container.
pub async fn validate_functional(
    runtime: &dyn ContainerRuntime,
    gateway: &dyn Gateway,
    image: &str,
    container_url: &str,
    settings: &WorkerSettings,
) -> Result<(), ValidationError> {
    // 1. Image size bound — before a single byte is POSTed.
    let size_bytes = runtime
        .image_size_bytes(image)
        .await
        .map_err(|e| ValidationError::ImageUnreadable(e.to_string()))?;
    let actual_mb = size_bytes / (1024 * 1024);
    let limit_mb = settings.defense_job.max_uncompressed_size_mb;
    if actual_mb > limit_mb {
        return Err(ValidationError::ImageTooLarge { actual_mb, limit_mb });
    }
    info!(image, actual_mb, limit_mb, "Image size within bound");

    // 2. Probe the endpoint with a minimal PE payload.
    let timeout = Duration::from_secs(settings.evaluation.requests_timeout_seconds);
    let response = gateway
        .post(container_url, probe_payload().into(), timeout)
        .await
        .map_err(|e| ValidationError::Unreachable(e.to_string()))?;

    match parse_prediction(response.status, response.content_type.as_deref(), &response.body) {
        Ok(label) => {
            info!(image, label, "Probe accepted, defense honours the wire contract");
            Ok(())
        }
        Err(PredictionError::HttpStatus { status, .. }) => Err(ValidationError::BadStatus(status)),
        Err(PredictionError::ContentType(ct)) => {
            Err(ValidationError::BadContentType(ct.unwrap_or_else(|| "nothing".to_string())))
        }
        Err(PredictionError::Body(msg)) => Err(ValidationError::BadBody(msg)),
        Err(PredictionError::InvalidPrediction(value)) => Err(ValidationError::BadPrediction(value)),
    }
}
