//! Defense wire contract.
//!
//! A defense exposes exactly one endpoint: `POST /` on TCP 8080 of its
//! container, request body = raw PE bytes, response
//! `{"result": 0}` or `{"result": 1}` as `application/json`. Workers never
//! talk to the container directly; every request goes through the egress
//! gateway with the two headers below.

use serde::Deserialize;
use thiserror::Error;

/// Header naming the container URL the gateway should forward to.
pub const HEADER_TARGET_URL: &str = "X-Target-Url";
/// Header carrying the shared gateway secret.
pub const HEADER_GATEWAY_AUTH: &str = "X-Gateway-Auth";

/// Port the defense container must listen on.
pub const DEFENSE_PORT: u16 = 8080;

/// Size of the canonical probe payload in bytes.
const PROBE_LEN: usize = 4096;

/// Canonical minimal-PE probe: the `MZ` magic followed by zero padding.
///
/// Enough for a classifier to treat it as a PE file, small enough to be a
/// trivial request. Defenses that choke on it fail functional validation.
pub fn probe_payload() -> Vec<u8> {
    let mut buf = vec![0u8; PROBE_LEN];
    buf[0] = b'M';
    buf[1] = b'Z';
    buf
}

/// Deviations from the wire contract, one variant per taxonomy row.
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("http {status}: {snippet}")]
    HttpStatus { status: u16, snippet: String },
    #[error("parse error: expected application/json, got {0:?}")]
    ContentType(Option<String>),
    #[error("parse error: {0}")]
    Body(String),
    #[error("invalid prediction: {0}")]
    InvalidPrediction(serde_json::Value),
}

#[derive(Deserialize)]
struct PredictionBody {
    result: Option<serde_json::Value>,
}

/// Validate a defense response and extract its `0`/`1` prediction.
///
/// Pure over (status, content-type, body) so both the functional probe and
/// the evaluation loop share one implementation of the contract.
pub fn parse_prediction(
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<u8, PredictionError> {
    if status != 200 {
        let text = String::from_utf8_lossy(body);
        let snippet: String = text.chars().take(200).collect();
        return Err(PredictionError::HttpStatus { status, snippet });
    }

    match content_type {
        Some(ct) if ct.contains("application/json") => {}
        other => return Err(PredictionError::ContentType(other.map(str::to_string))),
    }

    let parsed: PredictionBody =
        serde_json::from_slice(body).map_err(|e| PredictionError::Body(e.to_string()))?;

    let value = parsed
        .result
        .ok_or_else(|| PredictionError::Body("missing field `result`".into()))?;

    match value.as_i64() {
        Some(0) => Ok(0),
        Some(1) => Ok(1),
        _ => Err(PredictionError::InvalidPrediction(value)),
    }
}
