//! Defense source resolution: turn a `DefenseSource` into a local image.
//!
//! Three provenances, one outcome: an image name the sandbox can start.
//! Git and zip sources pass through the same hardened build-context
//! validation before anything is handed to the builder.

mod archive;
mod context;
mod docker;
mod git;

pub use archive::extract_zip;
pub use context::validate_build_context;
pub use docker::resolve_image_reference;

use thiserror::Error;
use tracing::info;

use crucible_db::DefenseSource;
use crucible_protocol::SourceSettings;

use crate::blob::{BlobError, BlobStore};
use crate::sandbox::{ContainerRuntime, SandboxError};

#[derive(Debug, Error)]
pub enum SourceError {
    /// The submission itself is at fault (oversized, malicious, no
    /// Dockerfile). The defense gets marked failed with this message.
    #[error("{0}")]
    Rejected(String),

    #[error("blob download failed: {0}")]
    Blob(#[from] BlobError),

    #[error("clone failed: {0}")]
    Clone(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether this failure is attributable to the submission (and should
    /// retire the defense) rather than to the infrastructure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Image tag for a built defense.
pub fn image_tag(submission_id: &str) -> String {
    format!("defense-{submission_id}:latest")
}

/// Phase C: obtain the defense image, whatever the provenance.
pub async fn resolve(
    runtime: &dyn ContainerRuntime,
    blob: &BlobStore,
    submission_id: &str,
    source: &DefenseSource,
    settings: &SourceSettings,
) -> Result<String, SourceError> {
    match source {
        DefenseSource::DockerImage { reference } => {
            let image = resolve_image_reference(reference);
            info!(reference = %reference, image = %image, "Pulling defense image");
            runtime.pull_image(&image).await?;
            Ok(image)
        }
        DefenseSource::GitRepo { url } => {
            let checkout = tempfile::tempdir()?;
            git::clone_shallow(url, checkout.path(), settings).await?;
            validate_build_context(checkout.path(), settings)?;

            let tag = image_tag(submission_id);
            info!(url = %url, tag = %tag, "Building defense image from git checkout");
            runtime.build_image(checkout.path(), &tag, settings).await?;
            Ok(tag)
        }
        DefenseSource::ZipArchive { object_key } => {
            let bytes = blob.get(object_key).await?;

            let max_zip_bytes = settings.max_zip_size_mb * 1024 * 1024;
            if bytes.len() as u64 > max_zip_bytes {
                return Err(SourceError::Rejected(format!(
                    "zip archive is {} bytes (max: {max_zip_bytes})",
                    bytes.len()
                )));
            }

            let extraction = tempfile::tempdir()?;
            extract_zip(&bytes, extraction.path(), settings)?;
            validate_build_context(extraction.path(), settings)?;

            let tag = image_tag(submission_id);
            info!(object_key = %object_key, tag = %tag, "Building defense image from zip archive");
            runtime.build_image(extraction.path(), &tag, settings).await?;
            Ok(tag)
        }
    }
}
