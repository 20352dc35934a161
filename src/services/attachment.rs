use crate::config::{ALLOWED_MEDIA_TYPES, AttachmentConfig};
use crate::domain::attachment::MediaUpload;
use crate::error::{AppError, Result};
use crate::platform::BlobStore;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    uploaded_bytes: Counter<u64>,
    upload_size_bytes: Histogram<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("waveline-messaging");
        Self {
            uploaded_bytes: meter
                .u64_counter("waveline_attachments_uploaded_bytes")
                .with_description("Total bytes of attachments uploaded")
                .build(),
            upload_size_bytes: meter
                .u64_histogram("waveline_attachment_upload_size_bytes")
                .with_description("Distribution of attachment upload sizes")
                .build(),
        }
    }
}

/// Validates and uploads message attachments. Validation runs entirely
/// locally, so an oversized or mistyped attachment never generates a
/// network call.
#[derive(Clone, Debug)]
pub struct AttachmentService {
    blobs: Arc<dyn BlobStore>,
    config: AttachmentConfig,
    metrics: Metrics,
}

impl AttachmentService {
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>, config: AttachmentConfig) -> Self {
        Self { blobs, config, metrics: Metrics::new() }
    }

    /// Uploads a validated attachment and returns its stable URL.
    ///
    /// # Errors
    /// Returns `AppError::Validation` if the attachment exceeds the size
    /// limit or carries a content type outside the image allow-list, before
    /// any upload is attempted.
    #[tracing::instrument(
        err(level = "warn"),
        skip(self, media),
        fields(attachment_id = tracing::field::Empty, attachment_size = media.bytes.len())
    )]
    pub async fn upload(&self, media: MediaUpload) -> Result<String> {
        self.validate(&media)?;

        let id = Uuid::new_v4();
        tracing::Span::current().record("attachment_id", tracing::field::display(id));

        let size = media.bytes.len();
        let url = self.blobs.put(&id.to_string(), &media.content_type, media.bytes).await?;

        self.metrics.uploaded_bytes.add(size as u64, &[]);
        self.metrics.upload_size_bytes.record(size as u64, &[]);
        tracing::debug!(attachment_id = %id, size, "Attachment uploaded");

        Ok(url)
    }

    fn validate(&self, media: &MediaUpload) -> Result<()> {
        if media.bytes.len() > self.config.max_size_bytes {
            return Err(AppError::Validation(format!(
                "Attachment of {} bytes exceeds the {}-byte limit",
                media.bytes.len(),
                self.config.max_size_bytes
            )));
        }
        if !ALLOWED_MEDIA_TYPES.contains(&media.content_type.as_str()) {
            return Err(AppError::Validation(format!(
                "Unsupported attachment type: {}",
                media.content_type
            )));
        }
        Ok(())
    }
}
