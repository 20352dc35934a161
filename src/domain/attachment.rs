use bytes::Bytes;

/// An attachment as handed over by the presentation layer, before
/// validation and upload.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub bytes: Bytes,
    pub content_type: String,
}

impl MediaUpload {
    #[must_use]
    pub fn new(bytes: Bytes, content_type: impl Into<String>) -> Self {
        Self { bytes, content_type: content_type.into() }
    }
}
