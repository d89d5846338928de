//! Error types

/// Image decoding and pipeline error
///
/// Decode errors never escape the cache; they are stored on the cached
/// image as its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("Unrecognized image format: {0}")]
    UnrecognizedFormat(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("Stream ended before the image was complete")]
    TruncatedStream,

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Failed to allocate {bytes} bytes")]
    AllocationFailure { bytes: usize },
}

impl From<png::DecodingError> for ImageError {
    fn from(e: png::DecodingError) -> Self {
        Self::CodecError(e.to_string())
    }
}

impl From<image::ImageError> for ImageError {
    fn from(e: image::ImageError) -> Self {
        Self::CodecError(e.to_string())
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive finite number, got {value}")]
    InvalidGamma { name: &'static str, value: f32 },

    #[error("pixel_aspect must be a positive finite number, got {0}")]
    InvalidAspect(f64),
}
