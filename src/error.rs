use thiserror::Error;

/// Pipeline error type.
///
/// Configuration errors are fatal at initialization; no partial pipeline is
/// left running. Runtime codec and resource errors are recoverable at the
/// granularity of one frame: the caller sees a skipped frame, not a dead
/// stream, unless the codec context itself is in a terminal state.
#[derive(Error, Debug)]
pub enum WriterError {
    /// Unsupported pixel format, bad filter expression, unopenable hardware
    /// device, or unsupported codec/muxer combination.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An FFmpeg call failed at runtime (encode, upload, write).
    #[error("codec error: {0}")]
    Codec(#[from] ffmpeg_next::Error),

    /// A bounded resource was exhausted (e.g. the hardware frame pool).
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// The caller broke an API contract (wrong audio buffer size,
    /// submission after flush).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The container trailer could not be written. Teardown still releases
    /// all contexts when this is reported.
    #[error("shutdown error: {0}")]
    Shutdown(ffmpeg_next::Error),
}

impl WriterError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, WriterError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_display() {
        let err = WriterError::Configuration("no compatible pixel format".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: no compatible pixel format"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn resource_display() {
        let err = WriterError::Resource("hardware frame pool exhausted".to_string());
        assert_eq!(err.to_string(), "resource exhausted: hardware frame pool exhausted");
        assert!(!err.is_configuration());
    }

    #[test]
    fn codec_conversion() {
        let err: WriterError = ffmpeg_next::Error::Eof.into();
        assert!(matches!(err, WriterError::Codec(_)));
    }
}
