//! Error type shared by every estimator, rule and store in this crate.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = DeconvolutionError> = std::result::Result<T, E>;

/// Everything that can go wrong while configuring or running a deconvolution.
///
/// Numeric guards (substituting epsilon for near-zero denominators) are not errors and
/// never surface here.
#[derive(Debug, Error)]
pub enum DeconvolutionError {
    /// The PSF does not fit inside the image, or an extent is zero.
    #[error("PSF extent {psf:?} does not fit image extent {image:?}")]
    DimensionMismatch { psf: [usize; 3], image: [usize; 3] },

    /// A setting or constructor argument is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The update rule does not support the requested operation after construction.
    #[error("{rule} does not support {operation}")]
    UnsupportedOperation {
        rule: String,
        operation: &'static str,
    },

    /// An OTF could not be read back from the backing store during a streaming run.
    ///
    /// `otf` is the index of the PSF the OTF belongs to (`0..=S`); stratum `m` blends
    /// OTFs `m` and `m + 1`.
    #[error("failed to stream OTF {otf} in iteration {iteration}")]
    StreamingIo {
        otf: usize,
        iteration: usize,
        #[source]
        source: Box<DeconvolutionError>,
    },

    /// Reading or writing a named blob failed.
    #[error("store access to '{name}' failed: {source}")]
    Store {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The FFT backend rejected a buffer.
    #[error("transform failed: {0}")]
    Transform(String),

    /// An observer asked to fail the run.
    #[error("observer failed: {0}")]
    Observer(String),
}

impl DeconvolutionError {
    pub(crate) fn store(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        DeconvolutionError::Store {
            name: name.into(),
            source: source.into(),
        }
    }

    pub(crate) fn unsupported(rule: impl Into<String>, operation: &'static str) -> Self {
        DeconvolutionError::UnsupportedOperation {
            rule: rule.into(),
            operation,
        }
    }
}
