//! The strategy interface the iteration driver delegates to.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::volume::{check_psf_extent, extent, Volume};
use std::fmt::Debug;

/// Whether a rule models one PSF for the whole volume or blends several across depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthModel {
    Invariant,
    StrataVolume,
    StrataPerStratum,
}

/// What a rule allows after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The PSF may be replaced.
    pub set_psf: bool,
    /// The image may be replaced by one of a different extent.
    pub reshape_image: bool,
}

/// Static description of an update rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleConfig {
    pub name: String,
    pub description: String,
    /// Optional reference as `(label, url)`.
    pub hyperlink: Option<(String, String)>,
    pub depth_model: DepthModel,
    pub capabilities: Capabilities,
}

/// Outcome of one call to [`UpdateRule::iterate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The rule has converged; the driver stops after this iteration.
    Converged,
}

/// Buffers handed to a rule for one iteration.
///
/// `old` holds the estimate as it was before the iteration; `estimate` starts out equal to
/// it and receives the update.
pub struct IterationContext<'a, T: DeconvFloat> {
    /// Zero-based index of the iteration being computed.
    pub iteration: usize,
    pub old: &'a Volume<T>,
    pub estimate: &'a mut Volume<T>,
}

/// The numeric update of an iterative estimator.
///
/// A rule owns its image and its cached OTF(s); the driver owns the estimate. `iterate`
/// takes `&mut self`, so two iterations can never run concurrently on one rule.
pub trait UpdateRule<T: DeconvFloat>: Send + Debug {
    /// Returns the rule configuration, including name, description and capabilities.
    fn config(&self) -> RuleConfig;

    /// The observed image the rule restores.
    fn image(&self) -> &Volume<T>;

    /// Replaces the PSF and recomputes the OTF.
    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()> {
        let _ = psf;
        Err(DeconvolutionError::unsupported(self.config().name, "set_psf"))
    }

    /// Replaces the image, recomputing the OTF when the extent changes.
    fn set_image(&mut self, image: &Volume<T>) -> Result<()>;

    /// Computes one iteration.
    fn iterate(&mut self, context: IterationContext<'_, T>) -> Result<Step>;
}

/// An in-place regularization step applied at the end of an EM iteration.
pub trait Regularizer<T: DeconvFloat>: Send {
    fn apply(&mut self, estimate: &mut Volume<T>);
}

impl<T, F> Regularizer<T> for F
where
    T: DeconvFloat,
    F: FnMut(&mut Volume<T>) + Send,
{
    fn apply(&mut self, estimate: &mut Volume<T>) {
        self(estimate)
    }
}

/// Checks every PSF against the image extent.
pub(crate) fn check_psfs<T: DeconvFloat>(psfs: &[Volume<T>], image: &Volume<T>) -> Result<()> {
    let image_extent = extent(&image.view());
    psfs.iter()
        .try_for_each(|psf| check_psf_extent(extent(&psf.view()), image_extent))
}

/// Rejects a replacement image whose extent differs from the current one.
pub(crate) fn check_same_shape<T: DeconvFloat>(
    rule: &str,
    current: &Volume<T>,
    replacement: &Volume<T>,
) -> Result<()> {
    if current.dim() == replacement.dim() {
        Ok(())
    } else {
        Err(DeconvolutionError::unsupported(
            rule,
            "set_image with a different extent",
        ))
    }
}
