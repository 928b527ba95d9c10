//! Estimators: one-shot linear filters and the iteration driver.
//!
//! Every estimator owns its PSF(s), the observed image and the current estimate, and is
//! driven through the [`Estimate`] trait. [`build_estimator`] turns
//! [`DeconvolutionSettings`] into a boxed estimator.

pub mod iterative;
pub mod linear;

use crate::config::{Algorithm, DeconvolutionSettings, Residency};
use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::observer::DriverState;
use crate::rules::{
    JanssonVanCittert, OtfResidency, RichardsonLucy, StrataBlendPerStratum, StrataBlendVolume,
    UpdateRule,
};
use crate::store::{OtfCache, VolumeStore};
use crate::volume::Volume;
use iterative::IterativeEstimate;
use linear::{LinearLeastSquares, MaximumAPosteriori};
use ndarray::ArrayView3;
use std::fmt::Debug;

/// Lifecycle of an estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Aborted,
    Done,
}

/// Why a run ended before reaching its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `abort()` or a cancelled token.
    Cancelled,
    /// The update rule reported convergence.
    Converged,
}

/// Outcome of a call to [`Estimate::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Iterations computed by this call.
    pub iterations_executed: usize,
    /// Iterations computed since the last reset.
    pub iterations_done: usize,
    pub state: RunState,
    pub stop: Option<StopReason>,
}

/// Common interface of all estimators.
pub trait Estimate<T: DeconvFloat>: Send + Debug {
    fn name(&self) -> String;

    /// Replaces the PSF. Fails with `DimensionMismatch` if it does not fit the image, and
    /// with `UnsupportedOperation` on depth-variant estimators.
    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()>;

    /// Replaces the observed image and resets the estimate.
    fn set_image(&mut self, image: &Volume<T>) -> Result<()>;

    /// Read-only view of the current estimate.
    fn results(&self) -> ArrayView3<'_, T>;

    fn run(&mut self) -> Result<RunSummary>;

    /// Access to the iteration driver, for estimators that have one.
    fn as_iterative_mut(&mut self) -> Option<&mut IterativeEstimate<T>> {
        None
    }
}

/// Builds the estimator described by `settings`.
///
/// Depth-variant algorithms expect `number_of_strata + 1` PSFs ordered by depth; all other
/// algorithms expect exactly one. Streaming residency needs a `store` for the OTFs; a
/// temporary `.npy` directory is used when none is given.
pub fn build_estimator<T>(
    settings: &DeconvolutionSettings,
    psfs: Vec<Volume<T>>,
    image: Volume<T>,
    store: Option<Box<dyn VolumeStore<T>>>,
) -> Result<Box<dyn Estimate<T>>>
where
    T: DeconvFloat + ndarray_npy::WritableElement + ndarray_npy::ReadableElement,
    num_complex::Complex<T>: ndarray_npy::WritableElement + ndarray_npy::ReadableElement,
{
    settings.validate()?;
    let epsilon = T::from_f64_c(settings.epsilon);
    let expected_psfs = if settings.algorithm.is_depth_variant() {
        settings.number_of_strata + 1
    } else {
        1
    };
    if psfs.len() != expected_psfs {
        return Err(DeconvolutionError::InvalidConfiguration(format!(
            "{:?} expects {expected_psfs} PSF(s), got {}",
            settings.algorithm,
            psfs.len()
        )));
    }

    let residency = || -> Result<OtfResidency<T>> {
        Ok(match settings.residency {
            Residency::Resident => OtfResidency::Resident,
            Residency::Streaming => {
                let store = match store {
                    Some(store) => store,
                    None => Box::new(crate::store::NpyStore::temporary()?),
                };
                OtfResidency::Streaming(OtfCache::new(store))
            }
        })
    };

    let mut psfs = psfs;
    let rule: Box<dyn UpdateRule<T>> = match settings.algorithm {
        Algorithm::LinearLeastSquares => {
            return Ok(Box::new(LinearLeastSquares::new(
                psfs.remove(0),
                image,
                T::from_f64_c(settings.linear_threshold),
            )?));
        }
        Algorithm::MaximumAPosteriori => {
            return Ok(Box::new(MaximumAPosteriori::new(
                psfs.remove(0),
                image,
                T::from_f64_c(settings.map_alpha),
                epsilon,
            )?));
        }
        Algorithm::RichardsonLucy => Box::new(RichardsonLucy::new(
            psfs.remove(0),
            image,
            settings.boundary,
            epsilon,
        )?),
        Algorithm::JanssonVanCittert => {
            Box::new(JanssonVanCittert::new(psfs.remove(0), image, epsilon)?)
        }
        Algorithm::StrataBlendVolume => Box::new(StrataBlendVolume::new(
            &psfs,
            image,
            settings.number_of_strata,
            settings.boundary,
            residency()?,
            epsilon,
        )?),
        Algorithm::StrataBlendPerStratum => Box::new(StrataBlendPerStratum::new(
            &psfs,
            image,
            settings.number_of_strata,
            settings.boundary,
            residency()?,
            epsilon,
        )?),
    };

    let mut estimate = IterativeEstimate::new(rule, settings.iterations);
    estimate.add_observer(
        settings.progress_interval,
        |state: &DriverState<'_, T>| -> Result<()> {
            log::info!(
                "{}: iteration {}/{}",
                state.rule,
                state.iterations_done,
                state.iterations_target
            );
            Ok(())
        },
    )?;
    Ok(Box::new(estimate))
}
