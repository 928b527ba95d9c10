//! Closed-form restorations in the Fourier domain.
//!
//! Both filters transform image and PSF once, when they are set, and compute the estimate
//! bin by bin on `run()`. The result depends only on the inputs, so repeated runs are
//! bit-identical.

use crate::error::Result;
use crate::estimate::{Estimate, RunState, RunSummary};
use crate::float::DeconvFloat;
use crate::fourier::Convolver;
use crate::rules::rule::check_psfs;
use crate::volume::{extent, uniform_prior, Boundary, Spectrum, Volume};
use ndarray::{Array3, ArrayView3, Zip};
use num_complex::Complex;

/// PSF, image and their cached spectra, shared by the linear filters.
#[derive(Debug)]
struct LinearModel<T: DeconvFloat> {
    convolver: Convolver<T>,
    psf: Volume<T>,
    image: Volume<T>,
    otf: Spectrum<T>,
    image_spectrum: Spectrum<T>,
    estimate: Volume<T>,
    state: RunState,
}

impl<T: DeconvFloat> LinearModel<T> {
    fn new(psf: Volume<T>, image: Volume<T>) -> Result<Self> {
        check_psfs(std::slice::from_ref(&psf), &image)?;
        let shape = extent(&image.view());
        let convolver = Convolver::new(shape, Boundary::Zero)?;
        let otf = convolver.otf(&psf)?;
        let image_spectrum = convolver.forward(image.view())?;
        Ok(LinearModel {
            convolver,
            psf,
            image,
            otf,
            image_spectrum,
            estimate: uniform_prior(shape),
            state: RunState::NotStarted,
        })
    }

    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()> {
        check_psfs(std::slice::from_ref(psf), &self.image)?;
        self.otf = self.convolver.otf(psf)?;
        self.psf = psf.clone();
        self.reset();
        Ok(())
    }

    fn set_image(&mut self, image: &Volume<T>) -> Result<()> {
        if image.dim() != self.image.dim() {
            check_psfs(std::slice::from_ref(&self.psf), image)?;
            self.convolver = Convolver::new(extent(&image.view()), Boundary::Zero)?;
            self.otf = self.convolver.otf(&self.psf)?;
        }
        self.image_spectrum = self.convolver.forward(image.view())?;
        self.image = image.clone();
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        self.estimate = uniform_prior(extent(&self.image.view()));
        self.state = RunState::NotStarted;
    }

    /// Inverse transform of the filtered spectrum with negatives clamped to zero.
    fn finish(&mut self, filtered: Spectrum<T>) -> Result<RunSummary> {
        let mut estimate = self.convolver.inverse(filtered)?;
        estimate.par_mapv_inplace(|v| v.max(T::zero()));
        self.estimate = estimate;
        self.state = RunState::Done;
        Ok(RunSummary {
            iterations_executed: 1,
            iterations_done: 1,
            state: RunState::Done,
            stop: None,
        })
    }
}

/// Thresholded inverse filter: `G / H` where `|H| > threshold`, 0 elsewhere.
#[derive(Debug)]
pub struct LinearLeastSquares<T: DeconvFloat> {
    model: LinearModel<T>,
    threshold: T,
}

impl<T: DeconvFloat> LinearLeastSquares<T> {
    pub fn new(psf: Volume<T>, image: Volume<T>, threshold: T) -> Result<Self> {
        Ok(LinearLeastSquares {
            model: LinearModel::new(psf, image)?,
            threshold,
        })
    }

    pub fn state(&self) -> RunState {
        self.model.state
    }
}

impl<T: DeconvFloat> Estimate<T> for LinearLeastSquares<T> {
    fn name(&self) -> String {
        "Linear least squares".to_string()
    }

    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()> {
        self.model.set_psf(psf)
    }

    fn set_image(&mut self, image: &Volume<T>) -> Result<()> {
        self.model.set_image(image)
    }

    fn results(&self) -> ArrayView3<'_, T> {
        self.model.estimate.view()
    }

    fn run(&mut self) -> Result<RunSummary> {
        let threshold = self.threshold;
        let zero = Complex::new(T::zero(), T::zero());
        let mut filtered = Array3::from_elem(self.model.image_spectrum.raw_dim(), zero);
        Zip::from(&mut filtered)
            .and(&self.model.image_spectrum)
            .and(&self.model.otf)
            .par_for_each(|f, &g, &h| {
                if h.norm() > threshold {
                    *f = g / h;
                }
            });
        self.model.finish(filtered)
    }
}

/// Tikhonov-regularized inverse filter:
///
/// ```text
/// F = conj(H) · G / (|H|² + 2 α Σ_d (k_d / n_d)²)
/// ```
///
/// where `k_d` is the signed bin index along axis `d`. Bins where `G` is exactly zero carry
/// no data and stay zero.
#[derive(Debug)]
pub struct MaximumAPosteriori<T: DeconvFloat> {
    model: LinearModel<T>,
    alpha: T,
    epsilon: T,
}

impl<T: DeconvFloat> MaximumAPosteriori<T> {
    pub fn new(psf: Volume<T>, image: Volume<T>, alpha: T, epsilon: T) -> Result<Self> {
        Ok(MaximumAPosteriori {
            model: LinearModel::new(psf, image)?,
            alpha,
            epsilon,
        })
    }

    pub fn state(&self) -> RunState {
        self.model.state
    }
}

/// Squared unit frequency `(k / n)²` of bin `index` on an axis of `n` samples, with bins
/// past the Nyquist index wrapped to negative frequencies.
fn squared_frequency<T: DeconvFloat>(index: usize, n: usize) -> T {
    let k = if index <= n / 2 {
        index as f64
    } else {
        index as f64 - n as f64
    };
    let f = k / n as f64;
    T::from_f64_c(f * f)
}

impl<T: DeconvFloat> Estimate<T> for MaximumAPosteriori<T> {
    fn name(&self) -> String {
        "Maximum a posteriori".to_string()
    }

    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()> {
        self.model.set_psf(psf)
    }

    fn set_image(&mut self, image: &Volume<T>) -> Result<()> {
        self.model.set_image(image)
    }

    fn results(&self) -> ArrayView3<'_, T> {
        self.model.estimate.view()
    }

    fn run(&mut self) -> Result<RunSummary> {
        let [n0, n1, n2] = extent(&self.model.image.view());
        let penalty = self.alpha + self.alpha;
        let epsilon = self.epsilon;
        let zero = Complex::new(T::zero(), T::zero());
        let mut filtered = Array3::from_elem(self.model.image_spectrum.raw_dim(), zero);
        Zip::indexed(&mut filtered)
            .and(&self.model.image_spectrum)
            .and(&self.model.otf)
            .par_for_each(|(i, j, k), f, &g, &h| {
                if g.re == T::zero() && g.im == T::zero() {
                    return;
                }
                let distance = squared_frequency::<T>(i, n0)
                    + squared_frequency::<T>(j, n1)
                    + squared_frequency::<T>(k, n2);
                let mut denominator = h.norm_sqr() + penalty * distance;
                if denominator <= epsilon {
                    denominator = epsilon;
                }
                *f = h.conj() * g / denominator;
            });
        self.model.finish(filtered)
    }
}
