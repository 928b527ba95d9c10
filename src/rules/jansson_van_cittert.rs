//! Jansson-van Cittert deconvolution.
//!
//! An additive update whose step size vanishes at both ends of the admissible range, so
//! the estimate is pulled towards `[0, max(image)]`. The rule reports convergence to the
//! driver instead of running to the iteration target.

use crate::error::Result;
use crate::float::DeconvFloat;
use crate::fourier::Convolver;
use crate::rules::rule::{
    check_psfs, Capabilities, DepthModel, IterationContext, RuleConfig, Step, UpdateRule,
};
use crate::volume::{
    clamp_into, extent, max_abs_difference, max_value, Boundary, Spectrum, Volume,
};
use ndarray::Zip;

/// Nonlinear additive update with a relaxation that vanishes at `0` and `2A`:
///
/// ```text
/// estimate = old + (1 - ((old - A) / A)²) · (image - blurred),   clamped to [0, 2A]
/// ```
///
/// where `A = max(image) / 2`. Reports convergence once `max|image - blurred| < ε`.
#[derive(Debug)]
pub struct JanssonVanCittert<T: DeconvFloat> {
    convolver: Convolver<T>,
    psf: Volume<T>,
    image: Volume<T>,
    otf: Spectrum<T>,
    half_max: T,
    epsilon: T,
}

fn half_max<T: DeconvFloat>(image: &Volume<T>) -> T {
    max_value(&image.view()) / T::from_f64_c(2.0)
}

impl<T: DeconvFloat> JanssonVanCittert<T> {
    /// Creates the rule on a zero-padded grid.
    ///
    /// # Arguments
    /// * `psf` - The point-spread function; it must fit inside the image
    /// * `image` - The observed volume; its maximum sets the admissible range
    /// * `epsilon` - Convergence threshold on `max|image - blurred|`, also the lower bound of
    ///   the relaxation divisor
    pub fn new(psf: Volume<T>, image: Volume<T>, epsilon: T) -> Result<Self> {
        check_psfs(std::slice::from_ref(&psf), &image)?;
        let convolver = Convolver::new(extent(&image.view()), Boundary::Zero)?;
        let otf = convolver.otf(&psf)?;
        Ok(JanssonVanCittert {
            half_max: half_max(&image),
            convolver,
            psf,
            image,
            otf,
            epsilon,
        })
    }

    /// `A = max(image) / 2`.
    pub fn half_max(&self) -> T {
        self.half_max
    }
}

impl<T: DeconvFloat> UpdateRule<T> for JanssonVanCittert<T> {
    fn config(&self) -> RuleConfig {
        RuleConfig {
            name: "Jansson-van Cittert".to_string(),
            description: "Additive relaxation bounded to [0, max(image)].".to_string(),
            hyperlink: None,
            depth_model: DepthModel::Invariant,
            capabilities: Capabilities {
                set_psf: true,
                reshape_image: true,
            },
        }
    }

    fn image(&self) -> &Volume<T> {
        &self.image
    }

    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()> {
        check_psfs(std::slice::from_ref(psf), &self.image)?;
        self.otf = self.convolver.otf(psf)?;
        self.psf = psf.clone();
        Ok(())
    }

    fn set_image(&mut self, image: &Volume<T>) -> Result<()> {
        if image.dim() != self.image.dim() {
            check_psfs(std::slice::from_ref(&self.psf), image)?;
            let convolver = Convolver::new(extent(&image.view()), Boundary::Zero)?;
            self.otf = convolver.otf(&self.psf)?;
            self.convolver = convolver;
        }
        self.image = image.clone();
        self.half_max = half_max(image);
        Ok(())
    }

    fn iterate(&mut self, context: IterationContext<'_, T>) -> Result<Step> {
        let blurred = self.convolver.blur(context.old.view(), &self.otf)?;
        let a = self.half_max;
        // an all-dark image would otherwise divide by zero
        let divisor = if a > self.epsilon { a } else { self.epsilon };
        // a negative image maximum leaves only zero inside the bounds
        let upper = (a + a).max(T::zero());

        let residual = max_abs_difference(&self.image, &blurred);

        Zip::from(&mut *context.estimate)
            .and(context.old)
            .and(&self.image)
            .and(&blurred)
            .par_for_each(|e, &o, &i, &b| {
                let shifted = (o - a) / divisor;
                *e = o + (T::one() - shifted * shifted) * (i - b);
            });
        clamp_into(context.estimate, T::zero(), upper);

        if residual < self.epsilon {
            log::debug!(
                "{} converged in iteration {}",
                self.config().name,
                context.iteration + 1
            );
            Ok(Step::Converged)
        } else {
            Ok(Step::Continue)
        }
    }
}
