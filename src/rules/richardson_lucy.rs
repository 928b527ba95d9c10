//! Classic Richardson-Lucy (EM) deconvolution under a depth-invariant PSF.
//!
//! The same rule serves both boundary modes; with the mirrored boundary, the
//! convolver reflects axis 0 before every forward transform and crops after every inverse.

use crate::error::Result;
use crate::float::DeconvFloat;
use crate::fourier::Convolver;
use crate::rules::rule::{
    check_psfs, Capabilities, DepthModel, IterationContext, Regularizer, RuleConfig, Step,
    UpdateRule,
};
use crate::volume::{
    extent, guarded_ratio, multiply_with_floor, Boundary, Spectrum, Volume,
};
use std::fmt::{Debug, Formatter};

/// Multiplicative EM update under a single, depth-invariant PSF.
///
/// ```text
/// blurred    = IFFT(FFT(old) · OTF) / N
/// ratio      = image / max(blurred, ε)
/// correction = IFFT(FFT(ratio) · conj(OTF)) / N
/// estimate   = correction · old, zeroed where ≤ ε
/// ```
///
/// With [`Boundary::Mirrored`] every transform runs on the axis-0 reflected grid.
pub struct RichardsonLucy<T: DeconvFloat> {
    convolver: Convolver<T>,
    psf: Volume<T>,
    image: Volume<T>,
    otf: Spectrum<T>,
    epsilon: T,
    regularizer: Option<Box<dyn Regularizer<T>>>,
}

impl<T: DeconvFloat> Debug for RichardsonLucy<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RichardsonLucy")
            .field("image", &self.image.dim())
            .field("psf", &self.psf.dim())
            .field("boundary", &self.convolver.boundary())
            .field("epsilon", &self.epsilon)
            .field("regularized", &self.regularizer.is_some())
            .finish()
    }
}

impl<T: DeconvFloat> RichardsonLucy<T> {
    /// Creates the rule and computes the OTF of `psf` once.
    ///
    /// # Arguments
    /// * `psf` - The point-spread function; it must fit inside the image
    /// * `image` - The observed volume
    /// * `boundary` - Extension of axis 0 before every transform
    /// * `epsilon` - Guard for near-zero blurred values and noise floor of the estimate
    pub fn new(psf: Volume<T>, image: Volume<T>, boundary: Boundary, epsilon: T) -> Result<Self> {
        check_psfs(std::slice::from_ref(&psf), &image)?;
        let convolver = Convolver::new(extent(&image.view()), boundary)?;
        let otf = convolver.otf(&psf)?;
        Ok(RichardsonLucy {
            convolver,
            psf,
            image,
            otf,
            epsilon,
            regularizer: None,
        })
    }

    /// Adds a regularizer applied in place after every update.
    pub fn with_regularizer(mut self, regularizer: impl Regularizer<T> + 'static) -> Self {
        self.regularizer = Some(Box::new(regularizer));
        self
    }

    /// Boundary mode the OTF was computed for.
    pub fn boundary(&self) -> Boundary {
        self.convolver.boundary()
    }
}

impl<T: DeconvFloat> UpdateRule<T> for RichardsonLucy<T> {
    fn config(&self) -> RuleConfig {
        let (name, description) = match self.convolver.boundary() {
            Boundary::Zero => (
                "Richardson-Lucy",
                "Multiplicative EM deconvolution with a zero-padded boundary.",
            ),
            Boundary::Mirrored => (
                "Richardson-Lucy (mirrored)",
                "Multiplicative EM deconvolution on an axis-0 mirrored grid.",
            ),
        };
        RuleConfig {
            name: name.to_string(),
            description: description.to_string(),
            hyperlink: Some((
                "Richardson (1972)".to_string(),
                "https://doi.org/10.1364/JOSA.62.000055".to_string(),
            )),
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
            let convolver = Convolver::new(extent(&image.view()), self.convolver.boundary())?;
            self.otf = convolver.otf(&self.psf)?;
            self.convolver = convolver;
        }
        self.image = image.clone();
        Ok(())
    }

    fn iterate(&mut self, context: IterationContext<'_, T>) -> Result<Step> {
        let blurred = self.convolver.blur(context.old.view(), &self.otf)?;
        let ratio = guarded_ratio(&self.image, &blurred, self.epsilon);
        let correction = self.convolver.correlate(ratio.view(), &self.otf)?;
        multiply_with_floor(context.estimate, &correction, context.old, self.epsilon);
        if let Some(regularizer) = self.regularizer.as_mut() {
            regularizer.apply(context.estimate);
        }
        Ok(Step::Continue)
    }
}
