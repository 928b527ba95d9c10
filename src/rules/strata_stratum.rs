//! Per-stratum strata blend.

use crate::error::Result;
use crate::float::DeconvFloat;
use crate::fourier::{accumulate_product, Conjugation};
use crate::rules::blend::BlendModel;
use crate::rules::otf_source::OtfResidency;
use crate::rules::rule::{Capabilities, DepthModel, IterationContext, RuleConfig, Step, UpdateRule};
use crate::strata::{accumulate_ramp, apply_ramp, StrataPartition, Weighting};
use crate::volume::{apply_floor, guarded_ratio, Boundary, Volume};
use ndarray::{Array3, Zip};

/// Depth-variant EM as an average of per-stratum updates.
///
/// Stratum `m` models the whole volume with its ramp extended (1 in front of it, 0 behind
/// it), runs a full EM update against that model, and contributes `old · correction_m / S`
/// to the new estimate. The noise floor is applied once, after all strata.
///
/// OTF 0 is requested before the stratum loop and OTF `m + 1` inside iteration `m`.
#[derive(Debug)]
pub struct StrataBlendPerStratum<T: DeconvFloat> {
    model: BlendModel<T>,
}

impl<T: DeconvFloat> StrataBlendPerStratum<T> {
    /// Builds the partition and computes the OTF of every PSF once.
    ///
    /// # Arguments
    /// * `psfs` - `number_of_strata + 1` PSFs ordered by depth; PSF `m` sits at the start of
    ///   stratum `m`, the last one at the end of the volume
    /// * `image` - The observed volume; its depth must be at least `number_of_strata + 1`
    /// * `number_of_strata` - Number of blended strata along axis 0
    /// * `boundary` - Extension of axis 0 before every transform
    /// * `residency` - Whether the OTFs stay in memory or are streamed from a cache
    /// * `epsilon` - Guard for denominators and noise floor of the estimate
    ///
    /// Fails with `InvalidConfiguration` on a wrong PSF count or a too shallow image and
    /// with `DimensionMismatch` if a PSF does not fit the image.
    pub fn new(
        psfs: &[Volume<T>],
        image: Volume<T>,
        number_of_strata: usize,
        boundary: Boundary,
        residency: OtfResidency<T>,
        epsilon: T,
    ) -> Result<Self> {
        Ok(StrataBlendPerStratum {
            model: BlendModel::new(psfs, image, number_of_strata, boundary, residency, epsilon)?,
        })
    }

    pub fn partition(&self) -> &StrataPartition {
        &self.model.partition
    }
}

impl<T: DeconvFloat> UpdateRule<T> for StrataBlendPerStratum<T> {
    fn config(&self) -> RuleConfig {
        let mirrored = self.model.convolver.boundary() == Boundary::Mirrored;
        let name = match (mirrored, self.model.otfs.is_streaming()) {
            (false, false) => "Strata blend (per stratum)",
            (true, false) => "Strata blend (per stratum, mirrored)",
            (false, true) => "Strata blend (per stratum, streaming)",
            (true, true) => "Strata blend (per stratum, mirrored, streaming)",
        };
        RuleConfig {
            name: name.to_string(),
            description: "Average of per-stratum EM updates, each with its own blended model."
                .to_string(),
            hyperlink: None,
            depth_model: DepthModel::StrataPerStratum,
            capabilities: Capabilities {
                set_psf: false,
                reshape_image: false,
            },
        }
    }

    fn image(&self) -> &Volume<T> {
        &self.model.image
    }

    fn set_image(&mut self, image: &Volume<T>) -> Result<()> {
        let name = self.config().name;
        self.model.set_image(&name, image)
    }

    fn iterate(&mut self, context: IterationContext<'_, T>) -> Result<Step> {
        let model = &self.model;
        let convolver = &model.convolver;
        let iteration = context.iteration;
        let share = T::one() / T::usize_as(model.partition.len());

        context.estimate.fill(T::zero());
        let mut lower = model.otfs.fetch(0, iteration)?;
        for stratum in model.partition.strata() {
            let upper = model.otfs.fetch(stratum.upper_psf(), iteration)?;

            let mut spectrum = convolver.zero_spectrum();
            let weighted = apply_ramp(context.old, stratum, Weighting::Blend);
            accumulate_product(
                &mut spectrum,
                &convolver.forward(weighted.view())?,
                &lower,
                Conjugation::None,
            );
            let weighted = apply_ramp(context.old, stratum, Weighting::Complement);
            accumulate_product(
                &mut spectrum,
                &convolver.forward(weighted.view())?,
                &upper,
                Conjugation::None,
            );
            let blurred = convolver.inverse(spectrum)?;

            let ratio = guarded_ratio(&model.image, &blurred, model.epsilon);
            let ratio_spectrum = convolver.forward(ratio.view())?;
            let mut correction = Array3::zeros(model.image.raw_dim());
            accumulate_ramp(
                &mut correction,
                &convolver.inverse_product(&ratio_spectrum, &lower, Conjugation::Conjugate)?,
                stratum,
                Weighting::Blend,
            );
            accumulate_ramp(
                &mut correction,
                &convolver.inverse_product(&ratio_spectrum, &upper, Conjugation::Conjugate)?,
                stratum,
                Weighting::Complement,
            );

            Zip::from(&mut *context.estimate)
                .and(context.old)
                .and(&correction)
                .par_for_each(|e, &o, &c| *e += o * c * share);
            lower = upper;
        }

        apply_floor(context.estimate, model.epsilon);
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeconvolutionError;
    use crate::psf::gaussian_psf;
    use crate::volume::uniform_prior;

    #[test]
    fn set_psf_is_unsupported() {
        let psf = gaussian_psf::<f32>([3, 3, 3], [1.0, 1.0, 1.0]).unwrap();
        let mut rule = StrataBlendPerStratum::new(
            &[psf.clone(), psf.clone(), psf.clone()],
            Array3::ones((6, 4, 4)),
            2,
            Boundary::Mirrored,
            OtfResidency::Resident,
            1e-4,
        )
        .unwrap();
        assert_eq!(rule.partition().len(), 2);
        assert!(matches!(
            rule.set_psf(&psf),
            Err(DeconvolutionError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn too_shallow_image_is_rejected() {
        let psf = gaussian_psf::<f64>([1, 3, 3], [0.0, 1.0, 1.0]).unwrap();
        let result = StrataBlendPerStratum::new(
            &vec![psf; 4],
            Array3::ones((3, 4, 4)),
            3,
            Boundary::Zero,
            OtfResidency::Resident,
            1e-4,
        );
        assert!(matches!(
            result,
            Err(DeconvolutionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn estimate_stays_non_negative() {
        let image = Array3::from_shape_fn((8, 4, 4), |(i, j, k)| ((3 * i + j + k) % 5) as f64);
        let psfs: Vec<_> = [0.5, 1.0, 1.5]
            .iter()
            .map(|&s| gaussian_psf::<f64>([3, 3, 3], [s, s, s]).unwrap())
            .collect();
        let mut rule = StrataBlendPerStratum::new(
            &psfs,
            image,
            2,
            Boundary::Zero,
            OtfResidency::Resident,
            1e-4,
        )
        .unwrap();
        let mut estimate = uniform_prior([8, 4, 4]);
        for iteration in 0..3 {
            let old = estimate.clone();
            rule.iterate(IterationContext {
                iteration,
                old: &old,
                estimate: &mut estimate,
            })
            .unwrap();
            assert!(estimate.iter().all(|&v| v >= 0.0 && v.is_finite()));
        }
    }
}
