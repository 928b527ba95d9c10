//! Whole-volume strata blend.
//!
//! One forward model for the entire volume, assembled stratum by stratum from blended
//! sub-volumes, and one correction computed as its adjoint.

use crate::error::Result;
use crate::float::DeconvFloat;
use crate::fourier::{accumulate_product, Conjugation};
use crate::rules::blend::BlendModel;
use crate::rules::otf_source::OtfResidency;
use crate::rules::rule::{Capabilities, DepthModel, IterationContext, RuleConfig, Step, UpdateRule};
use crate::strata::{accumulate_sub_domain, extract_sub_domain, StrataPartition, Weighting};
use crate::volume::{guarded_ratio, multiply_with_floor, Boundary, Volume};
use ndarray::Array3;

/// Depth-variant EM over the whole volume.
///
/// Each stratum contributes its blended sub-volume to a single forward model:
///
/// ```text
/// FFT(blurred) = Σ_m FFT(a_m · old|_m) · OTF_m + FFT((1 - a_m) · old|_m) · OTF_{m+1}
/// ```
///
/// The correction is the adjoint of that model, restricted stratum by stratum.
///
/// OTFs are requested in PSF order in both passes: OTF 0 before the stratum loop, OTF
/// `m + 1` inside iteration `m`.
#[derive(Debug)]
pub struct StrataBlendVolume<T: DeconvFloat> {
    model: BlendModel<T>,
}

impl<T: DeconvFloat> StrataBlendVolume<T> {
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
        Ok(StrataBlendVolume {
            model: BlendModel::new(psfs, image, number_of_strata, boundary, residency, epsilon)?,
        })
    }

    /// Strata the depth axis is divided into.
    pub fn partition(&self) -> &StrataPartition {
        &self.model.partition
    }
}

impl<T: DeconvFloat> UpdateRule<T> for StrataBlendVolume<T> {
    fn config(&self) -> RuleConfig {
        let mirrored = self.model.convolver.boundary() == Boundary::Mirrored;
        let name = match (mirrored, self.model.otfs.is_streaming()) {
            (false, false) => "Strata blend (volume)",
            (true, false) => "Strata blend (volume, mirrored)",
            (false, true) => "Strata blend (volume, streaming)",
            (true, true) => "Strata blend (volume, mirrored, streaming)",
        };
        RuleConfig {
            name: name.to_string(),
            description: "Depth-variant EM with PSFs blended linearly between strata."
                .to_string(),
            hyperlink: None,
            depth_model: DepthModel::StrataVolume,
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

        let mut spectrum = convolver.zero_spectrum();
        let mut lower = model.otfs.fetch(0, iteration)?;
        for stratum in model.partition.strata() {
            let upper = model.otfs.fetch(stratum.upper_psf(), iteration)?;
            let part = extract_sub_domain(context.old, stratum, Weighting::Blend);
            accumulate_product(
                &mut spectrum,
                &convolver.forward(part.view())?,
                &lower,
                Conjugation::None,
            );
            let part = extract_sub_domain(context.old, stratum, Weighting::Complement);
            accumulate_product(
                &mut spectrum,
                &convolver.forward(part.view())?,
                &upper,
                Conjugation::None,
            );
            lower = upper;
        }
        let blurred = convolver.inverse(spectrum)?;

        let ratio = guarded_ratio(&model.image, &blurred, model.epsilon);
        let ratio_spectrum = convolver.forward(ratio.view())?;

        let mut correction = Array3::zeros(model.image.raw_dim());
        let otf = model.otfs.fetch(0, iteration)?;
        let mut lower_correction =
            convolver.inverse_product(&ratio_spectrum, &otf, Conjugation::Conjugate)?;
        for stratum in model.partition.strata() {
            let otf = model.otfs.fetch(stratum.upper_psf(), iteration)?;
            let upper_correction =
                convolver.inverse_product(&ratio_spectrum, &otf, Conjugation::Conjugate)?;
            accumulate_sub_domain(&mut correction, &lower_correction, stratum, Weighting::Blend);
            accumulate_sub_domain(
                &mut correction,
                &upper_correction,
                stratum,
                Weighting::Complement,
            );
            lower_correction = upper_correction;
        }

        multiply_with_floor(context.estimate, &correction, context.old, model.epsilon);
        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeconvolutionError;
    use crate::psf::{box_psf, gaussian_psf};
    use crate::volume::uniform_prior;

    #[test]
    fn psf_count_must_match_strata() {
        let psf = box_psf::<f64>([3, 3, 3]).unwrap();
        let image = Array3::<f64>::ones((8, 4, 4));
        let result = StrataBlendVolume::new(
            &[psf.clone(), psf.clone()],
            image,
            2,
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
    fn set_psf_is_unsupported() {
        let psf = box_psf::<f64>([3, 3, 3]).unwrap();
        let image = Array3::<f64>::ones((8, 4, 4));
        let mut rule = StrataBlendVolume::new(
            &[psf.clone(), psf.clone()],
            image.clone(),
            1,
            Boundary::Zero,
            OtfResidency::Resident,
            1e-4,
        )
        .unwrap();
        assert!(!rule.config().capabilities.set_psf);
        assert!(matches!(
            rule.set_psf(&psf),
            Err(DeconvolutionError::UnsupportedOperation { .. })
        ));
        assert!(rule.set_image(&image).is_ok());
        assert!(matches!(
            rule.set_image(&Array3::ones((6, 4, 4))),
            Err(DeconvolutionError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn estimate_stays_non_negative() {
        let image = Array3::from_shape_fn((9, 5, 5), |(i, j, k)| ((i + j * k) % 4) as f64);
        let psfs: Vec<_> = [0.5, 1.0, 1.5]
            .iter()
            .map(|&s| gaussian_psf::<f64>([3, 3, 3], [s, s, s]).unwrap())
            .collect();
        for boundary in [Boundary::Zero, Boundary::Mirrored] {
            let mut rule = StrataBlendVolume::new(
                &psfs,
                image.clone(),
                2,
                boundary,
                OtfResidency::Resident,
                1e-4,
            )
            .unwrap();
            let mut estimate = uniform_prior([9, 5, 5]);
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
}
