//! Validation and state shared by the two strata-blended rules.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::fourier::Convolver;
use crate::rules::otf_source::{OtfResidency, StratumOtfs};
use crate::rules::rule::{check_psfs, check_same_shape};
use crate::strata::StrataPartition;
use crate::volume::{extent, Boundary, Volume};

/// State shared by the strata-blended rules: partition, per-PSF OTFs and image.
#[derive(Debug)]
pub(crate) struct BlendModel<T: DeconvFloat> {
    pub(crate) convolver: Convolver<T>,
    pub(crate) partition: StrataPartition,
    pub(crate) otfs: StratumOtfs<T>,
    pub(crate) image: Volume<T>,
    pub(crate) epsilon: T,
}

impl<T: DeconvFloat> BlendModel<T> {
    pub(crate) fn new(
        psfs: &[Volume<T>],
        image: Volume<T>,
        number_of_strata: usize,
        boundary: Boundary,
        residency: OtfResidency<T>,
        epsilon: T,
    ) -> Result<Self> {
        if psfs.len() != number_of_strata + 1 {
            return Err(DeconvolutionError::InvalidConfiguration(format!(
                "{number_of_strata} strata blend {} PSFs, got {}",
                number_of_strata + 1,
                psfs.len()
            )));
        }
        check_psfs(psfs, &image)?;
        let partition = StrataPartition::new(image.dim().0, number_of_strata)?;
        let convolver = Convolver::new(extent(&image.view()), boundary)?;
        let otfs = StratumOtfs::build(&convolver, psfs, residency)?;
        log::info!(
            "strata model: {} strata over {} planes, {:?} boundary, streaming: {}",
            number_of_strata,
            partition.depth(),
            boundary,
            otfs.is_streaming()
        );
        Ok(BlendModel {
            convolver,
            partition,
            otfs,
            image,
            epsilon,
        })
    }

    /// Replaces the image. The partition and OTFs depend on the extent, so only an
    /// image of the same shape is accepted.
    pub(crate) fn set_image(&mut self, rule: &str, image: &Volume<T>) -> Result<()> {
        check_same_shape(rule, &self.image, image)?;
        self.image = image.clone();
        Ok(())
    }
}
