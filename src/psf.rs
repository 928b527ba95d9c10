//! Small PSF suppliers for tests and synthetic data.
//!
//! Physical PSF models live outside this crate; anything that yields an `Array3<T>` can be
//! handed to an estimator. These helpers only cover the shapes needed for quick checks.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::volume::Volume;
use ndarray::Array3;

/// Rescales `psf` to unit sum, in place.
///
/// # Errors
/// `InvalidConfiguration` if the sum is not positive and finite.
pub fn normalize<T: DeconvFloat>(psf: &mut Volume<T>) -> Result<()> {
    let total = psf.sum();
    if !(total > T::zero() && total.is_finite()) {
        return Err(DeconvolutionError::InvalidConfiguration(format!(
            "cannot normalize a PSF with total intensity {total}"
        )));
    }
    psf.mapv_inplace(|v| v / total);
    Ok(())
}

/// A uniform PSF of the given extent with unit sum.
pub fn box_psf<T: DeconvFloat>(shape: [usize; 3]) -> Result<Volume<T>> {
    let count = shape.iter().product::<usize>();
    if count == 0 {
        return Err(DeconvolutionError::InvalidConfiguration(
            "PSF extent must not be empty".to_string(),
        ));
    }
    Ok(Array3::from_elem(shape, T::one() / T::usize_as(count)))
}

/// A separable Gaussian PSF centred on voxel `(p0/2, p1/2, p2/2)` with per-axis widths
/// `sigma` (in voxels), normalized to unit sum. A zero width collapses that axis to its
/// centre plane.
pub fn gaussian_psf<T: DeconvFloat>(shape: [usize; 3], sigma: [f64; 3]) -> Result<Volume<T>> {
    if sigma.iter().any(|s| !s.is_finite() || *s < 0.0) {
        return Err(DeconvolutionError::InvalidConfiguration(format!(
            "invalid Gaussian widths {sigma:?}"
        )));
    }
    let centre = [shape[0] / 2, shape[1] / 2, shape[2] / 2];
    let profile = |axis: usize, index: usize| -> f64 {
        let offset = index as f64 - centre[axis] as f64;
        if sigma[axis] == 0.0 {
            if index == centre[axis] {
                1.0
            } else {
                0.0
            }
        } else {
            (-0.5 * (offset / sigma[axis]).powi(2)).exp()
        }
    };
    let mut psf = Array3::from_shape_fn(shape, |(i, j, k)| {
        T::from_f64_c(profile(0, i) * profile(1, j) * profile(2, k))
    });
    normalize(&mut psf)?;
    Ok(psf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn box_psf_has_unit_sum() {
        let psf = box_psf::<f64>([3, 3, 3]).unwrap();
        assert_abs_diff_eq!(psf[[0, 0, 0]], 1.0 / 27.0);
        assert_abs_diff_eq!(psf.sum(), 1.0, epsilon = 1e-12);
        assert!(box_psf::<f32>([0, 3, 3]).is_err());
    }

    #[test]
    fn gaussian_psf_peaks_at_centre() {
        let psf = gaussian_psf::<f64>([5, 7, 7], [1.0, 1.5, 1.5]).unwrap();
        assert_abs_diff_eq!(psf.sum(), 1.0, epsilon = 1e-12);
        let peak = psf[[2, 3, 3]];
        assert!(psf.iter().all(|&v| v <= peak));
        assert_abs_diff_eq!(psf[[2, 3, 2]], psf[[2, 3, 4]], epsilon = 1e-15);
    }

    #[test]
    fn zero_width_gives_a_delta() {
        let psf = gaussian_psf::<f32>([3, 3, 3], [0.0, 0.0, 0.0]).unwrap();
        assert_eq!(psf[[1, 1, 1]], 1.0);
        assert_abs_diff_eq!(psf.sum(), 1.0);
    }

    #[test]
    fn normalize_rejects_empty_intensity() {
        let mut psf = Array3::<f64>::zeros((2, 2, 2));
        assert!(normalize(&mut psf).is_err());
    }
}
