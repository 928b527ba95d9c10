//! Volume buffers and the element-wise kernels shared by every estimator.
//!
//! A [`Volume`] is a dense 3-D array (axis 0 is depth). Data with fewer dimensions uses
//! leading axes of extent 1. A [`Spectrum`] is the half-spectrum produced by the real
//! forward transform: same extent except the last axis, which holds `n2 / 2 + 1` bins.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use ndarray::{s, Array3, ArrayView3, CowArray, Ix3, Zip};
use num_complex::Complex;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Real-valued 3-D buffer: observed image, PSF or current estimate.
pub type Volume<T> = Array3<T>;

/// Complex half-spectrum of a [`Volume`].
pub type Spectrum<T> = Array3<Complex<T>>;

/// Extent of a volume as a plain array, which is what errors and transforms report.
pub fn extent<T>(volume: &ArrayView3<'_, T>) -> [usize; 3] {
    let (n0, n1, n2) = volume.dim();
    [n0, n1, n2]
}

/// The uniform prior every iterative estimate starts from.
pub fn uniform_prior<T: DeconvFloat>(shape: [usize; 3]) -> Volume<T> {
    Array3::from_elem(shape, T::one())
}

/// Fails with `DimensionMismatch` if the PSF is larger than the image along any axis, or
/// if either of them has an empty axis.
pub fn check_psf_extent(psf: [usize; 3], image: [usize; 3]) -> Result<()> {
    let fits = psf
        .iter()
        .zip(image.iter())
        .all(|(&p, &i)| p > 0 && i > 0 && p <= i);
    if fits {
        Ok(())
    } else {
        Err(DeconvolutionError::DimensionMismatch { psf, image })
    }
}

/// Zero-pads `psf` into `grid` with its centre voxel `(p0/2, p1/2, p2/2)` moved to the
/// origin, wrapping circularly. This is the layout the OTF is computed from.
pub fn pad_centered<T: DeconvFloat>(psf: &ArrayView3<'_, T>, grid: [usize; 3]) -> Volume<T> {
    let (p0, p1, p2) = psf.dim();
    let centre = [p0 / 2, p1 / 2, p2 / 2];
    let mut padded = Array3::zeros(grid);
    for ((i, j, k), &value) in psf.indexed_iter() {
        let target = [
            (i + grid[0] - centre[0]) % grid[0],
            (j + grid[1] - centre[1]) % grid[1],
            (k + grid[2] - centre[2]) % grid[2],
        ];
        padded[target] = value;
    }
    padded
}

/// How a volume is extended along axis 0 before it is transformed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Boundary {
    /// Implicit zero-padded circular extension.
    #[default]
    Zero,
    /// Axis 0 is doubled by reflection to suppress wrap-around ringing.
    Mirrored,
}

impl Boundary {
    /// Shape of the transform grid for an image of the given extent.
    pub fn grid(&self, image: [usize; 3]) -> [usize; 3] {
        match self {
            Boundary::Zero => image,
            Boundary::Mirrored => [2 * image[0], image[1], image[2]],
        }
    }

    /// Extends `volume` onto the transform grid. The zero boundary borrows the input.
    pub fn extend<'a, T: DeconvFloat>(
        &self,
        volume: ArrayView3<'a, T>,
    ) -> CowArray<'a, T, Ix3> {
        match self {
            Boundary::Zero => CowArray::from(volume),
            Boundary::Mirrored => {
                let (n0, n1, n2) = volume.dim();
                let mut mirrored = Array3::zeros((2 * n0, n1, n2));
                mirrored.slice_mut(s![..n0, .., ..]).assign(&volume);
                mirrored
                    .slice_mut(s![n0.., .., ..])
                    .assign(&volume.slice(s![..;-1, .., ..]));
                CowArray::from(mirrored)
            }
        }
    }

    /// Crops a transform-grid volume back to `depth` planes along axis 0.
    pub fn crop<T: DeconvFloat>(&self, volume: Volume<T>, depth: usize) -> Volume<T> {
        match self {
            Boundary::Zero => volume,
            Boundary::Mirrored => volume.slice(s![..depth, .., ..]).to_owned(),
        }
    }
}

/// `image / blurred` where `blurred > epsilon`, otherwise `image / epsilon`.
pub fn guarded_ratio<T: DeconvFloat>(
    image: &Volume<T>,
    blurred: &Volume<T>,
    epsilon: T,
) -> Volume<T> {
    let mut ratio = Array3::zeros(image.raw_dim());
    Zip::from(&mut ratio)
        .and(image)
        .and(blurred)
        .par_for_each(|r, &i, &b| {
            *r = if b > epsilon { i / b } else { i / epsilon };
        });
    ratio
}

/// Writes `correction * old` into `estimate`, zeroing every value not above `epsilon`.
pub fn multiply_with_floor<T: DeconvFloat>(
    estimate: &mut Volume<T>,
    correction: &Volume<T>,
    old: &Volume<T>,
    epsilon: T,
) {
    Zip::from(estimate)
        .and(correction)
        .and(old)
        .par_for_each(|e, &c, &o| {
            let value = c * o;
            *e = if value > epsilon { value } else { T::zero() };
        });
}

/// Zeroes every value not above `epsilon`, in place.
pub fn apply_floor<T: DeconvFloat>(volume: &mut Volume<T>, epsilon: T) {
    volume.par_mapv_inplace(|v| if v > epsilon { v } else { T::zero() });
}

/// Clamps every value into `[low, high]`, in place.
pub fn clamp_into<T: DeconvFloat>(volume: &mut Volume<T>, low: T, high: T) {
    volume.par_mapv_inplace(|v| v.max(low).min(high));
}

/// Largest value of a volume, `-inf` when empty.
pub fn max_value<T: DeconvFloat>(volume: &ArrayView3<'_, T>) -> T {
    volume.iter().fold(T::neg_infinity(), |acc, &v| acc.max(v))
}

/// Largest absolute difference between two volumes of equal shape.
pub fn max_abs_difference<T: DeconvFloat>(a: &Volume<T>, b: &Volume<T>) -> T {
    Zip::from(a)
        .and(b)
        .fold(T::zero(), |acc, &x, &y| acc.max(Float::abs(x - y)))
}

/// `||current - previous|| / ||previous||`, or the plain norm of the difference when the
/// previous volume is all zero.
pub fn relative_change<T: DeconvFloat>(
    current: &ArrayView3<'_, T>,
    previous: &ArrayView3<'_, T>,
) -> f64 {
    let (diff, base) = Zip::from(current)
        .and(previous)
        .fold((0.0f64, 0.0f64), |(d, b), &c, &p| {
            let delta = (c - p).as_f64();
            (d + delta * delta, b + p.as_f64() * p.as_f64())
        });
    if base > 0.0 {
        (diff / base).sqrt()
    } else {
        diff.sqrt()
    }
}
