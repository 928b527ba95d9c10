//! Real↔complex 3-D Fourier transforms and the boundary-aware convolution built on them.
//!
//! The last axis is transformed with `realfft` and compacted to `n2 / 2 + 1` bins; the two
//! leading axes are transformed with complex `rustfft` plans. Transforms are unnormalised
//! in both directions; [`Convolver`] divides by the transform size after every inverse.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::volume::{check_psf_extent, extent, pad_centered, Boundary, Spectrum, Volume};
use rayon::prelude::*;
use ndarray::{Array3, ArrayView3, Axis, Zip};
use num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Cached forward and inverse plans for one grid shape.
#[derive(Clone)]
pub struct FourierTransform<T: DeconvFloat> {
    shape: [usize; 3],
    r2c: Arc<dyn RealToComplex<T>>,
    c2r: Arc<dyn ComplexToReal<T>>,
    forward_axes: [Arc<dyn Fft<T>>; 2],
    inverse_axes: [Arc<dyn Fft<T>>; 2],
}

impl<T: DeconvFloat> Debug for FourierTransform<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FourierTransform")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl<T: DeconvFloat> FourierTransform<T> {
    /// Plans transforms for a real grid of the given shape.
    pub fn new(shape: [usize; 3]) -> Result<Self> {
        if shape.iter().any(|&n| n == 0) {
            return Err(DeconvolutionError::InvalidConfiguration(format!(
                "cannot transform a grid with an empty axis: {shape:?}"
            )));
        }
        let mut real_planner = RealFftPlanner::<T>::new();
        let r2c = real_planner.plan_fft_forward(shape[2]);
        let c2r = real_planner.plan_fft_inverse(shape[2]);

        let mut planner = FftPlanner::<T>::new();
        let forward_axes = [
            planner.plan_fft_forward(shape[0]),
            planner.plan_fft_forward(shape[1]),
        ];
        let inverse_axes = [
            planner.plan_fft_inverse(shape[0]),
            planner.plan_fft_inverse(shape[1]),
        ];

        Ok(FourierTransform {
            shape,
            r2c,
            c2r,
            forward_axes,
            inverse_axes,
        })
    }

    /// Shape of the real grid.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Shape of the compacted complex spectrum.
    pub fn spectrum_shape(&self) -> [usize; 3] {
        [self.shape[0], self.shape[1], self.shape[2] / 2 + 1]
    }

    /// Number of real samples; an inverse of a forward transform is scaled by this.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Unnormalised forward transform of a real volume.
    pub fn forward(&self, input: ArrayView3<'_, T>) -> Result<Spectrum<T>> {
        if extent(&input) != self.shape {
            return Err(DeconvolutionError::Transform(format!(
                "forward input {:?} does not match plan {:?}",
                extent(&input),
                self.shape
            )));
        }
        let mut spectrum = Array3::<Complex<T>>::zeros(self.spectrum_shape());

        (input.axis_iter(Axis(0)), spectrum.axis_iter_mut(Axis(0)))
            .into_par_iter()
            .try_for_each(|(plane, mut spectrum_plane)| -> Result<()> {
                let mut row_buffer = self.r2c.make_input_vec();
                let mut row_spectrum = self.r2c.make_output_vec();
                for (row, mut spectrum_row) in
                    plane.outer_iter().zip(spectrum_plane.outer_iter_mut())
                {
                    row_buffer
                        .iter_mut()
                        .zip(row.iter())
                        .for_each(|(dst, &src)| *dst = src);
                    self.r2c
                        .process(&mut row_buffer, &mut row_spectrum)
                        .map_err(|err| DeconvolutionError::Transform(err.to_string()))?;
                    spectrum_row
                        .iter_mut()
                        .zip(row_spectrum.iter())
                        .for_each(|(dst, &src)| *dst = src);
                }
                Ok(())
            })?;

        transform_lanes(&mut spectrum, Axis(1), &self.forward_axes[1]);
        transform_lanes(&mut spectrum, Axis(0), &self.forward_axes[0]);
        Ok(spectrum)
    }

    /// Unnormalised inverse transform back to a real volume. Consumes the spectrum, which
    /// is used as scratch space.
    pub fn inverse(&self, mut spectrum: Spectrum<T>) -> Result<Volume<T>> {
        let (s0, s1, s2) = spectrum.dim();
        if [s0, s1, s2] != self.spectrum_shape() {
            return Err(DeconvolutionError::Transform(format!(
                "inverse input {:?} does not match plan {:?}",
                [s0, s1, s2],
                self.spectrum_shape()
            )));
        }
        transform_lanes(&mut spectrum, Axis(0), &self.inverse_axes[0]);
        transform_lanes(&mut spectrum, Axis(1), &self.inverse_axes[1]);

        let mut output = Array3::<T>::zeros(self.shape);
        let even = self.shape[2] % 2 == 0;

        (spectrum.axis_iter_mut(Axis(0)), output.axis_iter_mut(Axis(0)))
            .into_par_iter()
            .try_for_each(|(mut spectrum_plane, mut plane)| -> Result<()> {
                let mut row_buffer = self.c2r.make_output_vec();
                for (mut spectrum_row, mut row) in
                    spectrum_plane.outer_iter_mut().zip(plane.outer_iter_mut())
                {
                    let mut bins = spectrum_row.to_vec();
                    // a real signal has purely real DC and Nyquist bins
                    bins[0].im = T::zero();
                    if even {
                        let last = bins.len() - 1;
                        bins[last].im = T::zero();
                    }
                    self.c2r
                        .process(&mut bins, &mut row_buffer)
                        .map_err(|err| DeconvolutionError::Transform(err.to_string()))?;
                    row.iter_mut()
                        .zip(row_buffer.iter())
                        .for_each(|(dst, &src)| *dst = src);
                    spectrum_row.fill(Complex::new(T::zero(), T::zero()));
                }
                Ok(())
            })?;
        Ok(output)
    }
}

/// Applies a complex FFT along every lane of `axis`. A length-1 axis is left untouched.
fn transform_lanes<T: DeconvFloat>(data: &mut Spectrum<T>, axis: Axis, fft: &Arc<dyn Fft<T>>) {
    if data.len_of(axis) < 2 {
        return;
    }
    Zip::from(data.lanes_mut(axis)).par_for_each(|mut lane| {
        let mut buffer: Vec<Complex<T>> = lane.iter().copied().collect();
        fft.process(&mut buffer);
        lane.iter_mut()
            .zip(buffer)
            .for_each(|(dst, src)| *dst = src);
    });
}

/// Whether the OTF enters a product as-is or conjugated (correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjugation {
    None,
    Conjugate,
}

/// `acc += spectrum * otf` (or `* conj(otf)`), bin by bin.
pub fn accumulate_product<T: DeconvFloat>(
    acc: &mut Spectrum<T>,
    spectrum: &Spectrum<T>,
    otf: &Spectrum<T>,
    conjugation: Conjugation,
) {
    Zip::from(acc)
        .and(spectrum)
        .and(otf)
        .par_for_each(|a, &s, &h| {
            *a += match conjugation {
                Conjugation::None => s * h,
                Conjugation::Conjugate => s * h.conj(),
            };
        });
}

/// `spectrum *= otf` (or `*= conj(otf)`), in place.
pub fn multiply_in_place<T: DeconvFloat>(
    spectrum: &mut Spectrum<T>,
    otf: &Spectrum<T>,
    conjugation: Conjugation,
) {
    Zip::from(spectrum).and(otf).par_for_each(|s, &h| {
        *s = match conjugation {
            Conjugation::None => *s * h,
            Conjugation::Conjugate => *s * h.conj(),
        };
    });
}

/// Convolution and correlation of image-sized volumes with cached OTFs, honouring a
/// [`Boundary`] mode.
///
/// Inputs and outputs always have the image extent; extension to the transform grid and
/// cropping back happen inside.
#[derive(Debug, Clone)]
pub struct Convolver<T: DeconvFloat> {
    image_shape: [usize; 3],
    boundary: Boundary,
    transform: FourierTransform<T>,
    normalization: T,
}

impl<T: DeconvFloat> Convolver<T> {
    pub fn new(image_shape: [usize; 3], boundary: Boundary) -> Result<Self> {
        let transform = FourierTransform::new(boundary.grid(image_shape))?;
        let normalization = T::one() / T::usize_as(transform.size());
        Ok(Convolver {
            image_shape,
            boundary,
            transform,
            normalization,
        })
    }

    pub fn image_shape(&self) -> [usize; 3] {
        self.image_shape
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    pub fn spectrum_shape(&self) -> [usize; 3] {
        self.transform.spectrum_shape()
    }

    /// OTF of a PSF on this convolver's transform grid.
    ///
    /// Fails with `DimensionMismatch` if the PSF is larger than the image.
    pub fn otf(&self, psf: &Volume<T>) -> Result<Spectrum<T>> {
        check_psf_extent(extent(&psf.view()), self.image_shape)?;
        let padded = pad_centered(&psf.view(), self.transform.shape());
        self.transform.forward(padded.view())
    }

    /// Forward transform of an image-sized volume, extended onto the grid first.
    pub fn forward(&self, volume: ArrayView3<'_, T>) -> Result<Spectrum<T>> {
        let extended = self.boundary.extend(volume);
        self.transform.forward(extended.view())
    }

    /// Normalised inverse transform, cropped back to the image extent.
    pub fn inverse(&self, spectrum: Spectrum<T>) -> Result<Volume<T>> {
        let mut volume = self.transform.inverse(spectrum)?;
        let scale = self.normalization;
        volume.par_mapv_inplace(|v| v * scale);
        Ok(self.boundary.crop(volume, self.image_shape[0]))
    }

    /// `IFFT(FFT(volume) · OTF) / N`.
    pub fn blur(&self, volume: ArrayView3<'_, T>, otf: &Spectrum<T>) -> Result<Volume<T>> {
        let mut spectrum = self.forward(volume)?;
        multiply_in_place(&mut spectrum, otf, Conjugation::None);
        self.inverse(spectrum)
    }

    /// `IFFT(FFT(volume) · conj(OTF)) / N`, the adjoint of [`Convolver::blur`].
    pub fn correlate(&self, volume: ArrayView3<'_, T>, otf: &Spectrum<T>) -> Result<Volume<T>> {
        let mut spectrum = self.forward(volume)?;
        multiply_in_place(&mut spectrum, otf, Conjugation::Conjugate);
        self.inverse(spectrum)
    }

    /// Inverse of `spectrum · OTF` (or its conjugate) without touching `spectrum`.
    pub fn inverse_product(
        &self,
        spectrum: &Spectrum<T>,
        otf: &Spectrum<T>,
        conjugation: Conjugation,
    ) -> Result<Volume<T>> {
        let mut product = spectrum.clone();
        multiply_in_place(&mut product, otf, conjugation);
        self.inverse(product)
    }

    /// An all-zero spectrum on this grid, for accumulation.
    pub fn zero_spectrum(&self) -> Spectrum<T> {
        Array3::zeros(self.spectrum_shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(shape: (usize, usize, usize)) -> Volume<f64> {
        Array3::from_shape_fn(shape, |(i, j, k)| {
            ((i * 7 + j * 3 + k) % 11) as f64 + 0.5 * (k as f64).sin()
        })
    }

    #[test]
    fn spectrum_has_compacted_last_axis() {
        let transform = FourierTransform::<f64>::new([4, 6, 9]).unwrap();
        assert_eq!(transform.spectrum_shape(), [4, 6, 5]);
        let transform = FourierTransform::<f32>::new([4, 6, 8]).unwrap();
        assert_eq!(transform.spectrum_shape(), [4, 6, 5]);
        assert_eq!(transform.size(), 192);
    }

    #[test]
    fn empty_axis_is_rejected() {
        assert!(FourierTransform::<f64>::new([4, 0, 8]).is_err());
    }

    #[test]
    fn dc_bin_holds_the_sum() {
        let volume = ramp((4, 5, 6));
        let transform = FourierTransform::new([4, 5, 6]).unwrap();
        let spectrum = transform.forward(volume.view()).unwrap();
        assert_abs_diff_eq!(spectrum[[0, 0, 0]].re, volume.sum(), epsilon = 1e-9);
        assert_abs_diff_eq!(spectrum[[0, 0, 0]].im, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn forward_then_inverse_recovers_input() {
        for shape in [(4, 5, 6), (3, 4, 7), (1, 1, 8), (8, 8, 8)] {
            let volume = ramp(shape);
            let convolver = Convolver::new([shape.0, shape.1, shape.2], Boundary::Zero).unwrap();
            let spectrum = convolver.forward(volume.view()).unwrap();
            let recovered = convolver.inverse(spectrum).unwrap();
            for (a, b) in recovered.iter().zip(volume.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn mirrored_round_trip_recovers_input() {
        let volume = ramp((5, 4, 6));
        let convolver = Convolver::new([5, 4, 6], Boundary::Mirrored).unwrap();
        assert_eq!(convolver.spectrum_shape(), [10, 4, 4]);
        let spectrum = convolver.forward(volume.view()).unwrap();
        let recovered = convolver.inverse(spectrum).unwrap();
        assert_eq!(recovered.dim(), (5, 4, 6));
        for (a, b) in recovered.iter().zip(volume.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn blur_with_delta_psf_is_identity() {
        let volume = ramp((6, 6, 6));
        let mut psf = Array3::<f64>::zeros((3, 3, 3));
        psf[[1, 1, 1]] = 1.0;
        let convolver = Convolver::new([6, 6, 6], Boundary::Zero).unwrap();
        let otf = convolver.otf(&psf).unwrap();
        let blurred = convolver.blur(volume.view(), &otf).unwrap();
        for (a, b) in blurred.iter().zip(volume.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn blur_shifts_with_off_centre_psf() {
        let mut volume = Array3::<f64>::zeros((6, 6, 6));
        volume[[2, 2, 2]] = 1.0;
        let mut psf = Array3::<f64>::zeros((3, 3, 3));
        psf[[2, 1, 1]] = 1.0;
        let convolver = Convolver::new([6, 6, 6], Boundary::Zero).unwrap();
        let otf = convolver.otf(&psf).unwrap();
        let blurred = convolver.blur(volume.view(), &otf).unwrap();
        assert_abs_diff_eq!(blurred[[3, 2, 2]], 1.0, epsilon = 1e-9);
        let correlated = convolver.correlate(volume.view(), &otf).unwrap();
        assert_abs_diff_eq!(correlated[[1, 2, 2]], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn mirrored_boundary_reflects_instead_of_wrapping() {
        let mut volume = Array3::<f64>::zeros((6, 4, 4));
        volume[[0, 1, 1]] = 1.0;
        let psf = crate::psf::box_psf::<f64>([3, 1, 1]).unwrap();

        let zero = Convolver::new([6, 4, 4], Boundary::Zero).unwrap();
        let blurred = zero.blur(volume.view(), &zero.otf(&psf).unwrap()).unwrap();
        let expected = [1.0 / 3.0, 1.0 / 3.0, 0.0, 0.0, 0.0, 1.0 / 3.0];
        for (z, &value) in expected.iter().enumerate() {
            assert_abs_diff_eq!(blurred[[z, 1, 1]], value, epsilon = 1e-9);
        }

        let mirrored = Convolver::new([6, 4, 4], Boundary::Mirrored).unwrap();
        let blurred = mirrored
            .blur(volume.view(), &mirrored.otf(&psf).unwrap())
            .unwrap();
        let expected = [2.0 / 3.0, 1.0 / 3.0, 0.0, 0.0, 0.0, 0.0];
        for (z, &value) in expected.iter().enumerate() {
            assert_abs_diff_eq!(blurred[[z, 1, 1]], value, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(blurred.sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn oversized_psf_is_rejected() {
        let convolver = Convolver::<f64>::new([4, 4, 4], Boundary::Zero).unwrap();
        let psf = Array3::<f64>::ones((5, 3, 3));
        assert!(matches!(
            convolver.otf(&psf),
            Err(DeconvolutionError::DimensionMismatch { .. })
        ));
    }
}
