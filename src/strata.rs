//! Axis-0 partition of a volume into blended strata.
//!
//! The depth axis carries `S + 1` PSFs placed at the centres of `S + 1` equal bins. Between
//! two neighbouring PSF planes the blend weight `a` falls linearly from 1 to 0; stratum `m`
//! owns that ramp and mixes PSF `m` (weight `a`) with PSF `m + 1` (weight `1 - a`). The
//! half-bins in front of the first and behind the last PSF plane belong to the outer strata
//! unblended.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::volume::Volume;
use ndarray::{s, Array3, Axis, Zip};
use std::ops::Range;

/// Which side of the blend a volume is scaled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// `a`, the share of the stratum's lower PSF.
    Blend,
    /// `1 - a`, the share of the stratum's upper PSF.
    Complement,
}

/// One contiguous depth range and its blend ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stratum {
    pub index: usize,
    /// First plane owned by this stratum.
    pub start: usize,
    /// One past the last plane owned by this stratum.
    pub end: usize,
    /// Plane of the lower PSF, where `a == 1`.
    pub blend_start: usize,
    /// Plane of the upper PSF, where `a` has reached 0.
    pub blend_end: usize,
}

impl Stratum {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn lower_psf(&self) -> usize {
        self.index
    }

    pub fn upper_psf(&self) -> usize {
        self.index + 1
    }

    /// Blend weight `a` at depth `z`.
    ///
    /// The ramp is extended over the whole depth: 1 before `blend_start`, 0 from
    /// `blend_end` on.
    pub fn weight<T: DeconvFloat>(&self, z: usize) -> T {
        if z < self.blend_start {
            T::one()
        } else if z >= self.blend_end {
            T::zero()
        } else {
            let offset = T::usize_as(z - self.blend_start);
            let width = T::usize_as(self.blend_end - self.blend_start);
            T::one() - offset / width
        }
    }

    /// `a` or `1 - a` at depth `z`.
    pub fn weight_for<T: DeconvFloat>(&self, z: usize, weighting: Weighting) -> T {
        let a = self.weight::<T>(z);
        match weighting {
            Weighting::Blend => a,
            Weighting::Complement => T::one() - a,
        }
    }
}

/// A gap-free, non-overlapping cover of the depth axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrataPartition {
    depth: usize,
    strata: Vec<Stratum>,
}

impl StrataPartition {
    /// Partitions `depth` planes into `number_of_strata` blended strata.
    ///
    /// Needs at least one stratum and `depth >= number_of_strata + 1`, so that every PSF
    /// lands on its own plane.
    pub fn new(depth: usize, number_of_strata: usize) -> Result<Self> {
        if number_of_strata == 0 {
            return Err(DeconvolutionError::InvalidConfiguration(
                "at least one stratum is required".to_string(),
            ));
        }
        if depth < number_of_strata + 1 {
            return Err(DeconvolutionError::InvalidConfiguration(format!(
                "{number_of_strata} strata need a depth of at least {}, got {depth}",
                number_of_strata + 1
            )));
        }
        let bin = depth as f64 / (number_of_strata + 1) as f64;
        let planes: Vec<usize> = (0..=number_of_strata)
            .map(|m| (bin * (m as f64 + 0.5)).floor() as usize)
            .collect();

        let strata = (0..number_of_strata)
            .map(|m| Stratum {
                index: m,
                start: if m == 0 { 0 } else { planes[m] },
                end: if m + 1 == number_of_strata {
                    depth
                } else {
                    planes[m + 1]
                },
                blend_start: planes[m],
                blend_end: planes[m + 1],
            })
            .collect();

        Ok(StrataPartition { depth, strata })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn strata(&self) -> &[Stratum] {
        &self.strata
    }

    pub fn len(&self) -> usize {
        self.strata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    /// Number of PSFs the partition blends between.
    pub fn psf_count(&self) -> usize {
        self.strata.len() + 1
    }
}

/// Scales the planes of `stratum` by `a` or `1 - a`, in place. Planes outside the stratum
/// are left untouched.
pub fn scale_sub_domain<T: DeconvFloat>(
    volume: &mut Volume<T>,
    stratum: &Stratum,
    weighting: Weighting,
) {
    for z in stratum.range() {
        let w = stratum.weight_for::<T>(z, weighting);
        volume.index_axis_mut(Axis(0), z).mapv_inplace(|v| v * w);
    }
}

/// A copy of `volume` restricted to `stratum` and scaled by `a` or `1 - a`; zero elsewhere.
pub fn extract_sub_domain<T: DeconvFloat>(
    volume: &Volume<T>,
    stratum: &Stratum,
    weighting: Weighting,
) -> Volume<T> {
    let mut part = Array3::zeros(volume.raw_dim());
    let range = stratum.range();
    part.slice_mut(s![range.clone(), .., ..])
        .assign(&volume.slice(s![range, .., ..]));
    scale_sub_domain(&mut part, stratum, weighting);
    part
}

/// A copy of `volume` with every plane scaled by the extended ramp of `stratum`.
pub fn apply_ramp<T: DeconvFloat>(
    volume: &Volume<T>,
    stratum: &Stratum,
    weighting: Weighting,
) -> Volume<T> {
    let mut weighted = volume.clone();
    for (z, mut plane) in weighted.axis_iter_mut(Axis(0)).enumerate() {
        let w = stratum.weight_for::<T>(z, weighting);
        plane.mapv_inplace(|v| v * w);
    }
    weighted
}

/// `target[z] += w(z) · source[z]` for the planes of `stratum`.
pub fn accumulate_sub_domain<T: DeconvFloat>(
    target: &mut Volume<T>,
    source: &Volume<T>,
    stratum: &Stratum,
    weighting: Weighting,
) {
    accumulate_planes(target, source, stratum, stratum.range(), weighting);
}

/// `target[z] += w(z) · source[z]` over the whole depth, using the extended ramp.
pub fn accumulate_ramp<T: DeconvFloat>(
    target: &mut Volume<T>,
    source: &Volume<T>,
    stratum: &Stratum,
    weighting: Weighting,
) {
    let depth = target.len_of(Axis(0));
    accumulate_planes(target, source, stratum, 0..depth, weighting);
}

fn accumulate_planes<T: DeconvFloat>(
    target: &mut Volume<T>,
    source: &Volume<T>,
    stratum: &Stratum,
    planes: Range<usize>,
    weighting: Weighting,
) {
    for z in planes {
        let w = stratum.weight_for::<T>(z, weighting);
        Zip::from(target.index_axis_mut(Axis(0), z))
            .and(source.index_axis(Axis(0), z))
            .for_each(|t, &s| *t += w * s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn partition_covers_depth_without_gaps() {
        for depth in 2..40 {
            for number_of_strata in 1..depth {
                let partition = StrataPartition::new(depth, number_of_strata).unwrap();
                let strata = partition.strata();
                assert_eq!(strata.len(), number_of_strata);
                assert_eq!(partition.psf_count(), number_of_strata + 1);
                assert_eq!(strata[0].start, 0);
                assert_eq!(strata[strata.len() - 1].end, depth);
                for pair in strata.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                for stratum in strata {
                    assert!(stratum.start < stratum.end);
                    assert!(stratum.blend_start < stratum.blend_end);
                }
            }
        }
    }

    #[test]
    fn weight_and_complement_sum_to_one() {
        for depth in [2, 7, 8, 13, 64, 101] {
            for number_of_strata in [1, 2, depth / 2, depth - 1] {
                if number_of_strata == 0 || number_of_strata >= depth {
                    continue;
                }
                let partition = StrataPartition::new(depth, number_of_strata).unwrap();
                for stratum in partition.strata() {
                    for z in 0..depth {
                        let a = stratum.weight_for::<f64>(z, Weighting::Blend);
                        let b = stratum.weight_for::<f64>(z, Weighting::Complement);
                        assert_eq!(a + b, 1.0);
                        let a = stratum.weight_for::<f32>(z, Weighting::Blend);
                        let b = stratum.weight_for::<f32>(z, Weighting::Complement);
                        assert_eq!(a + b, 1.0);
                    }
                }
            }
        }
    }

    #[test]
    fn ramp_starts_at_one_and_falls_towards_zero() {
        let partition = StrataPartition::new(12, 2).unwrap();
        let strata = partition.strata();
        // bins of 4 planes, PSFs at 2, 6 and 10
        assert_eq!((strata[0].blend_start, strata[0].blend_end), (2, 6));
        assert_eq!((strata[1].blend_start, strata[1].blend_end), (6, 10));
        assert_eq!(strata[0].range(), 0..6);
        assert_eq!(strata[1].range(), 6..12);

        let s = &strata[1];
        assert_eq!(s.weight::<f64>(s.start), 1.0);
        let last = s.weight::<f64>(s.blend_end - 1);
        assert_abs_diff_eq!(last, 0.25);
        for z in s.blend_start..s.blend_end - 1 {
            assert!(s.weight::<f64>(z) > s.weight::<f64>(z + 1));
        }
        // flanking half-bins are unblended
        assert_eq!(strata[0].weight::<f64>(0), 1.0);
        assert_eq!(strata[1].weight::<f64>(11), 0.0);
    }

    #[test]
    fn invalid_partitions_are_rejected() {
        assert!(StrataPartition::new(8, 0).is_err());
        assert!(StrataPartition::new(3, 3).is_err());
        assert!(StrataPartition::new(4, 3).is_ok());
    }

    #[test]
    fn blend_and_complement_parts_rebuild_the_stratum() {
        let volume = Array3::from_shape_fn((10, 2, 3), |(i, j, k)| (i + j + k) as f64 + 1.0);
        let partition = StrataPartition::new(10, 2).unwrap();
        let mut rebuilt = Array3::<f64>::zeros(volume.raw_dim());
        for stratum in partition.strata() {
            rebuilt += &extract_sub_domain(&volume, stratum, Weighting::Blend);
            rebuilt += &extract_sub_domain(&volume, stratum, Weighting::Complement);
        }
        for (a, b) in rebuilt.iter().zip(volume.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn ramp_extends_over_whole_depth() {
        let volume = Array3::<f64>::ones((10, 1, 1));
        let partition = StrataPartition::new(10, 2).unwrap();
        let stratum = &partition.strata()[1];
        let weighted = apply_ramp(&volume, stratum, Weighting::Blend);
        assert_eq!(weighted[[0, 0, 0]], 1.0);
        assert_eq!(weighted[[9, 0, 0]], 0.0);

        let mut acc = Array3::<f64>::zeros((10, 1, 1));
        accumulate_ramp(&mut acc, &volume, stratum, Weighting::Blend);
        accumulate_ramp(&mut acc, &volume, stratum, Weighting::Complement);
        assert!(acc.iter().all(|&v| v == 1.0));

        let mut acc = Array3::<f64>::zeros((10, 1, 1));
        accumulate_sub_domain(&mut acc, &volume, stratum, Weighting::Blend);
        assert_eq!(acc[[0, 0, 0]], 0.0);
        assert_eq!(acc[[stratum.start, 0, 0]], 1.0);
    }
}
