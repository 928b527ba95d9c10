//! Per-PSF OTFs of the depth-variant rules, kept in memory or streamed from an
//! [`OtfCache`].
//!
//! A streamed OTF is read back exactly where it is needed, so every iteration reads the
//! cache in the same order.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::fourier::Convolver;
use crate::store::OtfCache;
use crate::volume::{Spectrum, Volume};
use std::borrow::Cow;

/// Where the per-stratum OTFs of a depth-variant rule live between iterations.
#[derive(Debug)]
pub enum OtfResidency<T: DeconvFloat> {
    /// All OTFs stay in memory.
    Resident,
    /// Each OTF is written once to the cache and read back whenever it is needed.
    Streaming(OtfCache<T>),
}

/// The OTFs of PSFs `0..=S`, either held or spilled.
#[derive(Debug)]
pub(crate) enum StratumOtfs<T: DeconvFloat> {
    Resident(Vec<Spectrum<T>>),
    Streaming(OtfCache<T>),
}

impl<T: DeconvFloat> StratumOtfs<T> {
    /// Computes the OTF of every PSF. When streaming, each one is written and dropped
    /// before the next is computed.
    pub(crate) fn build(
        convolver: &Convolver<T>,
        psfs: &[Volume<T>],
        residency: OtfResidency<T>,
    ) -> Result<Self> {
        match residency {
            OtfResidency::Resident => psfs
                .iter()
                .map(|psf| convolver.otf(psf))
                .collect::<Result<Vec<_>>>()
                .map(StratumOtfs::Resident),
            OtfResidency::Streaming(mut cache) => {
                for (index, psf) in psfs.iter().enumerate() {
                    let otf = convolver.otf(psf)?;
                    cache.put(index, &otf)?;
                }
                log::debug!(
                    "spilled {} OTFs to namespace {}",
                    psfs.len(),
                    cache.namespace()
                );
                Ok(StratumOtfs::Streaming(cache))
            }
        }
    }

    pub(crate) fn is_streaming(&self) -> bool {
        matches!(self, StratumOtfs::Streaming(_))
    }

    /// The OTF of PSF `index`, read back from the cache if streaming. A failed read is
    /// reported with the index and the iteration it happened in.
    pub(crate) fn fetch(&self, index: usize, iteration: usize) -> Result<Cow<'_, Spectrum<T>>> {
        match self {
            StratumOtfs::Resident(otfs) => otfs.get(index).map(Cow::Borrowed).ok_or_else(|| {
                DeconvolutionError::InvalidConfiguration(format!("no OTF for PSF {index}"))
            }),
            StratumOtfs::Streaming(cache) => {
                cache
                    .get(index)
                    .map(Cow::Owned)
                    .map_err(|source| DeconvolutionError::StreamingIo {
                        otf: index,
                        iteration,
                        source: Box::new(source),
                    })
            }
        }
    }
}
