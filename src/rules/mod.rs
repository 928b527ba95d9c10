//! Update rules driven by [`IterativeEstimate`](crate::estimate::iterative::IterativeEstimate).
//!
//! # Rule Families
//!
//! * **Depth-invariant**: a single PSF for the whole volume ([`RichardsonLucy`] with zero
//!   or mirrored boundary, [`JanssonVanCittert`]).
//!
//! * **Depth-variant**: `S + 1` PSFs blended linearly across `S` strata, either as one
//!   whole-volume model ([`StrataBlendVolume`]) or as an average of per-stratum updates
//!   ([`StrataBlendPerStratum`]). Both accept a mirrored boundary and can stream their OTFs
//!   through a store instead of keeping them resident.
//!
//! Each rule implements the [`UpdateRule`] trait defined in the `rule` module and reports
//! what it supports after construction through its [`Capabilities`].

/// Shared state of the strata-blended rules.
mod blend;

/// Multiplicative and bounded additive depth-invariant updates.
mod jansson_van_cittert;
mod richardson_lucy;

/// Resident or streamed per-stratum OTFs.
pub mod otf_source;

/// Core rule interface and shared helpers.
pub mod rule;

/// Strata-blended EM: whole-volume and per-stratum forms.
mod strata_stratum;
mod strata_volume;

pub use jansson_van_cittert::JanssonVanCittert;
pub use otf_source::OtfResidency;
pub use richardson_lucy::RichardsonLucy;
pub use rule::{
    Capabilities, DepthModel, IterationContext, Regularizer, RuleConfig, Step, UpdateRule,
};
pub use strata_stratum::StrataBlendPerStratum;
pub use strata_volume::StrataBlendVolume;
