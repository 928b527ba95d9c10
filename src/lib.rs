//! # strata-deconv
//!
//! Iterative deconvolution of 3-D intensity volumes blurred by a known PSF, including
//! depth-variant PSFs blended across strata of the depth axis.
//!
//! The crate is organised leaf to root:
//!
//! * [`fourier`]: real↔complex 3-D transforms and boundary-aware convolution.
//! * [`strata`]: axis-0 partition and blend weights.
//! * [`store`]: named blob persistence and the per-stratum OTF cache.
//! * [`rules`]: the update rules (EM, mirrored EM, Jansson-van Cittert, strata blends).
//! * [`estimate`]: linear filters, the iteration driver and [`build_estimator`].
//! * [`observer`]: periodic callbacks for progress, metrics, checkpoints and cancellation.
//!
//! ## Example
//!
//! ```
//! use ndarray::Array3;
//! use strata_deconv::psf::box_psf;
//! use strata_deconv::{build_estimator, Algorithm, DeconvolutionSettings};
//!
//! let mut image = Array3::<f64>::zeros((8, 8, 8));
//! image[[4, 4, 4]] = 1.0;
//! let settings = DeconvolutionSettings {
//!     algorithm: Algorithm::RichardsonLucy,
//!     iterations: 5,
//!     ..Default::default()
//! };
//! let mut estimate = build_estimator(&settings, vec![box_psf([3, 3, 3])?], image, None)?;
//! let summary = estimate.run()?;
//! assert_eq!(summary.iterations_done, 5);
//! assert!(estimate.results().iter().all(|&v| v >= 0.0));
//! # Ok::<(), strata_deconv::DeconvolutionError>(())
//! ```

pub mod config;
pub mod error;
pub mod estimate;
pub mod float;
pub mod fourier;
pub mod observer;
pub mod psf;
pub mod rules;
pub mod store;
pub mod strata;
pub mod volume;

pub use cancellable_loops::CancellationToken;
pub use config::{Algorithm, DeconvolutionSettings, Residency};
pub use error::{DeconvolutionError, Result};
pub use estimate::iterative::IterativeEstimate;
pub use estimate::linear::{LinearLeastSquares, MaximumAPosteriori};
pub use estimate::{build_estimator, Estimate, RunState, RunSummary, StopReason};
pub use float::DeconvFloat;
pub use observer::{DriverState, Observer};
pub use rules::UpdateRule;
pub use volume::{Boundary, Spectrum, Volume};
