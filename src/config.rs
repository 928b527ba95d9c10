//! Persisted deconvolution settings.
//!
//! Settings are stored with `preferences` under [`APP_INFO`] and [`PREFS_KEY`], so a run
//! can be repeated with the parameters of the previous one.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::volume::Boundary;
use preferences::{AppInfo, Preferences};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const APP_INFO: AppInfo = AppInfo {
    name: "Strata Deconvolution",
    author: "Linus Leo Stöckli",
};

pub const PREFS_KEY: &str = "config/deconvolution";

/// Which estimator a run uses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    LinearLeastSquares,
    MaximumAPosteriori,
    #[default]
    RichardsonLucy,
    JanssonVanCittert,
    StrataBlendVolume,
    StrataBlendPerStratum,
}

impl Algorithm {
    pub fn is_depth_variant(&self) -> bool {
        matches!(
            self,
            Algorithm::StrataBlendVolume | Algorithm::StrataBlendPerStratum
        )
    }
}

/// Where depth-variant rules keep their OTFs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residency {
    #[default]
    Resident,
    Streaming,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeconvolutionSettings {
    pub algorithm: Algorithm,
    pub boundary: Boundary,
    pub residency: Residency,
    pub iterations: usize,
    /// Guard for denominators and noise floor of the estimate.
    pub epsilon: f64,
    pub number_of_strata: usize,
    /// Minimum OTF magnitude used by the least-squares inverse filter.
    pub linear_threshold: f64,
    /// Weight of the frequency penalty of the MAP filter.
    pub map_alpha: f64,
    /// Iterations between two progress log lines.
    pub progress_interval: usize,
}

impl Default for DeconvolutionSettings {
    fn default() -> Self {
        DeconvolutionSettings {
            algorithm: Algorithm::default(),
            boundary: Boundary::default(),
            residency: Residency::default(),
            iterations: 100,
            epsilon: f64::DEFAULT_EPSILON,
            number_of_strata: 1,
            linear_threshold: 1e-3,
            map_alpha: 1e-2,
            progress_interval: 10,
        }
    }
}

impl DeconvolutionSettings {
    /// Checks ranges and combinations before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(DeconvolutionError::InvalidConfiguration(message));
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return invalid(format!("epsilon must be positive, got {}", self.epsilon));
        }
        if !(self.linear_threshold.is_finite() && self.linear_threshold >= 0.0) {
            return invalid(format!(
                "linear threshold must not be negative, got {}",
                self.linear_threshold
            ));
        }
        if !(self.map_alpha.is_finite() && self.map_alpha >= 0.0) {
            return invalid(format!(
                "MAP alpha must not be negative, got {}",
                self.map_alpha
            ));
        }
        if self.number_of_strata == 0 {
            return invalid("at least one stratum is required".to_string());
        }
        if self.progress_interval == 0 {
            return invalid("progress interval must be at least 1".to_string());
        }
        let mirrored = self.boundary == Boundary::Mirrored;
        match self.algorithm {
            Algorithm::LinearLeastSquares
            | Algorithm::MaximumAPosteriori
            | Algorithm::JanssonVanCittert
                if mirrored =>
            {
                return invalid(format!(
                    "{:?} does not support a mirrored boundary",
                    self.algorithm
                ));
            }
            _ => {}
        }
        if self.residency == Residency::Streaming && !self.algorithm.is_depth_variant() {
            return invalid(format!(
                "{:?} keeps a single OTF and cannot stream",
                self.algorithm
            ));
        }
        Ok(())
    }

    /// Loads the stored settings. Missing, unreadable or invalid settings fall back to
    /// the defaults; nothing is written.
    pub fn load_or_default() -> Self {
        DeconvolutionSettings::usable_or_default(
            DeconvolutionSettings::load(&APP_INFO, PREFS_KEY)
                .map_err(|err| DeconvolutionError::store(PREFS_KEY, err)),
        )
    }

    /// Like [`DeconvolutionSettings::load_or_default`], reading from `reader` instead of
    /// the preferences directory.
    pub fn read_or_default<R: Read>(reader: &mut R) -> Self {
        DeconvolutionSettings::usable_or_default(DeconvolutionSettings::read_from(reader))
    }

    fn usable_or_default(loaded: Result<Self>) -> Self {
        match loaded.and_then(|settings| settings.validate().map(|_| settings)) {
            Ok(settings) => settings,
            Err(err) => {
                log::info!("no usable deconvolution settings ({err}), using defaults");
                DeconvolutionSettings::default()
            }
        }
    }

    /// Stores the settings for the next session.
    pub fn store(&self) -> Result<()> {
        self.save(&APP_INFO, PREFS_KEY)
            .map_err(|err| DeconvolutionError::store(PREFS_KEY, err))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.save_to(writer)
            .map_err(|err| DeconvolutionError::store(PREFS_KEY, err))
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        DeconvolutionSettings::load_from(reader)
            .map_err(|err| DeconvolutionError::store(PREFS_KEY, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = DeconvolutionSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.algorithm, Algorithm::RichardsonLucy);
        assert_eq!(settings.iterations, 100);
        assert_eq!(settings.epsilon, f64::DEFAULT_EPSILON);
        assert_eq!(settings.epsilon, 1e-4);
    }

    #[test]
    fn settings_round_trip() {
        let settings = DeconvolutionSettings {
            algorithm: Algorithm::StrataBlendPerStratum,
            boundary: Boundary::Mirrored,
            residency: Residency::Streaming,
            number_of_strata: 3,
            ..Default::default()
        };
        let mut buffer = Vec::new();
        settings.write_to(&mut buffer).unwrap();
        let back = DeconvolutionSettings::read_from(&mut buffer.as_slice()).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let back =
            DeconvolutionSettings::read_from(&mut r#"{"iterations": 7}"#.as_bytes()).unwrap();
        assert_eq!(back.iterations, 7);
        assert_eq!(back.number_of_strata, 1);
    }

    #[test]
    fn unusable_settings_fall_back_to_defaults() {
        let garbage = DeconvolutionSettings::read_or_default(&mut "not json".as_bytes());
        assert_eq!(garbage, DeconvolutionSettings::default());

        let invalid = DeconvolutionSettings::read_or_default(
            &mut r#"{"algorithm": "JanssonVanCittert", "boundary": "Mirrored"}"#.as_bytes(),
        );
        assert_eq!(invalid, DeconvolutionSettings::default());

        let stored = DeconvolutionSettings {
            algorithm: Algorithm::StrataBlendVolume,
            number_of_strata: 4,
            iterations: 12,
            ..Default::default()
        };
        let mut buffer = Vec::new();
        stored.write_to(&mut buffer).unwrap();
        assert_eq!(
            DeconvolutionSettings::read_or_default(&mut buffer.as_slice()),
            stored
        );
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let mirrored_linear = DeconvolutionSettings {
            algorithm: Algorithm::MaximumAPosteriori,
            boundary: Boundary::Mirrored,
            ..Default::default()
        };
        assert!(mirrored_linear.validate().is_err());

        let streaming_em = DeconvolutionSettings {
            residency: Residency::Streaming,
            ..Default::default()
        };
        assert!(streaming_em.validate().is_err());

        let no_epsilon = DeconvolutionSettings {
            epsilon: 0.0,
            ..Default::default()
        };
        assert!(no_epsilon.validate().is_err());

        let mirrored_em = DeconvolutionSettings {
            boundary: Boundary::Mirrored,
            ..Default::default()
        };
        assert!(mirrored_em.validate().is_ok());
    }
}
