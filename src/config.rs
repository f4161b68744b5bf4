// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use crate::DriftError;
use crate::anchor::AnchorSearch;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO)
}

/// Settings of an anchor drift correction session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Time of primary acquisition between two corrections, in seconds.
    pub period_s: f64,
    /// Sub-pixel precision passed to the shift estimator (1/precision pixel).
    pub precision: i32,
    /// A capture times out after `timeout_factor * estimated time + timeout_margin_s`.
    pub timeout_factor: f64,
    pub timeout_margin_s: f64,
    /// Side of the anchor square, in full-field pixels, when it is guessed.
    pub anchor_size_px: usize,
    pub canny_low: f64,
    pub canny_high: f64,
    /// Anchor images kept for export, the reference included. `None` keeps
    /// every capture.
    pub max_anchor_history: Option<usize>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            period_s: 10.0,
            precision: 10,
            timeout_factor: 10.0,
            timeout_margin_s: 5.0,
            anchor_size_px: 50,
            canny_low: 100.0,
            canny_high: 200.0,
            max_anchor_history: None,
        }
    }
}

impl DriftConfig {
    pub fn validate(&self) -> Result<(), DriftError> {
        if !(self.period_s > 0.0 && self.period_s.is_finite()) {
            return Err(DriftError::InvalidParams(format!(
                "period_s must be positive, got {}",
                self.period_s
            )));
        }
        if !(self.timeout_factor >= 1.0 && self.timeout_factor.is_finite()) {
            return Err(DriftError::InvalidParams(format!(
                "timeout_factor must be >= 1, got {}",
                self.timeout_factor
            )));
        }
        if !(self.timeout_margin_s >= 0.0 && self.timeout_margin_s.is_finite()) {
            return Err(DriftError::InvalidParams(format!(
                "timeout_margin_s must be >= 0, got {}",
                self.timeout_margin_s
            )));
        }
        if self.anchor_size_px < 2 {
            return Err(DriftError::InvalidParams(
                "anchor_size_px must be at least 2".to_string(),
            ));
        }
        if !(self.canny_low >= 0.0 && self.canny_low <= self.canny_high) {
            return Err(DriftError::InvalidParams(format!(
                "canny thresholds must satisfy 0 <= low <= high, got {} / {}",
                self.canny_low, self.canny_high
            )));
        }
        if self.max_anchor_history.is_some_and(|n| n < 2) {
            return Err(DriftError::InvalidParams(
                "max_anchor_history must keep the reference and the latest capture".to_string(),
            ));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        seconds(self.period_s)
    }

    pub fn timeout_margin(&self) -> Duration {
        seconds(self.timeout_margin_s)
    }

    pub fn anchor_search(&self) -> AnchorSearch {
        AnchorSearch {
            anchor_size_px: self.anchor_size_px,
            canny_low: self.canny_low,
            canny_high: self.canny_high,
        }
    }
}

/// Settings of tile registration and weaving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Sub-pixel precision of the pairwise shift estimation.
    pub precision: i32,
    /// Neighbours overlapping by fewer pixels keep their expected offset.
    pub min_overlap_px: usize,
    /// Equalise the mean intensity of overlapping regions before weaving.
    pub adjust_brightness: bool,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            precision: 4,
            min_overlap_px: 8,
            adjust_brightness: false,
        }
    }
}

impl StitchConfig {
    pub fn validate(&self) -> Result<(), DriftError> {
        if self.min_overlap_px < 2 {
            return Err(DriftError::InvalidParams(
                "min_overlap_px must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DriftConfig::default().validate().unwrap();
        StitchConfig::default().validate().unwrap();
        assert_eq!(Duration::from_secs(10), DriftConfig::default().period());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: DriftConfig =
            serde_json::from_str(r#"{ "period_s": 2.5, "precision": 20 }"#).unwrap();
        assert_eq!(Duration::from_millis(2500), cfg.period());
        assert_eq!(20, cfg.precision);
        assert_eq!(50, cfg.anchor_size_px);
        cfg.validate().unwrap();

        let cfg: StitchConfig = serde_json::from_str(r#"{ "adjust_brightness": true }"#).unwrap();
        assert!(cfg.adjust_brightness);
        assert_eq!(4, cfg.precision);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = DriftConfig {
            period_s: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(DriftError::InvalidParams(_))));
        let bad = DriftConfig {
            canny_low: 300.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = DriftConfig {
            timeout_factor: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = DriftConfig {
            max_anchor_history: Some(1),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let cfg: DriftConfig = serde_json::from_str(r#"{ "max_anchor_history": 3 }"#).unwrap();
        assert_eq!(Some(3), cfg.max_anchor_history);
        cfg.validate().unwrap();
    }
}
