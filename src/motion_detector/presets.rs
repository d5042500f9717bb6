//! Sensitivity presets for the hybrid motion detector

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named sensitivity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
    /// Caller-supplied raw parameters
    Custom,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
            Sensitivity::Custom => "custom",
        }
    }

    /// Built-in parameter bundle, `None` for `Custom`
    pub fn preset(&self) -> Option<MotionParams> {
        match self {
            Sensitivity::Low => Some(MotionParams::low()),
            Sensitivity::Medium => Some(MotionParams::medium()),
            Sensitivity::High => Some(MotionParams::high()),
            Sensitivity::Custom => None,
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            "custom" => Ok(Sensitivity::Custom),
            other => Err(Error::Validation(format!(
                "Invalid sensitivity '{}'. Must be one of: low, medium, high, custom",
                other
            ))),
        }
    }
}

fn default_pixel_diff_weight() -> f32 {
    0.5
}

fn default_background_weight() -> f32 {
    0.5
}

fn default_background_scale() -> f32 {
    3.0
}

/// Tuning parameters for [`super::MotionDetector`]
///
/// The estimator weights and background scale were tuned empirically against
/// a small set of cameras; they are kept as overridable defaults and should be
/// recalibrated against new footage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionParams {
    /// Gaussian blur kernel size (odd, 1 disables blur)
    pub blur_kernel: u32,
    /// Per-pixel luma difference above which a pixel counts as changed
    pub pixel_threshold: u8,
    /// Amplification applied to the changed-pixel percentage
    pub pixel_scale: f32,
    /// Squared-distance multiple of the pixel variance marking foreground
    pub bg_var_threshold: f32,
    /// Background model history length in frames
    pub bg_history: u32,
    #[serde(default = "default_pixel_diff_weight")]
    pub pixel_diff_weight: f32,
    #[serde(default = "default_background_weight")]
    pub background_weight: f32,
    /// Amplification applied to the foreground-pixel percentage
    #[serde(default = "default_background_scale")]
    pub background_scale: f32,
}

impl MotionParams {
    pub fn low() -> Self {
        Self {
            blur_kernel: 5,
            pixel_threshold: 20,
            pixel_scale: 8.0,
            bg_var_threshold: 20.0,
            bg_history: 300,
            ..Self::medium()
        }
    }

    pub fn medium() -> Self {
        Self {
            blur_kernel: 3,
            pixel_threshold: 10,
            pixel_scale: 15.0,
            bg_var_threshold: 10.0,
            bg_history: 500,
            pixel_diff_weight: default_pixel_diff_weight(),
            background_weight: default_background_weight(),
            background_scale: default_background_scale(),
        }
    }

    pub fn high() -> Self {
        Self {
            blur_kernel: 3,
            pixel_threshold: 5,
            pixel_scale: 20.0,
            bg_var_threshold: 8.0,
            bg_history: 700,
            ..Self::medium()
        }
    }

    /// Resolve the parameters for a sensitivity level.
    ///
    /// `Custom` uses `custom` when given and falls back to the medium values.
    pub fn resolve(sensitivity: Sensitivity, custom: Option<MotionParams>) -> Self {
        sensitivity
            .preset()
            .or(custom)
            .unwrap_or_else(Self::medium)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blur_kernel == 0 || self.blur_kernel % 2 == 0 {
            return Err(Error::Validation(format!(
                "blur_kernel must be a positive odd number, got {}",
                self.blur_kernel
            )));
        }
        if self.bg_history == 0 {
            return Err(Error::Validation("bg_history must be at least 1".to_string()));
        }
        if !(self.bg_var_threshold > 0.0) {
            return Err(Error::Validation(format!(
                "bg_var_threshold must be positive, got {}",
                self.bg_var_threshold
            )));
        }
        let positive = [
            ("pixel_scale", self.pixel_scale),
            ("background_scale", self.background_scale),
            ("pixel_diff_weight", self.pixel_diff_weight),
            ("background_weight", self.background_weight),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Validation(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl Default for MotionParams {
    fn default() -> Self {
        Self::medium()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sensitivity() {
        assert_eq!("HIGH".parse::<Sensitivity>().unwrap(), Sensitivity::High);
        assert_eq!(" low ".parse::<Sensitivity>().unwrap(), Sensitivity::Low);
        assert!("extreme".parse::<Sensitivity>().is_err());
    }

    #[test]
    fn test_presets_order_by_strictness() {
        let (low, medium, high) = (MotionParams::low(), MotionParams::medium(), MotionParams::high());
        assert!(low.pixel_threshold > medium.pixel_threshold);
        assert!(medium.pixel_threshold > high.pixel_threshold);
        assert!(low.bg_var_threshold > medium.bg_var_threshold);
        assert!(medium.bg_var_threshold > high.bg_var_threshold);
        assert!(high.pixel_scale > low.pixel_scale);
    }

    #[test]
    fn test_custom_falls_back_to_medium() {
        assert_eq!(MotionParams::resolve(Sensitivity::Custom, None), MotionParams::medium());

        let custom = MotionParams {
            pixel_threshold: 42,
            ..MotionParams::medium()
        };
        assert_eq!(MotionParams::resolve(Sensitivity::Custom, Some(custom)).pixel_threshold, 42);
        // Presets ignore custom values
        assert_eq!(MotionParams::resolve(Sensitivity::Low, Some(custom)), MotionParams::low());
    }

    #[test]
    fn test_validate_rejects_even_kernel() {
        let params = MotionParams {
            blur_kernel: 4,
            ..MotionParams::medium()
        };
        assert!(matches!(params.validate(), Err(Error::Validation(_))));
        assert!(MotionParams::high().validate().is_ok());
    }

    #[test]
    fn test_weights_default_when_missing_from_json() {
        let json = r#"{"blur_kernel":3,"pixel_threshold":12,"pixel_scale":10.0,"bg_var_threshold":9.0,"bg_history":400}"#;
        let params: MotionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.pixel_diff_weight, 0.5);
        assert_eq!(params.background_weight, 0.5);
        assert_eq!(params.background_scale, 3.0);
    }
}
