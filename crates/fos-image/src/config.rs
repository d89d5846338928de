//! Image Pipeline Configuration

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Image pipeline configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Monitor gamma of the red channel
    pub display_red_gamma: f32,

    /// Monitor gamma of the green channel
    pub display_green_gamma: f32,

    /// Monitor gamma of the blue channel
    pub display_blue_gamma: f32,

    /// Overall user gamma correction (1.0 = none)
    pub user_gamma: f32,

    /// Floyd-Steinberg dithering for images, rounding otherwise
    pub dither_images: bool,

    /// Floyd-Steinberg dithering for text
    pub dither_text: bool,

    /// Image cache budget used by `ImageCache::shrink` (bytes)
    pub cache_budget: usize,

    /// Height/width ratio of one display pixel
    pub pixel_aspect: f64,

    /// Compensate non-square pixels when sizing images
    pub aspect_correction: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_red_gamma: 2.2,
            display_green_gamma: 2.2,
            display_blue_gamma: 2.2,
            user_gamma: 1.0,
            dither_images: true,
            dither_text: true,
            cache_budget: 4 * 1024 * 1024, // 4MB
            pixel_aspect: 1.0,
            aspect_correction: true,
        }
    }
}

impl Config {
    /// Check that every numeric option is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gammas = [
            ("display_red_gamma", self.display_red_gamma),
            ("display_green_gamma", self.display_green_gamma),
            ("display_blue_gamma", self.display_blue_gamma),
            ("user_gamma", self.user_gamma),
        ];
        for (name, value) in gammas {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidGamma { name, value });
            }
        }
        if !self.pixel_aspect.is_finite() || self.pixel_aspect <= 0.0 {
            return Err(ConfigError::InvalidAspect(self.pixel_aspect));
        }
        Ok(())
    }

    /// Per-channel display gamma
    pub fn display_gamma(&self) -> [f32; 3] {
        [self.display_red_gamma, self.display_green_gamma, self.display_blue_gamma]
    }

    /// Aspect ratio actually applied to image sizing
    pub fn effective_aspect(&self) -> f64 {
        if self.aspect_correction { self.pixel_aspect } else { 1.0 }
    }
}
