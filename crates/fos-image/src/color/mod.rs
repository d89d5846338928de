//! Color Pipeline
//!
//! Source samples → 48-bit linear light (alpha composited over the
//! background) → rounded or dithered device pixels.

mod dither;
mod gamma;

pub use dither::{new_dregs, DitherTables};
pub use gamma::{
    build_gamma_table, color_to_linear, source_exponent, GammaTable, TABLE_THRESHOLD_16BIT,
    TABLE_THRESHOLD_8BIT,
};

use crate::decode::{PixelBuffer, Samples};
use crate::device::PixelFormat;
use crate::{Color, Config, ConfigError, ImageError};

/// What a rendered bitmap is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    Image,
    Text,
}

/// Cross-image color state: settings, gamma version and device tables
#[derive(Debug)]
pub struct ColorPipeline {
    config: Config,
    /// Bumped on every gamma or dithering change
    gamma_version: u64,
    tables: Option<DitherTables>,
}

impl ColorPipeline {
    /// An invalid configuration is replaced by the defaults
    pub fn new(config: Config) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                tracing::warn!("Ignoring image configuration: {}", e);
                Config::default()
            }
        };
        Self { config, gamma_version: 0, tables: None }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gamma_version(&self) -> u64 {
        self.gamma_version
    }

    pub fn set_display_gamma(&mut self, gamma: [f32; 3]) -> Result<(), ConfigError> {
        let config = Config {
            display_red_gamma: gamma[0],
            display_green_gamma: gamma[1],
            display_blue_gamma: gamma[2],
            ..self.config.clone()
        };
        self.replace_config(config)
    }

    pub fn set_user_gamma(&mut self, gamma: f32) -> Result<(), ConfigError> {
        let config = Config { user_gamma: gamma, ..self.config.clone() };
        self.replace_config(config)
    }

    pub fn set_dithering(&mut self, images: bool, text: bool) {
        self.config.dither_images = images;
        self.config.dither_text = text;
        self.gamma_version += 1;
    }

    /// Install a new configuration, invalidating every materialized bitmap
    pub fn replace_config(&mut self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        self.gamma_version += 1;
        tracing::debug!("Gamma version now {}", self.gamma_version);
        Ok(())
    }

    /// Whether the target is dithered rather than rounded
    pub fn dithers(&self, target: RenderTarget) -> bool {
        match target {
            RenderTarget::Image => self.config.dither_images,
            RenderTarget::Text => self.config.dither_text,
        }
    }

    /// Exponent for a source with the given per-channel gamma
    pub fn exponent_for(&self, source_gamma: [f32; 3]) -> [f32; 3] {
        source_exponent(source_gamma, self.config.user_gamma)
    }

    /// Linear light of the background ("undercolor")
    pub fn background_linear(&self, background: Color) -> [u16; 3] {
        color_to_linear(background, self.config.user_gamma)
    }

    /// Quantization tables for the device format at the current display gamma
    pub fn tables(&mut self, format: PixelFormat) -> &DitherTables {
        let gamma = self.config.display_gamma();
        if !self.tables.as_ref().is_some_and(|t| t.matches(format, gamma)) {
            self.tables = None;
        }
        self.tables.get_or_insert_with(|| DitherTables::new(format, gamma))
    }

    /// Convert a row of linear RGB to device pixels
    ///
    /// `dregs` is used only when the target is dithered.
    pub fn render_row(
        &mut self,
        format: PixelFormat,
        target: RenderTarget,
        linear: &[u16],
        dregs: &mut [i32],
        out: &mut [u8],
    ) {
        let dither = self.dithers(target);
        let tables = self.tables(format);
        if dither {
            tables.dither_row(linear, dregs, out);
        } else {
            tables.round_row(linear, out);
        }
    }
}

/// Convert one buffer row to linear RGB, 3 samples per pixel
///
/// Alpha is composited over `background` in linear light.
pub fn linearize_row(buffer: &PixelBuffer, y: u32, gamma: &GammaTable, background: [u16; 3], out: &mut [u16]) {
    let layout = buffer.layout();
    let channels = layout.channels();
    let width = buffer.width() as usize;
    let start = y as usize * width * channels;
    let end = start + width * channels;

    match buffer.samples() {
        Samples::U8(data) => {
            for (px, dst) in data[start..end].chunks_exact(channels).zip(out.chunks_exact_mut(3)) {
                let alpha = if layout.has_alpha() { Some((px[3] as u32, 255)) } else { None };
                for c in 0..3 {
                    dst[c] = composite(gamma.apply(c, px[c] as u16), background[c], alpha);
                }
            }
        }
        Samples::U16(data) => {
            for (px, dst) in data[start..end].chunks_exact(channels).zip(out.chunks_exact_mut(3)) {
                let alpha = if layout.has_alpha() { Some((px[3] as u32, 65535)) } else { None };
                for c in 0..3 {
                    dst[c] = composite(gamma.apply(c, px[c]), background[c], alpha);
                }
            }
        }
    }
}

/// Linear buffer of a whole image
pub fn linearize(buffer: &PixelBuffer, gamma: &GammaTable, background: [u16; 3]) -> Result<Vec<u16>, ImageError> {
    let row_len = buffer.width() as usize * 3;
    let len = row_len * buffer.height() as usize;
    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .map_err(|_| ImageError::AllocationFailure { bytes: len * 2 })?;
    out.resize(len, 0);
    if row_len == 0 {
        return Ok(out);
    }
    for (y, row) in out.chunks_exact_mut(row_len).enumerate() {
        linearize_row(buffer, y as u32, gamma, background, row);
    }
    Ok(out)
}

#[inline]
fn composite(light: u16, background: u16, alpha: Option<(u32, u32)>) -> u16 {
    match alpha {
        None => light,
        Some((a, max)) if a >= max => light,
        Some((a, max)) => {
            let mixed = light as u64 * a as u64 + background as u64 * (max - a) as u64;
            ((mixed + max as u64 / 2) / max as u64) as u16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::BufferLayout;

    #[test]
    fn test_identity_round_trip_8bit() {
        let config = Config {
            display_red_gamma: 1.0,
            display_green_gamma: 1.0,
            display_blue_gamma: 1.0,
            dither_images: false,
            ..Config::default()
        };
        let mut pipeline = ColorPipeline::new(config);
        let gamma = GammaTable::build(pipeline.exponent_for([1.0; 3]), false);

        let mut buffer = PixelBuffer::new(256, 1, BufferLayout::Rgb8, Color::BLACK).unwrap();
        if let Some(row) = buffer.row_u8_mut(0) {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                px.copy_from_slice(&[x as u8, x as u8, 255 - x as u8]);
            }
        }

        let mut linear = vec![0u16; 256 * 3];
        linearize_row(&buffer, 0, &gamma, [0; 3], &mut linear);
        let mut out = vec![0u8; 256 * 3];
        let mut dregs = new_dregs(256);
        pipeline.render_row(PixelFormat::RGB888, RenderTarget::Image, &linear, &mut dregs, &mut out);

        assert_eq!(buffer.row_u8(0).unwrap(), &out[..]);
    }

    #[test]
    fn test_alpha_composites_over_background() {
        let pipeline = ColorPipeline::new(Config::default());
        let gamma = GammaTable::direct(pipeline.exponent_for([crate::SRGB_GAMMA; 3]), false);
        let background = pipeline.background_linear(Color::WHITE);

        let mut buffer = PixelBuffer::new(3, 1, BufferLayout::Rgba8, Color::WHITE).unwrap();
        if let Some(row) = buffer.row_u8_mut(0) {
            row.copy_from_slice(&[0, 0, 0, 0, 0, 0, 0, 255, 0, 0, 0, 128]);
        }
        let linear = linearize(&buffer, &gamma, background).unwrap();
        assert_eq!(&linear[0..3], &[65535; 3]);
        assert_eq!(&linear[3..6], &[0; 3]);
        // half coverage is half light
        assert_eq!(linear[6], 32639);
    }

    #[test]
    fn test_settings_bump_gamma_version() {
        let mut pipeline = ColorPipeline::new(Config::default());
        assert_eq!(pipeline.gamma_version(), 0);
        pipeline.set_user_gamma(1.2).unwrap();
        pipeline.set_display_gamma([1.8; 3]).unwrap();
        pipeline.set_dithering(false, true);
        assert_eq!(pipeline.gamma_version(), 3);
        assert!(!pipeline.dithers(RenderTarget::Image));
        assert!(pipeline.dithers(RenderTarget::Text));

        assert!(pipeline.set_user_gamma(-1.0).is_err());
        assert_eq!(pipeline.gamma_version(), 3);
        assert_eq!(pipeline.config().user_gamma, 1.2);
    }

    #[test]
    fn test_invalid_initial_config_uses_defaults() {
        let config = Config { display_blue_gamma: f32::NAN, dither_images: false, ..Config::default() };
        let pipeline = ColorPipeline::new(config);
        assert_eq!(pipeline.config(), &Config::default());

        let pipeline = ColorPipeline::new(Config { user_gamma: 0.0, ..Config::default() });
        assert_eq!(pipeline.config().user_gamma, 1.0);
    }

    #[test]
    fn test_tables_rebuilt_for_new_gamma() {
        let mut pipeline = ColorPipeline::new(Config::default());
        assert_eq!(pipeline.tables(PixelFormat::RGB565).gamma(), [2.2; 3]);
        pipeline.set_display_gamma([1.0; 3]).unwrap();
        assert_eq!(pipeline.tables(PixelFormat::RGB565).gamma(), [1.0; 3]);
    }
}
