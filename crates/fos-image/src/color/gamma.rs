//! Gamma Tables
//!
//! Conversion from gamma-encoded source samples to 16-bit linear light.

use crate::{Color, SRGB_GAMMA};

/// Below this many pixels an 8-bit source is converted with direct `powf`
pub const TABLE_THRESHOLD_8BIT: usize = 1024;

/// Below this many pixels a 16-bit source is converted with direct `powf`
pub const TABLE_THRESHOLD_16BIT: usize = 65536;

/// Build one channel's lookup: `round(65535 * (level / max) ^ exponent)`
///
/// `bits` is 8 (256 levels) or 16 (65536 levels).
pub fn build_gamma_table(exponent: f32, bits: u8) -> Vec<u16> {
    let levels = 1usize << bits;
    let max = (levels - 1) as f32;
    (0..levels).map(|level| to_light(level as f32 / max, exponent)).collect()
}

#[inline]
fn to_light(normalized: f32, exponent: f32) -> u16 {
    (65535.0 * normalized.powf(exponent)).round().clamp(0.0, 65535.0) as u16
}

/// Per-image, per-channel gamma conversion
///
/// Tabulated when the image is large enough to amortize the table,
/// otherwise computed on the fly.
#[derive(Debug, Clone)]
pub struct GammaTable {
    exponent: [f32; 3],
    sixteen_bit: bool,
    tables: Option<[Vec<u16>; 3]>,
}

impl GammaTable {
    /// Always-tabulated conversion
    pub fn build(exponent: [f32; 3], sixteen_bit: bool) -> Self {
        let bits = if sixteen_bit { 16 } else { 8 };
        let tables = exponent.map(|e| build_gamma_table(e, bits));
        Self { exponent, sixteen_bit, tables: Some(tables) }
    }

    /// Conversion that never tabulates
    pub fn direct(exponent: [f32; 3], sixteen_bit: bool) -> Self {
        Self { exponent, sixteen_bit, tables: None }
    }

    /// Pick tabulated or direct conversion from the image's pixel count
    pub fn for_image(exponent: [f32; 3], sixteen_bit: bool, pixels: usize) -> Self {
        let threshold = if sixteen_bit { TABLE_THRESHOLD_16BIT } else { TABLE_THRESHOLD_8BIT };
        if pixels >= threshold {
            Self::build(exponent, sixteen_bit)
        } else {
            Self::direct(exponent, sixteen_bit)
        }
    }

    pub fn exponent(&self) -> [f32; 3] {
        self.exponent
    }

    pub fn is_sixteen_bit(&self) -> bool {
        self.sixteen_bit
    }

    pub fn is_tabulated(&self) -> bool {
        self.tables.is_some()
    }

    /// Whether this table converts with `exponent` at the given depth
    pub fn matches(&self, exponent: [f32; 3], sixteen_bit: bool) -> bool {
        self.exponent == exponent && self.sixteen_bit == sixteen_bit
    }

    /// Linear light of one source sample
    #[inline]
    pub fn apply(&self, channel: usize, level: u16) -> u16 {
        match &self.tables {
            Some(tables) => tables[channel][level as usize],
            None => {
                let max = if self.sixteen_bit { 65535.0 } else { 255.0 };
                to_light(level as f32 / max, self.exponent[channel])
            }
        }
    }

    /// Table memory in bytes
    pub fn memory_usage(&self) -> usize {
        self.tables
            .as_ref()
            .map(|t| t.iter().map(|c| c.len() * 2).sum())
            .unwrap_or(0)
    }
}

/// Gamma exponent converting a source sample to linear light
pub fn source_exponent(source_gamma: [f32; 3], user_gamma: f32) -> [f32; 3] {
    source_gamma.map(|g| user_gamma / g)
}

/// Linear light of an sRGB color
pub fn color_to_linear(color: Color, user_gamma: f32) -> [u16; 3] {
    let exponent = user_gamma / SRGB_GAMMA;
    color.to_array().map(|c| to_light(c as f32 / 255.0, exponent))
}
