//! fOS Image
//!
//! Streaming image pipeline for the fOS browser engine.
//!
//! Bytes arrive from the network in arbitrary chunks and are fed to a
//! per-format incremental decoder. Decoded rows are converted to linear
//! light, optionally resampled, and rounded or dithered into the device's
//! pixel format. Results live in an [`ImageCache`] keyed by resource and
//! presentation parameters, reference counted and evicted LRU-first under a
//! byte budget.
//!
//! # Example
//! ```rust,ignore
//! use fos_image::{Config, ImageCache, ImageKey, MemoryDevice, PixelFormat, Resource, ResourceStatus};
//!
//! let mut cache = ImageCache::new(Config::default(), MemoryDevice::new(PixelFormat::RGB565));
//! let handle = cache.find_or_create(ImageKey::new("https://example.com/logo.gif"));
//! let resource = Resource::new("image/gif", &bytes, ResourceStatus::Complete);
//! while cache.feed(handle, &resource).is_yield() {}
//! cache.draw(handle, 10, 10);
//! cache.release(handle);
//! ```

mod config;
mod error;
pub mod cache;
pub mod color;
pub mod decode;
pub mod device;
pub mod scale;

pub use cache::{
    CacheStats, DecodeState, DrawStyle, FeedResult, ImageCache, ImageHandle, ImageKey, Resource,
    ResourceStatus, FEED_CHUNK_LIMIT,
};
pub use color::{ColorPipeline, DitherTables, GammaTable, RenderTarget};
pub use config::Config;
pub use decode::{BufferLayout, DecodeCanvas, DecodeStatus, Decoder, ImageKind, PixelBuffer};
pub use device::{BitmapHandle, ByteOrder, DisplayDevice, MemoryDevice, PixelFormat, PixmapDevice, WritableRows};
pub use error::{ConfigError, ImageError};

/// Gamma of sRGB-encoded data: `data = light ^ SRGB_GAMMA`
pub const SRGB_GAMMA: f32 = 0.45455;

/// Color in sRGB space (not rounded to any device)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color { r: 255, g: 255, b: 255 };
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// From `0xRRGGBB`
    pub fn from_rgb24(rgb: u32) -> Self {
        Self {
            r: (rgb >> 16) as u8,
            g: (rgb >> 8) as u8,
            b: rgb as u8,
        }
    }

    /// To `0xRRGGBB`
    pub fn to_rgb24(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_rgb24() {
        let c = Color::from_rgb24(0x12ab34);
        assert_eq!(c, Color::rgb(0x12, 0xab, 0x34));
        assert_eq!(c.to_rgb24(), 0x12ab34);
    }
}
