//! Streaming Image Decoders
//!
//! Every decoder accepts bytes in arbitrarily sized chunks and carries
//! partial records between calls. Decoded rows are written into the
//! [`DecodeCanvas`] the cache passes in.

mod buffered;
mod gif;
mod png;
mod xbm;

pub use self::buffered::BufferedDecoder;
pub use self::gif::GifDecoder;
pub use self::png::PngDecoder;
pub use self::xbm::XbmDecoder;

use crate::{Color, ImageError};

/// Minimum bytes needed to sniff a format from magic numbers
pub const SNIFF_BYTES: usize = 8;

/// Supported image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Gif,
    Xbm,
    Png,
    Jpeg,
    Tiff,
}

impl ImageKind {
    /// Format from a declared content type, parameters ignored
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match mime.as_str() {
            "image/gif" => Some(Self::Gif),
            "image/x-xbitmap" => Some(Self::Xbm),
            "image/png" | "image/x-png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/tiff" | "image/tif" => Some(Self::Tiff),
            _ => None,
        }
    }

    /// Whether the content type carries no format information
    pub fn is_generic_content_type(content_type: &str) -> bool {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        mime.is_empty() || mime.eq_ignore_ascii_case("application/octet-stream")
    }

    /// Detect format from magic bytes
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if data.starts_with(b"II*\0") || data.starts_with(b"MM\0*") {
            Some(Self::Tiff)
        } else if data.trim_ascii_start().starts_with(b"#define") {
            Some(Self::Xbm)
        } else {
            None
        }
    }

    /// Fresh decoder for this format
    pub fn create_decoder(self) -> Box<dyn Decoder> {
        match self {
            Self::Gif => Box::new(GifDecoder::new()),
            Self::Xbm => Box::new(XbmDecoder::new()),
            Self::Png => Box::new(PngDecoder::new()),
            Self::Jpeg => Box::new(BufferedDecoder::new(image::ImageFormat::Jpeg)),
            Self::Tiff => Box::new(BufferedDecoder::new(image::ImageFormat::Tiff)),
        }
    }
}

/// Result of feeding one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// More input is needed
    Continue,
    /// The image is complete; further input is ignored
    Done,
}

/// Per-format incremental decoder
pub trait Decoder {
    /// Consume the next chunk of the stream
    fn feed(&mut self, data: &[u8], canvas: &mut DecodeCanvas) -> Result<DecodeStatus, ImageError>;

    /// The stream has ended; decode buffered input or report truncation
    fn finish(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError>;

    fn is_done(&self) -> bool;

    /// Image size once the header has been parsed
    fn natural_size(&self) -> Option<(u32, u32)>;

    /// Rows are produced top-down, each exactly once
    fn is_sequential(&self) -> bool;
}

// ============================================================================
// Pixel Buffer
// ============================================================================

/// Canonical interleaved sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferLayout {
    Rgb8,
    Rgba8,
    Rgb16,
    Rgba16,
}

impl BufferLayout {
    pub fn channels(self) -> usize {
        if self.has_alpha() { 4 } else { 3 }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::Rgba8 | Self::Rgba16)
    }

    pub fn is_sixteen_bit(self) -> bool {
        matches!(self, Self::Rgb16 | Self::Rgba16)
    }

    /// Bytes per pixel: 3, 4, 6 or 8
    pub fn bytes_per_pixel(self) -> usize {
        self.channels() * if self.is_sixteen_bit() { 2 } else { 1 }
    }
}

/// `width * height * per_pixel`, or `AllocationFailure` if that overflows
pub(crate) fn area(width: u32, height: u32, per_pixel: usize) -> Result<usize, ImageError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(per_pixel))
        .ok_or(ImageError::AllocationFailure { bytes: usize::MAX })
}

/// Sample storage
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

/// Decoded image in linear memory, one layout per image
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    layout: BufferLayout,
    samples: Samples,
}

impl PixelBuffer {
    /// Allocate a buffer filled with `background` (transparent if alpha)
    pub fn new(width: u32, height: u32, layout: BufferLayout, background: Color) -> Result<Self, ImageError> {
        let pixels = area(width, height, 1)?;
        let len = area(width, height, layout.channels())?;
        let bytes = area(width, height, layout.bytes_per_pixel())?;
        let bg = background.to_array();

        let samples = if layout.is_sixteen_bit() {
            let mut data: Vec<u16> = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| ImageError::AllocationFailure { bytes })?;
            let px = [bg[0] as u16 * 257, bg[1] as u16 * 257, bg[2] as u16 * 257, 0];
            for _ in 0..pixels {
                data.extend_from_slice(&px[..layout.channels()]);
            }
            Samples::U16(data)
        } else {
            let mut data: Vec<u8> = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| ImageError::AllocationFailure { bytes })?;
            let px = [bg[0], bg[1], bg[2], 0];
            for _ in 0..pixels {
                data.extend_from_slice(&px[..layout.channels()]);
            }
            Samples::U8(data)
        };

        Ok(Self { width, height, layout, samples })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> BufferLayout {
        self.layout
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Memory held by the samples
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }

    fn row_range(&self, y: u32) -> Option<std::ops::Range<usize>> {
        if y >= self.height {
            return None;
        }
        let len = self.width as usize * self.layout.channels();
        let start = y as usize * len;
        Some(start..start + len)
    }

    pub fn row_u8(&self, y: u32) -> Option<&[u8]> {
        let range = self.row_range(y)?;
        match &self.samples {
            Samples::U8(data) => Some(&data[range]),
            Samples::U16(_) => None,
        }
    }

    pub fn row_u8_mut(&mut self, y: u32) -> Option<&mut [u8]> {
        let range = self.row_range(y)?;
        match &mut self.samples {
            Samples::U8(data) => Some(&mut data[range]),
            Samples::U16(_) => None,
        }
    }

    pub fn row_u16(&self, y: u32) -> Option<&[u16]> {
        let range = self.row_range(y)?;
        match &self.samples {
            Samples::U16(data) => Some(&data[range]),
            Samples::U8(_) => None,
        }
    }

    pub fn row_u16_mut(&mut self, y: u32) -> Option<&mut [u16]> {
        let range = self.row_range(y)?;
        match &mut self.samples {
            Samples::U16(data) => Some(&mut data[range]),
            Samples::U8(_) => None,
        }
    }

    /// Copy row `from` over row `to`
    pub fn copy_row(&mut self, from: u32, to: u32) {
        let (Some(src), Some(dst)) = (self.row_range(from), self.row_range(to)) else {
            return;
        };
        match &mut self.samples {
            Samples::U8(data) => data.copy_within(src, dst.start),
            Samples::U16(data) => data.copy_within(src, dst.start),
        }
    }

    /// Samples of one pixel widened to 16 bits, alpha last (max if opaque)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u16; 4]> {
        if x >= self.width {
            return None;
        }
        let channels = self.layout.channels();
        let i = self.row_range(y)?.start + x as usize * channels;
        let mut px = [0u16; 4];
        match &self.samples {
            Samples::U8(data) => {
                px[3] = 255;
                for c in 0..channels {
                    px[c] = data[i + c] as u16;
                }
            }
            Samples::U16(data) => {
                px[3] = 65535;
                px[..channels].copy_from_slice(&data[i..i + channels]);
            }
        }
        Some(px)
    }
}

// ============================================================================
// Decode Canvas
// ============================================================================

/// Decode-session context handed to a decoder on every call
#[derive(Debug)]
pub struct DecodeCanvas {
    background: Color,
    buffer: Option<PixelBuffer>,
    source_gamma: [f32; 3],
    /// Top rows that are final
    rows_complete: u32,
    /// Rows changed since the last `take_dirty`
    dirty: bool,
}

impl DecodeCanvas {
    pub fn new(background: Color) -> Self {
        Self {
            background,
            buffer: None,
            source_gamma: [crate::SRGB_GAMMA; 3],
            rows_complete: 0,
            dirty: false,
        }
    }

    pub fn background(&self) -> Color {
        self.background
    }

    /// Header parsed: allocate the pixel buffer filled with the background
    pub fn dimensions_known(
        &mut self,
        width: u32,
        height: u32,
        layout: BufferLayout,
        source_gamma: [f32; 3],
    ) -> Result<(), ImageError> {
        self.buffer = Some(PixelBuffer::new(width, height, layout, self.background)?);
        self.source_gamma = source_gamma;
        self.rows_complete = 0;
        self.dirty = true;
        tracing::debug!("Image dimensions known: {}x{} ({:?})", width, height, layout);
        Ok(())
    }

    pub fn has_dimensions(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&PixelBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut PixelBuffer> {
        self.buffer.as_mut()
    }

    pub fn source_gamma(&self) -> [f32; 3] {
        self.source_gamma
    }

    /// Record that rows `top..top + count` were written
    pub fn rows_written(&mut self, top: u32, count: u32) {
        self.dirty = true;
        if top <= self.rows_complete {
            let height = self.buffer.as_ref().map_or(0, |b| b.height());
            self.rows_complete = self.rows_complete.max(top + count).min(height);
        }
    }

    /// Number of contiguous final rows from the top
    pub fn rows_complete(&self) -> u32 {
        self.rows_complete
    }

    /// Whether rows changed since the last call
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Drop the buffer and progress
    pub fn reset(&mut self) {
        self.buffer = None;
        self.source_gamma = [crate::SRGB_GAMMA; 3];
        self.rows_complete = 0;
        self.dirty = false;
    }
}
