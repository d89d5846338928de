//! Buffered JPEG/TIFF Decoder
//!
//! These codecs are not driven incrementally: the stream is collected,
//! dimensions are probed as soon as the header parses, and the `image`
//! crate decodes everything when the stream ends.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader};

use super::{BufferLayout, DecodeCanvas, DecodeStatus, Decoder};
use crate::{ImageError, SRGB_GAMMA};

/// Collects the whole stream and decodes it at the end
pub struct BufferedDecoder {
    format: ImageFormat,
    data: Vec<u8>,
    size: Option<(u32, u32)>,
    /// Past `PROBE_EVERY_FEED` bytes, probes wait until this many are buffered
    next_probe: usize,
    done: bool,
}

/// Headers are probed on every feed until this much is buffered
const PROBE_EVERY_FEED: usize = 64 * 1024;

impl BufferedDecoder {
    pub fn new(format: ImageFormat) -> Self {
        Self { format, data: Vec::new(), size: None, next_probe: 0, done: false }
    }

    fn probe(&mut self) -> Option<(u32, u32)> {
        // Each probe re-reads the buffer, so large streams probe at doubling sizes
        if self.data.len() > PROBE_EVERY_FEED {
            if self.data.len() < self.next_probe {
                return None;
            }
            self.next_probe = self.data.len() * 2;
        }
        ImageReader::with_format(Cursor::new(&self.data), self.format)
            .into_dimensions()
            .ok()
    }
}

/// Layout matching the decoded image's depth and alpha
fn layout_of(img: &DynamicImage) -> BufferLayout {
    let color = img.color();
    let sixteen_bit = color.bytes_per_pixel() / color.channel_count() > 1;
    match (sixteen_bit, color.has_alpha()) {
        (false, false) => BufferLayout::Rgb8,
        (false, true) => BufferLayout::Rgba8,
        (true, false) => BufferLayout::Rgb16,
        (true, true) => BufferLayout::Rgba16,
    }
}

impl Decoder for BufferedDecoder {
    fn feed(&mut self, data: &[u8], canvas: &mut DecodeCanvas) -> Result<DecodeStatus, ImageError> {
        self.data
            .try_reserve(data.len())
            .map_err(|_| ImageError::AllocationFailure { bytes: self.data.len() + data.len() })?;
        self.data.extend_from_slice(data);

        if self.size.is_none() {
            if let Some((width, height)) = self.probe() {
                if width == 0 || height == 0 {
                    return Err(ImageError::MalformedHeader("image has zero size"));
                }
                tracing::debug!("{:?} header: {}x{}", self.format, width, height);
                canvas.dimensions_known(width, height, BufferLayout::Rgb8, [SRGB_GAMMA; 3])?;
                self.size = Some((width, height));
            }
        }
        Ok(DecodeStatus::Continue)
    }

    fn finish(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        if self.done {
            return Ok(());
        }
        let data = std::mem::take(&mut self.data);
        let img = image::load_from_memory_with_format(&data, self.format)?;
        let (width, height) = (img.width(), img.height());
        let layout = layout_of(&img);

        let reallocate = match canvas.buffer() {
            Some(buffer) => (buffer.width(), buffer.height(), buffer.layout()) != (width, height, layout),
            None => true,
        };
        if reallocate {
            canvas.dimensions_known(width, height, layout, [SRGB_GAMMA; 3])?;
        }
        self.size = Some((width, height));

        let channels = layout.channels();
        let row_len = width as usize * channels;
        if let Some(buffer) = canvas.buffer_mut() {
            if layout.is_sixteen_bit() {
                let samples = if layout.has_alpha() { img.into_rgba16().into_raw() } else { img.into_rgb16().into_raw() };
                for (y, src) in samples.chunks_exact(row_len).enumerate() {
                    if let Some(row) = buffer.row_u16_mut(y as u32) {
                        row.copy_from_slice(src);
                    }
                }
            } else {
                let samples = if layout.has_alpha() { img.into_rgba8().into_raw() } else { img.into_rgb8().into_raw() };
                for (y, src) in samples.chunks_exact(row_len).enumerate() {
                    if let Some(row) = buffer.row_u8_mut(y as u32) {
                        row.copy_from_slice(src);
                    }
                }
            }
        }
        canvas.rows_written(0, height);
        self.done = true;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn natural_size(&self) -> Option<(u32, u32)> {
        self.size
    }

    /// Every row lands at once in `finish`, so strips would gain nothing
    fn is_sequential(&self) -> bool {
        false
    }
}
