//! Cached Image
//!
//! One decoded resource: its decoder, pixel buffer and device bitmap.

use super::{ImageKey, Resource};
use crate::color::{self, new_dregs, ColorPipeline, GammaTable, RenderTarget};
use crate::decode::{DecodeCanvas, DecodeStatus, Decoder, ImageKind, SNIFF_BYTES};
use crate::device::{BitmapHandle, DisplayDevice};
use crate::{scale, ImageError};

// ============================================================================
// Decode State
// ============================================================================

/// Flag set describing where an image is in its decode lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DecodeState(u8);

impl DecodeState {
    /// Both display dimensions were given when the entry was created
    pub const SIZE_REQUESTED_UPFRONT: Self = Self(1);
    pub const DIMENSIONS_KNOWN: Self = Self(2);
    pub const DECODER_ACTIVE: Self = Self(4);
    /// Terminal until reload
    pub const ENDED: Self = Self(8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for DecodeState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a feed call achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// Every available byte was consumed
    NeedMoreData,
    /// Unconsumed bytes remain; call again after yielding
    YieldRequested,
    /// Decode is over (successfully or not)
    Ended,
}

impl FeedResult {
    pub fn is_yield(self) -> bool {
        self == FeedResult::YieldRequested
    }
}

/// Most bytes handed to a decoder by one feed call
pub const FEED_CHUNK_LIMIT: usize = 8192;

// ============================================================================
// Cached Image
// ============================================================================

/// Incremental rendering of a sequential image straight into its bitmap
#[derive(Debug)]
struct Strip {
    rows_done: u32,
    /// Error carried between rows of consecutive strips
    dregs: Vec<i32>,
    /// Gamma version the strip rows were rendered at, `None` before the first
    version: Option<u64>,
}

pub(crate) struct CachedImage {
    pub(crate) key: ImageKey,
    pub(crate) state: DecodeState,
    pub(crate) refcount: u32,
    pub(crate) last_touch: u64,
    decoder: Option<Box<dyn Decoder>>,
    canvas: DecodeCanvas,
    consumed: usize,
    display: Option<(u32, u32)>,
    /// Natural size the display size was computed from
    sized_from: Option<(u32, u32)>,
    pub(crate) bitmap: Option<BitmapHandle>,
    bitmap_version: Option<u64>,
    /// Buffer rows changed since the bitmap was rendered
    pixels_dirty: bool,
    strip: Option<Strip>,
    gamma_table: Option<GammaTable>,
    pub(crate) error: Option<ImageError>,
}

impl CachedImage {
    pub(crate) fn new(key: ImageKey, tick: u64) -> Self {
        let background = key.background;
        let mut image = Self {
            key,
            state: DecodeState::empty(),
            refcount: 1,
            last_touch: tick,
            decoder: None,
            canvas: DecodeCanvas::new(background),
            consumed: 0,
            display: None,
            sized_from: None,
            bitmap: None,
            bitmap_version: None,
            pixels_dirty: false,
            strip: None,
            gamma_table: None,
            error: None,
        };
        image.state = image.initial_state();
        image
    }

    fn initial_state(&self) -> DecodeState {
        if self.key.size_requested_upfront() {
            DecodeState::SIZE_REQUESTED_UPFRONT
        } else {
            DecodeState::empty()
        }
    }

    pub(crate) fn natural_size(&self) -> Option<(u32, u32)> {
        self.canvas.buffer().map(|b| (b.width(), b.height()))
    }

    pub(crate) fn display_size(&self) -> Option<(u32, u32)> {
        self.display
    }

    /// Display size once known, else the size to reserve for the image
    pub(crate) fn placeholder_size(&self) -> (u32, u32) {
        if let Some(size) = self.display {
            return size;
        }
        let side = 32.0 * self.key.scale as f64 / 100.0;
        let width = self.key.width.map_or(side, |w| w as f64);
        let height = self.key.height.map_or(side * self.key.aspect_ratio(), |h| h as f64);
        (width.round().max(1.0) as u32, height.round().max(1.0) as u32)
    }

    /// Bytes held by this entry, excluding its device bitmap
    pub(crate) fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.url.len()
            + self.canvas.buffer().map_or(0, |b| b.byte_size())
            + self.gamma_table.as_ref().map_or(0, |g| g.memory_usage())
            + self.strip.as_ref().map_or(0, |s| s.dregs.len() * std::mem::size_of::<i32>())
    }

    /// Tear everything down back to the pre-decode state
    pub(crate) fn reset<D: DisplayDevice>(&mut self, device: &mut D) {
        self.release_bitmap(device);
        self.decoder = None;
        self.canvas.reset();
        self.consumed = 0;
        self.display = None;
        self.sized_from = None;
        self.pixels_dirty = false;
        self.gamma_table = None;
        self.error = None;
        self.state = self.initial_state();
    }

    pub(crate) fn release_bitmap<D: DisplayDevice>(&mut self, device: &mut D) {
        if let Some(bitmap) = self.bitmap.take() {
            device.release_bitmap(bitmap);
        }
        self.bitmap_version = None;
        self.strip = None;
    }

    // ========================================================================
    // Feeding
    // ========================================================================

    pub(crate) fn feed<D: DisplayDevice>(
        &mut self,
        resource: &Resource<'_>,
        pipeline: &mut ColorPipeline,
        device: &mut D,
    ) -> FeedResult {
        if self.state.contains(DecodeState::ENDED) {
            return FeedResult::Ended;
        }
        if self.decoder.is_none() {
            match self.select_decoder(resource) {
                Ok(true) => {}
                Ok(false) => return FeedResult::NeedMoreData,
                Err(e) => {
                    self.end(Some(e), pipeline, device);
                    return FeedResult::Ended;
                }
            }
        }

        let available = resource.bytes.get(self.consumed..).unwrap_or(&[]);
        let chunk = &available[..available.len().min(FEED_CHUNK_LIMIT)];
        let status = match self.decoder.as_mut() {
            Some(decoder) => decoder.feed(chunk, &mut self.canvas),
            None => return FeedResult::Ended,
        };
        self.consumed += chunk.len();
        tracing::trace!("{}: fed {} bytes ({} consumed)", self.key.url, chunk.len(), self.consumed);

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                if let Err(render) = self.progress(pipeline, device) {
                    tracing::warn!("{}: could not render decoded rows: {}", self.key.url, render);
                }
                self.end(Some(e), pipeline, device);
                return FeedResult::Ended;
            }
        };
        if let Err(e) = self.progress(pipeline, device) {
            self.end(Some(e), pipeline, device);
            return FeedResult::Ended;
        }
        if status == DecodeStatus::Done {
            self.end(None, pipeline, device);
            return FeedResult::Ended;
        }
        if self.consumed < resource.bytes.len() {
            return FeedResult::YieldRequested;
        }
        if resource.status.is_terminal() {
            let finished = match self.decoder.as_mut() {
                Some(decoder) => decoder.finish(&mut self.canvas),
                None => Ok(()),
            };
            let error = finished.and_then(|()| self.progress(pipeline, device)).err();
            self.end(error, pipeline, device);
            return FeedResult::Ended;
        }
        FeedResult::NeedMoreData
    }

    /// Create the decoder; `Ok(false)` while too few bytes are here to sniff
    fn select_decoder(&mut self, resource: &Resource<'_>) -> Result<bool, ImageError> {
        let content_type = resource.content_type;
        let kind = if ImageKind::is_generic_content_type(content_type) {
            if resource.bytes.len() < SNIFF_BYTES && !resource.status.is_terminal() {
                return Ok(false);
            }
            ImageKind::sniff(resource.bytes)
        } else {
            ImageKind::from_content_type(content_type)
        };
        let Some(kind) = kind else {
            return Err(ImageError::UnrecognizedFormat(content_type.to_string()));
        };
        tracing::debug!("{}: decoding as {:?}", self.key.url, kind);
        self.decoder = Some(kind.create_decoder());
        self.state.insert(DecodeState::DECODER_ACTIVE);
        Ok(true)
    }

    /// React to new rows and dimensions after a decoder call
    fn progress<D: DisplayDevice>(&mut self, pipeline: &mut ColorPipeline, device: &mut D) -> Result<(), ImageError> {
        let Some(natural) = self.natural_size() else {
            return Ok(());
        };
        if self.sized_from != Some(natural) {
            self.dimensions_known(natural, device);
        }

        if self.strip.is_some() {
            self.advance_strip(pipeline, device)?;
            self.canvas.take_dirty();
        } else if self.canvas.take_dirty() {
            self.pixels_dirty = true;
        }
        Ok(())
    }

    /// Size the display bitmap, re-sizing if a codec revised its header
    fn dimensions_known<D: DisplayDevice>(&mut self, natural: (u32, u32), device: &mut D) {
        if self.sized_from.is_some() {
            self.release_bitmap(device);
        }
        self.sized_from = Some(natural);
        self.state.insert(DecodeState::DIMENSIONS_KNOWN);
        let display = scale::target_size(
            natural,
            self.key.width,
            self.key.height,
            self.key.scale,
            self.key.aspect_ratio(),
        );
        self.display = Some(display);
        let sequential = self.decoder.as_ref().is_some_and(|d| d.is_sequential());
        if display == natural && sequential && self.bitmap.is_none() {
            self.strip = Some(Strip { rows_done: 0, dregs: Vec::new(), version: None });
        }
        let (shown_w, shown_h) = display;
        tracing::debug!(
            "{}: {}x{} displayed at {}x{}{}",
            self.key.url,
            natural.0,
            natural.1,
            shown_w,
            shown_h,
            if self.strip.is_some() { " (strips)" } else { "" }
        );
    }

    /// Render newly completed rows of a strip-mode image into its bitmap
    fn advance_strip<D: DisplayDevice>(&mut self, pipeline: &mut ColorPipeline, device: &mut D) -> Result<(), ImageError> {
        let Some(mut strip) = self.strip.take() else {
            return Ok(());
        };
        let version = pipeline.gamma_version();
        if strip.version.is_none() {
            // First strip: the bitmap starts as the background
            let (width, height) = self.display.unwrap_or((1, 1));
            let bitmap = self.ensure_bitmap(device, width, height)?;
            fill_background(pipeline, device, bitmap, width, height, self.key.background);
            strip.dregs = new_dregs(width);
            strip.version = Some(version);
        } else if strip.version != Some(version) {
            // Settings changed mid-decode; fall back to whole-bitmap rendering
            self.pixels_dirty = true;
            self.bitmap_version = None;
            return Ok(());
        }

        let target = self.canvas.rows_complete();
        if target > strip.rows_done {
            self.ensure_gamma(pipeline);
            if let (Some(bitmap), Some(buffer), Some(gamma)) =
                (self.bitmap, self.canvas.buffer(), self.gamma_table.as_ref())
            {
                let format = device.pixel_format();
                let width = buffer.width();
                let row_bytes = format.row_bytes(width);
                let background = pipeline.background_linear(self.key.background);
                let count = target - strip.rows_done;
                let mut linear = vec![0u16; width as usize * 3];
                if let Some(mut rows) = device.begin_row_strip(bitmap, strip.rows_done, count) {
                    for i in 0..count {
                        color::linearize_row(buffer, strip.rows_done + i, gamma, background, &mut linear);
                        let out = &mut rows.row_mut(i)[..row_bytes];
                        pipeline.render_row(format, RenderTarget::Image, &linear, &mut strip.dregs, out);
                    }
                    device.commit_row_strip(bitmap, strip.rows_done, count);
                }
                strip.rows_done = target;
            }
        }
        self.strip = Some(strip);
        Ok(())
    }

    /// Decode is over: drop the decoder and settle the bitmap
    fn end<D: DisplayDevice>(&mut self, error: Option<ImageError>, pipeline: &mut ColorPipeline, device: &mut D) {
        self.decoder = None;
        self.state.remove(DecodeState::DECODER_ACTIVE);
        self.state.insert(DecodeState::ENDED);
        match &error {
            Some(e) => tracing::warn!("{}: decode failed: {}", self.key.url, e),
            None => tracing::debug!("{}: decode complete ({} bytes)", self.key.url, self.consumed),
        }
        self.error = error;

        let height = self.natural_size().map_or(0, |(_, h)| h);
        let version = pipeline.gamma_version();
        if let Some(strip) = self.strip.take() {
            if strip.version == Some(version) && strip.rows_done == height {
                self.bitmap_version = Some(version);
                self.pixels_dirty = false;
                return;
            }
            self.pixels_dirty = true;
        }
        if self.canvas.has_dimensions() {
            if let Err(e) = self.materialize(pipeline, device) {
                tracing::warn!("{}: cannot render: {}", self.key.url, e);
                self.error.get_or_insert(e);
            }
        }
    }

    // ========================================================================
    // Materializing
    // ========================================================================

    /// Whether the bitmap reflects the buffer at the current settings
    pub(crate) fn bitmap_is_current(&self, version: u64) -> bool {
        if self.bitmap.is_none() {
            return false;
        }
        match &self.strip {
            Some(strip) => strip.version == Some(version),
            None => self.bitmap_version == Some(version) && !self.pixels_dirty,
        }
    }

    /// Bring the bitmap up to date, rendering it if stale
    pub(crate) fn current_bitmap<D: DisplayDevice>(
        &mut self,
        pipeline: &mut ColorPipeline,
        device: &mut D,
    ) -> Option<BitmapHandle> {
        if !self.canvas.has_dimensions() {
            return None;
        }
        if !self.bitmap_is_current(pipeline.gamma_version()) {
            // A stale strip is finished off by a whole-bitmap render
            if self.strip.take().is_some() {
                self.pixels_dirty = true;
            }
            if let Err(e) = self.materialize(pipeline, device) {
                tracing::warn!("{}: cannot render: {}", self.key.url, e);
                self.decoder = None;
                self.state.remove(DecodeState::DECODER_ACTIVE);
                self.state.insert(DecodeState::ENDED);
                self.error.get_or_insert(e);
            }
        }
        self.bitmap
    }

    /// Render the whole buffer into the bitmap at the display size
    fn materialize<D: DisplayDevice>(&mut self, pipeline: &mut ColorPipeline, device: &mut D) -> Result<(), ImageError> {
        let Some((width, height)) = self.display else {
            return Ok(());
        };
        self.ensure_gamma(pipeline);
        let background = pipeline.background_linear(self.key.background);
        let linear = match (self.canvas.buffer(), self.gamma_table.as_ref()) {
            (Some(buffer), Some(gamma)) => {
                let linear = color::linearize(buffer, gamma, background)?;
                if (buffer.width(), buffer.height()) == (width, height) {
                    linear
                } else {
                    scale::scale(&linear, buffer.width(), buffer.height(), width, height)?
                }
            }
            _ => return Ok(()),
        };

        let bitmap = self.ensure_bitmap(device, width, height)?;
        let format = device.pixel_format();
        let row_bytes = format.row_bytes(width);
        let row_len = width as usize * 3;
        let mut dregs = new_dregs(width);
        if let Some(mut rows) = device.begin_row_strip(bitmap, 0, height) {
            for (y, src) in linear.chunks_exact(row_len).enumerate() {
                let out = &mut rows.row_mut(y as u32)[..row_bytes];
                pipeline.render_row(format, RenderTarget::Image, src, &mut dregs, out);
            }
            device.commit_row_strip(bitmap, 0, height);
        }
        self.bitmap_version = Some(pipeline.gamma_version());
        self.pixels_dirty = false;
        tracing::trace!("{}: rendered {}x{} bitmap", self.key.url, width, height);
        Ok(())
    }

    fn ensure_bitmap<D: DisplayDevice>(&mut self, device: &mut D, width: u32, height: u32) -> Result<BitmapHandle, ImageError> {
        if let Some(bitmap) = self.bitmap {
            if device.bitmap_size(bitmap) == Some((width, height)) {
                return Ok(bitmap);
            }
            device.release_bitmap(bitmap);
            self.bitmap = None;
        }
        let bitmap = device.allocate_bitmap(width, height)?;
        self.bitmap = Some(bitmap);
        Ok(bitmap)
    }

    /// Gamma table for the buffer's source gamma under current settings
    fn ensure_gamma(&mut self, pipeline: &ColorPipeline) {
        let Some(buffer) = self.canvas.buffer() else {
            return;
        };
        let exponent = pipeline.exponent_for(self.canvas.source_gamma());
        let sixteen_bit = buffer.layout().is_sixteen_bit();
        if !self.gamma_table.as_ref().is_some_and(|g| g.matches(exponent, sixteen_bit)) {
            let pixels = buffer.width() as usize * buffer.height() as usize;
            self.gamma_table = Some(GammaTable::for_image(exponent, sixteen_bit, pixels));
        }
    }
}

/// Paint every row of a fresh bitmap with the device-rounded background
fn fill_background<D: DisplayDevice>(
    pipeline: &mut ColorPipeline,
    device: &mut D,
    bitmap: BitmapHandle,
    width: u32,
    height: u32,
    background: crate::Color,
) {
    let format = device.pixel_format();
    let row_bytes = format.row_bytes(width);
    let [r, g, b] = pipeline.background_linear(background);
    let linear: Vec<u16> = (0..width).flat_map(|_| [r, g, b]).collect();
    let mut row = vec![0u8; row_bytes];
    pipeline.tables(format).round_row(&linear, &mut row);
    if let Some(mut rows) = device.begin_row_strip(bitmap, 0, height) {
        for y in 0..height {
            rows.row_mut(y)[..row_bytes].copy_from_slice(&row);
        }
        device.commit_row_strip(bitmap, 0, height);
    }
}
