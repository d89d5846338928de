//! Display Device Interface
//!
//! The device owns bitmap memory; the image pipeline only writes rows into
//! it through strips and asks it to draw. Two software devices are provided:
//! [`MemoryDevice`] for arbitrary pixel formats and [`PixmapDevice`] which
//! composes onto a tiny-skia pixmap.

use tiny_skia::{Pixmap, PixmapPaint, Transform};

use crate::ImageError;
use crate::decode::area;

/// Byte order of multi-byte device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Device pixel layout, reported once by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    /// Bytes per pixel (1..=4)
    pub bytes_per_pixel: u8,
    /// Bits per channel, red/green/blue
    pub bits: [u8; 3],
    /// Bit position of each channel inside the pixel value
    pub shifts: [u8; 3],
    /// Bits OR-ed into every pixel (e.g. opaque alpha)
    pub fill: u32,
    pub byte_order: ByteOrder,
}

impl PixelFormat {
    pub const RGB332: PixelFormat = PixelFormat {
        bytes_per_pixel: 1,
        bits: [3, 3, 2],
        shifts: [5, 2, 0],
        fill: 0,
        byte_order: ByteOrder::LittleEndian,
    };

    pub const RGB555: PixelFormat = PixelFormat {
        bytes_per_pixel: 2,
        bits: [5, 5, 5],
        shifts: [10, 5, 0],
        fill: 0,
        byte_order: ByteOrder::LittleEndian,
    };

    pub const RGB565: PixelFormat = PixelFormat {
        bytes_per_pixel: 2,
        bits: [5, 6, 5],
        shifts: [11, 5, 0],
        fill: 0,
        byte_order: ByteOrder::LittleEndian,
    };

    /// Bytes R, G, B
    pub const RGB888: PixelFormat = PixelFormat {
        bytes_per_pixel: 3,
        bits: [8, 8, 8],
        shifts: [16, 8, 0],
        fill: 0,
        byte_order: ByteOrder::BigEndian,
    };

    /// Bytes B, G, R, X
    pub const BGRX8888: PixelFormat = PixelFormat {
        bytes_per_pixel: 4,
        bits: [8, 8, 8],
        shifts: [16, 8, 0],
        fill: 0,
        byte_order: ByteOrder::LittleEndian,
    };

    /// Bytes R, G, B, A with opaque alpha (tiny-skia layout)
    pub const RGBA8888: PixelFormat = PixelFormat {
        bytes_per_pixel: 4,
        bits: [8, 8, 8],
        shifts: [0, 8, 16],
        fill: 0xff00_0000,
        byte_order: ByteOrder::LittleEndian,
    };

    /// Number of levels of a channel minus one
    pub fn max_grade(&self, channel: usize) -> u32 {
        (1u32 << self.bits[channel]) - 1
    }

    /// Pack per-channel grades into a pixel value
    pub fn encode(&self, grades: [u16; 3]) -> u32 {
        let mut value = self.fill;
        for c in 0..3 {
            value |= (grades[c] as u32 & self.max_grade(c)) << self.shifts[c];
        }
        value
    }

    /// Unpack a pixel value into per-channel grades
    pub fn decode(&self, value: u32) -> [u16; 3] {
        let mut grades = [0u16; 3];
        for c in 0..3 {
            grades[c] = ((value >> self.shifts[c]) & self.max_grade(c)) as u16;
        }
        grades
    }

    /// Store a pixel value into `out[..bytes_per_pixel]`
    pub fn write_pixel(&self, value: u32, out: &mut [u8]) {
        let n = self.bytes_per_pixel as usize;
        for i in 0..n {
            let shift = match self.byte_order {
                ByteOrder::LittleEndian => i * 8,
                ByteOrder::BigEndian => (n - 1 - i) * 8,
            };
            out[i] = (value >> shift) as u8;
        }
    }

    /// Load a pixel value from `bytes[..bytes_per_pixel]`
    pub fn read_pixel(&self, bytes: &[u8]) -> u32 {
        let n = self.bytes_per_pixel as usize;
        let mut value = 0u32;
        for i in 0..n {
            let shift = match self.byte_order {
                ByteOrder::LittleEndian => i * 8,
                ByteOrder::BigEndian => (n - 1 - i) * 8,
            };
            value |= (bytes[i] as u32) << shift;
        }
        value
    }

    /// Bytes in one row of `width` pixels
    pub fn row_bytes(&self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel as usize
    }
}

/// Device bitmap identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitmapHandle(pub u32);

/// Rows of a bitmap opened for writing
pub struct WritableRows<'a> {
    /// Row data, `rows * stride` bytes
    pub data: &'a mut [u8],
    /// Bytes between row starts
    pub stride: usize,
    /// Number of rows in the strip
    pub rows: u32,
}

impl WritableRows<'_> {
    /// Row `i` of the strip (relative to its top)
    pub fn row_mut(&mut self, i: u32) -> &mut [u8] {
        let start = i as usize * self.stride;
        &mut self.data[start..start + self.stride]
    }
}

/// Device backend that owns bitmap memory
pub trait DisplayDevice {
    /// Pixel layout every bitmap uses
    fn pixel_format(&self) -> PixelFormat;

    fn allocate_bitmap(&mut self, width: u32, height: u32) -> Result<BitmapHandle, ImageError>;

    /// Open rows `top..top + count` for writing
    fn begin_row_strip(&mut self, bitmap: BitmapHandle, top: u32, count: u32) -> Option<WritableRows<'_>>;

    /// Finish a strip opened with `begin_row_strip`
    fn commit_row_strip(&mut self, bitmap: BitmapHandle, top: u32, count: u32);

    fn bitmap_size(&self, bitmap: BitmapHandle) -> Option<(u32, u32)>;

    /// Open the whole bitmap for writing
    fn lock_bitmap(&mut self, bitmap: BitmapHandle) -> Option<WritableRows<'_>> {
        let (_, height) = self.bitmap_size(bitmap)?;
        self.begin_row_strip(bitmap, 0, height)
    }

    fn unlock_bitmap(&mut self, bitmap: BitmapHandle) {
        if let Some((_, height)) = self.bitmap_size(bitmap) {
            self.commit_row_strip(bitmap, 0, height);
        }
    }

    /// Memory held by a bitmap
    fn bitmap_bytes(&self, bitmap: BitmapHandle) -> usize {
        self.bitmap_size(bitmap)
            .map(|(w, h)| self.pixel_format().row_bytes(w) * h as usize)
            .unwrap_or(0)
    }

    fn draw(&mut self, bitmap: BitmapHandle, x: i32, y: i32);

    fn release_bitmap(&mut self, bitmap: BitmapHandle);
}

/// Allocate a zeroed byte vector, reporting failure instead of aborting
pub(crate) fn try_alloc_zeroed(bytes: usize) -> Result<Vec<u8>, ImageError> {
    let mut data = Vec::new();
    data.try_reserve_exact(bytes)
        .map_err(|_| ImageError::AllocationFailure { bytes })?;
    data.resize(bytes, 0);
    Ok(data)
}

// ============================================================================
// Memory Device
// ============================================================================

#[derive(Debug)]
struct MemoryBitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// Software device storing bitmaps in plain memory in any pixel format
#[derive(Debug)]
pub struct MemoryDevice {
    format: PixelFormat,
    bitmaps: Vec<Option<MemoryBitmap>>,
    free_list: Vec<u32>,
    /// Screen contents, written by `draw`
    framebuffer: Option<MemoryBitmap>,
    /// Committed strips, for statistics
    pub strips_committed: u64,
}

impl MemoryDevice {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            bitmaps: Vec::new(),
            free_list: Vec::new(),
            framebuffer: None,
            strips_committed: 0,
        }
    }

    /// Device with a screen of `width`×`height` that `draw` blits into
    pub fn with_framebuffer(format: PixelFormat, width: u32, height: u32) -> Self {
        let mut device = Self::new(format);
        device.framebuffer = Some(MemoryBitmap {
            width,
            height,
            data: vec![0; format.row_bytes(width) * height as usize],
        });
        device
    }

    /// Raw bytes of a bitmap
    pub fn bitmap_data(&self, bitmap: BitmapHandle) -> Option<&[u8]> {
        self.get(bitmap).map(|b| b.data.as_slice())
    }

    /// Pixel value at (x, y) of a bitmap
    pub fn pixel(&self, bitmap: BitmapHandle, x: u32, y: u32) -> Option<u32> {
        let bmp = self.get(bitmap)?;
        Self::pixel_of(&self.format, bmp, x, y)
    }

    /// Pixel value at (x, y) of the framebuffer
    pub fn framebuffer_pixel(&self, x: u32, y: u32) -> Option<u32> {
        let fb = self.framebuffer.as_ref()?;
        Self::pixel_of(&self.format, fb, x, y)
    }

    /// Number of allocated bitmaps
    pub fn live_bitmaps(&self) -> usize {
        self.bitmaps.iter().filter(|b| b.is_some()).count()
    }

    fn pixel_of(format: &PixelFormat, bmp: &MemoryBitmap, x: u32, y: u32) -> Option<u32> {
        if x >= bmp.width || y >= bmp.height {
            return None;
        }
        let bpp = format.bytes_per_pixel as usize;
        let idx = y as usize * format.row_bytes(bmp.width) + x as usize * bpp;
        Some(format.read_pixel(&bmp.data[idx..idx + bpp]))
    }

    fn get(&self, bitmap: BitmapHandle) -> Option<&MemoryBitmap> {
        self.bitmaps.get(bitmap.0 as usize).and_then(|b| b.as_ref())
    }
}

impl DisplayDevice for MemoryDevice {
    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn allocate_bitmap(&mut self, width: u32, height: u32) -> Result<BitmapHandle, ImageError> {
        let data = try_alloc_zeroed(area(width, height, self.format.bytes_per_pixel as usize)?)?;
        let bitmap = MemoryBitmap { width, height, data };
        if let Some(index) = self.free_list.pop() {
            self.bitmaps[index as usize] = Some(bitmap);
            Ok(BitmapHandle(index))
        } else {
            self.bitmaps.push(Some(bitmap));
            Ok(BitmapHandle(self.bitmaps.len() as u32 - 1))
        }
    }

    fn begin_row_strip(&mut self, bitmap: BitmapHandle, top: u32, count: u32) -> Option<WritableRows<'_>> {
        let format = self.format;
        let bmp = self.bitmaps.get_mut(bitmap.0 as usize)?.as_mut()?;
        if top + count > bmp.height {
            return None;
        }
        let stride = format.row_bytes(bmp.width);
        let start = top as usize * stride;
        let end = start + count as usize * stride;
        Some(WritableRows { data: &mut bmp.data[start..end], stride, rows: count })
    }

    fn commit_row_strip(&mut self, _bitmap: BitmapHandle, _top: u32, _count: u32) {
        self.strips_committed += 1;
    }

    fn bitmap_size(&self, bitmap: BitmapHandle) -> Option<(u32, u32)> {
        self.get(bitmap).map(|b| (b.width, b.height))
    }

    fn draw(&mut self, bitmap: BitmapHandle, x: i32, y: i32) {
        let format = self.format;
        let (Some(Some(src)), Some(fb)) = (self.bitmaps.get(bitmap.0 as usize), self.framebuffer.as_mut()) else {
            return;
        };
        let bpp = format.bytes_per_pixel as usize;
        let src_stride = format.row_bytes(src.width);
        let dst_stride = format.row_bytes(fb.width);

        let x0 = x.max(0);
        let x1 = (x + src.width as i32).min(fb.width as i32);
        if x1 <= x0 {
            return;
        }
        for sy in 0..src.height as i32 {
            let dy = y + sy;
            if dy < 0 || dy >= fb.height as i32 {
                continue;
            }
            let src_start = sy as usize * src_stride + (x0 - x) as usize * bpp;
            let dst_start = dy as usize * dst_stride + x0 as usize * bpp;
            let len = (x1 - x0) as usize * bpp;
            fb.data[dst_start..dst_start + len].copy_from_slice(&src.data[src_start..src_start + len]);
        }
    }

    fn release_bitmap(&mut self, bitmap: BitmapHandle) {
        if let Some(slot) = self.bitmaps.get_mut(bitmap.0 as usize) {
            if slot.take().is_some() {
                self.free_list.push(bitmap.0);
            }
        }
    }
}

// ============================================================================
// Pixmap Device
// ============================================================================

/// Device drawing onto a tiny-skia pixmap
///
/// Bitmaps are opaque RGBA pixmaps, so premultiplication is a no-op.
pub struct PixmapDevice {
    target: Pixmap,
    bitmaps: Vec<Option<Pixmap>>,
    free_list: Vec<u32>,
}

impl PixmapDevice {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            target: Pixmap::new(width, height)?,
            bitmaps: Vec::new(),
            free_list: Vec::new(),
        })
    }

    pub fn target(&self) -> &Pixmap {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut Pixmap {
        &mut self.target
    }

    pub fn into_target(self) -> Pixmap {
        self.target
    }

    /// Replace the target with a blank one of a new size
    pub fn resize_target(&mut self, width: u32, height: u32) -> bool {
        match Pixmap::new(width, height) {
            Some(target) => {
                self.target = target;
                true
            }
            None => false,
        }
    }
}

impl DisplayDevice for PixmapDevice {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::RGBA8888
    }

    fn allocate_bitmap(&mut self, width: u32, height: u32) -> Result<BitmapHandle, ImageError> {
        let bytes = area(width, height, 4)?;
        let pixmap = Pixmap::new(width, height).ok_or(ImageError::AllocationFailure { bytes })?;
        if let Some(index) = self.free_list.pop() {
            self.bitmaps[index as usize] = Some(pixmap);
            Ok(BitmapHandle(index))
        } else {
            self.bitmaps.push(Some(pixmap));
            Ok(BitmapHandle(self.bitmaps.len() as u32 - 1))
        }
    }

    fn begin_row_strip(&mut self, bitmap: BitmapHandle, top: u32, count: u32) -> Option<WritableRows<'_>> {
        let pixmap = self.bitmaps.get_mut(bitmap.0 as usize)?.as_mut()?;
        if top + count > pixmap.height() {
            return None;
        }
        let stride = pixmap.width() as usize * 4;
        let start = top as usize * stride;
        let end = start + count as usize * stride;
        Some(WritableRows { data: &mut pixmap.data_mut()[start..end], stride, rows: count })
    }

    fn commit_row_strip(&mut self, _bitmap: BitmapHandle, _top: u32, _count: u32) {}

    fn bitmap_size(&self, bitmap: BitmapHandle) -> Option<(u32, u32)> {
        self.bitmaps
            .get(bitmap.0 as usize)
            .and_then(|b| b.as_ref())
            .map(|p| (p.width(), p.height()))
    }

    fn draw(&mut self, bitmap: BitmapHandle, x: i32, y: i32) {
        if let Some(Some(pixmap)) = self.bitmaps.get(bitmap.0 as usize) {
            self.target.draw_pixmap(
                x,
                y,
                pixmap.as_ref(),
                &PixmapPaint::default(),
                Transform::identity(),
                None,
            );
        }
    }

    fn release_bitmap(&mut self, bitmap: BitmapHandle) {
        if let Some(slot) = self.bitmaps.get_mut(bitmap.0 as usize) {
            if slot.take().is_some() {
                self.free_list.push(bitmap.0);
            }
        }
    }
}
