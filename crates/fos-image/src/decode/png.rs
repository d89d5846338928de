//! PNG Decoder
//!
//! Drives `png::StreamingDecoder` for CRC checking and inflation, and does
//! scanline unfiltering, Adam7 de-interlacing and sample expansion here so
//! rows reach the canvas as soon as their bytes arrive.

use png::StreamingDecoder;

use super::{BufferLayout, DecodeCanvas, DecodeStatus, Decoder};
use crate::{ImageError, SRGB_GAMMA};

/// Adam7 pass geometry
const X_START: [u32; 7] = [0, 4, 0, 2, 0, 1, 0];
const Y_START: [u32; 7] = [0, 0, 4, 0, 2, 0, 1];
const X_STEP: [u32; 7] = [8, 8, 4, 4, 2, 2, 1];
const Y_STEP: [u32; 7] = [8, 8, 8, 4, 4, 2, 2];

const SIGNATURE_LEN: usize = 8;

/// Largest metadata chunk retained (PLTE is at most 768 bytes)
const MAX_META_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorType {
    Grayscale,
    Rgb,
    Indexed,
    GrayscaleAlpha,
    Rgba,
}

impl ColorType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Grayscale),
            2 => Some(Self::Rgb),
            3 => Some(Self::Indexed),
            4 => Some(Self::GrayscaleAlpha),
            6 => Some(Self::Rgba),
            _ => None,
        }
    }

    fn channels(self) -> usize {
        match self {
            Self::Grayscale | Self::Indexed => 1,
            Self::GrayscaleAlpha => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ihdr {
    width: u32,
    height: u32,
    bit_depth: u8,
    color_type: ColorType,
    interlaced: bool,
}

/// Ancillary data gathered before the first IDAT
#[derive(Debug, Default)]
struct Metadata {
    ihdr: Option<Ihdr>,
    palette: Vec<[u8; 3]>,
    trns: Option<Vec<u8>>,
    gamma: Option<f32>,
    srgb: bool,
    image_started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Signature(usize),
    Header,
    Data { kind: [u8; 4], remaining: usize },
    Crc(usize),
}

/// Follows chunk framing to collect header and color metadata
#[derive(Debug)]
struct ChunkScanner {
    frame: Frame,
    header: Vec<u8>,
    data: Vec<u8>,
    meta: Metadata,
}

impl ChunkScanner {
    fn new() -> Self {
        Self {
            frame: Frame::Signature(SIGNATURE_LEN),
            header: Vec::with_capacity(8),
            data: Vec::new(),
            meta: Metadata::default(),
        }
    }

    fn scan(&mut self, mut buf: &[u8]) -> Result<(), ImageError> {
        while !buf.is_empty() && !self.meta.image_started {
            match self.frame {
                Frame::Signature(left) => {
                    let n = left.min(buf.len());
                    buf = &buf[n..];
                    self.frame = if n == left { Frame::Header } else { Frame::Signature(left - n) };
                }
                Frame::Header => {
                    let n = (8 - self.header.len()).min(buf.len());
                    self.header.extend_from_slice(&buf[..n]);
                    buf = &buf[n..];
                    if self.header.len() == 8 {
                        let len = u32::from_be_bytes([self.header[0], self.header[1], self.header[2], self.header[3]]);
                        let kind = [self.header[4], self.header[5], self.header[6], self.header[7]];
                        self.header.clear();
                        self.data.clear();
                        if &kind == b"IDAT" {
                            self.meta.image_started = true;
                        }
                        self.frame = if len == 0 {
                            self.chunk_complete(kind)?;
                            Frame::Crc(4)
                        } else {
                            Frame::Data { kind, remaining: len as usize }
                        };
                    }
                }
                Frame::Data { kind, remaining } => {
                    let n = remaining.min(buf.len());
                    if self.data.len() + n <= MAX_META_CHUNK {
                        self.data.extend_from_slice(&buf[..n]);
                    }
                    buf = &buf[n..];
                    if n == remaining {
                        self.chunk_complete(kind)?;
                        self.frame = Frame::Crc(4);
                    } else {
                        self.frame = Frame::Data { kind, remaining: remaining - n };
                    }
                }
                Frame::Crc(left) => {
                    let n = left.min(buf.len());
                    buf = &buf[n..];
                    self.frame = if n == left { Frame::Header } else { Frame::Crc(left - n) };
                }
            }
        }
        Ok(())
    }

    fn chunk_complete(&mut self, kind: [u8; 4]) -> Result<(), ImageError> {
        let d = &self.data;
        match &kind {
            b"IHDR" => {
                if d.len() < 13 {
                    return Err(ImageError::MalformedHeader("short PNG IHDR"));
                }
                let color_type = ColorType::from_u8(d[9])
                    .ok_or(ImageError::MalformedHeader("invalid PNG color type"))?;
                let ihdr = Ihdr {
                    width: u32::from_be_bytes([d[0], d[1], d[2], d[3]]),
                    height: u32::from_be_bytes([d[4], d[5], d[6], d[7]]),
                    bit_depth: d[8],
                    color_type,
                    interlaced: d[12] == 1,
                };
                if ihdr.width == 0 || ihdr.height == 0 {
                    return Err(ImageError::MalformedHeader("PNG image has zero size"));
                }
                if !matches!(ihdr.bit_depth, 1 | 2 | 4 | 8 | 16) {
                    return Err(ImageError::UnsupportedFeature("PNG bit depth"));
                }
                self.meta.ihdr = Some(ihdr);
            }
            b"PLTE" => {
                self.meta.palette = d.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
            }
            b"tRNS" => self.meta.trns = Some(d.clone()),
            b"gAMA" if d.len() == 4 => {
                let gamma = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
                if gamma > 0 {
                    self.meta.gamma = Some(gamma as f32 / 100_000.0);
                }
            }
            b"sRGB" => self.meta.srgb = true,
            _ => {}
        }
        Ok(())
    }
}

/// Scanline geometry and output mapping fixed at the first IDAT
#[derive(Debug)]
struct Raster {
    ihdr: Ihdr,
    layout: BufferLayout,
    /// Filter unit in bytes
    bpp: usize,
    pass: usize,
    /// Line within the current pass
    line: u32,
    prev: Vec<u8>,
    palette: Vec<[u8; 3]>,
    trns: Option<Vec<u8>>,
}

impl Raster {
    fn new(ihdr: Ihdr, meta: &Metadata) -> Result<Self, ImageError> {
        if ihdr.color_type == ColorType::Indexed && meta.palette.is_empty() {
            return Err(ImageError::MalformedHeader("PNG palette missing"));
        }
        let has_alpha = matches!(ihdr.color_type, ColorType::GrayscaleAlpha | ColorType::Rgba) || meta.trns.is_some();
        let layout = match (ihdr.bit_depth == 16, has_alpha) {
            (false, false) => BufferLayout::Rgb8,
            (false, true) => BufferLayout::Rgba8,
            (true, false) => BufferLayout::Rgb16,
            (true, true) => BufferLayout::Rgba16,
        };
        let bits = ihdr.color_type.channels() * ihdr.bit_depth as usize;
        let mut raster = Self {
            ihdr,
            layout,
            bpp: bits.div_ceil(8),
            pass: 0,
            line: 0,
            prev: Vec::new(),
            palette: meta.palette.clone(),
            trns: meta.trns.clone(),
        };
        raster.start_pass(0);
        Ok(raster)
    }

    fn passes(&self) -> usize {
        if self.ihdr.interlaced { 7 } else { 1 }
    }

    /// Pixels per line and lines of a pass
    fn pass_size(&self, pass: usize) -> (u32, u32) {
        if !self.ihdr.interlaced {
            return (self.ihdr.width, self.ihdr.height);
        }
        let span = |total: u32, start: u32, step: u32| {
            if total > start { (total - start).div_ceil(step) } else { 0 }
        };
        (
            span(self.ihdr.width, X_START[pass], X_STEP[pass]),
            span(self.ihdr.height, Y_START[pass], Y_STEP[pass]),
        )
    }

    fn line_bytes(&self, pixels: u32) -> usize {
        (pixels as usize * self.ihdr.color_type.channels() * self.ihdr.bit_depth as usize).div_ceil(8)
    }

    /// Enter `pass`, skipping empty passes; false once all are done
    fn start_pass(&mut self, mut pass: usize) -> bool {
        while pass < self.passes() {
            let (w, h) = self.pass_size(pass);
            if w > 0 && h > 0 {
                self.pass = pass;
                self.line = 0;
                self.prev = vec![0; self.line_bytes(w)];
                return true;
            }
            pass += 1;
        }
        self.pass = pass;
        false
    }

    fn is_complete(&self) -> bool {
        self.pass >= self.passes()
    }

    /// Bytes of the next filtered line, filter byte included
    fn next_line_len(&self) -> usize {
        1 + self.line_bytes(self.pass_size(self.pass).0)
    }

    fn read_sample(&self, line: &[u8], i: usize, c: usize) -> u16 {
        let channels = self.ihdr.color_type.channels();
        match self.ihdr.bit_depth {
            16 => {
                let o = (i * channels + c) * 2;
                u16::from_be_bytes([line[o], line[o + 1]])
            }
            8 => line[i * channels + c] as u16,
            depth => {
                let depth = depth as usize;
                let bit = (i * channels + c) * depth;
                let shift = 8 - depth - bit % 8;
                ((line[bit / 8] >> shift) & ((1 << depth) - 1) as u8) as u16
            }
        }
    }

    /// Raw sample widened to the output depth
    fn widen(&self, v: u16) -> u16 {
        match self.ihdr.bit_depth {
            16 | 8 => v,
            depth => v * 255 / ((1 << depth) - 1),
        }
    }

    fn trns_u16(&self, i: usize) -> Option<u16> {
        let t = self.trns.as_ref()?;
        Some(u16::from_be_bytes([*t.get(i * 2)?, *t.get(i * 2 + 1)?]))
    }

    /// Output samples (R, G, B, A at output depth) of pixel `i`
    fn pixel(&self, line: &[u8], i: usize) -> [u16; 4] {
        let max = if self.layout.is_sixteen_bit() { 65535 } else { 255 };
        match self.ihdr.color_type {
            ColorType::Grayscale => {
                let raw = self.read_sample(line, i, 0);
                let v = self.widen(raw);
                let a = if self.trns_u16(0) == Some(raw) { 0 } else { max };
                [v, v, v, a]
            }
            ColorType::Rgb => {
                let raw = [0, 1, 2].map(|c| self.read_sample(line, i, c));
                let key = [0, 1, 2].map(|c| self.trns_u16(c));
                let a = if key == raw.map(Some) { 0 } else { max };
                [raw[0], raw[1], raw[2], a]
            }
            ColorType::Indexed => {
                let index = self.read_sample(line, i, 0) as usize;
                let [r, g, b] = self.palette.get(index).copied().unwrap_or([0, 0, 0]);
                let a = self
                    .trns
                    .as_ref()
                    .and_then(|t| t.get(index).copied())
                    .unwrap_or(255);
                [r as u16, g as u16, b as u16, a as u16]
            }
            ColorType::GrayscaleAlpha => {
                let v = self.read_sample(line, i, 0);
                [v, v, v, self.read_sample(line, i, 1)]
            }
            ColorType::Rgba => [0, 1, 2, 3].map(|c| self.read_sample(line, i, c)),
        }
    }

    /// Unfilter one line and write its pixels; returns the image row written
    fn process_line(&mut self, filtered: &[u8], canvas: &mut DecodeCanvas) -> Result<u32, ImageError> {
        let mut line = filtered[1..].to_vec();
        unfilter_row(filtered[0], &mut line, &self.prev, self.bpp)?;

        let (pass_w, _) = self.pass_size(self.pass);
        let (x0, dx, y) = if self.ihdr.interlaced {
            (X_START[self.pass], X_STEP[self.pass], Y_START[self.pass] + self.line * Y_STEP[self.pass])
        } else {
            (0, 1, self.line)
        };

        let channels = self.layout.channels();
        if let Some(buffer) = canvas.buffer_mut() {
            if self.layout.is_sixteen_bit() {
                if let Some(row) = buffer.row_u16_mut(y) {
                    for i in 0..pass_w as usize {
                        let o = (x0 + i as u32 * dx) as usize * channels;
                        let px = self.pixel(&line, i);
                        row[o..o + channels].copy_from_slice(&px[..channels]);
                    }
                }
            } else if let Some(row) = buffer.row_u8_mut(y) {
                for i in 0..pass_w as usize {
                    let o = (x0 + i as u32 * dx) as usize * channels;
                    let px = self.pixel(&line, i).map(|v| v as u8);
                    row[o..o + channels].copy_from_slice(&px[..channels]);
                }
            }
        }

        self.prev = line;
        self.line += 1;
        if self.line == self.pass_size(self.pass).1 {
            self.start_pass(self.pass + 1);
        }
        Ok(y)
    }
}

/// Reverse a PNG scanline filter in place
fn unfilter_row(filter: u8, row: &mut [u8], prev: &[u8], bpp: usize) -> Result<(), ImageError> {
    match filter {
        0 => {}
        1 => {
            for i in bpp..row.len() {
                row[i] = row[i].wrapping_add(row[i - bpp]);
            }
        }
        2 => {
            for (r, &p) in row.iter_mut().zip(prev.iter()) {
                *r = r.wrapping_add(p);
            }
        }
        3 => {
            for i in 0..row.len() {
                let left = if i >= bpp { row[i - bpp] as u16 } else { 0 };
                row[i] = row[i].wrapping_add(((left + prev[i] as u16) / 2) as u8);
            }
        }
        4 => {
            for i in 0..row.len() {
                let (left, upper_left) = if i >= bpp { (row[i - bpp], prev[i - bpp]) } else { (0, 0) };
                row[i] = row[i].wrapping_add(paeth(left, prev[i], upper_left));
            }
        }
        _ => return Err(ImageError::MalformedHeader("invalid PNG filter type")),
    }
    Ok(())
}

#[inline]
fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Progressive PNG decoder
pub struct PngDecoder {
    stream: StreamingDecoder,
    scanner: ChunkScanner,
    raster: Option<Raster>,
    /// Inflated, still-filtered image bytes
    inflated: Vec<u8>,
    done: bool,
}

impl PngDecoder {
    pub fn new() -> Self {
        Self {
            stream: StreamingDecoder::new(),
            scanner: ChunkScanner::new(),
            raster: None,
            inflated: Vec::new(),
            done: false,
        }
    }

    fn setup(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        let meta = &self.scanner.meta;
        let ihdr = meta.ihdr.ok_or(ImageError::MalformedHeader("PNG image data before IHDR"))?;
        let raster = Raster::new(ihdr, meta)?;

        let gamma = if meta.srgb { SRGB_GAMMA } else { meta.gamma.unwrap_or(SRGB_GAMMA) };
        canvas.dimensions_known(ihdr.width, ihdr.height, raster.layout, [gamma; 3])?;
        tracing::debug!(
            "PNG {}x{}, depth {}, {:?}, interlaced: {}",
            ihdr.width,
            ihdr.height,
            ihdr.bit_depth,
            ihdr.color_type,
            ihdr.interlaced
        );
        self.raster = Some(raster);
        Ok(())
    }

    /// Consume every complete scanline of `inflated`
    fn drain_lines(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        let Some(raster) = self.raster.as_mut() else {
            return Ok(());
        };
        let mut pos = 0;
        while !raster.is_complete() {
            let len = raster.next_line_len();
            if self.inflated.len() - pos < len {
                break;
            }
            let y = raster.process_line(&self.inflated[pos..pos + len], canvas)?;
            canvas.rows_written(y, 1);
            pos += len;
        }
        self.inflated.drain(..pos);
        if raster.is_complete() {
            self.done = true;
            self.inflated = Vec::new();
        }
        Ok(())
    }
}

impl Default for PngDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PngDecoder {
    fn feed(&mut self, data: &[u8], canvas: &mut DecodeCanvas) -> Result<DecodeStatus, ImageError> {
        if self.done {
            return Ok(DecodeStatus::Done);
        }
        self.scanner.scan(data)?;
        if self.raster.is_none() && self.scanner.meta.image_started {
            self.setup(canvas)?;
        }

        let mut buf = data;
        let mut stalls = 0;
        while !buf.is_empty() && !self.done {
            let (consumed, _) = self.stream.update(buf, &mut self.inflated)?;
            buf = &buf[consumed..];
            if consumed == 0 {
                stalls += 1;
                if stalls > 16 {
                    return Err(ImageError::CodecError("PNG decoder made no progress".into()));
                }
            } else {
                stalls = 0;
            }
            self.drain_lines(canvas)?;
        }

        Ok(if self.done { DecodeStatus::Done } else { DecodeStatus::Continue })
    }

    fn finish(&mut self, _canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        if self.done { Ok(()) } else { Err(ImageError::TruncatedStream) }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn natural_size(&self) -> Option<(u32, u32)> {
        self.raster.as_ref().map(|r| (r.ihdr.width, r.ihdr.height))
    }

    fn is_sequential(&self) -> bool {
        self.raster.as_ref().is_some_and(|r| !r.ihdr.interlaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Color;

    fn encode(width: u32, height: u32, color: png::ColorType, depth: png::BitDepth, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(color);
            encoder.set_depth(depth);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(data).unwrap();
        }
        out
    }

    #[test]
    fn test_unfilter_sub_and_up() {
        let mut row = vec![1, 2, 3, 4];
        unfilter_row(1, &mut row, &[0; 4], 1).unwrap();
        assert_eq!(row, vec![1, 3, 6, 10]);

        let mut row = vec![1, 1, 1, 1];
        unfilter_row(2, &mut row, &[10, 20, 30, 255], 1).unwrap();
        assert_eq!(row, vec![11, 21, 31, 0]);

        assert!(unfilter_row(5, &mut row, &[0; 4], 1).is_err());
    }

    #[test]
    fn test_paeth_predictor() {
        assert_eq!(paeth(10, 20, 10), 20);
        assert_eq!(paeth(20, 10, 10), 20);
        assert_eq!(paeth(5, 5, 5), 5);
    }

    #[test]
    fn test_adam7_pass_sizes() {
        let ihdr = Ihdr { width: 5, height: 3, bit_depth: 8, color_type: ColorType::Rgb, interlaced: true };
        let raster = Raster::new(ihdr, &Metadata::default()).unwrap();
        let sizes: Vec<_> = (0..7).map(|p| raster.pass_size(p)).collect();
        assert_eq!(sizes, vec![(1, 1), (1, 1), (2, 0), (1, 1), (3, 1), (2, 2), (5, 1)]);
    }

    #[test]
    fn test_decode_rgb8() {
        let data = [255, 0, 0, 0, 255, 0, 0, 0, 255, 9, 9, 9];
        let png_data = encode(2, 2, png::ColorType::Rgb, png::BitDepth::Eight, &data);

        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = PngDecoder::new();
        assert_eq!(decoder.feed(&png_data, &mut canvas).unwrap(), DecodeStatus::Done);
        assert!(decoder.is_sequential());
        let buffer = canvas.buffer().unwrap();
        assert_eq!(buffer.layout(), BufferLayout::Rgb8);
        assert_eq!(buffer.row_u8(0).unwrap(), &data[0..6]);
        assert_eq!(buffer.row_u8(1).unwrap(), &data[6..12]);
    }

    #[test]
    fn test_decode_gray2_sub_byte() {
        // 4 pixels of 2 bits: 0, 1, 2, 3
        let png_data = encode(4, 1, png::ColorType::Grayscale, png::BitDepth::Two, &[0b00_01_10_11]);
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        PngDecoder::new().feed(&png_data, &mut canvas).unwrap();
        let row = canvas.buffer().unwrap().row_u8(0).unwrap();
        assert_eq!(row, &[0, 0, 0, 85, 85, 85, 170, 170, 170, 255, 255, 255]);
    }

    #[test]
    fn test_decode_rgba16() {
        let data: Vec<u8> = [0x1234u16, 0x5678, 0x9abc, 0x8000].iter().flat_map(|v| v.to_be_bytes()).collect();
        let png_data = encode(1, 1, png::ColorType::Rgba, png::BitDepth::Sixteen, &data);
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        PngDecoder::new().feed(&png_data, &mut canvas).unwrap();
        let buffer = canvas.buffer().unwrap();
        assert_eq!(buffer.layout(), BufferLayout::Rgba16);
        assert_eq!(buffer.pixel(0, 0), Some([0x1234, 0x5678, 0x9abc, 0x8000]));
    }

    #[test]
    fn test_byte_by_byte() {
        let data: Vec<u8> = (0..8 * 5 * 3).map(|i| (i * 7) as u8).collect();
        let png_data = encode(8, 5, png::ColorType::Rgb, png::BitDepth::Eight, &data);

        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = PngDecoder::new();
        let mut status = DecodeStatus::Continue;
        for byte in &png_data {
            status = decoder.feed(std::slice::from_ref(byte), &mut canvas).unwrap();
        }
        assert_eq!(status, DecodeStatus::Done);
        for y in 0..5 {
            let start = y as usize * 24;
            assert_eq!(canvas.buffer().unwrap().row_u8(y).unwrap(), &data[start..start + 24]);
        }
    }

    fn crc32(bytes: &[u8]) -> u32 {
        let mut crc = !0u32;
        for &b in bytes {
            crc ^= b as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            }
        }
        !crc
    }

    fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        let start = out.len();
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        let crc = crc32(&out[start..]);
        out.extend_from_slice(&crc.to_be_bytes());
    }

    /// Interlaced RGB8 PNG with a stored (uncompressed) zlib stream.
    /// Rows cycle through the None, Sub and Up filters within each pass.
    fn interlaced_rgb(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 3]) -> Vec<u8> {
        const PASSES: [(u32, u32, u32, u32); 7] =
            [(0, 0, 8, 8), (4, 0, 8, 8), (0, 4, 4, 8), (2, 0, 4, 4), (0, 2, 2, 4), (1, 0, 2, 2), (0, 1, 1, 2)];
        let mut raw = Vec::new();
        for (x0, y0, dx, dy) in PASSES {
            if x0 >= width || y0 >= height {
                continue;
            }
            let mut prior: Vec<u8> = Vec::new();
            for (j, y) in (y0..height).step_by(dy as usize).enumerate() {
                let row: Vec<u8> = (x0..width).step_by(dx as usize).flat_map(|x| pixel(x, y)).collect();
                let filter = (j % 3) as u8;
                raw.push(filter);
                for (i, &v) in row.iter().enumerate() {
                    let left = if i >= 3 { row[i - 3] } else { 0 };
                    let up = prior.get(i).copied().unwrap_or(0);
                    raw.push(match filter {
                        1 => v.wrapping_sub(left),
                        2 => v.wrapping_sub(up),
                        _ => v,
                    });
                }
                prior = row;
            }
        }

        let mut zlib = vec![0x78, 0x01, 0x01];
        zlib.extend_from_slice(&(raw.len() as u16).to_le_bytes());
        zlib.extend_from_slice(&(!(raw.len() as u16)).to_le_bytes());
        zlib.extend_from_slice(&raw);
        let (mut a, mut b) = (1u32, 0u32);
        for &v in &raw {
            a = (a + v as u32) % 65521;
            b = (b + a) % 65521;
        }
        zlib.extend_from_slice(&((b << 16) | a).to_be_bytes());

        let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[8, 2, 0, 0, 1]);
        chunk(&mut out, b"IHDR", &ihdr);
        chunk(&mut out, b"IDAT", &zlib);
        chunk(&mut out, b"IEND", &[]);
        out
    }

    #[test]
    fn test_adam7_byte_by_byte() {
        let pixel = |x: u32, y: u32| [(x * 40) as u8, (y * 40) as u8, ((x + y) * 20 + 7) as u8];
        let png_data = interlaced_rgb(5, 5, pixel);

        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = PngDecoder::new();
        let mut status = DecodeStatus::Continue;
        for byte in &png_data {
            status = decoder.feed(std::slice::from_ref(byte), &mut canvas).unwrap();
        }
        assert_eq!(status, DecodeStatus::Done);
        assert!(!decoder.is_sequential());

        let buffer = canvas.buffer().unwrap();
        assert_eq!((buffer.width(), buffer.height()), (5, 5));
        for y in 0..5 {
            let expected: Vec<u8> = (0..5).flat_map(|x| pixel(x, y)).collect();
            assert_eq!(buffer.row_u8(y).unwrap(), expected.as_slice(), "row {}", y);
        }
    }

    #[test]
    fn test_truncated() {
        let data = vec![128u8; 16 * 16 * 3];
        let png_data = encode(16, 16, png::ColorType::Rgb, png::BitDepth::Eight, &data);
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = PngDecoder::new();
        decoder.feed(&png_data[..45], &mut canvas).unwrap();
        assert_eq!(decoder.natural_size(), Some((16, 16)));
        assert_eq!(decoder.finish(&mut canvas), Err(ImageError::TruncatedStream));
    }
}
