//! GIF Decoder (GIF87a/GIF89a)
//!
//! Streaming, from-scratch decoder for the first image of a GIF stream.
//! Input may be split anywhere; partial records are buffered until complete.

use super::{BufferLayout, DecodeCanvas, DecodeStatus, Decoder};
use crate::{ImageError, SRGB_GAMMA};

/// Max LZW code width
const MAX_CODE_WIDTH: u8 = 12;
const TABLE_SIZE: usize = 1 << MAX_CODE_WIDTH;
const NO_PREFIX: u16 = u16::MAX;

/// Interlace passes: first row, row stride, preview rows per decoded row
const PASS_START: [u32; 4] = [0, 4, 2, 1];
const PASS_STRIDE: [u32; 4] = [8, 8, 4, 2];
const PASS_FILL: [u32; 4] = [8, 4, 2, 1];

const GRAPHICS_CONTROL_LABEL: u8 = 0xF9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    GlobalPalette,
    BetweenImages,
    ExtensionLabel,
    BlockLength(Blocks),
    BlockData(Blocks, usize),
    ImageDescriptor,
    LocalPalette,
    LzwCodeSize,
    Done,
}

/// What a run of sub-blocks belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocks {
    Skip,
    GraphicsControl,
    Image,
}

/// Streaming GIF decoder
pub struct GifDecoder {
    state: State,
    /// Partial fixed-size record
    pending: Vec<u8>,
    /// Bytes the current fixed-size record needs
    need: usize,
    global_palette: Option<Vec<[u8; 3]>>,
    /// Palette of the image being decoded
    palette: Vec<[u8; 3]>,
    transparent: Option<u8>,
    /// First sub-block of a Graphics Control Extension
    gce: Vec<u8>,
    raster: Option<Raster>,
    lzw: Option<Lzw>,
    /// Scratch for decoded color indices
    indices: Vec<u8>,
}

impl GifDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            pending: Vec::with_capacity(16),
            need: 13,
            global_palette: None,
            palette: Vec::new(),
            transparent: None,
            gce: Vec::with_capacity(4),
            raster: None,
            lzw: None,
            indices: Vec::new(),
        }
    }

    /// Accumulate bytes of a fixed-size record; true once complete
    fn fill(&mut self, data: &[u8], pos: &mut usize) -> bool {
        let take = (self.need - self.pending.len()).min(data.len() - *pos);
        self.pending.extend_from_slice(&data[*pos..*pos + take]);
        *pos += take;
        self.pending.len() == self.need
    }

    fn enter(&mut self, state: State, bytes: usize) {
        self.state = state;
        self.need = bytes;
        self.pending.clear();
    }

    fn parse_header(&mut self) -> Result<(), ImageError> {
        let h = &self.pending;
        if &h[0..6] != b"GIF87a" && &h[0..6] != b"GIF89a" {
            return Err(ImageError::MalformedHeader("invalid GIF signature"));
        }
        let packed = h[10];
        if packed & 0x80 != 0 {
            let entries = 2usize << (packed & 0x07);
            self.enter(State::GlobalPalette, entries * 3);
        } else {
            self.enter(State::BetweenImages, 0);
        }
        Ok(())
    }

    fn parse_descriptor(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        let d = &self.pending;
        let width = u16::from_le_bytes([d[4], d[5]]) as u32;
        let height = u16::from_le_bytes([d[6], d[7]]) as u32;
        let packed = d[8];
        if width == 0 || height == 0 {
            return Err(ImageError::MalformedHeader("GIF image has zero size"));
        }

        let interlaced = packed & 0x40 != 0;
        canvas.dimensions_known(width, height, BufferLayout::Rgb8, [SRGB_GAMMA; 3])?;
        tracing::debug!("GIF image {}x{}, interlaced: {}", width, height, interlaced);
        self.raster = Some(Raster::new(width, height, interlaced));

        if packed & 0x80 != 0 {
            let entries = 2usize << (packed & 0x07);
            self.enter(State::LocalPalette, entries * 3);
        } else {
            self.palette = match &self.global_palette {
                Some(palette) => palette.clone(),
                None => (0..=255u8).map(|v| [v, v, v]).collect(),
            };
            self.enter(State::LzwCodeSize, 0);
        }
        Ok(())
    }

    fn apply_graphics_control(&mut self) {
        if self.gce.len() >= 4 && self.gce[0] & 0x01 != 0 {
            self.transparent = Some(self.gce[3]);
        }
        self.gce.clear();
    }

    fn image_data(&mut self, bytes: &[u8], canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        let (Some(lzw), Some(raster)) = (self.lzw.as_mut(), self.raster.as_mut()) else {
            return Ok(());
        };
        self.indices.clear();
        lzw.decode(bytes, &mut self.indices)?;

        let background = canvas.background().to_array();
        let palette = &self.palette;
        let transparent = self.transparent;
        raster.write(&self.indices, canvas, |index| {
            if Some(index) == transparent {
                background
            } else {
                palette.get(index as usize).copied().unwrap_or(background)
            }
        });

        if raster.complete {
            self.state = State::Done;
        }
        Ok(())
    }
}

impl Default for GifDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for GifDecoder {
    fn feed(&mut self, data: &[u8], canvas: &mut DecodeCanvas) -> Result<DecodeStatus, ImageError> {
        let mut pos = 0;
        while pos < data.len() && self.state != State::Done {
            match self.state {
                State::Header => {
                    if self.fill(data, &mut pos) {
                        self.parse_header()?;
                    }
                }
                State::GlobalPalette => {
                    if self.fill(data, &mut pos) {
                        let palette = self.pending.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
                        self.global_palette = Some(palette);
                        self.enter(State::BetweenImages, 0);
                    }
                }
                State::BetweenImages => {
                    let byte = data[pos];
                    pos += 1;
                    match byte {
                        b',' => self.enter(State::ImageDescriptor, 9),
                        b'!' => self.state = State::ExtensionLabel,
                        b';' => return Err(ImageError::MalformedHeader("GIF trailer before first image")),
                        // Padding or garbage between blocks
                        _ => {}
                    }
                }
                State::ExtensionLabel => {
                    let label = data[pos];
                    pos += 1;
                    let blocks = if label == GRAPHICS_CONTROL_LABEL { Blocks::GraphicsControl } else { Blocks::Skip };
                    self.gce.clear();
                    self.state = State::BlockLength(blocks);
                }
                State::BlockLength(blocks) => {
                    let len = data[pos] as usize;
                    pos += 1;
                    if len > 0 {
                        self.state = State::BlockData(blocks, len);
                        continue;
                    }
                    match blocks {
                        Blocks::Skip => self.state = State::BetweenImages,
                        Blocks::GraphicsControl => {
                            self.apply_graphics_control();
                            self.state = State::BetweenImages;
                        }
                        Blocks::Image => {
                            tracing::debug!("GIF image data ended");
                            self.state = State::Done;
                        }
                    }
                }
                State::BlockData(blocks, remaining) => {
                    let take = remaining.min(data.len() - pos);
                    let bytes = &data[pos..pos + take];
                    pos += take;
                    match blocks {
                        Blocks::Skip => {}
                        Blocks::GraphicsControl => {
                            let room = 4usize.saturating_sub(self.gce.len()).min(bytes.len());
                            self.gce.extend_from_slice(&bytes[..room]);
                        }
                        Blocks::Image => self.image_data(bytes, canvas)?,
                    }
                    if self.state == State::BlockData(blocks, remaining) {
                        self.state = if take == remaining {
                            State::BlockLength(blocks)
                        } else {
                            State::BlockData(blocks, remaining - take)
                        };
                    }
                }
                State::ImageDescriptor => {
                    if self.fill(data, &mut pos) {
                        self.parse_descriptor(canvas)?;
                    }
                }
                State::LocalPalette => {
                    if self.fill(data, &mut pos) {
                        self.palette = self.pending.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();
                        self.enter(State::LzwCodeSize, 0);
                    }
                }
                State::LzwCodeSize => {
                    let code_size = data[pos];
                    pos += 1;
                    if !(2..=8).contains(&code_size) {
                        return Err(ImageError::UnsupportedFeature("GIF LZW code size outside 2..=8"));
                    }
                    self.lzw = Some(Lzw::new(code_size));
                    self.state = State::BlockLength(Blocks::Image);
                }
                State::Done => {}
            }
        }

        if self.state == State::Done {
            self.lzw = None;
            Ok(DecodeStatus::Done)
        } else {
            Ok(DecodeStatus::Continue)
        }
    }

    fn finish(&mut self, _canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        if self.state == State::Done {
            Ok(())
        } else {
            Err(ImageError::TruncatedStream)
        }
    }

    fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn natural_size(&self) -> Option<(u32, u32)> {
        self.raster.as_ref().map(|r| (r.width, r.height))
    }

    fn is_sequential(&self) -> bool {
        self.raster.as_ref().is_some_and(|r| !r.interlaced)
    }
}

// ============================================================================
// Raster
// ============================================================================

/// Row cursor of the image being decoded
#[derive(Debug)]
struct Raster {
    width: u32,
    height: u32,
    interlaced: bool,
    x: u32,
    y: u32,
    pass: usize,
    complete: bool,
}

impl Raster {
    fn new(width: u32, height: u32, interlaced: bool) -> Self {
        Self { width, height, interlaced, x: 0, y: 0, pass: 0, complete: false }
    }

    /// Write color indices at the cursor; indices past the last row are dropped
    fn write(&mut self, indices: &[u8], canvas: &mut DecodeCanvas, color: impl Fn(u8) -> [u8; 3]) {
        let mut i = 0;
        while i < indices.len() && !self.complete {
            let n = ((self.width - self.x) as usize).min(indices.len() - i);
            if let Some(row) = canvas.buffer_mut().and_then(|b| b.row_u8_mut(self.y)) {
                for (k, &index) in indices[i..i + n].iter().enumerate() {
                    let o = (self.x as usize + k) * 3;
                    row[o..o + 3].copy_from_slice(&color(index));
                }
            }
            i += n;
            self.x += n as u32;
            if self.x == self.width {
                self.x = 0;
                self.finish_row(canvas);
            }
        }
    }

    fn finish_row(&mut self, canvas: &mut DecodeCanvas) {
        let y = self.y;
        if !self.interlaced {
            canvas.rows_written(y, 1);
            self.y += 1;
            self.complete = self.y == self.height;
            return;
        }

        // Preview: replicate into the rows later passes will fill
        let last = (y + PASS_FILL[self.pass]).min(self.height);
        if let Some(buffer) = canvas.buffer_mut() {
            for r in y + 1..last {
                buffer.copy_row(y, r);
            }
        }
        canvas.rows_written(y, last - y);

        self.y += PASS_STRIDE[self.pass];
        while self.y >= self.height {
            self.pass += 1;
            if self.pass == PASS_START.len() {
                self.complete = true;
                return;
            }
            self.y = PASS_START[self.pass];
        }
    }
}

// ============================================================================
// LZW
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Entry {
    end_char: u8,
    prefix: u16,
}

/// Incremental GIF LZW decompressor
struct Lzw {
    code_size: u8,
    clear_code: u16,
    end_code: u16,
    width: u8,
    next: u16,
    prev: Option<u16>,
    table: Vec<Entry>,
    bits: u32,
    bit_count: u8,
    stack: Vec<u8>,
    ended: bool,
}

impl Lzw {
    fn new(code_size: u8) -> Self {
        let clear_code = 1u16 << code_size;
        let mut table = vec![Entry { end_char: 0, prefix: NO_PREFIX }; TABLE_SIZE];
        for (i, entry) in table.iter_mut().enumerate().take(clear_code as usize) {
            entry.end_char = i as u8;
        }
        Self {
            code_size,
            clear_code,
            end_code: clear_code + 1,
            width: code_size + 1,
            next: clear_code + 2,
            prev: None,
            table,
            bits: 0,
            bit_count: 0,
            stack: Vec::with_capacity(TABLE_SIZE),
            ended: false,
        }
    }

    fn reset(&mut self) {
        self.width = self.code_size + 1;
        self.next = self.clear_code + 2;
        self.prev = None;
    }

    /// Decode packed codes (LSB first), appending color indices to `out`
    fn decode(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), ImageError> {
        for &byte in data {
            if self.ended {
                return Ok(());
            }
            self.bits |= (byte as u32) << self.bit_count;
            self.bit_count += 8;
            while self.bit_count >= self.width && !self.ended {
                let code = (self.bits & ((1 << self.width) - 1)) as u16;
                self.bits >>= self.width;
                self.bit_count -= self.width;
                self.code(code, out)?;
            }
        }
        Ok(())
    }

    fn code(&mut self, code: u16, out: &mut Vec<u8>) -> Result<(), ImageError> {
        if code == self.clear_code {
            self.reset();
            return Ok(());
        }
        if code == self.end_code {
            self.ended = true;
            return Ok(());
        }

        let Some(prev) = self.prev else {
            if code >= self.clear_code {
                return Err(ImageError::MalformedHeader("GIF LZW code out of range"));
            }
            self.emit(code, out)?;
            self.prev = Some(code);
            return Ok(());
        };

        let first = if code < self.next {
            self.first_char(code)?
        } else if code == self.next {
            // Deferred: the string is prev + first char of prev
            self.first_char(prev)?
        } else {
            return Err(ImageError::MalformedHeader("GIF LZW code out of range"));
        };

        if (self.next as usize) < TABLE_SIZE {
            self.table[self.next as usize] = Entry { end_char: first, prefix: prev };
            self.next += 1;
            if self.next == 1 << self.width && self.width < MAX_CODE_WIDTH {
                self.width += 1;
            }
        }

        self.emit(code, out)?;
        self.prev = Some(code);
        Ok(())
    }

    fn first_char(&self, mut code: u16) -> Result<u8, ImageError> {
        for _ in 0..TABLE_SIZE {
            let entry = self.table[code as usize];
            if entry.prefix == NO_PREFIX {
                return Ok(entry.end_char);
            }
            code = entry.prefix;
        }
        Err(ImageError::MalformedHeader("cyclic GIF LZW code"))
    }

    fn emit(&mut self, mut code: u16, out: &mut Vec<u8>) -> Result<(), ImageError> {
        self.stack.clear();
        loop {
            if self.stack.len() == TABLE_SIZE {
                return Err(ImageError::MalformedHeader("cyclic GIF LZW code"));
            }
            let entry = self.table[code as usize];
            self.stack.push(entry.end_char);
            if entry.prefix == NO_PREFIX {
                break;
            }
            code = entry.prefix;
        }
        out.extend(self.stack.iter().rev());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Color;

    fn pack(codes: &[u16], width: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let (mut acc, mut n) = (0u32, 0u8);
        for &code in codes {
            acc |= (code as u32) << n;
            n += width;
            while n >= 8 {
                out.push(acc as u8);
                acc >>= 8;
                n -= 8;
            }
        }
        if n > 0 {
            out.push(acc as u8);
        }
        out
    }

    /// 2x2 GIF with a 4-color global palette and the given code stream
    fn tiny_gif(codes: &[u16], interlace: bool, gce: Option<u8>) -> Vec<u8> {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[2, 0, 2, 0, 0x81, 0, 0]);
        gif.extend_from_slice(&[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]);
        if let Some(index) = gce {
            gif.extend_from_slice(&[b'!', 0xF9, 4, 0x01, 0, 0, index, 0]);
        }
        gif.push(b',');
        gif.extend_from_slice(&[0, 0, 0, 0, 2, 0, 2, 0, if interlace { 0x40 } else { 0 }]);
        gif.push(2);
        let data = pack(codes, 3);
        gif.push(data.len() as u8);
        gif.extend_from_slice(&data);
        gif.extend_from_slice(&[0, b';']);
        gif
    }

    fn decode(data: &[u8]) -> (Result<DecodeStatus, ImageError>, DecodeCanvas) {
        let mut canvas = DecodeCanvas::new(Color::rgb(1, 2, 3));
        let mut decoder = GifDecoder::new();
        let status = decoder.feed(data, &mut canvas);
        (status, canvas)
    }

    #[test]
    fn test_invalid_signature() {
        let (status, _) = decode(b"GIF88a\x01\x00\x01\x00\x00\x00\x00");
        assert!(matches!(status, Err(ImageError::MalformedHeader(_))));
    }

    #[test]
    fn test_header_split_anywhere() {
        let gif = tiny_gif(&[4, 0, 1, 4, 2, 3, 5], false, None);
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = GifDecoder::new();
        for byte in &gif[..20] {
            assert_eq!(decoder.feed(std::slice::from_ref(byte), &mut canvas).unwrap(), DecodeStatus::Continue);
        }
        assert!(decoder.natural_size().is_none());
        decoder.feed(&gif[20..], &mut canvas).unwrap();
        assert_eq!(decoder.natural_size(), Some((2, 2)));
        assert!(decoder.is_sequential());
    }

    #[test]
    fn test_deferred_code() {
        // 0, then code 6 = "00" before it is defined
        let gif = tiny_gif(&[4, 0, 6, 5], false, None);
        let (status, canvas) = decode(&gif);
        assert_eq!(status.unwrap(), DecodeStatus::Done);
        let buffer = canvas.buffer().unwrap();
        assert_eq!(buffer.row_u8(0).unwrap(), &[255, 0, 0, 255, 0, 0]);
        assert_eq!(buffer.row_u8(1).unwrap(), &[255, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_transparent_index_uses_background() {
        let gif = tiny_gif(&[4, 0, 1, 4, 2, 3, 5], false, Some(2));
        let (status, canvas) = decode(&gif);
        assert_eq!(status.unwrap(), DecodeStatus::Done);
        let buffer = canvas.buffer().unwrap();
        assert_eq!(buffer.row_u8(1).unwrap(), &[1, 2, 3, 255, 255, 255]);
    }

    #[test]
    fn test_out_of_range_code() {
        let gif = tiny_gif(&[4, 0, 7, 5], false, None);
        let (status, _) = decode(&gif);
        assert!(matches!(status, Err(ImageError::MalformedHeader(_))));
    }

    #[test]
    fn test_bad_code_size() {
        let mut gif = tiny_gif(&[4, 0, 1, 4, 2, 3, 5], false, None);
        // LZW code size byte follows the 9-byte descriptor
        let at = 13 + 12 + 1 + 9;
        gif[at] = 9;
        let (status, _) = decode(&gif);
        assert!(matches!(status, Err(ImageError::UnsupportedFeature(_))));
    }

    #[test]
    fn test_stray_bytes_between_blocks_skipped() {
        let mut gif = tiny_gif(&[4, 0, 1, 4, 2, 3, 5], false, Some(3));
        let descriptor = gif.iter().position(|&b| b == b',').unwrap();
        gif.splice(descriptor..descriptor, [0x00, 0x55, 0x00]);
        // And between the header and the extension
        gif.insert(25, 0x00);

        let (status, canvas) = decode(&gif);
        assert_eq!(status.unwrap(), DecodeStatus::Done);
        let buffer = canvas.buffer().unwrap();
        assert_eq!(buffer.row_u8(0).unwrap(), &[255, 0, 0, 0, 255, 0]);
        // Index 3 is transparent via the extension before the padding
        assert_eq!(buffer.row_u8(1).unwrap(), &[0, 0, 255, 1, 2, 3]);
    }

    #[test]
    fn test_trailer_before_image() {
        let mut gif = b"GIF87a".to_vec();
        gif.extend_from_slice(&[1, 0, 1, 0, 0, 0, 0, b';']);
        let (status, _) = decode(&gif);
        assert!(matches!(status, Err(ImageError::MalformedHeader(_))));
    }

    #[test]
    fn test_truncated_stream() {
        let gif = tiny_gif(&[4, 0, 1, 4, 2, 3, 5], false, None);
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = GifDecoder::new();
        decoder.feed(&gif[..30], &mut canvas).unwrap();
        assert_eq!(decoder.finish(&mut canvas), Err(ImageError::TruncatedStream));
    }

    #[test]
    fn test_lzw_table_growth() {
        // Code size 2: table reaches 8 entries after two additions, width becomes 4
        let mut lzw = Lzw::new(2);
        let mut out = Vec::new();
        for code in [4, 0, 1] {
            lzw.code(code, &mut out).unwrap();
        }
        assert_eq!(lzw.width, 3);
        lzw.code(2, &mut out).unwrap();
        assert_eq!(lzw.next, 8);
        assert_eq!(lzw.width, 4);
        // Code 7 = "12"
        lzw.code(7, &mut out).unwrap();
        assert_eq!(out, vec![0, 1, 2, 1, 2]);
    }
}
