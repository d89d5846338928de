//! XBM Decoder
//!
//! X bitmaps are C source: `#define name_width N`, `#define name_height N`
//! and an array of hex bytes, LSB first, rows padded to whole units.
//! Set bits are drawn black, clear bits show the background.

use super::{BufferLayout, DecodeCanvas, DecodeStatus, Decoder};
use crate::{ImageError, SRGB_GAMMA};

const FOREGROUND: [u8; 3] = [0, 0, 0];

/// Longest token kept; longer words are malformed
const MAX_TOKEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Normal,
    /// Saw `/`, may open a comment
    Slash,
    Comment,
    /// Saw `*` inside a comment
    CommentStar,
}

/// Streaming XBM decoder
pub struct XbmDecoder {
    lex: Lex,
    token: String,
    /// Last two complete header words
    words: Vec<String>,
    width: Option<u32>,
    height: Option<u32>,
    /// X10 bitmaps store 16-bit units
    unit_bits: u32,
    in_data: bool,
    x: u32,
    y: u32,
    done: bool,
}

impl XbmDecoder {
    pub fn new() -> Self {
        Self {
            lex: Lex::Normal,
            token: String::new(),
            words: Vec::new(),
            width: None,
            height: None,
            unit_bits: 8,
            in_data: false,
            x: 0,
            y: 0,
            done: false,
        }
    }

    fn end_token(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        if self.token.is_empty() {
            return Ok(());
        }
        let token = std::mem::take(&mut self.token);
        if self.in_data {
            let value = parse_number(&token).ok_or(ImageError::MalformedHeader("bad XBM data value"))?;
            self.put_unit(value, canvas);
        } else {
            self.header_word(token);
        }
        Ok(())
    }

    fn header_word(&mut self, word: String) {
        if word == "short" {
            self.unit_bits = 16;
        }
        if self.words.len() == 2 && self.words[0] == "#define" {
            let name = &self.words[1];
            if let Some(value) = parse_number(&word) {
                if name.ends_with("_width") || name == "width" {
                    self.width = Some(value);
                } else if name.ends_with("_height") || name == "height" {
                    self.height = Some(value);
                }
            }
        }
        if self.words.len() == 2 {
            self.words.remove(0);
        }
        self.words.push(word);
    }

    fn begin_data(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        let (Some(width), Some(height)) = (self.width, self.height) else {
            return Err(ImageError::MalformedHeader("XBM size not defined"));
        };
        if width == 0 || height == 0 {
            return Err(ImageError::MalformedHeader("XBM image has zero size"));
        }
        canvas.dimensions_known(width, height, BufferLayout::Rgb8, [SRGB_GAMMA; 3])?;
        tracing::debug!("XBM image {}x{}, {}-bit units", width, height, self.unit_bits);
        self.in_data = true;
        Ok(())
    }

    /// Paint one data unit at the cursor
    fn put_unit(&mut self, value: u32, canvas: &mut DecodeCanvas) {
        if self.done {
            return;
        }
        let width = self.width.unwrap_or(0);
        let n = self.unit_bits.min(width - self.x);
        if let Some(row) = canvas.buffer_mut().and_then(|b| b.row_u8_mut(self.y)) {
            for bit in 0..n {
                if value >> bit & 1 != 0 {
                    let o = (self.x + bit) as usize * 3;
                    row[o..o + 3].copy_from_slice(&FOREGROUND);
                }
            }
        }
        self.x += n;
        if self.x == width {
            // Padding bits of the unit are dropped
            canvas.rows_written(self.y, 1);
            self.x = 0;
            self.y += 1;
            self.done = Some(self.y) == self.height;
        }
    }
}

impl Default for XbmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(token: &str) -> Option<u32> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

fn is_delimiter(byte: u8) -> bool {
    byte.is_ascii_whitespace() || b",{}[]=;()".contains(&byte)
}

impl Decoder for XbmDecoder {
    fn feed(&mut self, data: &[u8], canvas: &mut DecodeCanvas) -> Result<DecodeStatus, ImageError> {
        for &byte in data {
            if self.done {
                break;
            }
            match self.lex {
                Lex::Comment => {
                    if byte == b'*' {
                        self.lex = Lex::CommentStar;
                    }
                    continue;
                }
                Lex::CommentStar => {
                    self.lex = match byte {
                        b'/' => Lex::Normal,
                        b'*' => Lex::CommentStar,
                        _ => Lex::Comment,
                    };
                    continue;
                }
                Lex::Slash => {
                    if byte == b'*' {
                        self.end_token(canvas)?;
                        self.lex = Lex::Comment;
                        continue;
                    }
                    self.lex = Lex::Normal;
                    self.token.push('/');
                }
                Lex::Normal => {}
            }

            if byte == b'/' {
                self.lex = Lex::Slash;
            } else if is_delimiter(byte) {
                self.end_token(canvas)?;
                if byte == b'{' && !self.in_data {
                    self.begin_data(canvas)?;
                }
            } else {
                if self.token.len() >= MAX_TOKEN {
                    return Err(ImageError::MalformedHeader("XBM token too long"));
                }
                self.token.push(byte as char);
            }
        }

        Ok(if self.done { DecodeStatus::Done } else { DecodeStatus::Continue })
    }

    fn finish(&mut self, canvas: &mut DecodeCanvas) -> Result<(), ImageError> {
        if !self.done && self.in_data {
            // A final value may end the stream without a delimiter
            self.end_token(canvas)?;
        }
        if self.done { Ok(()) } else { Err(ImageError::TruncatedStream) }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn natural_size(&self) -> Option<(u32, u32)> {
        if self.in_data { self.width.zip(self.height) } else { None }
    }

    fn is_sequential(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Color;

    const ARROW: &str = "#define arrow_width 10\n\
        #define arrow_height 2\n\
        /* two rows, 2 bytes each */\n\
        static unsigned char arrow_bits[] = {\n   0x01, 0x02, 0xff, 0x03 };\n";

    #[test]
    fn test_decode_bits_lsb_first() {
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = XbmDecoder::new();
        let status = decoder.feed(ARROW.as_bytes(), &mut canvas).unwrap();
        assert_eq!(status, DecodeStatus::Done);
        assert_eq!(decoder.natural_size(), Some((10, 2)));

        let buffer = canvas.buffer().unwrap();
        let row0 = buffer.row_u8(0).unwrap();
        assert_eq!(&row0[0..3], &[0, 0, 0]);
        assert_eq!(&row0[3..6], &[255, 255, 255]);
        // bit 1 of the second byte is x = 9
        assert_eq!(&row0[27..30], &[0, 0, 0]);
        let row1 = buffer.row_u8(1).unwrap();
        assert!(row1.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_chunking_independence() {
        let mut whole = DecodeCanvas::new(Color::WHITE);
        XbmDecoder::new().feed(ARROW.as_bytes(), &mut whole).unwrap();

        let mut split = DecodeCanvas::new(Color::WHITE);
        let mut decoder = XbmDecoder::new();
        for byte in ARROW.as_bytes() {
            decoder.feed(std::slice::from_ref(byte), &mut split).unwrap();
        }
        assert!(decoder.is_done());
        assert_eq!(whole.buffer().unwrap().samples(), split.buffer().unwrap().samples());
    }

    #[test]
    fn test_x10_short_units() {
        let src = "#define b_width 12\n#define b_height 1\nstatic short b_bits[] = { 0x0801 };";
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = XbmDecoder::new();
        assert_eq!(decoder.feed(src.as_bytes(), &mut canvas).unwrap(), DecodeStatus::Done);
        let row = canvas.buffer().unwrap().row_u8(0).unwrap();
        assert_eq!(&row[0..3], &[0, 0, 0]);
        assert_eq!(&row[33..36], &[0, 0, 0]);
        assert_eq!(&row[30..33], &[255, 255, 255]);
    }

    #[test]
    fn test_missing_size() {
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let result = XbmDecoder::new().feed(b"static char bits[] = { 0x00 };", &mut canvas);
        assert!(matches!(result, Err(ImageError::MalformedHeader(_))));
    }

    #[test]
    fn test_truncated() {
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = XbmDecoder::new();
        let cut = ARROW.find("0xff").unwrap();
        decoder.feed(&ARROW.as_bytes()[..cut], &mut canvas).unwrap();
        assert_eq!(decoder.finish(&mut canvas), Err(ImageError::TruncatedStream));
        assert!(canvas.rows_complete() >= 1);
    }

    #[test]
    fn test_oversized_header_fails_allocation() {
        let src = "#define a_width 4294967295\n#define a_height 4294967295\nstatic char a_bits[] = { 0x00 };\n";
        let mut canvas = DecodeCanvas::new(Color::WHITE);
        let mut decoder = XbmDecoder::new();
        let result = decoder.feed(src.as_bytes(), &mut canvas);
        assert!(matches!(result, Err(ImageError::AllocationFailure { .. })), "{:?}", result);
        assert!(!canvas.has_dimensions());
    }
}
