//! Rounding and Floyd-Steinberg Dithering
//!
//! Maps 16-bit linear light to device codes. The nearest code is chosen in
//! display voltage, so dark tones are not crushed by linear rounding.

use crate::device::PixelFormat;

const LEVELS: usize = 65536;

/// Per-format, per-display-gamma quantization lookup
pub struct DitherTables {
    format: PixelFormat,
    gamma: [f32; 3],
    /// Device grade for each linear level, per channel
    grade: [Vec<u16>; 3],
    /// Linear light the chosen grade actually produces, per channel
    light: [Vec<u16>; 3],
}

impl std::fmt::Debug for DitherTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DitherTables")
            .field("format", &self.format)
            .field("gamma", &self.gamma)
            .finish_non_exhaustive()
    }
}

impl DitherTables {
    pub fn new(format: PixelFormat, gamma: [f32; 3]) -> Self {
        let mut grade: [Vec<u16>; 3] = Default::default();
        let mut light: [Vec<u16>; 3] = Default::default();

        for c in 0..3 {
            let max = format.max_grade(c) as f32;
            let g = gamma[c];
            let achieved: Vec<u16> = (0..=format.max_grade(c))
                .map(|k| ((k as f32 / max).powf(g) * 65535.0).round().clamp(0.0, 65535.0) as u16)
                .collect();

            let mut grades = Vec::with_capacity(LEVELS);
            let mut lights = Vec::with_capacity(LEVELS);
            for j in 0..LEVELS {
                let voltage = (j as f32 / 65535.0).powf(1.0 / g);
                let k = (voltage * max).round().clamp(0.0, max) as usize;
                grades.push(k as u16);
                lights.push(achieved[k]);
            }
            grade[c] = grades;
            light[c] = lights;
        }

        tracing::debug!("Built dither tables for {:?} at gamma {:?}", format, gamma);
        Self { format, gamma, grade, light }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn gamma(&self) -> [f32; 3] {
        self.gamma
    }

    /// Whether these tables serve the given format and display gamma
    pub fn matches(&self, format: PixelFormat, gamma: [f32; 3]) -> bool {
        self.format == format && self.gamma == gamma
    }

    #[inline]
    pub fn grade(&self, channel: usize, light: u16) -> u16 {
        self.grade[channel][light as usize]
    }

    #[inline]
    pub fn achieved(&self, channel: usize, light: u16) -> u16 {
        self.light[channel][light as usize]
    }

    /// Round a row of linear RGB (3 samples per pixel) to device pixels
    pub fn round_row(&self, linear: &[u16], out: &mut [u8]) {
        let bpp = self.format.bytes_per_pixel as usize;
        for (px, dst) in linear.chunks_exact(3).zip(out.chunks_exact_mut(bpp)) {
            let grades = [self.grade(0, px[0]), self.grade(1, px[1]), self.grade(2, px[2])];
            self.format.write_pixel(self.format.encode(grades), dst);
        }
    }

    /// Dither a row of linear RGB into device pixels
    ///
    /// `dregs` holds 16x-scaled error carried to the next row, 3 per pixel,
    /// and must be zeroed before the first row of an image. Column
    /// registers restart at every row.
    pub fn dither_row(&self, linear: &[u16], dregs: &mut [i32], out: &mut [u8]) {
        let bpp = self.format.bytes_per_pixel as usize;
        let width = linear.len() / 3;
        debug_assert!(dregs.len() >= width * 3);

        let mut right = [0i32; 3];
        let mut low = [0i32; 3];

        for x in 0..width {
            let mut grades = [0u16; 3];
            for c in 0..3 {
                let i = x * 3 + c;
                let acc = dregs[i] + right[c];
                let wanted = (linear[i] as i32 + ((acc + 8) >> 4)).clamp(0, 65535) as u16;
                grades[c] = self.grade(c, wanted);
                let e = wanted as i32 - self.achieved(c, wanted) as i32;

                right[c] = 7 * e;
                dregs[i] = 5 * e + low[c];
                if x > 0 {
                    dregs[i - 3] += 3 * e;
                }
                low[c] = e;
            }
            self.format
                .write_pixel(self.format.encode(grades), &mut out[x * bpp..(x + 1) * bpp]);
        }
    }
}

/// Fresh dither accumulator for an image `width` pixels wide
pub fn new_dregs(width: u32) -> Vec<i32> {
    vec![0; width as usize * 3]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_row(format: PixelFormat, out: &[u8]) -> Vec<[u16; 3]> {
        out.chunks_exact(format.bytes_per_pixel as usize)
            .map(|p| format.decode(format.read_pixel(p)))
            .collect()
    }

    #[test]
    fn test_round_extremes() {
        let tables = DitherTables::new(PixelFormat::RGB565, [2.2; 3]);
        let mut out = vec![0u8; 4];
        tables.round_row(&[0, 0, 0, 65535, 65535, 65535], &mut out);
        assert_eq!(decode_row(PixelFormat::RGB565, &out), vec![[0, 0, 0], [31, 63, 31]]);
    }

    #[test]
    fn test_round_uses_voltage() {
        // 18% linear light is near mid voltage at gamma 2.2
        let tables = DitherTables::new(PixelFormat::RGB888, [2.2; 3]);
        let g = tables.grade(0, (0.18 * 65535.0) as u16);
        assert!((110..=120).contains(&g), "grade {}", g);
    }

    #[test]
    fn test_dither_uniform_unbiased() {
        let format = PixelFormat::RGB565;
        let tables = DitherTables::new(format, [1.0; 3]);
        let width = 64u32;
        let rows = 64;
        let level = 20000u16;
        let linear = vec![level; width as usize * 3];
        let mut dregs = new_dregs(width);
        let mut out = vec![0u8; format.row_bytes(width)];

        let mut sums = [0f64; 3];
        for _ in 0..rows {
            tables.dither_row(&linear, &mut dregs, &mut out);
            for px in decode_row(format, &out) {
                for c in 0..3 {
                    sums[c] += px[c] as f64 * 65535.0 / format.max_grade(c) as f64;
                }
            }
        }
        let n = (width as usize * rows) as f64;
        for c in 0..3 {
            let step = 65535.0 / format.max_grade(c) as f64;
            let mean = sums[c] / n;
            assert!((mean - level as f64).abs() < step, "channel {} mean {}", c, mean);
        }
    }

    #[test]
    fn test_dither_exact_level_has_no_error() {
        let format = PixelFormat::RGB888;
        let tables = DitherTables::new(format, [1.0; 3]);
        let linear = vec![257 * 77; 8 * 3];
        let mut dregs = new_dregs(8);
        let mut out = vec![0u8; format.row_bytes(8)];
        tables.dither_row(&linear, &mut dregs, &mut out);
        assert!(out.iter().all(|&b| b == 77));
        assert!(dregs.iter().all(|&d| d == 0));
    }
}
