//! Image Scaler
//!
//! Separable two-pass resampling of 48-bit linear RGB buffers. Enlarging
//! interpolates linearly with the end pixels aligned; reducing averages the
//! exact fractional overlap of each output pixel.

use crate::ImageError;
use crate::decode::area;

/// Resample a `iw`×`ih` linear RGB buffer to `ow`×`oh`
pub fn scale(src: &[u16], iw: u32, ih: u32, ow: u32, oh: u32) -> Result<Vec<u16>, ImageError> {
    if iw == ow && ih == oh {
        return Ok(src.to_vec());
    }
    // Run the pass that shrinks the intermediate buffer most first
    if (iw as u64) * (oh as u64) < (ow as u64) * (ih as u64) {
        let tmp = scale_vertical(src, iw, ih, oh)?;
        scale_horizontal(&tmp, iw, oh, ow)
    } else {
        let tmp = scale_horizontal(src, iw, ih, ow)?;
        scale_vertical(&tmp, ow, ih, oh)
    }
}

/// Zeroed linear RGB buffer of `width`×`height`
fn alloc(width: u32, height: u32) -> Result<Vec<u16>, ImageError> {
    let len = area(width, height, 3)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ImageError::AllocationFailure { bytes: len.saturating_mul(2) })?;
    buf.resize(len, 0);
    Ok(buf)
}

fn scale_horizontal(src: &[u16], iw: u32, h: u32, ow: u32) -> Result<Vec<u16>, ImageError> {
    let (iw, ow) = (iw as usize, ow as usize);
    let mut dst = alloc(ow as u32, h)?;
    for y in 0..h as usize {
        for c in 0..3 {
            let s = &src[y * iw * 3 + c..];
            let d = &mut dst[y * ow * 3 + c..];
            resample(s, 3, iw, d, 3, ow);
        }
    }
    Ok(dst)
}

fn scale_vertical(src: &[u16], w: u32, ih: u32, oh: u32) -> Result<Vec<u16>, ImageError> {
    let w = w as usize;
    let stride = w * 3;
    let mut dst = alloc(w as u32, oh)?;
    for x in 0..w {
        for c in 0..3 {
            let s = &src[x * 3 + c..];
            let d = &mut dst[x * 3 + c..];
            resample(s, stride, ih as usize, d, stride, oh as usize);
        }
    }
    Ok(dst)
}

/// Resample one strided line of `n_in` samples into `n_out` samples
fn resample(src: &[u16], src_stride: usize, n_in: usize, dst: &mut [u16], dst_stride: usize, n_out: usize) {
    if n_in == 0 || n_out == 0 {
        return;
    }
    let at = |i: usize| src[i * src_stride] as u64;

    if n_in == n_out {
        for i in 0..n_out {
            dst[i * dst_stride] = src[i * src_stride];
        }
    } else if n_out > n_in {
        if n_in == 1 {
            for j in 0..n_out {
                dst[j * dst_stride] = src[0];
            }
            return;
        }
        // Output j samples input position j * (n_in - 1) / (n_out - 1)
        let den = (n_out - 1) as u64;
        for j in 0..n_out {
            let num = j as u64 * (n_in - 1) as u64;
            let i = (num / den) as usize;
            let frac = num % den;
            let v = if frac == 0 {
                at(i)
            } else {
                (at(i) * (den - frac) + at(i + 1) * frac + den / 2) / den
            };
            dst[j * dst_stride] = v as u16;
        }
    } else {
        // Coordinates in units of 1/(n_in * n_out): input i spans
        // [i * n_out, (i + 1) * n_out), output j spans [j * n_in, (j + 1) * n_in)
        for j in 0..n_out {
            let start = j * n_in;
            let end = start + n_in;
            let mut acc = 0u64;
            for i in start / n_out..=(end - 1) / n_out {
                let overlap = end.min((i + 1) * n_out) - start.max(i * n_out);
                acc += at(i) * overlap as u64;
            }
            dst[j * dst_stride] = ((acc + n_in as u64 / 2) / n_in as u64) as u16;
        }
    }
}

/// Display size of an image from its natural size and the request
///
/// `aspect` is the display pixel aspect ratio, applied vertically unless
/// both dimensions are pinned.
pub fn target_size(
    natural: (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
    scale_percent: u32,
    aspect: f64,
) -> (u32, u32) {
    let (nw, nh) = (natural.0.max(1) as f64, natural.1.max(1) as f64);
    let (w, h) = match (width, height) {
        (Some(w), Some(h)) => (w as f64, h as f64),
        (Some(w), None) => (w as f64, w as f64 * nh / nw * aspect),
        (None, Some(h)) => (h as f64 * nw / nh / aspect, h as f64),
        (None, None) => {
            let s = scale_percent as f64 / 100.0;
            (nw * s, nh * s * aspect)
        }
    };
    (clamp_dimension(w), clamp_dimension(h))
}

fn clamp_dimension(v: f64) -> u32 {
    if v.is_finite() { v.round().clamp(1.0, u32::MAX as f64) as u32 } else { 1 }
}
