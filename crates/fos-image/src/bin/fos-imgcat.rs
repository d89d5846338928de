//! fos-imgcat - decode an image through the fOS image cache
//!
//! Usage: fos-imgcat <input> [output.png] [--width N] [--height N]
//!        [--chunk BYTES] [--gamma G] [--no-dither]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fos_image::{Color, Config, DrawStyle, FeedResult, ImageCache, PixmapDevice, Resource, ResourceStatus};
use tracing_subscriber::EnvFilter;

struct Args {
    input: PathBuf,
    output: PathBuf,
    width: Option<u32>,
    height: Option<u32>,
    /// Bytes delivered per simulated network read
    chunk: usize,
    gamma: Option<f32>,
    dither: bool,
}

fn parse_args() -> Result<Args> {
    let mut input = None;
    let mut output = None;
    let mut width = None;
    let mut height = None;
    let mut chunk = 1460;
    let mut gamma = None;
    let mut dither = true;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--width" => width = Some(value("--width")?.parse().context("bad --width")?),
            "--height" => height = Some(value("--height")?.parse().context("bad --height")?),
            "--chunk" => chunk = value("--chunk")?.parse().context("bad --chunk")?,
            "--gamma" => gamma = Some(value("--gamma")?.parse().context("bad --gamma")?),
            "--no-dither" => dither = false,
            flag if flag.starts_with("--") => bail!("unknown option {}", flag),
            _ if input.is_none() => input = Some(PathBuf::from(&arg)),
            _ if output.is_none() => output = Some(PathBuf::from(&arg)),
            _ => bail!("unexpected argument {}", arg),
        }
    }

    let Some(input) = input else {
        bail!("usage: fos-imgcat <input> [output.png] [--width N] [--height N] [--chunk BYTES] [--gamma G] [--no-dither]");
    };
    if chunk == 0 {
        bail!("--chunk must be positive");
    }
    let output = output.unwrap_or_else(|| input.with_extension("out.png"));
    Ok(Args { input, output, width, height, chunk, gamma, dither })
}

/// Declared type from the extension; unknown files are sniffed by the cache
fn content_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "gif" => "image/gif",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "xbm" => "image/x-xbitmap",
        _ => "application/octet-stream",
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let data = std::fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;

    let mut config = Config { dither_images: args.dither, ..Config::default() };
    if let Some(gamma) = args.gamma {
        config.user_gamma = gamma;
    }
    config.validate()?;

    let device = PixmapDevice::new(1, 1).context("cannot create pixmap")?;
    let mut cache = ImageCache::new(config, device);
    let key = cache
        .key(args.input.to_string_lossy())
        .with_size(args.width, args.height)
        .with_background(Color::WHITE);
    let handle = cache.find_or_create(key);

    // Deliver the file in network-sized reads
    let content_type = content_type(&args.input);
    let mut received = 0;
    let mut feeds = 0;
    loop {
        received = (received + args.chunk).min(data.len());
        let status = if received == data.len() { ResourceStatus::Complete } else { ResourceStatus::Loading };
        let resource = Resource::new(content_type, &data[..received], status);
        let result = loop {
            feeds += 1;
            let result = cache.feed(handle, &resource);
            if !result.is_yield() {
                break result;
            }
        };
        if result == FeedResult::Ended || status == ResourceStatus::Complete {
            break;
        }
    }
    tracing::info!("{} bytes decoded in {} feed calls", data.len(), feeds);

    let Some((width, height)) = cache.display_size(handle) else {
        match cache.error(handle) {
            Some(e) => bail!("{}: {}", args.input.display(), e),
            None => bail!("{}: no image header", args.input.display()),
        }
    };
    if !cache.device_mut().resize_target(width, height) {
        bail!("cannot allocate {}x{} pixmap", width, height);
    }
    cache.device_mut().target_mut().fill(tiny_skia::Color::WHITE);

    match cache.draw(handle, 0, 0) {
        Some(DrawStyle::Broken) => {
            let error = cache.error(handle).map(|e| e.to_string()).unwrap_or_default();
            tracing::warn!("Image is broken ({}); writing what was decoded", error);
        }
        Some(_) => {}
        None => bail!("image vanished from the cache"),
    }
    cache.release(handle);

    let target = cache.into_device().into_target();
    target
        .save_png(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    tracing::info!("Wrote {}x{} image to {}", width, height, args.output.display());
    Ok(())
}
