//! Image Cache
//!
//! Refcounted store of decoded images keyed by resource and presentation.
//! Entries live in a generational slab; an LRU index orders them by last
//! touch and eviction skips anything still referenced.

mod entry;

pub use entry::{DecodeState, FeedResult, FEED_CHUNK_LIMIT};

use std::collections::{BTreeMap, HashMap};

use self::entry::CachedImage;
use crate::color::ColorPipeline;
use crate::device::{BitmapHandle, DisplayDevice};
use crate::{Color, Config, ConfigError, ImageError};

// ============================================================================
// Keys and Handles
// ============================================================================

/// Identity of a cached image: the resource plus how it is presented
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    /// Shows through transparent pixels
    pub background: Color,
    pub url: String,
    /// Requested display width, `None` for the image's own
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Scale factor in percent, used when no dimension is requested
    pub scale: u32,
    /// Display pixel aspect ratio, 16.16 fixed point
    pub aspect: u32,
}

impl ImageKey {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            background: Color::WHITE,
            url: url.into(),
            width: None,
            height: None,
            scale: 100,
            aspect: 1 << 16,
        }
    }

    pub fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_background(mut self, background: Color) -> Self {
        self.background = background;
        self
    }

    pub fn with_scale(mut self, percent: u32) -> Self {
        self.scale = percent;
        self
    }

    pub fn with_aspect(mut self, aspect: f64) -> Self {
        self.aspect = (aspect * 65536.0).round().clamp(1.0, u32::MAX as f64) as u32;
        self
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.aspect as f64 / 65536.0
    }

    pub fn size_requested_upfront(&self) -> bool {
        self.width.is_some() && self.height.is_some()
    }
}

/// Generational reference to a cache entry
///
/// A handle outlives its entry harmlessly: once the entry is evicted every
/// operation on the handle is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    index: u32,
    generation: u32,
}

// ============================================================================
// Resources
// ============================================================================

/// Fetch state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Loading,
    Complete,
    /// Transfer stopped early
    Incomplete,
    Failed,
}

impl ResourceStatus {
    /// No more bytes will arrive
    pub fn is_terminal(self) -> bool {
        self != ResourceStatus::Loading
    }
}

/// View of a resource being fetched: every byte received so far
#[derive(Debug, Clone, Copy)]
pub struct Resource<'a> {
    pub content_type: &'a str,
    pub bytes: &'a [u8],
    pub status: ResourceStatus,
}

impl<'a> Resource<'a> {
    pub fn new(content_type: &'a str, bytes: &'a [u8], status: ResourceStatus) -> Self {
        Self { content_type, bytes, status }
    }
}

/// How the renderer should present an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStyle {
    /// Fully decoded
    Ready,
    /// Still arriving; drawn as far as decoded
    Decoding,
    /// Decode failed; draw a broken-image frame over what was decoded
    Broken,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries in the cache
    pub entries: usize,
    /// Bytes held by entries and their bitmaps
    pub live_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

// ============================================================================
// Image Cache
// ============================================================================

/// Image cache owning the color pipeline state and the display device
pub struct ImageCache<D: DisplayDevice> {
    /// Slots with the entry and its generation
    slots: Vec<Option<(CachedImage, u32)>>,
    /// Generation of every slot, including empty ones
    generations: Vec<u32>,
    free_list: Vec<u32>,
    index: HashMap<ImageKey, ImageHandle>,
    /// Last-touch tick to entry, oldest first
    lru: BTreeMap<u64, ImageHandle>,
    access_counter: u64,
    pipeline: ColorPipeline,
    device: D,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<D: DisplayDevice> ImageCache<D> {
    /// Falls back to `Config::default()` if `config` fails validation;
    /// call [`Config::validate`] first to report the error
    pub fn new(config: Config, device: D) -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            free_list: Vec::new(),
            index: HashMap::new(),
            lru: BTreeMap::new(),
            access_counter: 0,
            pipeline: ColorPipeline::new(config),
            device,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Key for a URL with the configured pixel aspect
    pub fn key(&self, url: impl Into<String>) -> ImageKey {
        ImageKey::new(url).with_aspect(self.pipeline.config().effective_aspect())
    }

    fn get(&self, handle: ImageHandle) -> Option<&CachedImage> {
        match self.slots.get(handle.index as usize) {
            Some(Some((image, generation))) if *generation == handle.generation => Some(image),
            _ => None,
        }
    }

    fn get_mut(&mut self, handle: ImageHandle) -> Option<&mut CachedImage> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Some((image, generation))) if *generation == handle.generation => Some(image),
            _ => None,
        }
    }

    fn insert(&mut self, image: CachedImage) -> ImageHandle {
        if let Some(index) = self.free_list.pop() {
            let generation = self.generations[index as usize];
            self.slots[index as usize] = Some((image, generation));
            ImageHandle { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some((image, 0)));
            self.generations.push(0);
            ImageHandle { index, generation: 0 }
        }
    }

    /// Drop an entry and its bitmap; the handle goes stale
    fn remove(&mut self, handle: ImageHandle) -> Option<CachedImage> {
        self.get(handle)?;
        let (mut image, _) = self.slots[handle.index as usize].take()?;
        self.generations[handle.index as usize] = handle.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.index.remove(&image.key);
        self.lru.remove(&image.last_touch);
        image.release_bitmap(&mut self.device);
        Some(image)
    }

    fn touch(&mut self, handle: ImageHandle) {
        self.access_counter += 1;
        let tick = self.access_counter;
        let Some(image) = self.get_mut(handle) else {
            return;
        };
        let previous = std::mem::replace(&mut image.last_touch, tick);
        self.lru.remove(&previous);
        self.lru.insert(tick, handle);
    }

    // ========================================================================
    // Lookup and Refcounting
    // ========================================================================

    /// Find the entry for `key`, creating it if absent; takes a reference
    pub fn find_or_create(&mut self, key: ImageKey) -> ImageHandle {
        if let Some(&handle) = self.index.get(&key) {
            self.hits += 1;
            if let Some(image) = self.get_mut(handle) {
                image.refcount += 1;
            }
            self.touch(handle);
            tracing::trace!("Image cache hit: {}", key.url);
            return handle;
        }

        self.misses += 1;
        self.access_counter += 1;
        let tick = self.access_counter;
        tracing::trace!("Image cache miss: {}", key.url);
        let handle = self.insert(CachedImage::new(key.clone(), tick));
        self.index.insert(key, handle);
        self.lru.insert(tick, handle);
        handle
    }

    /// Drop a reference; the entry remains until evicted
    pub fn release(&mut self, handle: ImageHandle) {
        if let Some(image) = self.get_mut(handle) {
            image.refcount = image.refcount.saturating_sub(1);
        }
    }

    /// Whether the handle still names a live entry
    pub fn contains(&self, handle: ImageHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn refcount(&self, handle: ImageHandle) -> Option<u32> {
        self.get(handle).map(|image| image.refcount)
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Decode bytes that arrived since the last call
    pub fn feed(&mut self, handle: ImageHandle, resource: &Resource<'_>) -> FeedResult {
        let Some((image, generation)) = self.slots.get_mut(handle.index as usize).and_then(Option::as_mut) else {
            return FeedResult::Ended;
        };
        if *generation != handle.generation {
            return FeedResult::Ended;
        }
        image.feed(resource, &mut self.pipeline, &mut self.device)
    }

    /// Restart an entry whose resource changed
    pub fn reload(&mut self, handle: ImageHandle) {
        let Some((image, generation)) = self.slots.get_mut(handle.index as usize).and_then(Option::as_mut) else {
            return;
        };
        if *generation == handle.generation {
            tracing::debug!("Reloading {}", image.key.url);
            image.reset(&mut self.device);
        }
    }

    pub fn state(&self, handle: ImageHandle) -> Option<DecodeState> {
        self.get(handle).map(|image| image.state)
    }

    pub fn is_finished(&self, handle: ImageHandle) -> bool {
        self.get(handle).is_some_and(|image| image.state.contains(DecodeState::ENDED))
    }

    pub fn error(&self, handle: ImageHandle) -> Option<&ImageError> {
        self.get(handle).and_then(|image| image.error.as_ref())
    }

    pub fn natural_size(&self, handle: ImageHandle) -> Option<(u32, u32)> {
        self.get(handle).and_then(|image| image.natural_size())
    }

    pub fn display_size(&self, handle: ImageHandle) -> Option<(u32, u32)> {
        self.get(handle).and_then(|image| image.display_size())
    }

    /// Layout size: the display size once known, else the requested size
    pub fn placeholder_size(&self, handle: ImageHandle) -> Option<(u32, u32)> {
        self.get(handle).map(|image| image.placeholder_size())
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Device bitmap rendered at the current settings
    pub fn bitmap(&mut self, handle: ImageHandle) -> Option<BitmapHandle> {
        let (image, generation) = self.slots.get_mut(handle.index as usize)?.as_mut()?;
        if *generation != handle.generation {
            return None;
        }
        image.current_bitmap(&mut self.pipeline, &mut self.device)
    }

    /// Draw the image with its top-left corner at `(x, y)`
    pub fn draw(&mut self, handle: ImageHandle, x: i32, y: i32) -> Option<DrawStyle> {
        let bitmap = self.bitmap(handle);
        if let Some(bitmap) = bitmap {
            self.device.draw(bitmap, x, y);
        }
        let image = self.get(handle)?;
        Some(if image.error.is_some() {
            DrawStyle::Broken
        } else if image.state.contains(DecodeState::ENDED) {
            DrawStyle::Ready
        } else {
            DrawStyle::Decoding
        })
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn config(&self) -> &Config {
        self.pipeline.config()
    }

    pub fn pipeline(&self) -> &ColorPipeline {
        &self.pipeline
    }

    /// Bitmaps re-render on next use; pixel buffers are kept
    pub fn set_display_gamma(&mut self, gamma: [f32; 3]) -> Result<(), ConfigError> {
        self.pipeline.set_display_gamma(gamma)
    }

    pub fn set_user_gamma(&mut self, gamma: f32) -> Result<(), ConfigError> {
        self.pipeline.set_user_gamma(gamma)
    }

    pub fn set_dithering(&mut self, images: bool, text: bool) {
        self.pipeline.set_dithering(images, text);
    }

    pub fn replace_config(&mut self, config: Config) -> Result<(), ConfigError> {
        self.pipeline.replace_config(config)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(mut self) -> D {
        self.clear();
        self.device
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn entry_bytes(&self, image: &CachedImage) -> usize {
        image.memory_usage() + image.bitmap.map_or(0, |b| self.device.bitmap_bytes(b))
    }

    /// Bytes held by all entries and their bitmaps
    pub fn memory_usage(&self) -> usize {
        self.slots.iter().flatten().map(|(image, _)| self.entry_bytes(image)).sum()
    }

    /// Evict unreferenced entries, least recently touched first, until the
    /// total is below `budget`
    pub fn evict(&mut self, budget: usize) {
        let mut total = self.memory_usage();
        let candidates: Vec<ImageHandle> = self.lru.values().copied().collect();
        for handle in candidates {
            if total < budget {
                break;
            }
            let Some(image) = self.get(handle) else {
                continue;
            };
            if image.refcount > 0 {
                continue;
            }
            let bytes = self.entry_bytes(image);
            if let Some(image) = self.remove(handle) {
                tracing::debug!("Evicted {} ({} bytes)", image.key.url, bytes);
                total -= bytes;
                self.evictions += 1;
            }
        }
    }

    /// Evict every unreferenced entry
    pub fn evict_all(&mut self) {
        self.evict(0);
    }

    /// Evict down to the configured budget
    pub fn shrink(&mut self) {
        self.evict(self.pipeline.config().cache_budget);
    }

    /// Destroy every entry, referenced or not, releasing all bitmaps
    pub fn clear(&mut self) {
        let handles: Vec<ImageHandle> = self.lru.values().copied().collect();
        for handle in handles {
            self.remove(handle);
        }
        tracing::debug!("Image cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.index.len(),
            live_bytes: self.memory_usage(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryDevice, PixelFormat};

    fn cache() -> ImageCache<MemoryDevice> {
        ImageCache::new(Config::default(), MemoryDevice::new(PixelFormat::RGB565))
    }

    /// 2x1 XBM: left pixel set
    const XBM: &[u8] = b"#define t_width 2\n#define t_height 1\nstatic char t_bits[] = { 0x01 };\n";

    fn load(cache: &mut ImageCache<MemoryDevice>, url: &str) -> ImageHandle {
        let handle = cache.find_or_create(ImageKey::new(url));
        let resource = Resource::new("image/x-xbitmap", XBM, ResourceStatus::Complete);
        while cache.feed(handle, &resource).is_yield() {}
        handle
    }

    #[test]
    fn test_find_or_create_idempotent() {
        let mut cache = cache();
        let a = cache.find_or_create(ImageKey::new("a.gif"));
        let b = cache.find_or_create(ImageKey::new("a.gif"));
        assert_eq!(a, b);
        assert_eq!(cache.refcount(a), Some(2));
        assert_eq!(cache.len(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_presentation_is_part_of_key() {
        let mut cache = cache();
        let a = cache.find_or_create(ImageKey::new("a.gif"));
        let b = cache.find_or_create(ImageKey::new("a.gif").with_size(Some(10), None));
        let c = cache.find_or_create(ImageKey::new("a.gif").with_background(Color::BLACK));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_released_entry_retrievable() {
        let mut cache = cache();
        let a = load(&mut cache, "a.xbm");
        cache.release(a);
        assert_eq!(cache.refcount(a), Some(0));
        assert!(cache.contains(a));

        let again = cache.find_or_create(ImageKey::new("a.xbm"));
        assert_eq!(again, a);
        assert!(cache.is_finished(again));
        assert_eq!(cache.natural_size(again), Some((2, 1)));
    }

    #[test]
    fn test_initial_state() {
        let mut cache = cache();
        let sized = cache.find_or_create(ImageKey::new("a").with_size(Some(4), Some(5)));
        let plain = cache.find_or_create(ImageKey::new("b").with_size(Some(4), None));
        assert_eq!(cache.state(sized), Some(DecodeState::SIZE_REQUESTED_UPFRONT));
        assert_eq!(cache.state(plain), Some(DecodeState::empty()));
    }

    #[test]
    fn test_placeholder_size() {
        let mut cache = cache();
        let plain = cache.find_or_create(ImageKey::new("a"));
        let half = cache.find_or_create(ImageKey::new("b").with_scale(50).with_aspect(2.0));
        let wide = cache.find_or_create(ImageKey::new("c").with_size(Some(100), None));
        assert_eq!(cache.placeholder_size(plain), Some((32, 32)));
        assert_eq!(cache.placeholder_size(half), Some((16, 32)));
        assert_eq!(cache.placeholder_size(wide), Some((100, 32)));

        let loaded = load(&mut cache, "d.xbm");
        assert_eq!(cache.placeholder_size(loaded), Some((2, 1)));
    }

    #[test]
    fn test_unrecognized_format() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("a.txt"));
        let resource = Resource::new("text/plain", b"hello", ResourceStatus::Loading);
        assert_eq!(cache.feed(handle, &resource), FeedResult::Ended);
        assert!(cache.is_finished(handle));
        assert_eq!(cache.error(handle), Some(&ImageError::UnrecognizedFormat("text/plain".into())));
        assert_eq!(cache.draw(handle, 0, 0), Some(DrawStyle::Broken));
        assert!(!cache.state(handle).unwrap().contains(DecodeState::DECODER_ACTIVE));
    }

    #[test]
    fn test_generic_type_waits_to_sniff() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("a"));
        let gif = b"GIF89a\x01\x00\x01\x00";
        let partial = Resource::new("application/octet-stream", &gif[..4], ResourceStatus::Loading);
        assert_eq!(cache.feed(handle, &partial), FeedResult::NeedMoreData);
        assert!(!cache.state(handle).unwrap().contains(DecodeState::DECODER_ACTIVE));

        let more = Resource::new("application/octet-stream", gif, ResourceStatus::Loading);
        assert_eq!(cache.feed(handle, &more), FeedResult::NeedMoreData);
        assert!(cache.state(handle).unwrap().contains(DecodeState::DECODER_ACTIVE));
    }

    #[test]
    fn test_feed_yields_between_chunks() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("big.xbm"));
        let mut src = String::from("#define b_width 8\n#define b_height 3000\nstatic char b_bits[] = {\n");
        for _ in 0..3000 {
            src.push_str("0x00, ");
        }
        src.push_str("};\n");
        let resource = Resource::new("image/x-xbitmap", src.as_bytes(), ResourceStatus::Loading);

        let mut yields = 0;
        loop {
            match cache.feed(handle, &resource) {
                FeedResult::YieldRequested => yields += 1,
                FeedResult::Ended => break,
                FeedResult::NeedMoreData => panic!("data was available"),
            }
        }
        assert_eq!(yields, src.len().div_ceil(FEED_CHUNK_LIMIT) - 1);
        assert_eq!(cache.draw(handle, 0, 0), Some(DrawStyle::Ready));
    }

    #[test]
    fn test_oversized_header_is_broken() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("huge.xbm"));
        let src = b"#define h_width 4294967295\n#define h_height 4294967295\nstatic char h_bits[] = { 0x00 };\n";
        let resource = Resource::new("image/x-xbitmap", src, ResourceStatus::Loading);
        assert_eq!(cache.feed(handle, &resource), FeedResult::Ended);
        assert!(matches!(cache.error(handle), Some(ImageError::AllocationFailure { .. })));
        assert_eq!(cache.draw(handle, 0, 0), Some(DrawStyle::Broken));
        assert_eq!(cache.device().live_bitmaps(), 0);
    }

    #[test]
    fn test_decode_error_keeps_rendered_rows() {
        let mut cache = cache();
        cache.set_dithering(false, false);
        let handle = cache.find_or_create(ImageKey::new("bad.xbm"));
        let src = b"#define b_width 8\n#define b_height 2\nstatic char b_bits[] = { 0xff, 0xqq };\n";
        let resource = Resource::new("image/x-xbitmap", src, ResourceStatus::Loading);
        assert_eq!(cache.feed(handle, &resource), FeedResult::Ended);
        assert!(matches!(cache.error(handle), Some(ImageError::MalformedHeader(_))));
        assert_eq!(cache.draw(handle, 0, 0), Some(DrawStyle::Broken));

        // The first row decoded before the error and is black
        let bitmap = cache.bitmap(handle).unwrap();
        assert_eq!(cache.device().pixel(bitmap, 0, 0), Some(0x0000));
        assert_eq!(cache.device().pixel(bitmap, 0, 1), Some(0xffff));
    }

    #[test]
    fn test_truncated_is_broken() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("cut.xbm"));
        let cut = XBM.len() - 8;
        let loading = Resource::new("image/x-xbitmap", &XBM[..cut], ResourceStatus::Loading);
        assert_eq!(cache.feed(handle, &loading), FeedResult::NeedMoreData);
        assert_eq!(cache.draw(handle, 0, 0), Some(DrawStyle::Decoding));

        let failed = Resource::new("image/x-xbitmap", &XBM[..cut], ResourceStatus::Incomplete);
        assert_eq!(cache.feed(handle, &failed), FeedResult::Ended);
        assert_eq!(cache.error(handle), Some(&ImageError::TruncatedStream));
        assert_eq!(cache.draw(handle, 0, 0), Some(DrawStyle::Broken));
        assert!(cache.bitmap(handle).is_some());
    }

    #[test]
    fn test_sequential_image_renders_in_strips() {
        let mut cache = cache();
        cache.set_dithering(false, false);
        let handle = load(&mut cache, "a.xbm");
        assert_eq!(cache.device().strips_committed, 2);

        let bitmap = cache.bitmap(handle).unwrap();
        assert_eq!(cache.device().pixel(bitmap, 0, 0), Some(0x0000));
        assert_eq!(cache.device().pixel(bitmap, 1, 0), Some(0xffff));
    }

    #[test]
    fn test_gamma_change_rerenders() {
        let mut cache = cache();
        cache.set_dithering(false, false);
        let handle = load(&mut cache, "a.xbm");
        let bitmap = cache.bitmap(handle).unwrap();
        let committed = cache.device().strips_committed;

        // No change: nothing re-rendered
        assert_eq!(cache.bitmap(handle), Some(bitmap));
        assert_eq!(cache.device().strips_committed, committed);

        cache.set_user_gamma(2.0).unwrap();
        assert_eq!(cache.bitmap(handle), Some(bitmap));
        assert_eq!(cache.device().strips_committed, committed + 1);
        assert_eq!(cache.device().pixel(bitmap, 1, 0), Some(0xffff));
    }

    #[test]
    fn test_invalid_gamma_rejected() {
        let mut cache = cache();
        let version = cache.pipeline().gamma_version();
        assert!(cache.set_user_gamma(-1.0).is_err());
        assert_eq!(cache.pipeline().gamma_version(), version);
    }

    #[test]
    fn test_evict_lru_order_and_pinning() {
        let mut cache = cache();
        let a = load(&mut cache, "a.xbm");
        let b = load(&mut cache, "b.xbm");
        let c = load(&mut cache, "c.xbm");
        cache.release(a);
        cache.release(b);
        // c stays pinned

        // Touch a so b becomes the oldest unreferenced entry
        let a2 = cache.find_or_create(ImageKey::new("a.xbm"));
        cache.release(a2);

        let total = cache.memory_usage();
        cache.evict(total);
        assert!(!cache.contains(b));
        assert!(cache.contains(a));
        assert!(cache.contains(c));
        assert_eq!(cache.stats().evictions, 1);

        cache.evict_all();
        assert!(!cache.contains(a));
        assert!(cache.contains(c));
        assert_eq!(cache.device().live_bitmaps(), 1);
    }

    #[test]
    fn test_memory_usage_counts_gamma_table() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("wide.xbm"));
        let mut src = String::from("#define w_width 64\n#define w_height 32\nstatic char w_bits[] = {\n");
        for i in 0..64 * 32 / 8 {
            src.push_str(&format!("0x{:02x}, ", i % 256));
        }
        src.push_str("};\n");
        let resource = Resource::new("image/x-xbitmap", src.as_bytes(), ResourceStatus::Complete);
        while cache.feed(handle, &resource).is_yield() {}
        assert!(cache.is_finished(handle));

        // 2048 pixels is enough to tabulate three 8-bit channels
        let pixels = 64 * 32;
        let buffer = pixels * 3;
        let bitmap = pixels * 2;
        let table = 3 * 256 * 2;
        assert!(cache.memory_usage() >= buffer + bitmap + table, "{}", cache.memory_usage());
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let config = Config { user_gamma: f32::NAN, ..Config::default() };
        let cache = ImageCache::new(config, MemoryDevice::new(PixelFormat::RGB565));
        assert_eq!(cache.config(), &Config::default());
    }

    #[test]
    fn test_evict_under_budget_is_noop() {
        let mut cache = cache();
        let a = load(&mut cache, "a.xbm");
        cache.release(a);
        cache.evict(cache.memory_usage() + 1);
        assert!(cache.contains(a));
    }

    #[test]
    fn test_stale_handle_ignored() {
        let mut cache = cache();
        let a = load(&mut cache, "a.xbm");
        cache.release(a);
        cache.evict_all();

        let b = cache.find_or_create(ImageKey::new("b.xbm"));
        assert_ne!(a, b);
        assert_eq!(cache.refcount(a), None);
        assert_eq!(cache.bitmap(a), None);
        assert_eq!(cache.draw(a, 0, 0), None);
        let resource = Resource::new("image/x-xbitmap", XBM, ResourceStatus::Complete);
        assert_eq!(cache.feed(a, &resource), FeedResult::Ended);
        cache.release(a);
        assert_eq!(cache.refcount(b), Some(1));
    }

    #[test]
    fn test_clear_releases_bitmaps() {
        let mut cache = cache();
        load(&mut cache, "a.xbm");
        load(&mut cache, "b.xbm");
        assert_eq!(cache.device().live_bitmaps(), 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.device().live_bitmaps(), 0);
    }

    #[test]
    fn test_reload_resets() {
        let mut cache = cache();
        let a = load(&mut cache, "a.xbm");
        cache.reload(a);
        assert_eq!(cache.state(a), Some(DecodeState::empty()));
        assert_eq!(cache.natural_size(a), None);
        assert_eq!(cache.device().live_bitmaps(), 0);

        let resource = Resource::new("image/x-xbitmap", XBM, ResourceStatus::Complete);
        assert_eq!(cache.feed(a, &resource), FeedResult::Ended);
        assert_eq!(cache.natural_size(a), Some((2, 1)));
    }

    #[test]
    fn test_scaled_display_size() {
        let mut cache = cache();
        let handle = cache.find_or_create(ImageKey::new("a.xbm").with_scale(200));
        let resource = Resource::new("image/x-xbitmap", XBM, ResourceStatus::Complete);
        assert_eq!(cache.feed(handle, &resource), FeedResult::Ended);
        assert_eq!(cache.display_size(handle), Some((4, 2)));
        let bitmap = cache.bitmap(handle).unwrap();
        assert_eq!(cache.device().bitmap_size(bitmap), Some((4, 2)));
    }
}
