//! Lazy, viewport-driven page thumbnails.
//!
//! Only pages inside the visible window (plus overscan) are rendered, and only
//! when the caller asks for them with a budget. Reading the collection never
//! changes it.

use crate::config::ThumbnailConfig;
use crate::page_collection::{PageCollection, PageId};
use crate::raster::{RasterError, RasterFrame, RasterProducer};
use crate::source::{RenderError, SourceDocument};
use std::collections::HashMap;
use std::ops::Range;
use tracing::{debug, trace};

/// JPEG quality used for thumbnails.
const THUMBNAIL_QUALITY: u8 = 70;

#[derive(Debug)]
enum Entry {
    Ready { rotation: u16, frame: RasterFrame },
    Failed(RenderError),
}

/// Cache of encoded thumbnails for one page collection.
#[derive(Debug)]
pub struct ThumbnailCache {
    max_edge: u32,
    overscan: usize,
    capacity: usize,
    entries: HashMap<PageId, Entry>,
    /// Pages in the window, in presentation order, with their rotation.
    window: Vec<(PageId, u16)>,
    span: Range<usize>,
    positions: HashMap<PageId, usize>,
}

impl ThumbnailCache {
    pub fn new(max_edge: u32, overscan: usize, capacity: usize) -> Self {
        ThumbnailCache {
            max_edge: max_edge.max(1),
            overscan,
            capacity,
            entries: HashMap::new(),
            window: Vec::new(),
            span: 0..0,
            positions: HashMap::new(),
        }
    }

    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self::new(config.max_edge, config.overscan, config.capacity)
    }

    /// Records the visible positions and returns the pages in the window that
    /// still need rendering.
    ///
    /// Moving the window clears recorded failures so those pages are tried
    /// again.
    pub fn set_viewport(
        &mut self,
        collection: &PageCollection,
        first_position: usize,
        visible_count: usize,
    ) -> Vec<PageId> {
        let order = collection.order();
        let first = first_position.min(order.len());
        let start = first.saturating_sub(self.overscan);
        let end = first
            .saturating_add(visible_count)
            .saturating_add(self.overscan)
            .min(order.len());

        if (start..end) != self.span {
            self.entries
                .retain(|_, entry| matches!(entry, Entry::Ready { .. }));
            self.span = start..end;
        }

        self.positions = order
            .iter()
            .enumerate()
            .map(|(position, page)| (*page, position))
            .collect();
        self.window = order[start..end]
            .iter()
            .map(|page| (*page, collection.rotation(*page)))
            .collect();

        // A rotated page needs a fresh thumbnail.
        for (page, rotation) in &self.window {
            if let Some(Entry::Ready { rotation: cached, .. }) = self.entries.get(page) {
                if cached != rotation {
                    self.entries.remove(page);
                }
            }
        }

        self.evict();
        trace!(start, end, cached = self.entries.len(), "Viewport updated");
        self.missing()
    }

    /// Pages in the window with neither a thumbnail nor a recorded failure.
    pub fn missing(&self) -> Vec<PageId> {
        self.window
            .iter()
            .filter(|(page, _)| !self.entries.contains_key(page))
            .map(|(page, _)| *page)
            .collect()
    }

    /// Renders up to `budget` missing pages in window order.
    ///
    /// Unreadable pages are recorded as failed. Returns how many pages were
    /// attempted.
    pub fn materialize(
        &mut self,
        source: &SourceDocument,
        producer: &mut RasterProducer,
        budget: usize,
    ) -> Result<usize, RasterError> {
        let pending: Vec<(PageId, u16)> = self
            .window
            .iter()
            .filter(|(page, _)| !self.entries.contains_key(page))
            .take(budget)
            .copied()
            .collect();

        for (page, rotation) in &pending {
            let entry = match self.render(source, producer, *page, *rotation) {
                Ok(frame) => Entry::Ready {
                    rotation: *rotation,
                    frame,
                },
                Err(RasterError::Render(reason)) => {
                    debug!(%page, %reason, "Thumbnail failed");
                    Entry::Failed(reason)
                }
                Err(e) => return Err(e),
            };
            self.entries.insert(*page, entry);
        }

        self.evict();
        Ok(pending.len())
    }

    fn render(
        &self,
        source: &SourceDocument,
        producer: &mut RasterProducer,
        page: PageId,
        rotation: u16,
    ) -> Result<RasterFrame, RasterError> {
        let size = source
            .page_size(page)
            .ok_or(RenderError::PageOutOfRange {
                page,
                page_count: source.page_count(),
            })?;
        let longest = size.width.max(size.height);
        if longest <= 0.0 {
            return Err(RenderError::Unreadable {
                page,
                reason: "page has no area".to_string(),
            }
            .into());
        }
        let scale = self.max_edge as f32 / longest;
        producer.render_frame(source, page, rotation, scale, THUMBNAIL_QUALITY)
    }

    /// Drops thumbnails outside the window, farthest first, until the cache
    /// fits its capacity.
    fn evict(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }

        let span = self.span.clone();
        let distance = |page: &PageId| match self.positions.get(page) {
            Some(&position) if position < span.start => span.start - position,
            Some(&position) if position >= span.end => position + 1 - span.end,
            Some(_) => 0,
            None => usize::MAX,
        };

        let mut outside: Vec<(usize, PageId)> = self
            .entries
            .keys()
            .map(|page| (distance(page), *page))
            .filter(|(distance, _)| *distance > 0)
            .collect();
        outside.sort_unstable_by(|a, b| b.cmp(a));

        let excess = self.entries.len() - self.capacity;
        for (_, page) in outside.into_iter().take(excess) {
            self.entries.remove(&page);
        }
    }

    pub fn get(&self, page: PageId) -> Option<&RasterFrame> {
        match self.entries.get(&page) {
            Some(Entry::Ready { frame, .. }) => Some(frame),
            _ => None,
        }
    }

    pub fn failure(&self, page: PageId) -> Option<&RenderError> {
        match self.entries.get(&page) {
            Some(Entry::Failed(reason)) => Some(reason),
            _ => None,
        }
    }

    /// Pages currently in the window, in presentation order.
    pub fn window(&self) -> Vec<PageId> {
        self.window.iter().map(|(page, _)| *page).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry, Entry::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.window.clear();
        self.positions.clear();
        self.span = 0..0;
    }
}
