//! Ordered, selectable view over a document's pages.
//!
//! Reorder, split, extract and rotate tools all share one `PageCollection`.
//! The sequence is always a permutation of the document's pages; the
//! selection is a subset of it. Any mutation bumps a revision counter so the
//! owner can tell when a produced result went stale.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A page of the source document, identified by its 1-based original index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u32);

impl PageId {
    /// Returns `None` for 0; page identifiers are 1-based.
    pub fn new(number: u32) -> Option<Self> {
        (number >= 1).then_some(PageId(number))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-based index into the original document.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of an output document: which source page, rotated by how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEdit {
    pub page: PageId,
    /// Clockwise rotation delta in degrees: 0, 90, 180 or 270.
    pub rotation: u16,
}

/// Outcome of parsing a page-range expression.
///
/// Malformed tokens never fail the parse; they are reported here so callers
/// can warn when nothing usable was entered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSelection {
    pub pages: BTreeSet<PageId>,
    pub accepted_tokens: usize,
    pub dropped_tokens: Vec<String>,
}

impl RangeSelection {
    /// True when at least one token was entered and every one was dropped.
    pub fn all_dropped(&self) -> bool {
        self.accepted_tokens == 0 && !self.dropped_tokens.is_empty()
    }
}

/// Parses `entry (',' entry)*` where `entry := number | number '-' number`.
///
/// Bounds are clamped into `[1, page_count]`. Non-numeric tokens and inverted
/// ranges are dropped.
pub fn parse_range_expression(text: &str, page_count: u32) -> RangeSelection {
    let mut selection = RangeSelection::default();
    if page_count == 0 {
        return selection;
    }

    let clamp = |n: u64| n.clamp(1, page_count as u64) as u32;

    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let bounds = match token.split_once('-') {
            Some((start, end)) => match (start.trim().parse::<u64>(), end.trim().parse::<u64>()) {
                (Ok(start), Ok(end)) if start <= end => Some((clamp(start), clamp(end))),
                _ => None,
            },
            None => token.parse::<u64>().ok().map(|n| (clamp(n), clamp(n))),
        };

        match bounds {
            Some((start, end)) => {
                selection.accepted_tokens += 1;
                selection.pages.extend((start..=end).map(PageId));
            }
            None => selection.dropped_tokens.push(token.to_string()),
        }
    }

    selection
}

/// Serializes a set of pages as canonical ranges, e.g. `1-3,5`.
pub fn format_range_expression<'a>(pages: impl IntoIterator<Item = &'a PageId>) -> String {
    let sorted: BTreeSet<u32> = pages.into_iter().map(|p| p.get()).collect();
    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }

    parts.join(",")
}

/// Presentation order, selection and rotation state for a document's pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCollection {
    page_count: u32,
    order: Vec<PageId>,
    selected: BTreeSet<PageId>,
    rotations: BTreeMap<PageId, u16>,
    revision: u64,
}

impl PageCollection {
    /// Creates the identity order with every page selected.
    pub fn new(page_count: u32) -> Self {
        let order: Vec<PageId> = (1..=page_count).map(PageId).collect();
        PageCollection {
            page_count,
            selected: order.iter().copied().collect(),
            order,
            rotations: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Current presentation order.
    pub fn order(&self) -> &[PageId] {
        &self.order
    }

    pub fn contains(&self, page: PageId) -> bool {
        page.get() <= self.page_count
    }

    pub fn is_selected(&self, page: PageId) -> bool {
        self.selected.contains(&page)
    }

    pub fn selected(&self) -> &BTreeSet<PageId> {
        &self.selected
    }

    /// Incremented by every state-changing operation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Flips `page` in the selection. Returns false if `page` is out of range.
    pub fn toggle(&mut self, page: PageId) -> bool {
        if !self.contains(page) {
            return false;
        }
        if !self.selected.remove(&page) {
            self.selected.insert(page);
        }
        self.revision += 1;
        true
    }

    /// Moves the element at position `from` to position `to`.
    ///
    /// Positions refer to the current order, not to page identifiers.
    /// Out-of-bounds positions leave the collection untouched.
    pub fn move_page(&mut self, from: usize, to: usize) -> bool {
        if from >= self.order.len() || to >= self.order.len() {
            return false;
        }
        if from != to {
            let page = self.order.remove(from);
            self.order.insert(to, page);
            self.revision += 1;
        }
        true
    }

    /// Replaces the selection with the pages named by a range expression.
    pub fn apply_range_expression(&mut self, text: &str) -> RangeSelection {
        let parsed = parse_range_expression(text, self.page_count);
        self.selected = parsed.pages.clone();
        self.revision += 1;
        parsed
    }

    /// Canonical range expression for the current selection.
    pub fn range_expression(&self) -> String {
        format_range_expression(&self.selected)
    }

    pub fn select_all(&mut self) {
        self.selected = self.order.iter().copied().collect();
        self.revision += 1;
    }

    pub fn clear_selection(&mut self) {
        self.selected.clear();
        self.revision += 1;
    }

    /// Adds `quarter_turns * 90` degrees of clockwise rotation to `page`.
    pub fn rotate(&mut self, page: PageId, quarter_turns: i32) -> bool {
        if !self.contains(page) {
            return false;
        }
        let current = self.rotation(page) as i32;
        let degrees = (current + quarter_turns * 90).rem_euclid(360) as u16;
        if degrees == 0 {
            self.rotations.remove(&page);
        } else {
            self.rotations.insert(page, degrees);
        }
        self.revision += 1;
        true
    }

    pub fn rotation(&self, page: PageId) -> u16 {
        self.rotations.get(&page).copied().unwrap_or(0)
    }

    /// Restores identity order, full selection and no rotation.
    pub fn reset(&mut self) {
        let revision = self.revision + 1;
        *self = PageCollection::new(self.page_count);
        self.revision = revision;
    }

    /// Selected pages in presentation order, with their rotation.
    pub fn output_pages(&self) -> Vec<PageEdit> {
        self.order
            .iter()
            .filter(|page| self.selected.contains(page))
            .map(|&page| PageEdit {
                page,
                rotation: self.rotation(page),
            })
            .collect()
    }
}
