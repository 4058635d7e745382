//! Data-loader contract used by callbacks that index per-item results.

/// What a callback needs to know about a split to map `(batch, offset)` to an item id.
///
/// Batches are expected in order and all of size [`batch_size`](Self::batch_size),
/// except possibly the last one.
pub trait DataLoader {
    fn batch_size(&self) -> usize;
    fn total_item_count(&self) -> usize;

    fn num_batches(&self) -> usize {
        match self.batch_size() {
            0 => 0,
            bs => self.total_item_count().div_ceil(bs),
        }
    }
}

/// Plain description of a split.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitInfo {
    pub total_items: usize,
    pub batch_size: usize,
}

impl SplitInfo {
    pub fn new(total_items: usize, batch_size: usize) -> Self {
        Self {
            total_items,
            batch_size,
        }
    }
}

impl DataLoader for SplitInfo {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn total_item_count(&self) -> usize {
        self.total_items
    }
}
