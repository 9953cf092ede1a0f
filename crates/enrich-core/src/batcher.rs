//! Token-bounded batching
//!
//! Greedy, single pass, order preserving. An item that alone exceeds the
//! budget still gets a batch of its own, so nothing is ever dropped and the
//! scan always makes progress.

/// An ordered, non-empty group of items dispatched as one request
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    index: usize,
    items: Vec<T>,
    estimated_tokens: usize,
}

impl<T> Batch<T> {
    /// Position of this batch in the batching order
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Items in order
    #[inline]
    #[must_use]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Number of items (never zero)
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false; batches are never empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the per-item estimates, without overhead
    #[inline]
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }

    /// Take the items
    #[inline]
    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Cheap token estimate: one token per three characters, rounded up
///
/// Monotone in the text length; not a tokenizer.
#[inline]
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(3)
}

/// Partition `items` into batches whose estimate plus `overhead` fits `limit`
///
/// A batch is closed when adding the next item would push
/// `running + estimate + overhead` past `limit`, unless the batch is still
/// empty; then the item is taken regardless.
pub fn make_batches<T, I, F>(items: I, mut estimate: F, overhead: usize, limit: usize) -> Vec<Batch<T>>
where
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> usize,
{
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut running = 0usize;

    for item in items {
        let cost = estimate(&item);
        if !current.is_empty() && running.saturating_add(cost).saturating_add(overhead) > limit {
            batches.push(Batch {
                index: batches.len(),
                items: std::mem::take(&mut current),
                estimated_tokens: running,
            });
            running = 0;
        }
        running = running.saturating_add(cost);
        current.push(item);
    }

    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            items: current,
            estimated_tokens: running,
        });
    }

    batches
}
