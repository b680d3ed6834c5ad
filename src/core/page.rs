//! Page abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size pages, similar to how operating
//! systems manage virtual memory. A page is identified by its index in the
//! device cache and is shared between beams by reference counting.

/// Identifier of a physical page in the device cache.
pub type PageId = usize;

/// A fixed-size chunk of KV cache memory.
///
/// Each page stores KV states for `block_seq_stride` tokens. Pages are the
/// unit of allocation in the [`PageStore`](super::page_store::PageStore);
/// they are never copied, only referenced.
#[derive(Debug, Clone)]
pub struct Page {
    /// Index of this page in the device cache.
    page_id: PageId,
    /// Number of live allocations referencing this page.
    ref_count: usize,
}

impl Page {
    /// Create a newly acquired page with a single reference.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            ref_count: 1,
        }
    }

    /// Get the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Increment reference count (when a fork shares this page).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement reference count.
    ///
    /// # Returns
    ///
    /// The new reference count after decrementing.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Compute number of pages needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_decode::core::page::pages_for_tokens;
///
/// assert_eq!(pages_for_tokens(35, 16), 3);
/// assert_eq!(pages_for_tokens(32, 16), 2);
/// assert_eq!(pages_for_tokens(0, 16), 0);
/// ```
pub fn pages_for_tokens(num_tokens: usize, block_seq_stride: usize) -> usize {
    num_tokens.div_ceil(block_seq_stride.max(1))
}
