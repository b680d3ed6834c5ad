//! Cache allocations: the pages bound to one beam.
//!
//! An allocation is an ordered list of page references into a
//! [`SharedPageStore`]. Forking shares every committed page copy-on-write;
//! each side then grows its own tail with [`CacheAllocation::extend`].
//!
//! Token at position `p` lives in page `pages[p / block_seq_stride]`, slot
//! `p % block_seq_stride`.

use tracing::{debug, warn};

use crate::core::page::PageId;
use crate::core::page_store::SharedPageStore;
use crate::error::{Error, Result};

/// Unique identifier for an allocation.
pub type AllocationId = u64;

/// Ordered page references owned by one beam.
#[derive(Debug)]
pub struct CacheAllocation {
    id: AllocationId,
    /// Physical page IDs in logical order.
    pages: Vec<PageId>,
    store: SharedPageStore,
    released: bool,
}

impl CacheAllocation {
    pub(crate) fn new(id: AllocationId, pages: Vec<PageId>, store: SharedPageStore) -> Self {
        Self {
            id,
            pages,
            store,
            released: false,
        }
    }

    /// Get the allocation ID.
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Physical page IDs in logical order.
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    /// Number of pages referenced.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// The store this allocation draws from.
    pub fn store(&self) -> &SharedPageStore {
        &self.store
    }

    /// Fork this allocation, sharing all of its pages.
    pub fn fork(&self) -> Result<Self> {
        self.store.fork(self)
    }

    /// Append `num_pages` fresh pages to this allocation's tail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the store cannot supply the pages, or
    /// [`Error::InvalidStateTransition`] if the allocation was released.
    pub fn extend(&mut self, num_pages: usize) -> Result<()> {
        if self.released {
            return Err(Error::InvalidStateTransition {
                from: "Released",
                to: "Extended",
            });
        }
        let new_pages = self.store.extend_pages(num_pages)?;
        self.pages.extend(new_pages);
        Ok(())
    }

    /// Drop this allocation's reference to each of its pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] on a second call.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::DoubleRelease(self.id));
        }
        self.released = true;
        let freed = self.store.release_pages(&self.pages);
        debug!(
            allocation = self.id,
            pages = self.pages.len(),
            freed,
            "released cache allocation"
        );
        Ok(())
    }
}

impl Drop for CacheAllocation {
    fn drop(&mut self) {
        if !self.released {
            warn!(allocation = self.id, "cache allocation dropped without release");
            self.released = true;
            self.store.release_pages(&self.pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_shares_pages() {
        let store = SharedPageStore::new(10);
        let parent = store.allocate(3).unwrap();
        let child = parent.fork().unwrap();

        assert_ne!(parent.id(), child.id());
        assert_eq!(parent.pages(), child.pages());
        for &page in parent.pages() {
            assert_eq!(store.ref_count(page), Some(2));
        }
        assert_eq!(store.num_free_pages(), 7);
    }

    #[test]
    fn test_fork_tails_are_independent() {
        let store = SharedPageStore::new(10);
        let mut parent = store.allocate(2).unwrap();
        let mut child = parent.fork().unwrap();

        parent.extend(1).unwrap();
        child.extend(2).unwrap();

        assert_eq!(parent.num_pages(), 3);
        assert_eq!(child.num_pages(), 4);
        assert_eq!(parent.pages()[..2], child.pages()[..2]);
        assert_eq!(store.ref_count(parent.pages()[2]), Some(1));
        assert_eq!(store.num_free_pages(), 5);
    }

    #[test]
    fn test_double_release_fails() {
        let store = SharedPageStore::new(4);
        let mut allocation = store.allocate(2).unwrap();

        allocation.release().unwrap();
        assert!(matches!(
            allocation.release(),
            Err(Error::DoubleRelease(id)) if id == allocation.id()
        ));
        assert_eq!(store.num_free_pages(), 4);
        assert_eq!(store.num_releases(), 1);
    }

    #[test]
    fn test_fork_after_release_fails() {
        let store = SharedPageStore::new(4);
        let mut allocation = store.allocate(1).unwrap();
        allocation.release().unwrap();

        assert!(allocation.fork().is_err());
        assert!(allocation.extend(1).is_err());
    }

    #[test]
    fn test_drop_returns_pages() {
        let store = SharedPageStore::new(4);
        {
            let _allocation = store.allocate(3).unwrap();
            assert_eq!(store.num_free_pages(), 1);
        }
        assert_eq!(store.num_free_pages(), 4);
    }

    #[test]
    fn test_extend_out_of_memory() {
        let store = SharedPageStore::new(2);
        let mut allocation = store.allocate(2).unwrap();

        assert!(matches!(
            allocation.extend(1),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(allocation.num_pages(), 2);
    }
}
