//! Page store for the paged KV cache.
//!
//! The PageStore handles acquisition and return of KV cache pages, similar
//! to how an operating system manages physical memory pages.
//!
//! ## Features
//!
//! - **FIFO free list**: pages are handed out in the order they were freed
//! - **Reference counting**: forked allocations share pages copy-on-write
//!
//! Callers normally go through [`SharedPageStore`], which wraps the store in a
//! single mutex and hands out [`CacheAllocation`]s.
//!
//! ## Example
//!
//! ```
//! use nano_decode::core::page_store::SharedPageStore;
//!
//! let store = SharedPageStore::new(8);
//! let mut allocation = store.allocate(3).unwrap();
//! assert_eq!(store.num_free_pages(), 5);
//!
//! let mut fork = store.fork(&allocation).unwrap();
//! store.release(&mut allocation).unwrap();
//! assert_eq!(store.num_free_pages(), 5); // still referenced by the fork
//!
//! store.release(&mut fork).unwrap();
//! assert_eq!(store.num_free_pages(), 8);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::allocation::{AllocationId, CacheAllocation};
use crate::core::page::{Page, PageId};
use crate::error::{Error, Result};

/// Manages the reference-counted pages of the device KV cache.
#[derive(Debug)]
pub struct PageStore {
    /// Pages currently referenced by at least one allocation.
    pages: HashMap<PageId, Page>,
    /// Free page IDs in FIFO order.
    free_list: VecDeque<PageId>,
    /// Total number of pages.
    num_pages: usize,
    /// Number of allocation releases performed.
    num_releases: usize,
    /// Next allocation identifier.
    next_allocation_id: AllocationId,
}

impl PageStore {
    /// Create a new page store with the specified capacity.
    pub fn new(num_pages: usize) -> Self {
        Self {
            pages: HashMap::with_capacity(num_pages),
            free_list: (0..num_pages).collect(),
            num_pages,
            num_releases: 0,
            next_allocation_id: 0,
        }
    }

    /// Get the total number of pages.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Get the number of free pages.
    pub fn num_free_pages(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of referenced pages.
    pub fn num_used_pages(&self) -> usize {
        self.pages.len()
    }

    /// Check if a specific number of pages can be acquired.
    pub fn can_allocate(&self, num_pages: usize) -> bool {
        self.free_list.len() >= num_pages
    }

    /// Reference count of a page, or `None` if it is free.
    pub fn ref_count(&self, page_id: PageId) -> Option<usize> {
        self.pages.get(&page_id).map(Page::ref_count)
    }

    /// Number of allocation releases performed so far.
    pub fn num_releases(&self) -> usize {
        self.num_releases
    }

    /// Acquire `num_pages` free pages, each with a single reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if not enough pages are free. Nothing is
    /// acquired in that case.
    pub(crate) fn acquire(&mut self, num_pages: usize) -> Result<Vec<PageId>> {
        if !self.can_allocate(num_pages) {
            return Err(Error::OutOfMemory {
                required: num_pages,
                available: self.free_list.len(),
            });
        }

        let page_ids: Vec<PageId> = self.free_list.drain(..num_pages).collect();
        for &page_id in &page_ids {
            self.pages.insert(page_id, Page::new(page_id));
        }
        Ok(page_ids)
    }

    /// Add one reference to each page.
    pub(crate) fn share(&mut self, page_ids: &[PageId]) {
        for page_id in page_ids {
            if let Some(page) = self.pages.get_mut(page_id) {
                page.increment_ref();
            }
        }
    }

    /// Drop one reference from each page, freeing those that reach zero.
    ///
    /// # Returns
    ///
    /// Number of pages returned to the free list.
    pub(crate) fn unshare(&mut self, page_ids: &[PageId]) -> usize {
        let mut freed = 0;
        for &page_id in page_ids {
            if let Some(page) = self.pages.get_mut(&page_id) {
                if page.decrement_ref() == 0 {
                    self.pages.remove(&page_id);
                    self.free_list.push_back(page_id);
                    freed += 1;
                }
            }
        }
        freed
    }

    fn next_allocation_id(&mut self) -> AllocationId {
        let id = self.next_allocation_id;
        self.next_allocation_id += 1;
        id
    }
}

/// Handle to a [`PageStore`] shared by every allocation drawn from it.
///
/// All reference-count mutation goes through [`allocate`](Self::allocate),
/// [`fork`](Self::fork) and [`release`](Self::release) under one lock.
#[derive(Debug, Clone)]
pub struct SharedPageStore {
    inner: Arc<Mutex<PageStore>>,
}

impl SharedPageStore {
    /// Create a shared store with `num_pages` free pages.
    pub fn new(num_pages: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PageStore::new(num_pages))),
        }
    }

    /// Reserve `num_pages` free pages as a new allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if fewer than `num_pages` pages are free.
    pub fn allocate(&self, num_pages: usize) -> Result<CacheAllocation> {
        let (id, page_ids) = {
            let mut store = self.inner.lock();
            let page_ids = store.acquire(num_pages)?;
            (store.next_allocation_id(), page_ids)
        };
        debug!(allocation = id, pages = num_pages, "allocated cache pages");
        Ok(CacheAllocation::new(id, page_ids, self.clone()))
    }

    /// Create an allocation sharing every page of `allocation`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if `allocation` was released.
    pub fn fork(&self, allocation: &CacheAllocation) -> Result<CacheAllocation> {
        if allocation.is_released() {
            return Err(Error::InvalidStateTransition {
                from: "Released",
                to: "Forked",
            });
        }
        let page_ids = allocation.pages().to_vec();
        let id = {
            let mut store = self.inner.lock();
            store.share(&page_ids);
            store.next_allocation_id()
        };
        debug!(
            parent = allocation.id(),
            allocation = id,
            pages = page_ids.len(),
            "forked cache allocation"
        );
        Ok(CacheAllocation::new(id, page_ids, self.clone()))
    }

    /// Release every page reference held by `allocation`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] if `allocation` was already released.
    pub fn release(&self, allocation: &mut CacheAllocation) -> Result<()> {
        allocation.release()
    }

    pub(crate) fn extend_pages(&self, num_pages: usize) -> Result<Vec<PageId>> {
        self.inner.lock().acquire(num_pages)
    }

    pub(crate) fn release_pages(&self, page_ids: &[PageId]) -> usize {
        let mut store = self.inner.lock();
        store.num_releases += 1;
        store.unshare(page_ids)
    }

    /// Get the total number of pages.
    pub fn num_pages(&self) -> usize {
        self.inner.lock().num_pages()
    }

    /// Get the number of free pages.
    pub fn num_free_pages(&self) -> usize {
        self.inner.lock().num_free_pages()
    }

    /// Get the number of referenced pages.
    pub fn num_used_pages(&self) -> usize {
        self.inner.lock().num_used_pages()
    }

    /// Check if a specific number of pages can be allocated.
    pub fn can_allocate(&self, num_pages: usize) -> bool {
        self.inner.lock().can_allocate(num_pages)
    }

    /// Reference count of a page, or `None` if it is free.
    pub fn ref_count(&self, page_id: PageId) -> Option<usize> {
        self.inner.lock().ref_count(page_id)
    }

    /// Number of allocation releases performed so far.
    pub fn num_releases(&self) -> usize {
        self.inner.lock().num_releases()
    }
}
