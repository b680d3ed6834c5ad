//! Core infrastructure for nano-decode.
//!
//! This module contains the fundamental building blocks:
//! - Page and PageStore for the paged KV cache
//! - CacheAllocation for copy-on-write page sharing between beams
//! - ExecRequest for the unit of work handed to the compute backend

pub mod allocation;
pub mod exec_request;
pub mod page;
pub mod page_store;

pub use allocation::{AllocationId, CacheAllocation};
pub use exec_request::{CompletionSignal, ExecRequest, SignalState};
pub use page::{pages_for_tokens, Page, PageId};
pub use page_store::{PageStore, SharedPageStore};
