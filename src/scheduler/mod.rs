//! Request admission.
//!
//! This module handles:
//! - Queue depth limits
//! - Top-k compatibility with the compiled sampling path
//! - KV cache page budgeting per request

pub mod queue;

pub use queue::{
    Encoder, InputBatch, NullResponder, QueueEntry, RequestId, RequestQueueManager, Responder,
};
