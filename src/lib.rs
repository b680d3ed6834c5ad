//! nano-decode: decode-time scheduling for paged LLM inference.
//!
//! This crate implements the bookkeeping around a numeric backend:
//! - Paged KV cache store with copy-on-write forking
//! - Request admission against queue, top-k and page budgets
//! - Logits sampling (temperature, top-k, top-p)
//! - Beam groups with pluggable selection strategies

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{
    DecodeConfig, KvCacheDtype, LogitsNormalization, ModelParams, PagedKVCacheParams, QueueConfig,
};
pub use crate::core::{CacheAllocation, CompletionSignal, ExecRequest, SharedPageStore, SignalState};
pub use engine::{Beam, BeamGroup, BeamScorer, StepReport};
pub use error::{Error, Result};
pub use scheduler::{InputBatch, RequestId, RequestQueueManager, Responder};
