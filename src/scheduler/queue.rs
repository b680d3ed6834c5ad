//! Admission control for generation requests.
//!
//! The [`RequestQueueManager`] decides whether a new request may enter the
//! system given the queue depth, the compiled top-k, and the KV cache page
//! budget. It only accounts page counts; the pages themselves are reserved
//! through a [`SharedPageStore`](crate::core::SharedPageStore) by the caller.
//!
//! ## Admission Flow
//!
//! ```text
//!   add_to_queue()
//!        │
//!        ▼
//!   queue size < max? ──no──► QueueFull ─────┐
//!        │ yes                               │
//!        ▼                                   │
//!   top_k matches?   ──no──► TopKMismatch ───┤
//!        │ yes                               ▼
//!        ▼                           responder.send_error()
//!   pages available? ──no──► OutOfMemory ────┘    returns None
//!        │ yes
//!        ▼
//!   reserve pages, track entry, return Some(id)
//! ```
//!
//! ## Example
//!
//! ```
//! use nano_decode::config::{DecodeConfig, ModelParams, QueueConfig};
//! use nano_decode::scheduler::{InputBatch, NullResponder, RequestQueueManager};
//!
//! let mut manager = RequestQueueManager::new(ModelParams::default(), QueueConfig::default());
//! let before = manager.available_page_count();
//!
//! let id = manager
//!     .add_to_queue(
//!         vec![DecodeConfig::default()],
//!         InputBatch::Pretokenized(vec![vec![1, 2, 3, 4]]),
//!         &NullResponder,
//!     )
//!     .unwrap();
//! assert!(manager.available_page_count() < before);
//!
//! manager.remove_from_queue(id).unwrap();
//! assert_eq!(manager.available_page_count(), before);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{DecodeConfig, ModelParams, QueueConfig};
use crate::core::page::pages_for_tokens;
use crate::error::{Error, Result};

/// Unique identifier for an admitted request.
pub type RequestId = u64;

/// Input of a generation request.
#[derive(Debug, Clone)]
pub enum InputBatch {
    /// Raw prompts, tokenized through the manager's [`Encoder`].
    Text(Vec<String>),
    /// Token ID sequences.
    Pretokenized(Vec<Vec<u32>>),
}

impl InputBatch {
    /// Whether the batch is already tokenized.
    pub fn is_pretokenized(&self) -> bool {
        matches!(self, Self::Pretokenized(_))
    }

    /// Number of prompts in the batch.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(prompts) => prompts.len(),
            Self::Pretokenized(prompts) => prompts.len(),
        }
    }

    /// Whether the batch has no prompts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns raw text into token IDs.
pub trait Encoder: Send + Sync {
    /// Encode one prompt.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// Delivery path back to the client that issued a request.
pub trait Responder {
    /// Report a failure. Called exactly once per rejected admission.
    fn send_error(&self, error: &Error);

    /// Deliver the generated token sequences of a finished request.
    fn send_response(&self, request_id: RequestId, results: &[Vec<u32>]);
}

/// Responder that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResponder;

impl Responder for NullResponder {
    fn send_error(&self, _error: &Error) {}

    fn send_response(&self, _request_id: RequestId, _results: &[Vec<u32>]) {}
}

/// State tracked for one admitted request.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Decode configuration per prompt (a single config applies to all).
    pub decode_configs: Vec<DecodeConfig>,
    /// Tokenized prompts.
    pub input_token_ids: Vec<Vec<u32>>,
    /// Top-k the request was admitted under.
    pub top_k: i32,
    /// Pages reserved for the request.
    pub page_count: usize,
}

impl QueueEntry {
    /// Decode configuration for the prompt at `index`.
    pub fn decode_config(&self, index: usize) -> Option<&DecodeConfig> {
        match self.decode_configs.as_slice() {
            [single] => Some(single),
            configs => configs.get(index),
        }
    }
}

/// Admission control over queue depth and KV cache pages.
pub struct RequestQueueManager {
    /// Model geometry and compiled top-k.
    model_params: ModelParams,
    /// Maximum number of tracked requests.
    max_queue_size: usize,
    /// Number of tracked requests.
    current_queue_size: usize,
    /// Pages not reserved by any tracked request.
    available_page_count: usize,
    /// Tracked requests.
    entries: BTreeMap<RequestId, QueueEntry>,
    /// Next request id to hand out.
    next_request_id: RequestId,
    /// Tokenizer for text input.
    encoder: Option<Arc<dyn Encoder>>,
}

impl RequestQueueManager {
    /// Create a manager whose page budget is the device page count.
    pub fn new(model_params: ModelParams, config: QueueConfig) -> Self {
        let available_page_count = model_params.paged_kv_cache.device_block_count;
        info!(
            max_queue_size = config.max_queue_size,
            pages = available_page_count,
            page_bytes = model_params.page_size_bytes(),
            "request queue manager ready"
        );
        Self {
            model_params,
            max_queue_size: config.max_queue_size,
            current_queue_size: 0,
            available_page_count,
            entries: BTreeMap::new(),
            next_request_id: 1,
            encoder: None,
        }
    }

    /// Attach an encoder used for [`InputBatch::Text`] input.
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Try to admit a request.
    ///
    /// On rejection `responder.send_error` is called once and `None` is
    /// returned; the page budget is left untouched.
    pub fn add_to_queue(
        &mut self,
        decode_configs: Vec<DecodeConfig>,
        input_batch: InputBatch,
        responder: &dyn Responder,
    ) -> Option<RequestId> {
        match self.admit(decode_configs, input_batch) {
            Ok(request_id) => Some(request_id),
            Err(error) => {
                warn!(%error, "rejected request");
                responder.send_error(&error);
                None
            }
        }
    }

    fn admit(
        &mut self,
        decode_configs: Vec<DecodeConfig>,
        input_batch: InputBatch,
    ) -> Result<RequestId> {
        if self.current_queue_size >= self.max_queue_size {
            return Err(Error::QueueFull {
                size: self.current_queue_size,
                max: self.max_queue_size,
            });
        }

        for config in &decode_configs {
            if config.top_k != self.model_params.top_k {
                return Err(Error::TopKMismatch {
                    expected: self.model_params.top_k,
                    requested: config.top_k,
                });
            }
        }

        let input_token_ids = self.tokenize(input_batch)?;
        if decode_configs.is_empty()
            || (decode_configs.len() != 1 && decode_configs.len() != input_token_ids.len())
        {
            return Err(Error::InvalidInput(format!(
                "{} decode configs for {} prompts",
                decode_configs.len(),
                input_token_ids.len()
            )));
        }
        for config in &decode_configs {
            config.validate()?;
        }

        let page_count = self.required_pages(&decode_configs, &input_token_ids);
        if page_count > self.available_page_count {
            return Err(Error::OutOfMemory {
                required: page_count,
                available: self.available_page_count,
            });
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.available_page_count -= page_count;
        self.current_queue_size += 1;
        self.entries.insert(
            request_id,
            QueueEntry {
                decode_configs,
                input_token_ids,
                top_k: self.model_params.top_k,
                page_count,
            },
        );

        info!(
            request_id,
            pages = page_count,
            available = self.available_page_count,
            "admitted request"
        );
        Ok(request_id)
    }

    fn tokenize(&self, input_batch: InputBatch) -> Result<Vec<Vec<u32>>> {
        let input_token_ids = match input_batch {
            InputBatch::Pretokenized(prompts) => prompts,
            InputBatch::Text(prompts) => {
                let encoder = self
                    .encoder
                    .as_ref()
                    .ok_or_else(|| Error::InvalidInput("text input without an encoder".into()))?;
                prompts
                    .iter()
                    .map(|prompt| encoder.encode(prompt))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        if input_token_ids.is_empty() {
            return Err(Error::InvalidInput("empty input batch".into()));
        }
        Ok(input_token_ids)
    }

    /// Pages needed to hold every prompt plus its full completion, per beam.
    fn required_pages(
        &self,
        decode_configs: &[DecodeConfig],
        input_token_ids: &[Vec<u32>],
    ) -> usize {
        let stride = self.model_params.block_seq_stride();
        input_token_ids
            .iter()
            .enumerate()
            .map(|(i, tokens)| {
                let config = match decode_configs {
                    [single] => single,
                    configs => &configs[i],
                };
                pages_for_tokens(tokens.len() + config.max_completion_tokens, stride)
                    * config.num_beams
            })
            .sum()
    }

    /// Stop tracking a request and return its pages to the budget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `request_id` is not tracked.
    pub fn remove_from_queue(&mut self, request_id: RequestId) -> Result<QueueEntry> {
        let entry = self
            .entries
            .remove(&request_id)
            .ok_or(Error::NotFound(request_id))?;

        self.available_page_count += entry.page_count;
        self.current_queue_size = self.current_queue_size.saturating_sub(1);
        debug!(
            request_id,
            pages = entry.page_count,
            available = self.available_page_count,
            "removed request"
        );
        Ok(entry)
    }

    /// IDs of all tracked requests, ascending.
    pub fn current_tasks(&self) -> Vec<RequestId> {
        self.entries.keys().copied().collect()
    }

    /// Get a tracked request.
    pub fn get(&self, request_id: RequestId) -> Option<&QueueEntry> {
        self.entries.get(&request_id)
    }

    /// Pages reserved by a tracked request.
    pub fn request_pages(&self, request_id: RequestId) -> Option<usize> {
        self.entries.get(&request_id).map(|entry| entry.page_count)
    }

    /// Pages not reserved by any tracked request.
    pub fn available_page_count(&self) -> usize {
        self.available_page_count
    }

    /// Number of tracked requests.
    pub fn current_queue_size(&self) -> usize {
        self.current_queue_size
    }

    /// Maximum number of tracked requests.
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Model parameters the manager was built with.
    pub fn model_params(&self) -> &ModelParams {
        &self.model_params
    }

    #[cfg(test)]
    pub(crate) fn set_current_queue_size(&mut self, size: usize) {
        self.current_queue_size = size;
    }

    #[cfg(test)]
    pub(crate) fn set_available_page_count(&mut self, pages: usize) {
        self.available_page_count = pages;
    }
}
