//! Execution requests handed to the compute backend.
//!
//! An [`ExecRequest`] is one inference-execution unit: the tokens of one
//! hypothesis, the logits the backend produced for its last step, the cache
//! pages it owns, and a settable-once completion signal.

use std::sync::Arc;

use candle_core::Tensor;
use tokio::sync::watch;

use crate::core::allocation::CacheAllocation;
use crate::error::{Error, Result};

/// Observable state of a [`CompletionSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// Not resolved yet.
    Pending,
    /// Resolved successfully.
    Success,
    /// Resolved with a failure.
    Failure,
}

impl SignalState {
    /// Whether the signal has been resolved either way.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Single-writer completion signal.
///
/// Moves once from [`SignalState::Pending`] to a resolved state; any number of
/// tasks may [`wait`](Self::wait) on it.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<SignalState>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    /// Create a pending signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalState::Pending);
        Self { tx }
    }

    /// Resolve the signal successfully.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalAlreadyResolved`] if it was already resolved.
    pub fn set_success(&self) -> Result<()> {
        self.resolve(SignalState::Success)
    }

    /// Resolve the signal with a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalAlreadyResolved`] if it was already resolved.
    pub fn set_failure(&self) -> Result<()> {
        self.resolve(SignalState::Failure)
    }

    fn resolve(&self, outcome: SignalState) -> Result<()> {
        let mut resolved = false;
        self.tx.send_if_modified(|state| {
            if *state == SignalState::Pending {
                *state = outcome;
                resolved = true;
            }
            resolved
        });
        if resolved {
            Ok(())
        } else {
            Err(Error::SignalAlreadyResolved)
        }
    }

    /// Current state.
    pub fn state(&self) -> SignalState {
        *self.tx.borrow()
    }

    /// Whether the signal has been resolved.
    pub fn is_set(&self) -> bool {
        self.state().is_resolved()
    }

    /// Suspend until the signal is resolved and return the outcome.
    pub async fn wait(&self) -> SignalState {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(SignalState::is_resolved).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        outcome
    }
}

/// One inference-execution unit bound to a beam.
#[derive(Debug)]
pub struct ExecRequest {
    /// Prompt token IDs.
    input_token_ids: Vec<u32>,
    /// Generated token IDs.
    output_token_ids: Vec<u32>,
    /// Logits written by the backend for the latest step.
    result_logits: Option<Tensor>,
    /// Token IDs of the logits row when the backend pre-selected candidates.
    result_indices: Option<Vec<u32>>,
    /// Pages owned by this request.
    allocation: CacheAllocation,
    /// Completion signal shared with the backend.
    done: Arc<CompletionSignal>,
    /// Number of decode steps taken.
    decode_steps: usize,
}

impl ExecRequest {
    /// Create a request over `input_token_ids` owning `allocation`.
    pub fn new(input_token_ids: Vec<u32>, allocation: CacheAllocation) -> Self {
        Self {
            input_token_ids,
            output_token_ids: Vec::new(),
            result_logits: None,
            result_indices: None,
            allocation,
            done: Arc::new(CompletionSignal::new()),
            decode_steps: 0,
        }
    }

    /// Copy this request for a new hypothesis.
    ///
    /// Tokens, logits and step count are copied; the allocation is forked and
    /// the copy gets its own completion signal.
    pub fn fork(&self) -> Result<Self> {
        Ok(Self {
            input_token_ids: self.input_token_ids.clone(),
            output_token_ids: self.output_token_ids.clone(),
            result_logits: self.result_logits.clone(),
            result_indices: self.result_indices.clone(),
            allocation: self.allocation.fork()?,
            done: Arc::new(CompletionSignal::new()),
            decode_steps: self.decode_steps,
        })
    }

    /// Get the prompt token IDs.
    pub fn input_token_ids(&self) -> &[u32] {
        &self.input_token_ids
    }

    /// Get the generated token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Total number of tokens (prompt + generated).
    pub fn total_len(&self) -> usize {
        self.input_token_ids.len() + self.output_token_ids.len()
    }

    /// Number of decode steps taken.
    pub fn decode_steps(&self) -> usize {
        self.decode_steps
    }

    /// Record a generated token for the step just taken.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
        self.decode_steps += 1;
    }

    /// Logits of the latest step, if the backend produced any.
    pub fn result_logits(&self) -> Option<&Tensor> {
        self.result_logits.as_ref()
    }

    /// Store the logits of the latest step.
    pub fn set_result_logits(&mut self, logits: Tensor) {
        self.result_logits = Some(logits);
        self.result_indices = None;
    }

    /// Token IDs for each logits position, if the backend narrowed the row.
    pub fn result_indices(&self) -> Option<&[u32]> {
        self.result_indices.as_deref()
    }

    /// Store logits for a backend-selected subset of tokens.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] unless there is one index per logit.
    pub fn set_result_top_k(&mut self, logits: Tensor, indices: Vec<u32>) -> Result<()> {
        if indices.len() != logits.elem_count() {
            return Err(Error::InvalidInput(format!(
                "{} token indices for {} logits",
                indices.len(),
                logits.elem_count()
            )));
        }
        self.result_logits = Some(logits);
        self.result_indices = Some(indices);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_result_top_k_unchecked(&mut self, logits: Tensor, indices: Vec<u32>) {
        self.result_logits = Some(logits);
        self.result_indices = Some(indices);
    }

    /// Get the cache allocation.
    pub fn allocation(&self) -> &CacheAllocation {
        &self.allocation
    }

    /// Get mutable access to the cache allocation.
    pub fn allocation_mut(&mut self) -> &mut CacheAllocation {
        &mut self.allocation
    }

    /// Completion signal of this request.
    pub fn done(&self) -> &Arc<CompletionSignal> {
        &self.done
    }

    /// Return this request's pages to the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleRelease`] if the pages were already freed.
    pub fn free_cache_pages(&mut self) -> Result<()> {
        self.allocation.release()
    }

    /// Whether the cache pages have been freed.
    pub fn is_cache_released(&self) -> bool {
        self.allocation.is_released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::page_store::SharedPageStore;

    #[test]
    fn test_signal_resolves_once() {
        let signal = CompletionSignal::new();
        assert_eq!(signal.state(), SignalState::Pending);

        signal.set_success().unwrap();
        assert!(signal.is_set());
        assert!(matches!(
            signal.set_failure(),
            Err(Error::SignalAlreadyResolved)
        ));
        assert_eq!(signal.state(), SignalState::Success);
    }

    #[tokio::test]
    async fn test_signal_wait_after_resolution() {
        let signal = CompletionSignal::new();
        signal.set_failure().unwrap();
        assert_eq!(signal.wait().await, SignalState::Failure);
    }

    #[tokio::test]
    async fn test_signal_wait_before_resolution() {
        let signal = Arc::new(CompletionSignal::new());
        let writer = Arc::clone(&signal);

        let (outcome, ()) = tokio::join!(signal.wait(), async move {
            tokio::task::yield_now().await;
            writer.set_success().unwrap();
        });
        assert_eq!(outcome, SignalState::Success);
    }

    #[test]
    fn test_append_tokens_counts_steps() {
        let store = SharedPageStore::new(4);
        let mut req = ExecRequest::new(vec![1, 2, 3], store.allocate(2).unwrap());

        req.append_token(7);
        req.append_token(8);

        assert_eq!(req.output_token_ids(), &[7, 8]);
        assert_eq!(req.decode_steps(), 2);
        assert_eq!(req.total_len(), 5);
    }

    #[test]
    fn test_fork_copies_tokens_and_shares_pages() {
        let store = SharedPageStore::new(4);
        let mut req = ExecRequest::new(vec![1, 2], store.allocate(2).unwrap());
        req.append_token(9);

        let copy = req.fork().unwrap();
        assert_eq!(copy.output_token_ids(), &[9]);
        assert_eq!(copy.decode_steps(), 1);
        assert!(!copy.done().is_set());
        assert!(!Arc::ptr_eq(req.done(), copy.done()));
        assert_eq!(store.ref_count(req.allocation().pages()[0]), Some(2));
    }

    #[test]
    fn test_result_top_k_requires_one_index_per_logit() {
        let store = SharedPageStore::new(4);
        let mut req = ExecRequest::new(vec![1], store.allocate(1).unwrap());
        let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 0.4], &candle_core::Device::Cpu).unwrap();

        let err = req
            .set_result_top_k(logits.clone(), vec![10, 11])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(req.result_logits().is_none());
        assert!(req.result_indices().is_none());

        req.set_result_top_k(logits, vec![10, 11, 12, 13]).unwrap();
        assert_eq!(req.result_indices(), Some(&[10, 11, 12, 13][..]));
    }

    #[test]
    fn test_free_cache_pages_once() {
        let store = SharedPageStore::new(4);
        let mut req = ExecRequest::new(vec![1], store.allocate(1).unwrap());

        req.free_cache_pages().unwrap();
        assert!(req.is_cache_released());
        assert!(req.free_cache_pages().is_err());
        assert_eq!(store.num_free_pages(), 4);
    }
}
