//! Beams: one decoding hypothesis each.
//!
//! A beam wraps the [`ExecRequest`] that carries its tokens and cache pages,
//! the [`DecodeConfig`] it samples with, and its per-step state.
//!
//! ## Lifecycle
//!
//! ```text
//!             advance()           complete()
//!   Active ───────────► Active ─────────────► Completed
//!      │
//!      │  prune()
//!      └─────────────► Pruned
//! ```
//!
//! Both terminal transitions release the beam's cache pages exactly once.

use candle_core::Tensor;

use crate::config::{DecodeConfig, LogitsNormalization};
use crate::core::exec_request::ExecRequest;
use crate::engine::logits::LogitsArray;
use crate::engine::sampler::{apply_temperature, convert_logits_normalization};
use crate::error::{Error, Result};

/// Unique identifier for a beam within its group.
pub type BeamId = u64;

/// Status of a beam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeamStatus {
    /// Still generating.
    Active,
    /// Finished with EOS or at the token limit.
    Completed,
    /// Dropped by the scorer without producing output.
    Pruned,
}

impl BeamStatus {
    /// Check if the beam can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Pruned)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Completed => "Completed",
            Self::Pruned => "Pruned",
        }
    }
}

/// One hypothesis within a [`BeamGroup`](super::beam_group::BeamGroup).
#[derive(Debug)]
pub struct Beam {
    beam_id: BeamId,
    exec_req: ExecRequest,
    decode_config: DecodeConfig,
    /// Token chosen at the latest step.
    last_token: Option<u32>,
    /// Cumulative log-probability of the generated tokens.
    score: f32,
    status: BeamStatus,
}

impl Beam {
    /// Create an active beam.
    pub fn new(beam_id: BeamId, exec_req: ExecRequest, decode_config: DecodeConfig) -> Self {
        Self {
            beam_id,
            exec_req,
            decode_config,
            last_token: None,
            score: 0.0,
            status: BeamStatus::Active,
        }
    }

    /// Get the beam ID.
    pub fn beam_id(&self) -> BeamId {
        self.beam_id
    }

    /// Get the underlying request.
    pub fn exec_req(&self) -> &ExecRequest {
        &self.exec_req
    }

    /// Get mutable access to the underlying request.
    pub fn exec_req_mut(&mut self) -> &mut ExecRequest {
        &mut self.exec_req
    }

    /// Get the decode configuration.
    pub fn decode_config(&self) -> &DecodeConfig {
        &self.decode_config
    }

    /// Get mutable access to the decode configuration.
    pub fn decode_config_mut(&mut self) -> &mut DecodeConfig {
        &mut self.decode_config
    }

    /// Token chosen at the latest step.
    pub fn last_token(&self) -> Option<u32> {
        self.last_token
    }

    /// Cumulative score.
    pub fn score(&self) -> f32 {
        self.score
    }

    /// Get the current status.
    pub fn status(&self) -> BeamStatus {
        self.status
    }

    /// Generated tokens so far.
    pub fn output_token_ids(&self) -> &[u32] {
        self.exec_req.output_token_ids()
    }

    /// Raw logits of the latest step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sampling`] if the backend has not produced logits.
    pub fn result_logits(&self) -> Result<&Tensor> {
        self.exec_req
            .result_logits()
            .ok_or_else(|| Error::Sampling(format!("beam {} has no logits", self.beam_id)))
    }

    /// Latest logits with temperature applied, converted to `target`.
    pub fn prepared_logits(&self, target: LogitsNormalization) -> Result<Vec<f32>> {
        let logits = apply_temperature(self.result_logits()?, self.decode_config.temperature)?;
        convert_logits_normalization(self.decode_config.logits_normalization, target, &logits)?
            .to_vec()
    }

    /// Record the token chosen for this step and its new cumulative score.
    pub fn advance(&mut self, token: u32, score: f32) {
        self.last_token = Some(token);
        self.score = score;
        self.exec_req.append_token(token);
    }

    /// Whether the latest token ends the hypothesis.
    pub fn reached_stop(&self) -> bool {
        let eos = self.decode_config.eos_token_id.is_some()
            && self.last_token == self.decode_config.eos_token_id;
        eos || self.exec_req.decode_steps() >= self.decode_config.max_completion_tokens
    }

    /// Copy this beam under a new ID with a forked cache allocation.
    pub fn fork(&self, beam_id: BeamId) -> Result<Self> {
        Ok(Self {
            beam_id,
            exec_req: self.exec_req.fork()?,
            decode_config: self.decode_config.clone(),
            last_token: self.last_token,
            score: self.score,
            status: BeamStatus::Active,
        })
    }

    /// Transition to completed, releasing the cache pages.
    pub fn complete(&mut self) -> Result<()> {
        self.finish(BeamStatus::Completed)
    }

    /// Transition to pruned, releasing the cache pages.
    pub fn prune(&mut self) -> Result<()> {
        self.finish(BeamStatus::Pruned)
    }

    fn finish(&mut self, to: BeamStatus) -> Result<()> {
        if self.status != BeamStatus::Active {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.exec_req.free_cache_pages()?;
        self.status = to;
        Ok(())
    }

    /// Release the cache pages unless that already happened.
    ///
    /// # Returns
    ///
    /// `true` if pages were released by this call.
    pub fn release_cache(&mut self) -> Result<bool> {
        if self.exec_req.is_cache_released() {
            return Ok(false);
        }
        self.exec_req.free_cache_pages()?;
        Ok(true)
    }
}
