//! Configuration types for nano-decode.
//!
//! These are read-only inputs: the model geometry fixes the page arithmetic,
//! and a [`DecodeConfig`] fixes how one request's beams are sampled.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of the paged KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheDtype {
    Float16,
    Bfloat16,
    Float32,
}

impl KvCacheDtype {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Float16 | Self::Bfloat16 => 2,
            Self::Float32 => 4,
        }
    }
}

/// Paged KV cache parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedKVCacheParams {
    /// Tokens stored per page.
    pub block_seq_stride: usize,
    /// Number of key/value heads.
    pub attention_head_count_kv: usize,
    /// Total number of pages on the device.
    pub device_block_count: usize,
    /// Cache element type.
    pub kv_cache_dtype: KvCacheDtype,
}

impl Default for PagedKVCacheParams {
    fn default() -> Self {
        Self {
            block_seq_stride: 16,
            attention_head_count_kv: 8,
            device_block_count: 256,
            kv_cache_dtype: KvCacheDtype::Float16,
        }
    }
}

/// Model parameters consumed by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Maximum sequence length.
    pub max_seq_len: usize,
    /// Number of transformer blocks (each holds its own K and V per page).
    pub transformer_block_count: usize,
    /// Attention head dimension.
    pub attn_head_dim: usize,
    /// Batch sizes compiled for prefill.
    pub prefill_batch_sizes: Vec<usize>,
    /// Batch sizes compiled for decode.
    pub decode_batch_sizes: Vec<usize>,
    /// Top-k the compiled sampling path was built for (-1 = disabled).
    pub top_k: i32,
    /// Paged KV cache geometry.
    pub paged_kv_cache: PagedKVCacheParams,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            max_seq_len: 2048,
            transformer_block_count: 22,
            attn_head_dim: 64,
            prefill_batch_sizes: vec![4],
            decode_batch_sizes: vec![4],
            top_k: -1,
            paged_kv_cache: PagedKVCacheParams::default(),
        }
    }
}

impl ModelParams {
    /// Parse model parameters from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Tokens per page.
    pub fn block_seq_stride(&self) -> usize {
        self.paged_kv_cache.block_seq_stride
    }

    /// Bytes occupied by one page across all transformer blocks (K and V).
    pub fn page_size_bytes(&self) -> usize {
        let cache = &self.paged_kv_cache;
        self.transformer_block_count
            * 2
            * cache.attention_head_count_kv
            * self.attn_head_dim
            * cache.block_seq_stride
            * cache.kv_cache_dtype.size_in_bytes()
    }
}

/// Representation state of a logits row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogitsNormalization {
    /// Raw model scores.
    #[default]
    None,
    /// Probabilities.
    Softmax,
    /// Log-probabilities.
    LogSoftmax,
}

/// Per-request decoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Number of hypotheses kept for the request.
    pub num_beams: usize,
    /// Top-k candidates (-1 = disabled).
    pub top_k: i32,
    /// Nucleus mass (>= 1.0 = disabled).
    pub top_p: f32,
    /// Temperature applied to raw logits.
    pub temperature: f32,
    /// Score hypotheses jointly instead of sampling each independently.
    pub use_beam_search: bool,
    /// Normalization the backend already applied to `result_logits`.
    pub logits_normalization: LogitsNormalization,
    /// Maximum number of generated tokens per beam.
    pub max_completion_tokens: usize,
    /// End-of-sequence token.
    pub eos_token_id: Option<u32>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            num_beams: 1,
            top_k: -1,
            top_p: 1.0,
            temperature: 1.0,
            use_beam_search: false,
            logits_normalization: LogitsNormalization::None,
            max_completion_tokens: 256,
            eos_token_id: None,
        }
    }
}

impl DecodeConfig {
    /// Top-k if enabled.
    pub fn top_k(&self) -> Option<usize> {
        (self.top_k > 0).then_some(self.top_k as usize)
    }

    /// Top-p if enabled.
    pub fn top_p(&self) -> Option<f32> {
        (self.top_p > 0.0 && self.top_p < 1.0).then_some(self.top_p)
    }

    /// Check the documented value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            return Err(Error::Config("num_beams must be at least 1".into()));
        }
        if self.top_k == 0 || self.top_k < -1 {
            return Err(Error::Config(format!(
                "top_k must be positive or -1, got {}",
                self.top_k
            )));
        }
        if !(self.top_p > 0.0) {
            return Err(Error::Config(format!("top_p must be > 0, got {}", self.top_p)));
        }
        if !(self.temperature > 0.0) {
            return Err(Error::Config(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if self.max_completion_tokens == 0 {
            return Err(Error::Config("max_completion_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

/// Request queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of requests tracked at once.
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_queue_size: 128 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_config_defaults_validate() {
        let config = DecodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.top_k(), None);
        assert_eq!(config.top_p(), None);
    }

    #[test]
    fn test_decode_config_rejects_bad_values() {
        let zero_beams = DecodeConfig {
            num_beams: 0,
            ..Default::default()
        };
        assert!(zero_beams.validate().is_err());

        let zero_top_k = DecodeConfig {
            top_k: 0,
            ..Default::default()
        };
        assert!(zero_top_k.validate().is_err());

        let cold = DecodeConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(cold.validate().is_err());
    }

    #[test]
    fn test_top_p_disabled_at_one() {
        let config = DecodeConfig {
            top_p: 0.9,
            ..Default::default()
        };
        assert_eq!(config.top_p(), Some(0.9));

        let config = DecodeConfig {
            top_p: 1.0,
            ..Default::default()
        };
        assert_eq!(config.top_p(), None);
    }

    #[test]
    fn test_model_params_from_json() {
        let json = r#"{
            "max_seq_len": 512,
            "transformer_block_count": 2,
            "attn_head_dim": 4,
            "prefill_batch_sizes": [4],
            "decode_batch_sizes": [2],
            "top_k": 5,
            "paged_kv_cache": {
                "block_seq_stride": 2,
                "attention_head_count_kv": 3,
                "device_block_count": 100,
                "kv_cache_dtype": "float16"
            }
        }"#;
        let params = ModelParams::from_json(json).unwrap();
        assert_eq!(params.top_k, 5);
        assert_eq!(params.block_seq_stride(), 2);
        // 2 blocks * (K, V) * 3 heads * 4 dim * 2 tokens * 2 bytes
        assert_eq!(params.page_size_bytes(), 2 * 2 * 3 * 4 * 2 * 2);
    }
}
