//! Token sampling functions.
//!
//! Stateless building blocks the beam scorers compose each decode step:
//!
//! - **Temperature**: Controls randomness (lower = more deterministic)
//! - **Normalization**: Moves a row between raw, softmax and log-softmax
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k selection (optional)
//! Keep top k tokens, softmax over them
//!     │
//!     ▼ Top-p filtering (optional)
//! Smallest prefix with cumulative prob ≥ p
//!     │
//!     ▼ Weighted draw (sampling scorer only)
//! Selected token
//! ```
//!
//! Every function is deterministic and leaves its inputs untouched.

use std::cmp::Ordering;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::config::LogitsNormalization;
use crate::engine::logits::LogitsArray;
use crate::error::{Error, Result};

/// Divide logits by `temperature`.
///
/// At exactly 1.0 the logits are returned as-is without touching the
/// division primitive.
pub fn apply_temperature<L: LogitsArray>(logits: &L, temperature: f32) -> Result<L> {
    if temperature == 1.0 {
        return Ok(logits.clone());
    }
    if !(temperature > 0.0) {
        return Err(Error::Config(format!(
            "temperature must be > 0, got {temperature}"
        )));
    }
    logits.divide(f64::from(temperature))
}

/// Convert logits from the `current` normalization to `target`.
///
/// # Errors
///
/// Returns [`Error::UnsupportedConversion`] when asked to recover raw
/// logits from a normalized row.
pub fn convert_logits_normalization<L: LogitsArray>(
    current: LogitsNormalization,
    target: LogitsNormalization,
    logits: &L,
) -> Result<L> {
    use LogitsNormalization as N;

    match (current, target) {
        (from, to) if from == to => Ok(logits.clone()),
        (N::None, N::Softmax) => logits.softmax(),
        (N::None, N::LogSoftmax) => logits.log_softmax(),
        (N::Softmax, N::LogSoftmax) => logits.log(),
        (N::LogSoftmax, N::Softmax) => logits.exp(),
        (from, to) => Err(Error::UnsupportedConversion { from, to }),
    }
}

/// Normalize raw scores into probabilities, whatever their current state.
pub fn to_softmax(raw_scores: &[f32], normalization: LogitsNormalization) -> Vec<f32> {
    match normalization {
        LogitsNormalization::None => {
            let max = raw_scores
                .iter()
                .copied()
                .fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = raw_scores.iter().map(|&x| (x - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            if sum > 0.0 {
                exps.into_iter().map(|e| e / sum).collect()
            } else {
                exps
            }
        }
        LogitsNormalization::Softmax => raw_scores.to_vec(),
        LogitsNormalization::LogSoftmax => raw_scores.iter().map(|&x| x.exp()).collect(),
    }
}

/// Positions of `values` sorted by descending value; ties keep position order.
fn descending_order(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| match values[b].total_cmp(&values[a]) {
        Ordering::Equal => a.cmp(&b),
        ord => ord,
    });
    order
}

/// Select the `top_k` highest values, returning their tokens and raw values.
///
/// `indices` maps row positions to token IDs when the backend already
/// narrowed the vocabulary; without it the position is the token ID.
///
/// # Errors
///
/// Returns [`Error::Sampling`] if `indices` is shorter than the row.
pub fn select_top_k(
    logits: &[f32],
    indices: Option<&[u32]>,
    top_k: usize,
) -> Result<(Vec<u32>, Vec<f32>)> {
    let mut tokens = Vec::with_capacity(top_k.min(logits.len()));
    let mut values = Vec::with_capacity(tokens.capacity());
    for pos in descending_order(logits).into_iter().take(top_k) {
        let token = match indices {
            None => pos as u32,
            Some(ids) => *ids.get(pos).ok_or_else(|| {
                Error::Sampling(format!(
                    "{} token indices for {} logits",
                    ids.len(),
                    logits.len()
                ))
            })?,
        };
        tokens.push(token);
        values.push(logits[pos]);
    }
    Ok((tokens, values))
}

/// Top-k candidates with their probabilities, most likely first.
///
/// Probabilities are the softmax over the selected values, interpreted per
/// `normalization`. Returns `min(top_k, logits.len())` candidates.
pub fn sample_top_k(
    logits: &[f32],
    indices: Option<&[u32]>,
    top_k: usize,
    normalization: LogitsNormalization,
) -> Result<(Vec<u32>, Vec<f32>)> {
    let (tokens, values) = select_top_k(logits, indices, top_k)?;
    let probs = to_softmax(&values, normalization);
    Ok((tokens, probs))
}

/// Nucleus filtering over `(tokens, probs)`.
///
/// Keeps the smallest most-likely prefix whose cumulative probability reaches
/// `top_p`, but never fewer than `num_selections` candidates when that many
/// exist. With `top_p >= 1.0` every candidate is kept. Output is sorted by
/// descending probability; probabilities are only returned if `return_probs`.
///
/// # Errors
///
/// Returns [`Error::Sampling`] if `tokens` and `probs` differ in length.
pub fn sample_top_p(
    tokens: &[u32],
    probs: &[f32],
    top_p: f32,
    num_selections: usize,
    return_probs: bool,
) -> Result<(Vec<u32>, Option<Vec<f32>>)> {
    if tokens.len() != probs.len() {
        return Err(Error::Sampling(format!(
            "{} tokens for {} probabilities",
            tokens.len(),
            probs.len()
        )));
    }
    let order = descending_order(probs);

    let mut cutoff = order.len();
    if top_p < 1.0 {
        let mut cumulative = 0.0f32;
        for (i, &pos) in order.iter().enumerate() {
            cumulative += probs[pos];
            if cumulative >= top_p {
                cutoff = i + 1;
                break;
            }
        }
    }
    let cutoff = cutoff.max(num_selections.min(order.len()));

    let kept = &order[..cutoff];
    let kept_tokens = kept.iter().map(|&pos| tokens[pos]).collect();
    let kept_probs = return_probs.then(|| kept.iter().map(|&pos| probs[pos]).collect());
    Ok((kept_tokens, kept_probs))
}

/// Token with the highest value and that value.
pub fn argmax(logits: &[f32], indices: Option<&[u32]>) -> Result<Option<(u32, f32)>> {
    let (tokens, values) = select_top_k(logits, indices, 1)?;
    Ok(tokens.first().copied().zip(values.first().copied()))
}

/// Draw one candidate in proportion to its probability.
///
/// Returns the token and its renormalized probability.
pub fn draw_weighted<R: Rng + ?Sized>(
    tokens: &[u32],
    probs: &[f32],
    rng: &mut R,
) -> Result<(u32, f32)> {
    let dist = WeightedIndex::new(probs)
        .map_err(|e| Error::Sampling(format!("failed to create distribution: {e}")))?;
    let sum: f32 = probs.iter().sum();
    let idx = dist.sample(rng);
    Ok((tokens[idx], probs[idx] / sum))
}
