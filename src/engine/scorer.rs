//! Beam selection strategies.
//!
//! A [`BeamScorer`] looks at the active beams of a group once per decode step
//! and decides which hypotheses continue and with which token. Selecting the
//! same parent more than once branches it; a parent that is never selected is
//! pruned by the group.
//!
//! - [`GreedyScorer`]: each beam takes its most likely token
//! - [`SamplingScorer`]: each beam draws independently through top-k/top-p
//! - [`BeamSearchScorer`]: all beams compete on cumulative log-probability

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::{DecodeConfig, LogitsNormalization};
use crate::engine::beam::Beam;
use crate::engine::sampler::{argmax, draw_weighted, sample_top_k, sample_top_p, select_top_k};
use crate::error::{Error, Result};

/// One continuation chosen by a scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    /// Position of the parent beam in the active slice.
    pub beam_index: usize,
    /// Token appended to the parent.
    pub token: u32,
    /// Cumulative score after appending the token.
    pub score: f32,
}

/// Outcome of one scorer pass.
#[derive(Debug, Default)]
pub struct Selections {
    /// Continuations, best first.
    pub chosen: Vec<Selection>,
    /// Beams whose logits could not be sampled this step.
    pub failures: Vec<(usize, Error)>,
}

/// Strategy deciding which active beams survive a decode step.
pub trait BeamScorer: Send {
    /// Choose continuations for `active` given the already `completed` beams.
    fn select_beams(&mut self, active: &[Beam], completed: &[Beam]) -> Selections;
}

impl<F> BeamScorer for F
where
    F: FnMut(&[Beam], &[Beam]) -> Selections + Send,
{
    fn select_beams(&mut self, active: &[Beam], completed: &[Beam]) -> Selections {
        self(active, completed)
    }
}

/// Pick the scorer matching a decode configuration.
pub fn scorer_for(config: &DecodeConfig) -> Box<dyn BeamScorer> {
    if config.use_beam_search {
        Box::new(BeamSearchScorer)
    } else if config.top_k().is_some() || config.top_p().is_some() {
        Box::new(SamplingScorer::new())
    } else {
        Box::new(GreedyScorer)
    }
}

fn log_prob(prob: f32) -> f32 {
    prob.max(f32::MIN_POSITIVE).ln()
}

/// Each beam continues with its highest-probability token.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyScorer;

impl GreedyScorer {
    fn select_one(beam: &Beam) -> Result<(u32, f32)> {
        let log_probs = beam.prepared_logits(LogitsNormalization::LogSoftmax)?;
        argmax(&log_probs, beam.exec_req().result_indices())?
            .ok_or_else(|| Error::Sampling(format!("beam {} has empty logits", beam.beam_id())))
    }
}

impl BeamScorer for GreedyScorer {
    fn select_beams(&mut self, active: &[Beam], _completed: &[Beam]) -> Selections {
        let mut selections = Selections::default();
        for (beam_index, beam) in active.iter().enumerate() {
            match Self::select_one(beam) {
                Ok((token, log_prob)) => selections.chosen.push(Selection {
                    beam_index,
                    token,
                    score: beam.score() + log_prob,
                }),
                Err(e) => selections.failures.push((beam_index, e)),
            }
        }
        selections
    }
}

/// Each beam draws its next token independently.
///
/// Candidates are narrowed by top-k and then top-p when enabled, and one is
/// drawn in proportion to its probability.
#[derive(Debug, Clone)]
pub struct SamplingScorer {
    rng: StdRng,
}

impl Default for SamplingScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingScorer {
    /// Create a scorer seeded from system entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a scorer with a specific seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn select_one(&mut self, beam: &Beam) -> Result<(u32, f32)> {
        let config = beam.decode_config();
        let logits = beam.prepared_logits(config.logits_normalization)?;
        let top_k = config.top_k().unwrap_or(logits.len());
        let (tokens, probs) = sample_top_k(
            &logits,
            beam.exec_req().result_indices(),
            top_k,
            config.logits_normalization,
        )?;

        let (tokens, probs) = match config.top_p() {
            Some(top_p) => {
                let (tokens, probs) = sample_top_p(&tokens, &probs, top_p, 1, true)?;
                (tokens, probs.unwrap_or_default())
            }
            None => (tokens, probs),
        };

        draw_weighted(&tokens, &probs, &mut self.rng)
    }
}

impl BeamScorer for SamplingScorer {
    fn select_beams(&mut self, active: &[Beam], _completed: &[Beam]) -> Selections {
        let mut selections = Selections::default();
        for (beam_index, beam) in active.iter().enumerate() {
            match self.select_one(beam) {
                Ok((token, prob)) => selections.chosen.push(Selection {
                    beam_index,
                    token,
                    score: beam.score() + log_prob(prob),
                }),
                Err(e) => selections.failures.push((beam_index, e)),
            }
        }
        selections
    }
}

/// Joint selection over every active beam's continuations.
///
/// Each beam proposes its best candidates by log-probability; the group keeps
/// the overall best `num_beams - completed` by cumulative score.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeamSearchScorer;

impl BeamSearchScorer {
    fn candidates(beam: &Beam, beam_index: usize, width: usize) -> Result<Vec<Selection>> {
        let log_probs = beam.prepared_logits(LogitsNormalization::LogSoftmax)?;
        let width = beam
            .decode_config()
            .top_k()
            .map_or(width, |top_k| top_k.min(width));
        let (tokens, values) = select_top_k(&log_probs, beam.exec_req().result_indices(), width)?;
        Ok(tokens
            .into_iter()
            .zip(values)
            .map(|(token, log_prob)| Selection {
                beam_index,
                token,
                score: beam.score() + log_prob,
            })
            .collect())
    }
}

impl BeamScorer for BeamSearchScorer {
    fn select_beams(&mut self, active: &[Beam], completed: &[Beam]) -> Selections {
        let mut selections = Selections::default();
        let Some(first) = active.first() else {
            return selections;
        };
        let width = first
            .decode_config()
            .num_beams
            .saturating_sub(completed.len());

        for (beam_index, beam) in active.iter().enumerate() {
            match Self::candidates(beam, beam_index, width) {
                Ok(candidates) => selections.chosen.extend(candidates),
                Err(e) => selections.failures.push((beam_index, e)),
            }
        }

        // Stable sort: equal scores keep beam order, then token rank.
        selections
            .chosen
            .sort_by(|a, b| b.score.total_cmp(&a.score));
        selections.chosen.truncate(width);
        debug!(
            kept = selections.chosen.len(),
            width, "beam search selection"
        );
        selections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exec_request::ExecRequest;
    use crate::core::page_store::SharedPageStore;
    use candle_core::{Device, Tensor};
    use std::collections::HashSet;

    fn beam_with_logits(
        store: &SharedPageStore,
        beam_id: u64,
        config: &DecodeConfig,
        logits: &[f32],
    ) -> Beam {
        let mut exec_req = ExecRequest::new(vec![1], store.allocate(1).unwrap());
        exec_req.set_result_logits(Tensor::new(logits, &Device::Cpu).unwrap());
        Beam::new(beam_id, exec_req, config.clone())
    }

    /// Tokens chosen for one flat-logits beam over repeated passes.
    fn chosen_tokens(config: DecodeConfig, passes: usize) -> Vec<Vec<u32>> {
        let store = SharedPageStore::new(4);
        let beams = vec![beam_with_logits(&store, 0, &config, &[1.0; 4])];
        let mut scorer = scorer_for(&config);
        (0..passes)
            .map(|_| {
                let selections = scorer.select_beams(&beams, &[]);
                assert!(selections.failures.is_empty());
                selections.chosen.iter().map(|s| s.token).collect()
            })
            .collect()
    }

    #[test]
    fn test_scorer_for_default_is_greedy() {
        // Ties resolve to the lowest token on every pass.
        let passes = chosen_tokens(DecodeConfig::default(), 50);
        assert!(passes.iter().all(|tokens| tokens == &vec![0]));
    }

    #[test]
    fn test_scorer_for_top_k_samples() {
        let config = DecodeConfig {
            top_k: 4,
            ..Default::default()
        };
        let passes = chosen_tokens(config, 200);
        assert!(passes.iter().all(|tokens| tokens.len() == 1));

        let seen: HashSet<u32> = passes.into_iter().flatten().collect();
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_scorer_for_beam_search_branches() {
        let config = DecodeConfig {
            num_beams: 3,
            use_beam_search: true,
            ..Default::default()
        };
        // One active beam yields a continuation per open slot.
        let passes = chosen_tokens(config, 1);
        assert_eq!(passes[0], vec![0, 1, 2]);
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let store = SharedPageStore::new(4);
        let config = DecodeConfig::default();
        let beams = vec![
            beam_with_logits(&store, 0, &config, &[0.1, 0.2, 10.0, 0.4]),
            beam_with_logits(&store, 1, &config, &[5.0, 0.2, 0.3, 0.4]),
        ];

        let selections = GreedyScorer.select_beams(&beams, &[]);
        let tokens: Vec<u32> = selections.chosen.iter().map(|s| s.token).collect();
        assert_eq!(tokens, vec![2, 0]);
        assert!(selections.failures.is_empty());
        assert!(selections.chosen.iter().all(|s| s.score <= 0.0));
    }

    #[test]
    fn test_missing_logits_reported_per_beam() {
        let store = SharedPageStore::new(4);
        let config = DecodeConfig::default();
        let beams = vec![
            beam_with_logits(&store, 0, &config, &[0.1, 3.0]),
            Beam::new(
                1,
                ExecRequest::new(vec![1], store.allocate(1).unwrap()),
                config.clone(),
            ),
        ];

        let selections = GreedyScorer.select_beams(&beams, &[]);
        assert_eq!(selections.chosen.len(), 1);
        assert_eq!(selections.failures.len(), 1);
        assert_eq!(selections.failures[0].0, 1);
    }

    #[test]
    fn test_sampling_respects_top_k() {
        let store = SharedPageStore::new(4);
        let config = DecodeConfig {
            top_k: 2,
            ..Default::default()
        };
        let beams = vec![beam_with_logits(
            &store,
            0,
            &config,
            &[0.1, 0.2, 0.3, 10.0, 9.0],
        )];

        let mut scorer = SamplingScorer::with_seed(42);
        for _ in 0..50 {
            let selections = scorer.select_beams(&beams, &[]);
            let token = selections.chosen[0].token;
            assert!(token == 3 || token == 4);
        }
    }

    #[test]
    fn test_sampling_reproducible_with_seed() {
        let store = SharedPageStore::new(4);
        let config = DecodeConfig {
            top_p: 0.99,
            ..Default::default()
        };
        let beams = vec![beam_with_logits(&store, 0, &config, &[1.0; 8])];

        let mut a = SamplingScorer::with_seed(12345);
        let mut b = SamplingScorer::with_seed(12345);
        for _ in 0..10 {
            assert_eq!(
                a.select_beams(&beams, &[]).chosen[0].token,
                b.select_beams(&beams, &[]).chosen[0].token
            );
        }
    }

    #[test]
    fn test_beam_search_branches_best_parent() {
        let store = SharedPageStore::new(4);
        let config = DecodeConfig {
            num_beams: 2,
            use_beam_search: true,
            ..Default::default()
        };
        // Beam 0 is confident in two tokens; beam 1 is flat.
        let beams = vec![
            beam_with_logits(&store, 0, &config, &[10.0, 10.0, -10.0, -10.0]),
            beam_with_logits(&store, 1, &config, &[0.0, 0.0, 0.0, 0.0]),
        ];

        let selections = BeamSearchScorer.select_beams(&beams, &[]);
        assert_eq!(selections.chosen.len(), 2);
        assert!(selections.chosen.iter().all(|s| s.beam_index == 0));
        assert_eq!(selections.chosen[0].token, 0);
        assert_eq!(selections.chosen[1].token, 1);
    }

    #[test]
    fn test_beam_search_width_shrinks_with_completed() {
        let store = SharedPageStore::new(4);
        let config = DecodeConfig {
            num_beams: 3,
            use_beam_search: true,
            ..Default::default()
        };
        let active = vec![beam_with_logits(&store, 0, &config, &[1.0, 2.0, 3.0, 4.0])];
        let completed = vec![
            beam_with_logits(&store, 1, &config, &[0.0]),
            beam_with_logits(&store, 2, &config, &[0.0]),
        ];

        let selections = BeamSearchScorer.select_beams(&active, &completed);
        assert_eq!(selections.chosen.len(), 1);
        assert_eq!(selections.chosen[0].token, 3);
    }
}
