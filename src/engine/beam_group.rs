//! Beam groups: the hypotheses of one request.
//!
//! A [`BeamGroup`] partitions its beams into active and completed sets and
//! advances them one decode step at a time with [`BeamGroup::process_beams`].
//!
//! ## Decode Step
//!
//! ```text
//!   active beams ──► scorer.select_beams() ──► selections
//!                                                  │
//!        ┌─────────────────────┬───────────────────┼──────────────────┐
//!        ▼                     ▼                   ▼                  ▼
//!   not selected         selected once      selected n times    sampling failed
//!     prune()              advance()        fork() n-1 times     stays active
//!                              │             advance() each
//!                              ▼                   │
//!                      EOS or token limit? ◄───────┘
//!                        yes: complete()
//!                        no:  stays active
//! ```
//!
//! Every prune or completion releases that beam's pages exactly once;
//! [`BeamGroup::clean_up`] releases whatever is left.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::config::DecodeConfig;
use crate::core::exec_request::ExecRequest;
use crate::engine::beam::{Beam, BeamId};
use crate::engine::scorer::{scorer_for, BeamScorer, Selection, Selections};
use crate::error::{Error, Result};

/// Summary of one decode step.
#[derive(Debug, Default)]
pub struct StepReport {
    /// Beams that finished this step.
    pub completed: usize,
    /// Beams dropped this step.
    pub pruned: usize,
    /// Beams created by branching this step.
    pub forked: usize,
    /// Beams whose sampling failed; they stay active unchanged.
    pub failures: Vec<(BeamId, Error)>,
}

/// Active and completed hypotheses of one request.
pub struct BeamGroup {
    decode_config: DecodeConfig,
    active_beams: Vec<Beam>,
    completed_beams: Vec<Beam>,
    scorer: Box<dyn BeamScorer>,
    next_beam_id: BeamId,
}

impl BeamGroup {
    /// Create a group over `beams` using `scorer` for selection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if there are more beams than
    /// `decode_config.num_beams`.
    pub fn new(
        decode_config: DecodeConfig,
        beams: Vec<Beam>,
        scorer: Box<dyn BeamScorer>,
    ) -> Result<Self> {
        if beams.len() > decode_config.num_beams {
            return Err(Error::InvalidInput(format!(
                "{} beams for num_beams {}",
                beams.len(),
                decode_config.num_beams
            )));
        }
        let next_beam_id = beams
            .iter()
            .map(|beam| beam.beam_id() + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            decode_config,
            active_beams: beams,
            completed_beams: Vec::new(),
            scorer,
            next_beam_id,
        })
    }

    /// Create a group of `num_beams` beams from one request.
    ///
    /// The first beam takes `exec_req`; the others fork its allocation. The
    /// scorer is chosen from the configuration.
    pub fn from_exec_request(decode_config: DecodeConfig, exec_req: ExecRequest) -> Result<Self> {
        decode_config.validate()?;
        let mut exec_reqs = Vec::with_capacity(decode_config.num_beams);
        for _ in 1..decode_config.num_beams {
            exec_reqs.push(exec_req.fork()?);
        }
        exec_reqs.insert(0, exec_req);

        let beams = exec_reqs
            .into_iter()
            .zip(0..)
            .map(|(exec_req, beam_id)| Beam::new(beam_id, exec_req, decode_config.clone()))
            .collect();
        let scorer = scorer_for(&decode_config);
        Self::new(decode_config, beams, scorer)
    }

    /// Get the decode configuration.
    pub fn decode_config(&self) -> &DecodeConfig {
        &self.decode_config
    }

    /// Beams still generating.
    pub fn active_beams(&self) -> &[Beam] {
        &self.active_beams
    }

    /// Get mutable access to the active beams (to feed logits).
    pub fn active_beams_mut(&mut self) -> &mut [Beam] {
        &mut self.active_beams
    }

    /// Finished beams in completion order.
    pub fn completed_beams(&self) -> &[Beam] {
        &self.completed_beams
    }

    /// Number of active beams.
    pub fn active_beam_count(&self) -> usize {
        self.active_beams.len()
    }

    /// Number of completed beams.
    pub fn completed_beam_count(&self) -> usize {
        self.completed_beams.len()
    }

    /// Whether no beam is active.
    pub fn is_finished(&self) -> bool {
        self.active_beams.is_empty()
    }

    /// Replace the selection strategy.
    pub fn set_scorer(&mut self, scorer: Box<dyn BeamScorer>) {
        self.scorer = scorer;
    }

    /// Run one decode step.
    ///
    /// # Errors
    ///
    /// Hard failures only: an out-of-range index from the scorer, or a
    /// cache allocation released twice. Per-beam sampling failures are
    /// returned in the [`StepReport`]. Index errors are detected before any
    /// beam changes; after a release error the group should be discarded.
    pub fn process_beams(&mut self) -> Result<StepReport> {
        let mut report = StepReport::default();
        if self.active_beams.is_empty() {
            return Ok(report);
        }

        let Selections { chosen, failures } = self
            .scorer
            .select_beams(&self.active_beams, &self.completed_beams);

        let failed: HashSet<usize> = failures.iter().map(|(index, _)| *index).collect();
        let by_parent = self.group_selections(chosen, &failed)?;
        for (index, error) in failures {
            let Some(beam) = self.active_beams.get(index) else {
                return Err(Error::InvalidInput(format!(
                    "scorer reported failure for beam index {} of {}",
                    index,
                    self.active_beams.len()
                )));
            };
            warn!(beam = beam.beam_id(), %error, "beam sampling failed");
            report.failures.push((beam.beam_id(), error));
        }

        let previous = std::mem::take(&mut self.active_beams);
        for (index, mut beam) in previous.into_iter().enumerate() {
            if failed.contains(&index) {
                self.active_beams.push(beam);
                continue;
            }

            let picks = &by_parent[index];
            let Some((first, rest)) = picks.split_first() else {
                beam.prune()?;
                debug!(beam = beam.beam_id(), "pruned beam");
                report.pruned += 1;
                continue;
            };

            let mut branches = Vec::with_capacity(rest.len());
            for pick in rest {
                let mut fork = beam.fork(self.next_beam_id)?;
                self.next_beam_id += 1;
                fork.advance(pick.token, pick.score);
                branches.push(fork);
            }
            report.forked += branches.len();
            beam.advance(first.token, first.score);

            for mut beam in std::iter::once(beam).chain(branches) {
                if beam.reached_stop() {
                    beam.complete()?;
                    debug!(
                        beam = beam.beam_id(),
                        tokens = beam.output_token_ids().len(),
                        "completed beam"
                    );
                    self.completed_beams.push(beam);
                    report.completed += 1;
                } else {
                    self.active_beams.push(beam);
                }
            }
        }

        if self.is_finished() {
            info!(
                completed = self.completed_beams.len(),
                "beam group finished"
            );
        }
        Ok(report)
    }

    /// Suspend until every beam's completion signal is set.
    pub async fn wait(&self) {
        for beam in self.active_beams.iter().chain(&self.completed_beams) {
            beam.exec_req().done().wait().await;
        }
    }

    /// Release the cache pages of every beam that still holds them.
    ///
    /// Beams already released on completion or pruning are skipped, so
    /// repeated calls are safe.
    ///
    /// # Returns
    ///
    /// Number of allocations released by this call.
    pub fn clean_up(&mut self) -> Result<usize> {
        let mut released = 0;
        for beam in self
            .active_beams
            .iter_mut()
            .chain(self.completed_beams.iter_mut())
        {
            if beam.release_cache()? {
                released += 1;
            }
        }
        debug!(released, "cleaned up beam group");
        Ok(released)
    }

    /// Generated tokens of the best hypotheses, best first.
    ///
    /// Completed beams are ranked by score; if none completed the active
    /// beams are used instead.
    pub fn results(&self) -> Vec<Vec<u32>> {
        let pool = if self.completed_beams.is_empty() {
            &self.active_beams
        } else {
            &self.completed_beams
        };
        let mut ranked: Vec<&Beam> = pool.iter().collect();
        ranked.sort_by(|a, b| b.score().total_cmp(&a.score()));
        ranked
            .into_iter()
            .take(self.decode_config.num_beams)
            .map(|beam| beam.output_token_ids().to_vec())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_active_beams(&mut self, beams: Vec<Beam>) {
        self.active_beams = beams;
    }

    #[cfg(test)]
    pub(crate) fn set_completed_beams(&mut self, beams: Vec<Beam>) {
        self.completed_beams = beams;
    }

    /// Bucket selections by parent, dropping failed parents and anything
    /// beyond the remaining beam budget.
    fn group_selections(
        &self,
        chosen: Vec<Selection>,
        failed: &HashSet<usize>,
    ) -> Result<Vec<Vec<Selection>>> {
        let budget = self
            .decode_config
            .num_beams
            .saturating_sub(self.completed_beams.len())
            .saturating_sub(failed.len());

        let mut by_parent = vec![Vec::new(); self.active_beams.len()];
        let mut kept = 0;
        for selection in chosen {
            let Some(bucket) = by_parent.get_mut(selection.beam_index) else {
                return Err(Error::InvalidInput(format!(
                    "scorer selected beam index {} of {}",
                    selection.beam_index,
                    self.active_beams.len()
                )));
            };
            if failed.contains(&selection.beam_index) {
                continue;
            }
            if kept == budget {
                warn!(budget, "scorer selected more beams than the group can hold");
                break;
            }
            bucket.push(selection);
            kept += 1;
        }
        Ok(by_parent)
    }
}
