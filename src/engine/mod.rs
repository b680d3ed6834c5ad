//! Decode engine.
//!
//! This module contains:
//! - Logits abstraction over the compute backend's arrays
//! - Sampler functions for temperature, normalization, top-k and top-p
//! - Beams and beam groups advancing one decode step at a time
//! - Scorers deciding which beams survive each step

pub mod beam;
pub mod beam_group;
pub mod logits;
pub mod sampler;
pub mod scorer;

pub use beam::{Beam, BeamId, BeamStatus};
pub use beam_group::{BeamGroup, StepReport};
pub use logits::LogitsArray;
pub use scorer::{
    scorer_for, BeamScorer, BeamSearchScorer, GreedyScorer, SamplingScorer, Selection, Selections,
};
