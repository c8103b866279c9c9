//! # Adaptive Context Schedule
//!
//! The generation model has a hard context budget, but how much retrieved
//! evidence fits is only known once generation accepts or rejects a prompt.
//! The schedule turns the ranked sentence list and the configured ascending
//! threshold list into a sequence of attempts: each attempt's cutoff is
//! stricter than the last, so each context is a subset of the previous one.
//! The Q&A pipeline walks the attempts until generation succeeds or the
//! schedule is exhausted.
//!
//! Similarity filtering is monotonic in the threshold, which makes this a
//! bounded, convergent retry strategy rather than guesswork.

use crate::retrieval::{build_context, select_evidence, RankedSentence};

/// One entry of the retry schedule.
#[derive(Debug, Clone)]
pub struct ContextAttempt {
    /// Similarity cutoff used for this attempt.
    pub threshold: f32,
    /// The context produced at this cutoff (placeholder when no evidence
    /// survived).
    pub context: String,
    /// How many evidence sentences survived the cutoff.
    pub evidence_count: usize,
    /// True for the final, strictest attempt.
    pub is_last: bool,
}

/// Ranked sentences plus the ascending threshold list.
#[derive(Debug)]
pub struct ContextSchedule {
    ranked: Vec<RankedSentence>,
    thresholds: Vec<f32>,
}

impl ContextSchedule {
    /// Build a schedule. The threshold list is assumed non-empty and
    /// strictly ascending (enforced by configuration validation).
    pub fn new(ranked: Vec<RankedSentence>, thresholds: Vec<f32>) -> Self {
        Self { ranked, thresholds }
    }

    pub fn attempt_count(&self) -> usize {
        self.thresholds.len()
    }

    /// The attempt at the given position, or `None` past the end.
    pub fn attempt(&self, index: usize) -> Option<ContextAttempt> {
        let threshold = *self.thresholds.get(index)?;
        let evidence = select_evidence(&self.ranked, threshold);

        Some(ContextAttempt {
            threshold,
            evidence_count: evidence.len(),
            context: build_context(&evidence),
            is_last: index + 1 == self.thresholds.len(),
        })
    }

    /// Iterate attempts from most lenient to strictest.
    pub fn attempts(&self) -> impl Iterator<Item = ContextAttempt> + '_ {
        (0..self.attempt_count()).filter_map(|i| self.attempt(i))
    }
}
