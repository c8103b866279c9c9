//! # Answer Confidence Scoring
//!
//! Derives a reliability score for a generated answer purely from the answer
//! and the context it was generated from. No reference corpus, no model in
//! the loop, byte-identical inputs always give the same score.
//!
//! ## Rules:
//! - Empty answer (no tokens after normalization) → 0.0
//! - Answer matching a known "no information" fallback phrase → 1.0: an
//!   explicit admission of absence is treated as maximally reliable
//! - Otherwise → fraction of answer tokens that also occur in the context
//!
//! This is a lexical-overlap proxy, not a translation-quality metric. It
//! catches the failure mode that matters here: answers inventing facts the
//! retrieved context never mentioned.

use std::collections::HashSet;

/// The phrases the generation prompt instructs the model to emit when the
/// context holds no answer.
pub const FALLBACK_PHRASES: &[&str] = &[
    "Maaf, informasi tersebut tidak ditemukan dalam transkrip ini.",
    "Tidak ada informasi dalam transkrip.",
    "Tidak ada informasi relevan ditemukan dalam transkrip.",
];

/// Lowercase, punctuation-stripped word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// True when the answer is one of the fallback phrases, compared on
/// normalized tokens so punctuation and casing differences don't matter.
fn is_fallback_phrase(answer_tokens: &[String]) -> bool {
    FALLBACK_PHRASES
        .iter()
        .any(|phrase| tokenize(phrase) == answer_tokens)
}

/// Score an answer against the context it was generated from. Always in
/// [0.0, 1.0].
pub fn confidence(answer: &str, context: &str) -> f64 {
    let answer_tokens = tokenize(answer);

    if answer_tokens.is_empty() {
        return 0.0;
    }

    if is_fallback_phrase(&answer_tokens) {
        return 1.0;
    }

    let context_tokens: HashSet<String> = tokenize(context).into_iter().collect();
    let grounded = answer_tokens
        .iter()
        .filter(|t| context_tokens.contains(*t))
        .count();

    grounded as f64 / answer_tokens.len() as f64
}
