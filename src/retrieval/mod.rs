//! # Retrieval Engine
//!
//! Turns transcript text into ranked evidence for a question:
//!
//! 1. Segment the transcript into sentences
//! 2. Embed the question and every sentence, rank sentences by cosine
//!    similarity (descending)
//! 3. Keep sentences strictly above a similarity cutoff, deduplicating
//!    near-identical ones, and join the survivors into a context block
//!
//! Because the ranking is score-sorted, the walk in
//! [`select_evidence`] stops at the first sentence at or below the cutoff.
//! Raising the cutoff can only shrink the surviving set, which is what the
//! adaptive retry in [`context`] relies on.

pub mod context;

/// Context handed to generation when nothing relevant was retrieved.
pub const NO_CONTEXT_PLACEHOLDER: &str =
    "Tidak ada informasi relevan ditemukan dalam transkrip.";

/// Visible separator between evidence sentences in the generated context.
pub const CONTEXT_SEPARATOR: &str = "\n---\n";

/// A transcript sentence with its similarity to the question.
#[derive(Debug, Clone)]
pub struct RankedSentence {
    pub text: String,
    pub score: f32,
}

/// Abbreviations common in the clinical transcripts that end with a period
/// but don't end a sentence.
const NON_TERMINAL_ABBREVIATIONS: &[&str] = &[
    "dr", "drg", "prof", "sdr", "ny", "tn", "an", "no", "hal", "dll", "dsb", "yth",
];

/// Split text into sentences on terminal punctuation and newlines.
///
/// A period only terminates when followed by whitespace (so decimals like
/// "37.5" survive) and when the word before it isn't a known abbreviation.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }

        current.push(c);

        if matches!(c, '.' | '!' | '?') {
            let next_is_boundary = chars
                .get(i + 1)
                .map(|n| n.is_whitespace())
                .unwrap_or(true);

            if next_is_boundary && !(c == '.' && ends_with_abbreviation(&current)) {
                push_sentence(&mut sentences, &mut current);
            }
        }
    }

    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

fn ends_with_abbreviation(text: &str) -> bool {
    let without_period = text.trim_end_matches('.');
    let last_word = without_period
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    NON_TERMINAL_ABBREVIATIONS
        .iter()
        .any(|abbr| last_word.eq_ignore_ascii_case(abbr))
}

/// Cosine similarity between two embedding vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a < 1e-10 || mag_b < 1e-10 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Score every sentence against the question embedding and sort descending.
///
/// The sort is stable, so equally-scored sentences keep transcript order.
pub fn rank_sentences(
    question_embedding: &[f32],
    sentences: Vec<String>,
    sentence_embeddings: &[Vec<f32>],
) -> Vec<RankedSentence> {
    let mut ranked: Vec<RankedSentence> = sentences
        .into_iter()
        .zip(sentence_embeddings.iter())
        .map(|(text, embedding)| RankedSentence {
            score: cosine_similarity(question_embedding, embedding),
            text,
        })
        .collect();

    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// Walk the score-sorted list and keep sentences strictly above `threshold`.
///
/// Sentences that differ only in case or surrounding whitespace count as
/// duplicates; the first (highest-ranked) occurrence wins and keeps its
/// original text. The walk stops at the first sentence at or below the
/// threshold; everything after it scores no higher.
pub fn select_evidence(ranked: &[RankedSentence], threshold: f32) -> Vec<String> {
    let mut evidence = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for sentence in ranked {
        if sentence.score <= threshold {
            break;
        }

        let normalized = sentence.text.trim().to_lowercase();
        if !seen.insert(normalized) {
            continue;
        }

        evidence.push(sentence.text.clone());
    }

    evidence
}

/// Join retained evidence in rank order, or fall back to the placeholder.
pub fn build_context(evidence: &[String]) -> String {
    if evidence.is_empty() {
        NO_CONTEXT_PLACEHOLDER.to_string()
    } else {
        evidence.join(CONTEXT_SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(entries: &[(&str, f32)]) -> Vec<RankedSentence> {
        let mut list: Vec<RankedSentence> = entries
            .iter()
            .map(|(text, score)| RankedSentence {
                text: text.to_string(),
                score: *score,
            })
            .collect();
        list.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        list
    }

    #[test]
    fn test_sentence_splitting() {
        let text = "Nama pasien Siti. Usia 30 tahun! Apakah ada keluhan?";
        let sentences = split_sentences(text);
        assert_eq!(
            sentences,
            vec!["Nama pasien Siti.", "Usia 30 tahun!", "Apakah ada keluhan?"]
        );
    }

    #[test]
    fn test_sentence_splitting_keeps_decimals_and_abbreviations() {
        let text = "Suhu badan 37.5 derajat. Diperiksa oleh dr. Andi kemarin.";
        let sentences = split_sentences(text);
        assert_eq!(
            sentences,
            vec![
                "Suhu badan 37.5 derajat.",
                "Diperiksa oleh dr. Andi kemarin."
            ]
        );
    }

    #[test]
    fn test_sentence_splitting_on_newlines() {
        let sentences = split_sentences("Baris pertama\nBaris kedua.\n\nBaris ketiga");
        assert_eq!(sentences, vec!["Baris pertama", "Baris kedua.", "Baris ketiga"]);
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[2.0, 0.0], &[5.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_ranking_sorts_descending() {
        let question = vec![1.0, 0.0];
        let sentences = vec!["jauh".to_string(), "dekat".to_string(), "tengah".to_string()];
        let embeddings = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.7, 0.7]];

        let ranked = rank_sentences(&question, sentences, &embeddings);
        assert_eq!(ranked[0].text, "dekat");
        assert_eq!(ranked[1].text, "tengah");
        assert_eq!(ranked[2].text, "jauh");
    }

    #[test]
    fn test_selection_is_strictly_above_threshold() {
        let list = ranked(&[("a", 0.50), ("b", 0.40), ("c", 0.30)]);
        // 0.40 is not strictly greater than 0.40
        assert_eq!(select_evidence(&list, 0.4), vec!["a"]);
        assert_eq!(select_evidence(&list, 0.3), vec!["a", "b"]);
        assert!(select_evidence(&list, 0.6).is_empty());
    }

    #[test]
    fn test_monotonic_shrink_across_thresholds() {
        let list = ranked(&[
            ("satu", 0.92),
            ("dua", 0.55),
            ("tiga", 0.45),
            ("empat", 0.35),
            ("lima", 0.10),
        ]);

        let thresholds = [0.3f32, 0.4, 0.5, 0.9];
        let mut previous: Option<Vec<String>> = None;
        for threshold in thresholds {
            let current = select_evidence(&list, threshold);
            if let Some(previous) = &previous {
                // Later (stricter) thresholds keep a subset of the earlier set.
                assert!(current.iter().all(|s| previous.contains(s)));
                assert!(current.len() <= previous.len());
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_dedupe_ignores_case_and_whitespace() {
        let list = ranked(&[
            ("Obat diminum pagi.", 0.9),
            ("  obat diminum pagi.  ", 0.8),
            ("OBAT DIMINUM PAGI.", 0.7),
            ("Dosis setengah tablet.", 0.6),
        ]);

        let evidence = select_evidence(&list, 0.3);
        assert_eq!(evidence, vec!["Obat diminum pagi.", "Dosis setengah tablet."]);
    }

    #[test]
    fn test_context_join_and_placeholder() {
        assert_eq!(build_context(&[]), NO_CONTEXT_PLACEHOLDER);

        let joined = build_context(&["a".to_string(), "b".to_string()]);
        assert_eq!(joined, "a\n---\nb");
    }
}
