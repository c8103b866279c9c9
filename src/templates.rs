//! # Question Templates
//!
//! When a transcription completes, a fixed battery of follow-up questions is
//! queued against the new transcript. The battery lives in a plain text
//! file so clinicians can edit it without redeploying:
//!
//! ```text
//! # comment lines and blanks are skipped
//! Identitas|Siapa nama dan berapa usia pasien?
//! Obat|Obat apa saja yang sedang diminum pasien?
//! ```
//!
//! A missing file is not an error: the transcription still completes, a
//! warning is logged and no questions are queued.

use std::path::Path;

/// One template entry: a short label and the question prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionTemplate {
    pub label: String,
    pub prompt: String,
}

impl QuestionTemplate {
    /// The question text queued for the Q&A pipeline.
    pub fn question_text(&self) -> String {
        format!("{}: {}", self.label, self.prompt)
    }
}

/// Load templates in file order. Missing file → empty list plus a warning.
pub fn load_templates(path: &Path) -> Vec<QuestionTemplate> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(
                "Question template file {} not readable ({}); no follow-up questions will be queued",
                path.display(),
                e
            );
            return Vec::new();
        }
    };

    parse_templates(&content)
}

fn parse_templates(content: &str) -> Vec<QuestionTemplate> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }

            match line.split_once('|') {
                Some((label, prompt)) if !label.trim().is_empty() && !prompt.trim().is_empty() => {
                    Some(QuestionTemplate {
                        label: label.trim().to_string(),
                        prompt: prompt.trim().to_string(),
                    })
                }
                _ => {
                    tracing::warn!("Skipping malformed question template line: {:?}", line);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_preserves_order() {
        let content = "\
# Pertanyaan standar wawancara TB
Identitas|Siapa nama dan berapa usia pasien?

Obat|Obat apa saja yang sedang diminum pasien?
Alergi|Apakah pasien memiliki riwayat alergi?
";
        let templates = parse_templates(content);
        assert_eq!(templates.len(), 3);
        assert_eq!(templates[0].label, "Identitas");
        assert_eq!(templates[1].label, "Obat");
        assert_eq!(templates[2].label, "Alergi");
        assert_eq!(
            templates[0].question_text(),
            "Identitas: Siapa nama dan berapa usia pasien?"
        );
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let content = "tanpa pemisah\n|prompt kosong label\nlabel kosong prompt|\nOk|beneran";
        let templates = parse_templates(content);
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].label, "Ok");
    }

    #[test]
    fn test_missing_file_is_not_fatal() {
        let templates = load_templates(Path::new("/nonexistent/questions.txt"));
        assert!(templates.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Berat|Berapa berat badan pasien?").unwrap();

        let templates = load_templates(file.path());
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].prompt, "Berapa berat badan pasien?");
    }
}
