//! HTTP request handlers.

pub mod questions;
pub mod transcripts;

/// Keep only filesystem-safe characters, the way uploads are named on disk.
pub(crate) fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect::<String>()
        .trim()
        .to_string()
}
