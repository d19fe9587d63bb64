//! Shared utility functions.

use regex::Regex;
use std::sync::LazyLock;
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Runs of characters that are not allowed in a branch slug.
static SLUG_SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Run blocking work (git2, filesystem copies) off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Lowercase, collapse every run of non-alphanumerics to a single `-`.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let slug = SLUG_SEPARATOR_RE.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "epic".to_string()
    } else {
        slug
    }
}

/// Keep only the last `max_lines` lines of collaborator output.
pub fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
