use std::path::PathBuf;
use tracing::debug;

/// Retrieval-backed knowledge provider for the strict-mode critic: pulls
/// short excerpts out of the adapter's `docs_manifest` instead of baking
/// domain exemplars into the prompt.
pub struct KnowledgeProvider {
    manifest: Vec<PathBuf>,
    max_chars: usize,
}

impl KnowledgeProvider {
    pub fn new(manifest: Vec<PathBuf>) -> Self {
        Self {
            manifest,
            max_chars: 2_000,
        }
    }

    /// Lines from the manifest docs that share a keyword with the query,
    /// capped. Returns `None` when nothing matches or no docs exist.
    pub fn excerpt(&self, query: &str) -> Option<String> {
        let keywords: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() >= 3)
            .map(String::from)
            .collect();
        if keywords.is_empty() {
            return None;
        }

        let mut excerpt = String::new();
        for path in &self.manifest {
            let Ok(content) = std::fs::read_to_string(path) else {
                debug!(?path, "skipping unreadable doc in manifest");
                continue;
            };
            for line in content.lines() {
                let lower = line.to_lowercase();
                if keywords.iter().any(|k| lower.contains(k)) {
                    excerpt.push_str(line.trim());
                    excerpt.push('\n');
                    if excerpt.len() >= self.max_chars {
                        return Some(excerpt);
                    }
                }
            }
        }

        if excerpt.is_empty() {
            None
        } else {
            Some(excerpt)
        }
    }
}
