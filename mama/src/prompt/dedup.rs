//! Content deduplication for injected prompt material.
//!
//! Entries are keyed by a 16-hex content hash and the canonical real path, so
//! two symlinked paths to the same file collapse into one entry. Lower
//! distance means more relevant; on any collision the smaller distance wins.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// One deduplicated piece of content.
#[derive(Debug, Clone)]
pub struct ContentEntry {
    /// Path as given by the caller.
    pub path: String,
    /// Canonical real path; falls back to the given path when resolution fails.
    pub real_path: PathBuf,
    pub content: String,
    /// Relevance score, lower is better.
    pub distance: f64,
    /// First 16 hex chars of the SHA-256 of the content.
    pub hash: String,
}

/// What [`ContentDeduplicator::add`] did with the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// An existing entry with the same hash or real path was replaced because
    /// the candidate is closer.
    Replaced,
    Rejected,
}

/// Hash/realpath-based suppression of duplicate injected content.
#[derive(Default)]
pub struct ContentDeduplicator {
    entries: Vec<ContentEntry>,
}

fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

fn resolve_real_path(path: &str) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path))
}

impl ContentDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &str, content: &str, distance: f64) -> AddOutcome {
        let hash = content_hash(content);
        let real_path = resolve_real_path(path);

        if let Some(pos) = self.entries.iter().position(|e| e.hash == hash) {
            // Same content seen, possibly via another path or symlink.
            if distance < self.entries[pos].distance {
                self.entries[pos] = ContentEntry {
                    path: path.to_string(),
                    real_path,
                    content: content.to_string(),
                    distance,
                    hash,
                };
                return AddOutcome::Replaced;
            }
            return AddOutcome::Rejected;
        }

        if let Some(pos) = self.entries.iter().position(|e| e.real_path == real_path) {
            // Same file, different content: it changed between reads.
            if distance < self.entries[pos].distance {
                self.entries[pos] = ContentEntry {
                    path: path.to_string(),
                    real_path,
                    content: content.to_string(),
                    distance,
                    hash,
                };
                return AddOutcome::Replaced;
            }
            return AddOutcome::Rejected;
        }

        self.entries.push(ContentEntry {
            path: path.to_string(),
            real_path,
            content: content.to_string(),
            distance,
            hash,
        });
        AddOutcome::Inserted
    }

    /// Entries sorted by ascending distance.
    pub fn entries(&self) -> Vec<&ContentEntry> {
        let mut out: Vec<&ContentEntry> = self.entries.iter().collect();
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
