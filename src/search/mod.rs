//! Semantic code search collaborators.
//!
//! The executor only consumes the [`Embedder`] and [`VectorStore`] seams;
//! the engine ranks the indexed files by cosine similarity against the
//! embedded query and renders a human-readable result block. Index
//! population is driven externally (the repository bootstrapper) through
//! [`SearchEngine::index`].

pub mod embedding;
pub mod store;

use crate::{
    config::SearchSettings,
    error::{CommandError, ErrorKind},
    search::{embedding::HttpEmbedder, store::SledVectorStore},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// Largest file read back for line counts and previews.
const PREVIEW_READ_CAP: u64 = 256 * 1024;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text into a fixed-dimensionality vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The configured dimensionality.
    fn dimensions(&self) -> usize;
}

/// One indexed file, keyed by repo-relative path.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IndexedFile {
    pub path: String,
    pub content_hash: String,
    pub vector: Vec<f32>,
    pub mtime: i64,
    pub size: u64,
    pub indexed_at: DateTime<Utc>,
}

pub trait VectorStore: Send + Sync {
    fn upsert(&self, entry: &IndexedFile) -> Result<()>;
    fn get(&self, path: &str) -> Result<Option<IndexedFile>>;
    fn remove(&self, path: &str) -> Result<()>;
    fn entries(&self) -> Result<Vec<IndexedFile>>;
}

/// A ranked search hit.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub path: String,
    pub score: f32,
    pub line_count: usize,
    pub size: u64,
    pub preview: Option<String>,
}

/// The outcome of one query.
#[derive(Clone, Debug)]
pub struct SearchReport {
    pub query: String,
    pub duration: Duration,
    pub hits: Vec<SearchHit>,
    /// More candidates existed than the configured maximum.
    pub truncated: bool,
}

impl SearchReport {
    /// Render the result block shown to the LLM.
    pub fn format(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Search: {}\n", self.query));
        out.push_str(&format!("Duration: {:.2}s\n", self.duration.as_secs_f64()));

        if self.hits.is_empty() {
            out.push_str("No results.\n");
            return out;
        }

        out.push_str("Results:\n");
        for (rank, hit) in self.hits.iter().enumerate() {
            out.push_str(&format!(
                "  {}. {} (score: {:.1}, {} lines, {})\n",
                rank + 1,
                hit.path,
                hit.score * 100.0,
                hit.line_count,
                human_size(hit.size),
            ));
            if let Some(preview) = &hit.preview {
                out.push_str(&format!("     > {}\n", preview));
            }
        }
        if self.truncated {
            out.push_str("  ...\n");
        }
        out
    }
}

pub struct SearchEngine {
    embedder: Box<dyn Embedder>,
    store: Box<dyn VectorStore>,
    repo_root: PathBuf,
    max_results: usize,
}

impl SearchEngine {
    pub fn new(
        embedder: Box<dyn Embedder>,
        store: Box<dyn VectorStore>,
        repo_root: PathBuf,
        max_results: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            repo_root,
            max_results: max_results.max(1),
        }
    }

    /// Assemble the production engine from configuration.
    pub fn from_settings(settings: &SearchSettings, repo_root: &Path) -> Result<Self> {
        let store = SledVectorStore::open(&repo_root.join(settings.index_path())).map_err(|e| {
            CommandError::new(
                ErrorKind::SearchInitFailed,
                format!("open vector index: {e:#}"),
            )
        })?;
        let embedder = HttpEmbedder::new(
            settings.endpoint().clone(),
            settings.model().clone(),
            settings.dimensions(),
        );

        Ok(Self::new(
            Box::new(embedder),
            Box::new(store),
            repo_root.to_path_buf(),
            settings.max_results(),
        ))
    }

    /// Embed and upsert one file.
    pub async fn index(&self, relative_path: &str, content: &str) -> Result<()> {
        let vector = self
            .embedder
            .embed(content)
            .await
            .with_context(|| format!("embed {relative_path}"))?;

        let absolute = self.repo_root.join(relative_path);
        let (mtime, size) = match std::fs::metadata(&absolute) {
            Ok(metadata) => (
                metadata
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default(),
                metadata.len(),
            ),
            Err(_) => (0, content.len() as u64),
        };

        self.store.upsert(&IndexedFile {
            path: relative_path.to_string(),
            content_hash: hex_sha256(content.as_bytes()),
            vector,
            mtime,
            size,
            indexed_at: Utc::now(),
        })
    }

    /// Run one query against the index.
    pub async fn search(&self, query: &str) -> Result<SearchReport> {
        let started = Instant::now();

        let query_vector = self.embedder.embed(query).await.context("embed query")?;
        let entries = self.store.entries().context("load vector index")?;

        let mut scored: Vec<(f32, IndexedFile)> = entries
            .into_iter()
            .filter_map(|entry| cosine(&query_vector, &entry.vector).map(|s| (s, entry)))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let truncated = scored.len() >= self.max_results;
        scored.truncate(self.max_results);

        let hits = scored
            .into_iter()
            .map(|(score, entry)| self.hydrate(score, entry))
            .collect();

        Ok(SearchReport {
            query: query.to_string(),
            duration: started.elapsed(),
            hits,
            truncated,
        })
    }

    /// Fill in line count and preview from the file on disk; index metadata
    /// is the fallback when the file is unreadable.
    fn hydrate(&self, score: f32, entry: IndexedFile) -> SearchHit {
        let absolute = self.repo_root.join(&entry.path);
        let contents = std::fs::metadata(&absolute)
            .ok()
            .filter(|m| m.is_file() && m.len() <= PREVIEW_READ_CAP)
            .and_then(|_| std::fs::read_to_string(&absolute).ok());

        let (line_count, preview) = match &contents {
            Some(text) => (
                text.lines().count(),
                text.lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(|line| truncate_chars(line, 80)),
            ),
            None => (0, None),
        };

        SearchHit {
            path: entry.path,
            score,
            line_count,
            size: entry.size,
            preview,
        }
    }
}

/// Cosine similarity; `None` on dimensionality mismatch or zero vectors.
fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }

    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn truncate_chars(line: &str, max: usize) -> String {
    line.chars().take(max).collect()
}
