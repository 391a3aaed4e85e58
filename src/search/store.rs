//! The on-disk vector store, keyed by repo-relative path.

use crate::search::{IndexedFile, VectorStore};
use anyhow::{Context, Result};
use log::trace;
use sled::Db;
use std::path::Path;

/// Sled-backed vector store holding message-pack encoded entries.
#[derive(Clone, Debug)]
pub struct SledVectorStore {
    db: Db,
}

impl SledVectorStore {
    /// Open the store, whereas the `Path` has to be a directory.
    pub fn open(path: &Path) -> Result<Self> {
        trace!("Opening vector store {}", path.display());
        Ok(Self {
            db: sled::open(path)
                .with_context(|| format!("failed to open vector store {}", path.display()))?,
        })
    }
}

impl VectorStore for SledVectorStore {
    fn upsert(&self, entry: &IndexedFile) -> Result<()> {
        self.db
            .insert(
                entry.path.as_bytes(),
                rmp_serde::to_vec(entry).context("failed to serialize index entry")?,
            )
            .context("failed to upsert index entry")?;
        trace!("Upserted index entry (count = {})", self.db.len());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<IndexedFile>> {
        match self
            .db
            .get(path.as_bytes())
            .context("failed to retrieve index entry")?
        {
            None => Ok(None),
            Some(value) => Ok(Some(
                rmp_serde::from_slice(&value).context("deserialize index entry")?,
            )),
        }
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.db
            .remove(path.as_bytes())
            .context("failed to remove index entry")?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<IndexedFile>> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item.context("iterate vector store")?;
            entries.push(rmp_serde::from_slice(&value).context("deserialize index entry")?);
        }
        Ok(entries)
    }
}
