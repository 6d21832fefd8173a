use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::info;

use crate::compactor;
use crate::engine::{Collaborators, Engine};
use crate::limits::*;

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("property name too long")]
    NameTooLong,
    #[error("empty property name")]
    EmptyName,
    #[error("too many properties")]
    TooMany,
    #[error("failed to open ledger: {0}")]
    Io(#[from] std::io::Error),
}

/// One engine (and one ledger file) per property, opened on first use.
pub struct Properties {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    max_properties: usize,
    collaborators: Collaborators,
}

/// Keep only characters that are safe in a file name.
fn ledger_name(property: &str) -> Result<String, PropertyError> {
    if property.len() > MAX_PROPERTY_NAME_LEN {
        return Err(PropertyError::NameTooLong);
    }
    let safe: String = property
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(PropertyError::EmptyName);
    }
    Ok(safe)
}

impl Properties {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, collaborators: Collaborators) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            max_properties: MAX_PROPERTIES,
            collaborators,
        }
    }

    #[cfg(test)]
    fn with_max_properties(mut self, max_properties: usize) -> Self {
        self.max_properties = max_properties;
        self
    }

    /// Get or lazily open the engine for `property`. Names that sanitize to the same
    /// file share one engine.
    pub fn get_or_open(&self, property: &str) -> Result<Arc<Engine>, PropertyError> {
        let name = ledger_name(property)?;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= self.max_properties {
            return Err(PropertyError::TooMany);
        }

        let engine = match self.engines.entry(name) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let path = self.data_dir.join(format!("{}.ledger", slot.key()));
                let engine = Arc::new(Engine::open(path, self.collaborators.clone())?);
                info!(property = %slot.key(), "property opened");
                slot.insert(engine.clone());
                engine
            }
        };

        let compacting = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compacting, threshold).await;
        });
        metrics::gauge!(crate::observability::PROPERTIES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
