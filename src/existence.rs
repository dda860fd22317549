use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Composite keys of entities known to exist remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExistenceSet {
    keys: BTreeSet<String>,
}

impl ExistenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.keys.iter()
    }

    pub fn retain(&mut self, keep: impl FnMut(&String) -> bool) {
        self.keys.retain(keep);
    }

    /// Reads a set previously written by [`ExistenceSet::save`]. A missing file
    /// yields `None` so callers can fall back to a full sweep.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let set = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(set))
    }

    /// Writes the set as a sorted JSON array, via a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(self).context("failed to serialize existence set")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| {
            format!(
                "failed to move temporary file {} to {}",
                tmp.display(),
                path.display()
            )
        })?;
        Ok(())
    }
}

impl Extend<String> for ExistenceSet {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        self.keys.extend(iter);
    }
}

impl FromIterator<String> for ExistenceSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a str> for ExistenceSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        iter.into_iter().map(str::to_string).collect()
    }
}
