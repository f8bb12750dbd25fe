use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

const SNAPSHOT_PATH_VAR: &str = "CATEGORY_SNAPSHOT_PATH";
const DEFAULT_SNAPSHOT_PATH: &str = "data/categories.yaml";

#[derive(Debug, Error)]
pub enum CategoryCacheError {
    #[error("could not read category snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse category snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    categories: Vec<String>,
}

/// In-memory set of the category paths the storefront curates, loaded
/// from a YAML snapshot kept next to the service. Entries are full
/// `>`-joined chains; imports check against it to flag paths nobody
/// has curated yet.
pub struct CategoryCache {
    path: PathBuf,
    paths: RwLock<BTreeSet<String>>,
}

impl CategoryCache {
    pub fn from_env() -> Self {
        let path =
            env::var(SNAPSHOT_PATH_VAR).unwrap_or_else(|_| DEFAULT_SNAPSHOT_PATH.to_string());
        Self::new(path)
    }

    /// Starts empty; call [`CategoryCache::refresh`] to load the snapshot.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            paths: RwLock::new(BTreeSet::new()),
        }
    }

    /// Reloads the snapshot wholesale and returns how many paths it holds.
    /// Whitespace-only entries are dropped; on failure the previous set is
    /// kept.
    pub fn refresh(&self) -> Result<usize, CategoryCacheError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| CategoryCacheError::Read {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: Snapshot =
            serde_yaml::from_str(&raw).map_err(|source| CategoryCacheError::Parse {
                path: self.path.clone(),
                source,
            })?;
        let fresh: BTreeSet<String> = snapshot
            .categories
            .iter()
            .map(|path| path.trim())
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect();
        let count = fresh.len();
        let mut guard = self.paths.write().unwrap_or_else(PoisonError::into_inner);
        *guard = fresh;
        info!(
            target = "caravel.import",
            count,
            path = %self.path.display(),
            "category snapshot refreshed"
        );
        Ok(count)
    }

    pub fn contains(&self, path: &str) -> bool {
        let guard = self.paths.read().unwrap_or_else(PoisonError::into_inner);
        guard.contains(path.trim())
    }

    /// All known paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let guard = self.paths.read().unwrap_or_else(PoisonError::into_inner);
        guard.iter().cloned().collect()
    }

    /// Unique first segments of the known paths, sorted.
    pub fn top_level(&self) -> Vec<String> {
        let guard = self.paths.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .iter()
            .filter_map(|path| path.split('>').next())
            .map(str::trim)
            .filter(|root| !root.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        let guard = self.paths.read().unwrap_or_else(PoisonError::into_inner);
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_snapshot(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("categories.yaml");
        std::fs::write(&path, body).expect("write snapshot");
        path
    }

    #[test]
    fn refresh_loads_trimmed_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_snapshot(
            &dir,
            "categories:\n  - \"Furniture > Living Room > Tables\"\n  - \"  Outdoor > Garden  \"\n  - \"\"\n",
        );
        let cache = CategoryCache::new(path);
        assert!(cache.is_empty());

        let count = cache.refresh().expect("refresh");
        assert_eq!(count, 2);
        assert!(cache.contains("Outdoor > Garden"));
        assert!(cache.contains("  Furniture > Living Room > Tables "));
        assert!(!cache.contains("Furniture"));
    }

    #[test]
    fn top_level_collapses_to_unique_roots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_snapshot(
            &dir,
            "categories:\n  - \"Furniture > Tables\"\n  - \"Furniture > Chairs\"\n  - \"Outdoor\"\n",
        );
        let cache = CategoryCache::new(path);
        cache.refresh().expect("refresh");
        assert_eq!(cache.top_level(), vec!["Furniture", "Outdoor"]);
    }

    #[test]
    fn refresh_replaces_the_previous_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_snapshot(&dir, "categories:\n  - \"Old > Path\"\n");
        let cache = CategoryCache::new(path.clone());
        cache.refresh().expect("refresh");
        assert!(cache.contains("Old > Path"));

        std::fs::write(&path, "categories:\n  - \"New > Path\"\n").expect("rewrite");
        cache.refresh().expect("refresh again");
        assert!(!cache.contains("Old > Path"));
        assert!(cache.contains("New > Path"));
    }

    #[test]
    fn missing_file_and_bad_yaml_are_distinct_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CategoryCache::new(dir.path().join("absent.yaml"));
        assert!(matches!(
            cache.refresh(),
            Err(CategoryCacheError::Read { .. })
        ));

        let path = write_snapshot(&dir, "categories: {not: a list}\n");
        let cache = CategoryCache::new(path);
        assert!(matches!(
            cache.refresh(),
            Err(CategoryCacheError::Parse { .. })
        ));

        // A failed refresh keeps whatever was loaded before.
        assert!(cache.is_empty());
    }
}
