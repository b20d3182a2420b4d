use crate::ledger::{Generation, Ledger, LedgerKey, UpsertOutcome};
use crate::lmdb_storage::{LedgerMeta, LmdbStorage};
use contentdb_core::{scale_key, Error, FeatureRow, FeatureSetRegistry, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Owns every feature ledger and its LMDB artifact.
pub struct StorageManager {
    ledgers: Arc<RwLock<HashMap<LedgerKey, Arc<Ledger>>>>,
    registry: FeatureSetRegistry,
    data_dir: PathBuf,
    lmdb: Arc<LmdbStorage>,
    rebuilding: Mutex<HashSet<String>>,
}

/// Marks a feature set as being rebuilt until dropped.
pub struct RebuildGuard<'a> {
    manager: &'a StorageManager,
    featureset: String,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.manager.rebuilding.lock().remove(&self.featureset);
    }
}

impl StorageManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, registry: FeatureSetRegistry) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let lmdb_path = data_dir.join("lmdb");
        let lmdb = Arc::new(LmdbStorage::new(&lmdb_path).map_err(|e| Error::Storage(e.to_string()))?);

        let mut ledgers = HashMap::new();
        let stored = lmdb.load_all().map_err(|e| Error::Storage(e.to_string()))?;
        for (name, stored) in stored {
            let Some(key) = LedgerKey::parse_storage_key(&name) else {
                warn!("Skipping ledger with unrecognised key {:?}", name);
                continue;
            };
            let generation = Generation::from_rows(stored.meta.generation, stored.meta.column_names, stored.rows)?;
            for scale in generation.scales() {
                let duplicates = generation.duplicate_count(scale);
                if duplicates > 0 {
                    warn!(
                        "{} holds {} duplicate rows at scale {}; run remove_duplicates to clean up",
                        key, duplicates, scale
                    );
                }
            }
            ledgers.insert(key.clone(), Arc::new(Ledger::new(key, generation, stored.meta.next_seq)));
        }
        if !ledgers.is_empty() {
            info!("Loaded {} ledgers from {}", ledgers.len(), lmdb_path.display());
        }

        Ok(Self {
            ledgers: Arc::new(RwLock::new(ledgers)),
            registry,
            data_dir,
            lmdb,
            rebuilding: Mutex::new(HashSet::new()),
        })
    }

    #[inline]
    #[must_use]
    pub fn registry(&self) -> &FeatureSetRegistry {
        &self.registry
    }

    #[inline]
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Canonical key for a feature set name, failing for unregistered sets.
    fn key(&self, featureset: &str, container: Option<u64>) -> Result<LedgerKey> {
        let set = self.registry.get(featureset)?;
        Ok(LedgerKey::new(set.name.clone(), container))
    }

    fn ledger(&self, key: &LedgerKey) -> Result<Arc<Ledger>> {
        self.ledgers
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("ledger {}", key)))
    }

    /// Create an empty ledger. `column_names` may be empty, otherwise it must
    /// have one name per vector component.
    pub fn initialize(&self, featureset: &str, column_names: Vec<String>, container: Option<u64>) -> Result<()> {
        let key = self.key(featureset, container)?;
        if !column_names.is_empty() {
            self.registry.get(featureset)?.check_width(column_names.len())?;
        }

        let mut ledgers = self.ledgers.write();
        if ledgers.contains_key(&key) {
            return Err(Error::LedgerExists(key.to_string()));
        }

        let meta = LedgerMeta {
            column_names: column_names.clone(),
            generation: 0,
            next_seq: 0,
        };
        self.lmdb
            .save_meta(&key.storage_key(), &meta)
            .map_err(|e| Error::Storage(e.to_string()))?;

        info!("Initialized ledger {}", key);
        let ledger = Ledger::new(key.clone(), Generation::empty(0, column_names), 0);
        ledgers.insert(key, Arc::new(ledger));
        Ok(())
    }

    /// Insert a row into the ledger of `featureset` scoped by the row's
    /// container. An already present (locator, scale) is reported, not an error.
    pub fn upsert(&self, featureset: &str, row: FeatureRow) -> Result<UpsertOutcome> {
        let key = self.key(featureset, row.container_id)?;
        self.registry.get(featureset)?.check_width(row.vector.dim())?;
        if !row.vector.is_finite() {
            return Err(Error::Format(format!("vector of {} has non-finite components", row.locator)));
        }
        self.ledger(&key)?.upsert(row, &self.lmdb)
    }

    /// Snapshot of the current generation.
    pub fn retrieve(&self, featureset: &str, container: Option<u64>) -> Result<Arc<Generation>> {
        let key = self.key(featureset, container)?;
        Ok(self.ledger(&key)?.snapshot())
    }

    #[must_use]
    pub fn exists(&self, featureset: &str, container: Option<u64>) -> bool {
        self.key(featureset, container)
            .map(|key| self.ledgers.read().contains_key(&key))
            .unwrap_or(false)
    }

    /// Drop all but the most recently appended row per locator at `scale`.
    /// Returns the number of rows removed.
    pub fn remove_duplicates(&self, scale: f64, featureset: &str, container: Option<u64>) -> Result<usize> {
        let scale = scale_key(scale)?;
        let key = self.key(featureset, container)?;
        self.ledger(&key)?.remove_duplicates(scale, &self.lmdb)
    }

    pub fn drop_ledger(&self, featureset: &str, container: Option<u64>) -> Result<bool> {
        let key = self.key(featureset, container)?;
        let mut ledgers = self.ledgers.write();
        let Some(ledger) = ledgers.get(&key).cloned() else {
            return Ok(false);
        };
        ledger.drop_from(&self.lmdb)?;
        ledgers.remove(&key);
        info!("Dropped ledger {}", key);
        Ok(true)
    }

    #[must_use]
    pub fn list_ledgers(&self) -> Vec<LedgerKey> {
        let mut keys: Vec<LedgerKey> = self.ledgers.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Claim the rebuild slot of a feature set.
    pub fn begin_rebuild(&self, featureset: &str) -> Result<RebuildGuard<'_>> {
        let name = self.registry.get(featureset)?.name.clone();
        let mut rebuilding = self.rebuilding.lock();
        if !rebuilding.insert(name.clone()) {
            return Err(Error::RebuildInProgress(name));
        }
        Ok(RebuildGuard {
            manager: self,
            featureset: name,
        })
    }

    /// Replace the global ledger of the guarded feature set with `rows`,
    /// creating it if missing. The artifact is rewritten in one transaction
    /// before readers can see the new generation.
    pub fn install_generation(
        &self,
        guard: &RebuildGuard<'_>,
        column_names: Vec<String>,
        rows: Vec<FeatureRow>,
    ) -> Result<Arc<Generation>> {
        let key = LedgerKey::global(guard.featureset.clone());
        let existing = self.ledgers.read().get(&key).cloned();
        if let Some(ledger) = existing {
            return ledger.replace(column_names, rows, &self.lmdb);
        }

        // a new ledger becomes visible only once its first generation is persisted
        let mut ledgers = self.ledgers.write();
        let raced = ledgers.get(&key).cloned();
        if let Some(ledger) = raced {
            drop(ledgers);
            return ledger.replace(column_names, rows, &self.lmdb);
        }
        let ledger = Arc::new(Ledger::new(key.clone(), Generation::empty(0, Vec::new()), 0));
        let generation = ledger.replace(column_names, rows, &self.lmdb)?;
        ledgers.insert(key, ledger);
        Ok(generation)
    }
}
