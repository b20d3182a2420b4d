//! Feature ledgers: copy-on-write generations behind an atomic pointer.
//!
//! A [`Ledger`] owns the current [`Generation`] of one (feature set, scope)
//! pair. Writers build generation N+1 from N and publish it with a single
//! pointer store; readers load the pointer and keep a consistent snapshot for
//! as long as they hold the `Arc`.

use crate::lmdb_storage::{LedgerMeta, LmdbStorage};
use arc_swap::ArcSwap;
use contentdb_core::{scale_key, Error, FeatureRow, Locator, Result, Scale, KEY_SEPARATOR};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Whether a ledger covers every image or a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerScope {
    Global,
    Container(u64),
}

impl LedgerScope {
    pub fn from_container(container: Option<u64>) -> Self {
        container.map_or(LedgerScope::Global, LedgerScope::Container)
    }

    pub fn container(&self) -> Option<u64> {
        match self {
            LedgerScope::Global => None,
            LedgerScope::Container(id) => Some(*id),
        }
    }

    fn storage_name(&self) -> String {
        match self {
            LedgerScope::Global => "global".to_string(),
            LedgerScope::Container(id) => format!("c{}", id),
        }
    }

    fn parse_storage_name(s: &str) -> Option<Self> {
        if s == "global" {
            return Some(LedgerScope::Global);
        }
        s.strip_prefix('c')?.parse().ok().map(LedgerScope::Container)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub featureset: String,
    pub scope: LedgerScope,
}

impl LedgerKey {
    pub fn new(featureset: impl Into<String>, container: Option<u64>) -> Self {
        Self {
            featureset: featureset.into(),
            scope: LedgerScope::from_container(container),
        }
    }

    pub fn global(featureset: impl Into<String>) -> Self {
        Self::new(featureset, None)
    }

    pub(crate) fn storage_key(&self) -> String {
        format!("{}{}{}", self.featureset, KEY_SEPARATOR, self.scope.storage_name())
    }

    pub(crate) fn parse_storage_key(s: &str) -> Option<Self> {
        let (featureset, scope) = s.split_once(KEY_SEPARATOR)?;
        Some(Self {
            featureset: featureset.to_string(),
            scope: LedgerScope::parse_storage_name(scope)?,
        })
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            LedgerScope::Global => write!(f, "{} (global)", self.featureset),
            LedgerScope::Container(id) => write!(f, "{} (container {})", self.featureset, id),
        }
    }
}

/// Rows of one scale in append order, with their persisted sequence numbers.
#[derive(Debug, Clone, Default)]
pub struct ScaleBucket {
    rows: Vec<FeatureRow>,
    seqs: Vec<u64>,
    locators: ahash::AHashSet<Locator>,
}

impl ScaleBucket {
    fn push(&mut self, seq: u64, row: FeatureRow) {
        self.locators.insert(row.locator);
        self.rows.push(row);
        self.seqs.push(seq);
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, locator: &Locator) -> bool {
        self.locators.contains(locator)
    }
}

/// One immutable published version of a ledger.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    number: u64,
    column_names: Arc<Vec<String>>,
    buckets: BTreeMap<Scale, Arc<ScaleBucket>>,
}

impl Generation {
    pub fn empty(number: u64, column_names: Vec<String>) -> Self {
        Self {
            number,
            column_names: Arc::new(column_names),
            buckets: BTreeMap::new(),
        }
    }

    /// Build a generation from rows in append order. Duplicates are kept.
    pub fn from_rows(number: u64, column_names: Vec<String>, rows: Vec<(u64, FeatureRow)>) -> Result<Self> {
        let mut buckets: BTreeMap<Scale, ScaleBucket> = BTreeMap::new();
        for (seq, row) in rows {
            let scale = scale_key(row.scale)?;
            buckets.entry(scale).or_default().push(seq, row);
        }
        Ok(Self {
            number,
            column_names: Arc::new(column_names),
            buckets: buckets.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Scale keys in ascending order.
    pub fn scales(&self) -> impl Iterator<Item = Scale> + '_ {
        self.buckets.keys().copied()
    }

    /// Rows stored at `scale`, empty if the scale is absent.
    pub fn rows(&self, scale: Scale) -> &[FeatureRow] {
        self.buckets.get(&scale).map(|b| b.rows()).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scale, &[FeatureRow])> + '_ {
        self.buckets.iter().map(|(scale, bucket)| (*scale, bucket.rows()))
    }

    pub fn contains(&self, locator: &Locator, scale: Scale) -> bool {
        self.buckets
            .get(&scale)
            .map(|b| b.contains(locator))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every persisted sequence number in this generation.
    pub fn seqs(&self) -> Vec<u64> {
        self.buckets.values().flat_map(|b| b.seqs.iter().copied()).collect()
    }

    /// Rows ordered by (scale, locator), for order-independent comparison.
    pub fn sorted_rows(&self) -> Vec<&FeatureRow> {
        let mut rows: Vec<&FeatureRow> = self.buckets.values().flat_map(|b| b.rows.iter()).collect();
        rows.sort_by(|a, b| {
            a.scale
                .total_cmp(&b.scale)
                .then_with(|| a.locator.cmp(&b.locator))
        });
        rows
    }

    /// Number of rows at `scale` whose locator appears more than once.
    pub fn duplicate_count(&self, scale: Scale) -> usize {
        self.buckets
            .get(&scale)
            .map(|b| b.len() - b.locators.len())
            .unwrap_or(0)
    }

    /// Generation N+1 with one more row. Only the touched bucket is copied.
    fn with_row(&self, seq: u64, scale: Scale, row: FeatureRow) -> Self {
        let mut buckets = self.buckets.clone();
        let bucket = buckets.entry(scale).or_default();
        Arc::make_mut(bucket).push(seq, row);
        Self {
            number: self.number + 1,
            column_names: self.column_names.clone(),
            buckets,
        }
    }

    /// Generation N+1 keeping only the last appended row per locator at `scale`,
    /// together with the sequence numbers that were dropped.
    fn without_duplicates(&self, scale: Scale) -> (Self, Vec<u64>) {
        let mut next = Self {
            number: self.number + 1,
            column_names: self.column_names.clone(),
            buckets: self.buckets.clone(),
        };
        let Some(bucket) = self.buckets.get(&scale) else {
            return (next, Vec::new());
        };

        let (kept, removed) = keep_last_per_locator(bucket);
        let mut rebuilt = ScaleBucket::default();
        for i in kept {
            rebuilt.push(bucket.seqs[i], bucket.rows[i].clone());
        }
        next.buckets.insert(scale, Arc::new(rebuilt));
        (next, removed)
    }
}

/// Survivor policy for duplicate removal: the highest sequence number (most
/// recently appended row) wins. Returns kept indices in append order and the
/// sequence numbers to delete.
pub fn keep_last_per_locator(bucket: &ScaleBucket) -> (Vec<usize>, Vec<u64>) {
    let mut seen = ahash::AHashSet::with_capacity(bucket.len());
    let mut kept = Vec::with_capacity(bucket.len());
    let mut removed = Vec::new();

    for i in (0..bucket.len()).rev() {
        if seen.insert(bucket.rows[i].locator) {
            kept.push(i);
        } else {
            removed.push(bucket.seqs[i]);
        }
    }
    kept.reverse();
    (kept, removed)
}

/// Result of an [`upsert`](crate::StorageManager::upsert).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted { generation: u64 },
    /// The (locator, scale) pair was already present; nothing was written.
    Duplicate,
}

impl UpsertOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, UpsertOutcome::Duplicate)
    }
}

struct WriterState {
    next_seq: u64,
    dropped: bool,
}

pub struct Ledger {
    key: LedgerKey,
    current: ArcSwap<Generation>,
    writer: Mutex<WriterState>,
}

impl Ledger {
    pub(crate) fn new(key: LedgerKey, generation: Generation, next_seq: u64) -> Self {
        Self {
            key,
            current: ArcSwap::from_pointee(generation),
            writer: Mutex::new(WriterState {
                next_seq,
                dropped: false,
            }),
        }
    }

    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    /// The currently published generation.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    fn meta(generation: &Generation, next_seq: u64) -> LedgerMeta {
        LedgerMeta {
            column_names: generation.column_names().to_vec(),
            generation: generation.number(),
            next_seq,
        }
    }

    fn ensure_live(&self, state: &WriterState) -> Result<()> {
        if state.dropped {
            return Err(Error::NotFound(format!("ledger {}", self.key)));
        }
        Ok(())
    }

    pub(crate) fn upsert(&self, row: FeatureRow, lmdb: &LmdbStorage) -> Result<UpsertOutcome> {
        let (locator, scale) = row.key()?;
        let mut state = self.writer.lock();
        self.ensure_live(&state)?;

        let current = self.current.load_full();
        if current.contains(&locator, scale) {
            debug!("{} already holds {} at scale {}", self.key, locator, scale);
            return Ok(UpsertOutcome::Duplicate);
        }

        let seq = state.next_seq;
        let next = current.with_row(seq, scale, row.clone());
        let meta = Self::meta(&next, seq + 1);
        lmdb.append_rows(&self.key.storage_key(), &[(seq, row)], &meta)
            .map_err(|e| Error::Storage(e.to_string()))?;

        state.next_seq = seq + 1;
        let generation = next.number();
        self.current.store(Arc::new(next));
        Ok(UpsertOutcome::Inserted { generation })
    }

    /// Replace the whole ledger content. The artifact is rewritten in one
    /// transaction before the pointer moves; on failure nothing is published.
    pub(crate) fn replace(
        &self,
        column_names: Vec<String>,
        rows: Vec<FeatureRow>,
        lmdb: &LmdbStorage,
    ) -> Result<Arc<Generation>> {
        let mut state = self.writer.lock();
        self.ensure_live(&state)?;

        let current = self.current.load_full();
        let first_seq = state.next_seq;
        let numbered: Vec<(u64, FeatureRow)> = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| (first_seq + i as u64, row))
            .collect();
        let next_seq = first_seq + numbered.len() as u64;

        let next = Generation::from_rows(current.number() + 1, column_names, numbered.clone())?;
        let meta = Self::meta(&next, next_seq);
        lmdb.replace_rows(&self.key.storage_key(), &current.seqs(), &numbered, &meta)
            .map_err(|e| Error::Storage(format!("swap of {} aborted: {}", self.key, e)))?;

        state.next_seq = next_seq;
        let next = Arc::new(next);
        self.current.store(next.clone());
        info!(
            "{} swapped to generation {} ({} rows)",
            self.key,
            next.number(),
            next.len()
        );
        Ok(next)
    }

    pub(crate) fn remove_duplicates(&self, scale: Scale, lmdb: &LmdbStorage) -> Result<usize> {
        let mut state = self.writer.lock();
        self.ensure_live(&state)?;

        let current = self.current.load_full();
        let (next, removed) = current.without_duplicates(scale);
        if removed.is_empty() {
            return Ok(0);
        }

        let meta = Self::meta(&next, state.next_seq);
        lmdb.replace_rows(&self.key.storage_key(), &removed, &[], &meta)
            .map_err(|e| Error::Storage(e.to_string()))?;

        self.current.store(Arc::new(next));
        info!("{} dropped {} duplicate rows at scale {}", self.key, removed.len(), scale);
        Ok(removed.len())
    }

    pub(crate) fn drop_from(&self, lmdb: &LmdbStorage) -> Result<()> {
        let mut state = self.writer.lock();
        self.ensure_live(&state)?;

        let current = self.current.load_full();
        lmdb.delete_ledger(&self.key.storage_key(), &current.seqs())
            .map_err(|e| Error::Storage(e.to_string()))?;
        state.dropped = true;
        Ok(())
    }
}
