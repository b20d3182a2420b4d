// LMDB-backed ledger artifact. Every mutation is one write transaction, so a
// reader of the file sees either the old or the new ledger state.
use anyhow::{Context, Result};
use contentdb_core::{FeatureRow, KEY_SEPARATOR};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const DB_LEDGERS: &str = "ledgers";
const DB_ROWS: &str = "rows";

/// Per-ledger header stored next to its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub column_names: Vec<String>,
    pub generation: u64,
    pub next_seq: u64,
}

/// A ledger as read back from disk, rows in append order.
#[derive(Debug)]
pub struct StoredLedger {
    pub meta: LedgerMeta,
    pub rows: Vec<(u64, FeatureRow)>,
}

pub struct LmdbStorage {
    env: Arc<Env>,
    ledgers_db: Database<Str, Bytes>,
    rows_db: Database<Str, Bytes>,
}

impl LmdbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(&path)?;

        let env = Arc::new(unsafe {
            EnvOpenOptions::new()
                .map_size(16 * 1024 * 1024 * 1024) // 16GB address space
                .max_dbs(4)
                .open(path)?
        });

        let mut wtxn = env.write_txn()?;
        let ledgers_db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some(DB_LEDGERS))?;
        let rows_db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some(DB_ROWS))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            ledgers_db,
            rows_db,
        })
    }

    fn row_key(ledger: &str, seq: u64) -> String {
        // zero padded so lexicographic order is append order
        format!("{}{}{:020}", ledger, KEY_SEPARATOR, seq)
    }

    fn row_prefix(ledger: &str) -> String {
        format!("{}{}", ledger, KEY_SEPARATOR)
    }

    fn put_meta(&self, wtxn: &mut RwTxn, ledger: &str, meta: &LedgerMeta) -> Result<()> {
        let bytes = bincode::serialize(meta)?;
        self.ledgers_db.put(wtxn, ledger, &bytes)?;
        Ok(())
    }

    fn put_row(&self, wtxn: &mut RwTxn, ledger: &str, seq: u64, row: &FeatureRow) -> Result<()> {
        let bytes = bincode::serialize(row)?;
        self.rows_db.put(wtxn, &Self::row_key(ledger, seq), &bytes)?;
        Ok(())
    }

    /// Create or overwrite a ledger header without touching its rows.
    pub fn save_meta(&self, ledger: &str, meta: &LedgerMeta) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.put_meta(&mut wtxn, ledger, meta)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Append rows and update the header in one transaction. No deduplication
    /// happens here; that is the ledger's job.
    pub fn append_rows(&self, ledger: &str, rows: &[(u64, FeatureRow)], meta: &LedgerMeta) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for (seq, row) in rows {
            self.put_row(&mut wtxn, ledger, *seq, row)?;
        }
        self.put_meta(&mut wtxn, ledger, meta)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Delete the listed rows, write the new ones and the header, then commit.
    pub fn replace_rows(
        &self,
        ledger: &str,
        delete_seqs: &[u64],
        rows: &[(u64, FeatureRow)],
        meta: &LedgerMeta,
    ) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for seq in delete_seqs {
            self.rows_db.delete(&mut wtxn, &Self::row_key(ledger, *seq))?;
        }
        for (seq, row) in rows {
            self.put_row(&mut wtxn, ledger, *seq, row)?;
        }
        self.put_meta(&mut wtxn, ledger, meta)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Remove a ledger header and the listed rows.
    pub fn delete_ledger(&self, ledger: &str, seqs: &[u64]) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        for seq in seqs {
            self.rows_db.delete(&mut wtxn, &Self::row_key(ledger, *seq))?;
        }
        let existed = self.ledgers_db.delete(&mut wtxn, ledger)?;
        wtxn.commit()?;
        Ok(existed)
    }

    pub fn get_meta(&self, ledger: &str) -> Result<Option<LedgerMeta>> {
        let rtxn = self.env.read_txn()?;
        match self.ledgers_db.get(&rtxn, ledger)? {
            Some(data) => Ok(Some(bincode::deserialize(data)?)),
            None => Ok(None),
        }
    }

    /// Read every ledger with its rows.
    pub fn load_all(&self) -> Result<Vec<(String, StoredLedger)>> {
        let rtxn = self.env.read_txn()?;
        let mut ledgers = Vec::new();

        for entry in self.ledgers_db.iter(&rtxn)? {
            let (name, data) = entry?;
            let meta: LedgerMeta = bincode::deserialize(data)
                .with_context(|| format!("decoding header of ledger {:?}", name))?;

            let prefix = Self::row_prefix(name);
            let mut rows = Vec::new();
            for row_entry in self.rows_db.prefix_iter(&rtxn, &prefix)? {
                let (key, data) = row_entry?;
                let seq: u64 = key[prefix.len()..]
                    .parse()
                    .with_context(|| format!("malformed row key {:?}", key))?;
                let row: FeatureRow = bincode::deserialize(data)
                    .with_context(|| format!("decoding row {:?}", key))?;
                rows.push((seq, row));
            }

            ledgers.push((name.to_string(), StoredLedger { meta, rows }));
        }

        Ok(ledgers)
    }

    /// Number of persisted rows of a ledger.
    pub fn count_rows(&self, ledger: &str) -> Result<usize> {
        let rtxn = self.env.read_txn()?;
        let prefix = Self::row_prefix(ledger);
        let mut count = 0;
        for entry in self.rows_db.prefix_iter(&rtxn, &prefix)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
