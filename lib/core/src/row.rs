use crate::{Error, Locator, Result, Vector};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Scale key of a ledger bucket.
///
/// Scales are compared as 64-bit floats, so a value that went through an
/// `f32` round trip upstream is a different key unless widened identically.
pub type Scale = OrderedFloat<f64>;

/// Validate and wrap a raw scale value.
pub fn scale_key(scale: f64) -> Result<Scale> {
    if scale.is_nan() {
        return Err(Error::Format("scale is NaN".to_string()));
    }
    Ok(OrderedFloat(scale))
}

/// One extracted feature vector and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub locator: Locator,
    pub scale: f64,
    pub owner_id: u64,
    pub vector: Vector,
    #[serde(default)]
    pub container_id: Option<u64>,
}

impl FeatureRow {
    #[inline]
    #[must_use]
    pub fn new(locator: Locator, scale: f64, owner_id: u64, vector: Vector) -> Self {
        Self {
            locator,
            scale,
            owner_id,
            vector,
            container_id: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_container(mut self, container_id: u64) -> Self {
        self.container_id = Some(container_id);
        self
    }

    /// Identity of the row inside a ledger.
    pub fn key(&self) -> Result<(Locator, Scale)> {
        Ok((self.locator, scale_key(self.scale)?))
    }
}

/// The authoritative feature record attached to one image: column names plus
/// every row ever extracted for it, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub column_names: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new(column_names: Vec<String>, rows: Vec<FeatureRow>) -> Self {
        Self { column_names, rows }
    }
}

/// Keep the most recently appended row for each `(Locator, scale)`.
///
/// Rows are walked newest first and the first occurrence of a key wins; the
/// survivors are returned oldest first together with the number of rows dropped.
pub fn most_recent_wins(rows: Vec<FeatureRow>) -> Result<(Vec<FeatureRow>, usize)> {
    let total = rows.len();
    let mut seen = ahash::AHashSet::with_capacity(total);
    let mut survivors = Vec::with_capacity(total);

    for row in rows.into_iter().rev() {
        if seen.insert(row.key()?) {
            survivors.push(row);
        }
    }
    survivors.reverse();

    let dropped = total - survivors.len();
    Ok((survivors, dropped))
}

/// The most recently appended row for `locator`, if any.
pub fn latest_row_for<'a>(rows: &'a [FeatureRow], locator: &Locator) -> Option<&'a FeatureRow> {
    rows.iter().rev().find(|row| row.locator == *locator)
}
