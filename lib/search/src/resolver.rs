//! Turns positive/negative selections into query vectors and a working scale.
//!
//! Query vectors always come from each image's authoritative feature table,
//! never from the ledger, so a search works for images that were extracted
//! but not yet indexed.

use contentdb_core::{
    latest_row_for, CallContext, Error, FeatureExtractor, FeatureTable, Locator, Result, Scale,
    Vector,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

/// One selected example, resolved to its stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryItem {
    pub locator: Locator,
    pub polarity: Polarity,
    pub scale: f64,
    pub vector: Vector,
}

/// Ledger scale key closest to `target`.
///
/// Keys are visited in ascending order and a key only replaces the current
/// choice when strictly closer, so the smaller key wins a tie.
pub fn nearest_scale<I>(keys: I, target: f64) -> Option<Scale>
where
    I: IntoIterator<Item = Scale>,
{
    let mut keys: Vec<Scale> = keys.into_iter().collect();
    keys.sort();

    let mut best: Option<(Scale, f64)> = None;
    for key in keys {
        let gap = (key.0 - target).abs();
        match best {
            Some((_, best_gap)) if gap >= best_gap => {}
            _ => best = Some((key, gap)),
        }
    }
    best.map(|(key, _)| key)
}

/// Working scale of a query: the largest scale among the selected examples.
pub fn query_scale(items: &[QueryItem]) -> Option<f64> {
    items.iter().map(|item| item.scale).reduce(f64::max)
}

/// Resolves locators against authoritative tables, fetching each image's
/// table at most once.
pub struct QueryResolver<'a> {
    extractor: &'a dyn FeatureExtractor,
    featureset: &'a str,
    ctx: &'a CallContext,
    tables: HashMap<u64, FeatureTable>,
}

impl<'a> QueryResolver<'a> {
    pub fn new(extractor: &'a dyn FeatureExtractor, featureset: &'a str, ctx: &'a CallContext) -> Self {
        Self {
            extractor,
            featureset,
            ctx,
            tables: HashMap::new(),
        }
    }

    async fn table(&mut self, image_id: u64) -> Result<&FeatureTable> {
        if !self.tables.contains_key(&image_id) {
            let operation = format!("extractor.get_authoritative({})", image_id);
            let table = self
                .ctx
                .run(&operation, self.extractor.get_authoritative(image_id, self.featureset))
                .await?;
            self.tables.insert(image_id, table);
        }
        self.tables
            .get(&image_id)
            .ok_or_else(|| Error::NotFound(format!("feature table of image {}", image_id)))
    }

    pub async fn resolve(&mut self, locator: Locator, polarity: Polarity) -> Result<QueryItem> {
        let featureset = self.featureset;
        let table = match self.table(locator.image_id).await {
            Ok(table) => table,
            Err(Error::NotFound(_)) => {
                return Err(Error::NotFound(format!(
                    "no {} features stored for {}",
                    featureset, locator
                )))
            }
            Err(e) => return Err(e),
        };
        let row = latest_row_for(&table.rows, &locator).ok_or_else(|| {
            Error::NotFound(format!("no {} features stored for {}", featureset, locator))
        })?;
        debug!("Resolved {} at scale {}", locator, row.scale);
        Ok(QueryItem {
            locator,
            polarity,
            scale: row.scale,
            vector: row.vector.clone(),
        })
    }

    /// Resolve every selection. A locator selected with both polarities
    /// counts as negative only.
    pub async fn resolve_all(
        &mut self,
        positive: &[Locator],
        negative: &[Locator],
    ) -> Result<(Vec<QueryItem>, Vec<QueryItem>)> {
        let mut positives = Vec::with_capacity(positive.len());
        for locator in positive.iter().filter(|l| !negative.contains(l)) {
            positives.push(self.resolve(*locator, Polarity::Positive).await?);
        }
        let mut negatives = Vec::with_capacity(negative.len());
        for locator in negative {
            negatives.push(self.resolve(*locator, Polarity::Negative).await?);
        }
        Ok((positives, negatives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use contentdb_core::{ExtractionRequest, FeatureRow};
    use ordered_float::OrderedFloat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_nearest_scale_picks_closest() {
        let keys = [OrderedFloat(0.25), OrderedFloat(0.5), OrderedFloat(1.0)];
        assert_eq!(nearest_scale(keys, 0.9), Some(OrderedFloat(1.0)));
        assert_eq!(nearest_scale(keys, 0.3), Some(OrderedFloat(0.25)));
        assert_eq!(nearest_scale(keys, 7.0), Some(OrderedFloat(1.0)));
    }

    #[test]
    fn test_nearest_scale_tie_goes_to_smaller_key() {
        let keys = [OrderedFloat(1.0), OrderedFloat(0.5)];
        assert_eq!(nearest_scale(keys, 0.75), Some(OrderedFloat(0.5)));
    }

    #[test]
    fn test_nearest_scale_empty() {
        assert_eq!(nearest_scale(Vec::<Scale>::new(), 1.0), None);
    }

    struct Tables {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeatureExtractor for Tables {
        async fn extract(&self, _request: &ExtractionRequest) -> Result<FeatureRow> {
            Err(Error::Upstream("not used".into()))
        }

        async fn has(&self, _image_id: u64, _featureset: &str) -> Result<bool> {
            Ok(true)
        }

        async fn get_authoritative(&self, image_id: u64, _featureset: &str) -> Result<FeatureTable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if image_id == 404 {
                return Err(Error::NotFound(format!("image {}", image_id)));
            }
            let rows = vec![
                FeatureRow::new(Locator::new(image_id, 0, 0, 0, 0), 0.5, 1, Vector::new(vec![1.0])),
                FeatureRow::new(Locator::new(image_id, 0, 1, 0, 0), 1.0, 1, Vector::new(vec![2.0])),
                // re-extraction of channel 0, appended last
                FeatureRow::new(Locator::new(image_id, 0, 0, 0, 0), 0.5, 1, Vector::new(vec![3.0])),
            ];
            Ok(FeatureTable::new(vec!["f".into()], rows))
        }
    }

    #[tokio::test]
    async fn test_resolve_uses_latest_row_and_memoizes() {
        let extractor = Tables { calls: AtomicUsize::new(0) };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let mut resolver = QueryResolver::new(&extractor, "slf33", &ctx);

        let (pos, neg) = resolver
            .resolve_all(&[Locator::new(5, 0, 0, 0, 0)], &[Locator::new(5, 0, 1, 0, 0)])
            .await
            .unwrap();

        assert_eq!(pos[0].vector.as_slice(), &[3.0]);
        assert_eq!(pos[0].scale, 0.5);
        assert_eq!(neg[0].polarity, Polarity::Negative);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(query_scale(&[pos[0].clone(), neg[0].clone()]), Some(1.0));
    }

    #[tokio::test]
    async fn test_resolve_missing_row_names_locator() {
        let extractor = Tables { calls: AtomicUsize::new(0) };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let mut resolver = QueryResolver::new(&extractor, "slf33", &ctx);

        let err = resolver
            .resolve(Locator::new(5, 0, 9, 0, 0), Polarity::Positive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m.contains("5.0.9.0.0")));

        let err = resolver.resolve(Locator::image(404), Polarity::Positive).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m.contains("404.0.0.0.0")));
    }

    #[tokio::test]
    async fn test_both_polarities_counts_as_negative() {
        let extractor = Tables { calls: AtomicUsize::new(0) };
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let mut resolver = QueryResolver::new(&extractor, "slf33", &ctx);

        let both = Locator::new(5, 0, 0, 0, 0);
        let (pos, neg) = resolver.resolve_all(&[both], &[both]).await.unwrap();
        assert!(pos.is_empty());
        assert_eq!(neg.len(), 1);
    }
}
