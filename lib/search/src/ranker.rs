//! In-process similarity ranker.
//!
//! Columns are z-scored against the candidate pool, then every candidate is
//! scored by the power mean of its Euclidean distances to the query vectors.
//! A strongly negative exponent makes the score behave like a soft minimum:
//! a candidate close to any one query ranks high.

use async_trait::async_trait;
use contentdb_core::{
    Error, FeatureRow, Normalization, RankParams, Ranked, Result, SimilarityRanker, Vector,
};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct ZScoreRanker;

impl ZScoreRanker {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous ranking; the trait impl delegates here.
    pub fn rank_sync(&self, queries: &[Vector], pool: &[FeatureRow], params: &RankParams) -> Result<Vec<Ranked>> {
        if queries.is_empty() {
            return Err(Error::InvalidRequest("no query vectors".to_string()));
        }
        let Some(first) = pool.first() else {
            return Ok(Vec::new());
        };
        let dim = first.vector.dim();
        if let Some(row) = pool.iter().find(|r| r.vector.dim() != dim) {
            return Err(Error::InvalidDimension {
                expected: dim,
                actual: row.vector.dim(),
            });
        }
        if let Some(query) = queries.iter().find(|q| q.dim() != dim) {
            return Err(Error::InvalidDimension {
                expected: dim,
                actual: query.dim(),
            });
        }

        let scaler = match params.normalization {
            Normalization::Zscore => ColumnScaler::fit(pool, dim),
            Normalization::None => ColumnScaler::identity(dim),
        };
        let queries: Vec<Vector> = queries.iter().map(|q| scaler.apply(q.as_slice())).collect();

        let mut ranked: Vec<Ranked> = pool
            .par_iter()
            .map(|row| {
                let candidate = scaler.apply(row.vector.as_slice());
                let distances: Vec<f64> = queries.iter().map(|q| q.l2_distance(&candidate)).collect();
                Ranked {
                    locator: row.locator,
                    score: power_mean(&distances, params.alpha),
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.locator.cmp(&b.locator))
        });
        Ok(ranked)
    }
}

/// Scoring runs on the blocking pool so large candidate pools do not stall
/// the async workers.
#[async_trait]
impl SimilarityRanker for ZScoreRanker {
    async fn rank(&self, queries: &[Vector], pool: &[FeatureRow], params: &RankParams) -> Result<Vec<Ranked>> {
        let ranker = *self;
        let queries = queries.to_vec();
        let pool = pool.to_vec();
        let params = *params;
        tokio::task::spawn_blocking(move || ranker.rank_sync(&queries, &pool, &params))
            .await
            .map_err(|e| Error::InvariantViolation(format!("ranking task failed: {}", e)))?
    }
}

/// Per-column affine transform; `None` marks a column that is ignored.
struct ColumnScaler {
    columns: Vec<Option<(f64, f64)>>,
}

impl ColumnScaler {
    fn identity(dim: usize) -> Self {
        Self {
            columns: vec![Some((0.0, 1.0)); dim],
        }
    }

    fn fit(pool: &[FeatureRow], dim: usize) -> Self {
        let n = pool.len() as f64;
        let columns = (0..dim)
            .map(|j| {
                let mean = pool.iter().map(|r| r.vector.as_slice()[j]).sum::<f64>() / n;
                let var = pool
                    .iter()
                    .map(|r| {
                        let d = r.vector.as_slice()[j] - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / n;
                let std = var.sqrt();
                // constant columns carry no information
                if std > 0.0 && std.is_finite() {
                    Some((mean, std))
                } else {
                    None
                }
            })
            .collect();
        Self { columns }
    }

    fn apply(&self, values: &[f64]) -> Vector {
        Vector::new(
            self.columns
                .iter()
                .zip(values)
                .map(|(column, x)| match column {
                    Some((mean, std)) => (x - mean) / std,
                    None => 0.0,
                })
                .collect(),
        )
    }
}

/// Power mean of non-negative distances with exponent `alpha`.
///
/// `alpha == 0` is the geometric mean. For `alpha <= 0` a zero distance makes
/// the whole mean zero.
pub fn power_mean(distances: &[f64], alpha: f64) -> f64 {
    if distances.is_empty() {
        return f64::INFINITY;
    }
    let n = distances.len() as f64;
    if alpha <= 0.0 && distances.iter().any(|d| *d == 0.0) {
        return 0.0;
    }
    if alpha == 0.0 {
        let log_sum: f64 = distances.iter().map(|d| d.ln()).sum();
        return (log_sum / n).exp();
    }
    let sum: f64 = distances.iter().map(|d| d.powf(alpha)).sum();
    (sum / n).powf(1.0 / alpha)
}
