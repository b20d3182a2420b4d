use crate::{FeatureRow, Locator, Result, Vector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Column normalization applied before distances are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    Zscore,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankParams {
    /// Exponent of the power mean over distances to the query set.
    pub alpha: f64,
    pub normalization: Normalization,
}

impl Default for RankParams {
    fn default() -> Self {
        Self {
            alpha: -5.0,
            normalization: Normalization::Zscore,
        }
    }
}

/// A candidate in ranked position, with the ranker's distance score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ranked {
    pub locator: Locator,
    pub score: f64,
}

/// Nearest-neighbour ranking of a candidate pool against a set of query vectors.
#[async_trait]
pub trait SimilarityRanker: Send + Sync {
    /// Rank every candidate in `pool`, most similar first.
    async fn rank(
        &self,
        queries: &[Vector],
        pool: &[FeatureRow],
        params: &RankParams,
    ) -> Result<Vec<Ranked>>;
}
