use contentdb_core::{Error, FeatureSet, FeatureSetRegistry, Normalization, RankParams, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of the search service. Every field has a default, so an empty
/// JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Minimum number of fused candidates checked per host round-trip.
    pub batch_floor: usize,
    /// Host round-trips allowed in flight at once.
    pub host_concurrency: usize,
    pub call_timeout_ms: u64,
    pub alpha: f64,
    pub normalization: Normalization,
    pub featuresets: Vec<FeatureSet>,
    pub default_result_count: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            batch_floor: 100,
            host_concurrency: 4,
            call_timeout_ms: 30_000,
            alpha: -5.0,
            normalization: Normalization::Zscore,
            featuresets: FeatureSetRegistry::default().iter().cloned().collect(),
            default_result_count: 10,
        }
    }
}

impl ServiceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: ServiceConfig = serde_json::from_str(&data)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_floor == 0 {
            return Err(Error::InvalidConfig("batch_floor must be at least 1".to_string()));
        }
        if self.host_concurrency == 0 {
            return Err(Error::InvalidConfig("host_concurrency must be at least 1".to_string()));
        }
        if self.call_timeout_ms == 0 {
            return Err(Error::InvalidConfig("call_timeout_ms must be positive".to_string()));
        }
        if self.default_result_count == 0 {
            return Err(Error::InvalidConfig("default_result_count must be at least 1".to_string()));
        }
        if !self.alpha.is_finite() {
            return Err(Error::InvalidConfig("alpha must be finite".to_string()));
        }
        self.registry().map(|_| ())
    }

    pub fn registry(&self) -> Result<FeatureSetRegistry> {
        FeatureSetRegistry::new(self.featuresets.clone())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn rank_params(&self) -> RankParams {
        RankParams {
            alpha: self.alpha,
            normalization: self.normalization,
        }
    }
}
