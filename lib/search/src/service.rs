//! The operations exposed to clients: search, calculate-and-index, rebuild.

use crate::config::ServiceConfig;
use crate::fusion::fuse;
use crate::resolver::{nearest_scale, query_scale, QueryItem, QueryResolver};
use crate::retriever::{RankedResult, Retriever};
use contentdb_core::{
    most_recent_wins, CallContext, CancelHandle, Error, ErrorKind, ExtractionRequest,
    FeatureExtractor, FeatureRow, FeatureSet, FeatureSetRegistry, Filter, FilterCondition,
    HostPlatform, ImageInfo, Locator, Result, SimilarityRanker, Vector,
};
use contentdb_storage::{Compactor, RebuildReport, StorageManager, UpsertOutcome};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub positive: Vec<Locator>,
    pub negative: Vec<Locator>,
    /// Number of results wanted; the configured default when absent.
    pub result_count: Option<usize>,
    pub filter: Option<FilterCondition>,
    /// Search the ledger of this container instead of the global one.
    pub container: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOutcome {
    Found,
    NoResults,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub outcome: SearchOutcome,
    pub results: Vec<RankedResult>,
    pub exhausted: bool,
    /// Ledger scale the candidates were taken from.
    pub scale: f64,
    pub generation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSelection {
    #[default]
    All,
    Some(Vec<u64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaneSelection {
    All,
    Index(u64),
}

impl Default for PlaneSelection {
    fn default() -> Self {
        PlaneSelection::Index(0)
    }
}

impl PlaneSelection {
    fn resolve(&self, size: u64, axis: &str) -> Result<Vec<u64>> {
        match self {
            PlaneSelection::All => Ok((0..size.max(1)).collect()),
            PlaneSelection::Index(i) if *i < size.max(1) => Ok(vec![*i]),
            PlaneSelection::Index(i) => Err(Error::InvalidRequest(format!(
                "{} index {} out of range (size {})",
                axis, i, size
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Taken from the URL path when submitted over REST.
    #[serde(default)]
    pub image_id: u64,
    #[serde(default)]
    pub channels: ChannelSelection,
    #[serde(default)]
    pub z: PlaneSelection,
    #[serde(default)]
    pub t: PlaneSelection,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Also add the rows to the global ledger.
    #[serde(default = "default_true")]
    pub global: bool,
    /// Also add the rows to this container's ledger.
    #[serde(default)]
    pub container: Option<u64>,
}

impl IndexRequest {
    pub fn new(image_id: u64) -> Self {
        Self {
            image_id,
            channels: ChannelSelection::All,
            z: PlaneSelection::default(),
            t: PlaneSelection::default(),
            scale: default_scale(),
            global: true,
            container: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Features already existed; nothing was extracted.
    AlreadyPresent,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionStatus {
    Extracted,
    Failed { kind: ErrorKind, message: String },
}

impl ExtractionStatus {
    fn failed(e: &Error) -> Self {
        ExtractionStatus::Failed {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionItem {
    pub channel: u64,
    pub z: u64,
    pub t: u64,
    #[serde(flatten)]
    pub status: ExtractionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for LedgerError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerOutcome {
    pub container: Option<u64>,
    pub initialized: bool,
    pub inserted: usize,
    pub duplicates: usize,
    /// Distinct scales of the rows this ledger accepted.
    pub scales: Vec<f64>,
    pub error: Option<LedgerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub image_id: u64,
    pub featureset: String,
    pub status: FeatureStatus,
    pub extractions: Vec<ExtractionItem>,
    pub ledgers: Vec<LedgerOutcome>,
}

/// One image of a container-wide calculation: its report, or why it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageOutcome {
    pub image_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<IndexReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LedgerError>,
}

/// Duplicate removal over one (ledger, scale) after a container-wide calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateSweep {
    pub container: Option<u64>,
    pub scale: f64,
    pub removed: usize,
    pub error: Option<LedgerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerIndexReport {
    pub container_id: u64,
    pub featureset: String,
    pub images: Vec<ImageOutcome>,
    pub sweeps: Vec<DuplicateSweep>,
}

/// A feature set stored on an image, with the channels it covers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFeatureSet {
    pub featureset: String,
    pub channels: Vec<String>,
}

pub struct SearchService {
    storage: Arc<StorageManager>,
    host: Arc<dyn HostPlatform>,
    extractor: Arc<dyn FeatureExtractor>,
    ranker: Arc<dyn SimilarityRanker>,
    config: ServiceConfig,
}

impl SearchService {
    pub fn new(
        storage: Arc<StorageManager>,
        host: Arc<dyn HostPlatform>,
        extractor: Arc<dyn FeatureExtractor>,
        ranker: Arc<dyn SimilarityRanker>,
        config: ServiceConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            host,
            extractor,
            ranker,
            config,
        })
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &FeatureSetRegistry {
        self.storage.registry()
    }

    /// A fresh call context using the configured per-call timeout.
    pub fn context(&self) -> (CallContext, CancelHandle) {
        CallContext::new(self.config.call_timeout())
    }

    /// Rank the ledger of `featureset` against the selected examples.
    pub async fn search(&self, featureset: &str, request: &SearchRequest, ctx: &CallContext) -> Result<SearchResponse> {
        let span = info_span!("search", request_id = %Uuid::new_v4(), featureset = %featureset);
        self.search_inner(featureset, request, ctx).instrument(span).await
    }

    async fn search_inner(&self, featureset: &str, request: &SearchRequest, ctx: &CallContext) -> Result<SearchResponse> {
        if request.positive.is_empty() && request.negative.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one positive or negative example is required".to_string(),
            ));
        }
        let k = request.result_count.unwrap_or(self.config.default_result_count);
        if k == 0 {
            return Err(Error::InvalidRequest("result count must be at least 1".to_string()));
        }
        let set = self.registry().get(featureset)?.clone();

        // one snapshot for the whole request; a concurrent rebuild does not affect it
        let generation = self.storage.retrieve(&set.name, request.container)?;

        let mut resolver = QueryResolver::new(self.extractor.as_ref(), &set.name, ctx);
        let (positives, negatives) = resolver.resolve_all(&request.positive, &request.negative).await?;
        for item in positives.iter().chain(&negatives) {
            set.check_width(item.vector.dim())?;
        }

        let all: Vec<QueryItem> = positives.iter().chain(&negatives).cloned().collect();
        let target = query_scale(&all)
            .ok_or_else(|| Error::InvalidRequest("no examples left after resolution".to_string()))?;
        let scale = nearest_scale(generation.scales(), target)
            .ok_or_else(|| Error::NotFound(format!("ledger of {} has no rows", set.name)))?;
        let pool = generation.rows(scale);
        debug!(
            "Query scale {} resolved to ledger scale {} with {} candidates",
            target,
            scale,
            pool.len()
        );

        let params = self.config.rank_params();
        let ranked_positive = self.rank(&positives, pool, &params).await?;
        let ranked_negative = self.rank(&negatives, pool, &params).await?;
        let fused = fuse(ranked_positive.as_deref(), ranked_negative.as_deref())?;

        let retriever = Retriever::new(self.host.as_ref(), self.config.batch_floor, self.config.host_concurrency);
        let filter = request.filter.as_ref().map(|f| f as &dyn Filter);
        let page = retriever.top_k(&fused, k, filter, ctx).await?;

        let outcome = if page.results.is_empty() {
            SearchOutcome::NoResults
        } else {
            SearchOutcome::Found
        };
        info!(
            "Search over {} returned {} results (exhausted: {})",
            set.name,
            page.results.len(),
            page.exhausted
        );
        Ok(SearchResponse {
            outcome,
            results: page.results,
            exhausted: page.exhausted,
            scale: scale.0,
            generation: generation.number(),
        })
    }

    async fn rank(
        &self,
        items: &[QueryItem],
        pool: &[FeatureRow],
        params: &contentdb_core::RankParams,
    ) -> Result<Option<Vec<Locator>>> {
        if items.is_empty() {
            return Ok(None);
        }
        let queries: Vec<Vector> = items.iter().map(|item| item.vector.clone()).collect();
        let ranked = self.ranker.rank(&queries, pool, params).await?;
        Ok(Some(ranked.into_iter().map(|r| r.locator).collect()))
    }

    async fn describe(&self, image_id: u64, ctx: &CallContext) -> Result<ImageInfo> {
        let mut infos = ctx
            .run("host.describe_images", self.host.describe_images(&[image_id]))
            .await?;
        infos
            .remove(&image_id)
            .ok_or_else(|| Error::NotFound(format!("image {}", image_id)))
    }

    /// Extract features for one image if it has none, then add its
    /// authoritative rows to the requested ledgers.
    pub async fn calculate_and_index(
        &self,
        featureset: &str,
        request: &IndexRequest,
        ctx: &CallContext,
    ) -> Result<IndexReport> {
        let set = self.registry().get(featureset)?.clone();
        let info = self.describe(request.image_id, ctx).await?;

        let present = ctx
            .run("extractor.has", self.extractor.has(request.image_id, &set.name))
            .await?;
        let (status, extractions) = if present {
            debug!("Image {} already has {} features", request.image_id, set.name);
            (FeatureStatus::AlreadyPresent, Vec::new())
        } else {
            (FeatureStatus::Computed, self.extract_all(&set, &info, request, ctx).await?)
        };

        let mut targets = Vec::new();
        if request.global {
            targets.push(None);
        }
        if let Some(container) = request.container {
            targets.push(Some(container));
        }

        let ledgers = if targets.is_empty() {
            Vec::new()
        } else {
            self.index_image(&set, &info, &targets, ctx).await?
        };

        Ok(IndexReport {
            image_id: request.image_id,
            featureset: set.name,
            status,
            extractions,
            ledgers,
        })
    }

    async fn extract_all(
        &self,
        set: &FeatureSet,
        info: &ImageInfo,
        request: &IndexRequest,
        ctx: &CallContext,
    ) -> Result<Vec<ExtractionItem>> {
        let mut channels = set.channels.channels_for(info.size_c());
        if let ChannelSelection::Some(selected) = &request.channels {
            channels.retain(|c| selected.contains(c));
        }
        if channels.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "no selected channel of image {} applies to {}",
                info.image_id, set.name
            )));
        }
        let zs = request.z.resolve(info.size_z, "z")?;
        let ts = request.t.resolve(info.size_t, "t")?;

        let mut items = Vec::with_capacity(channels.len() * zs.len() * ts.len());
        for &channel in &channels {
            for &z in &zs {
                for &t in &ts {
                    let extraction = ExtractionRequest {
                        image_id: info.image_id,
                        featureset: set.name.clone(),
                        pixels_id: info.pixels_id,
                        channels: vec![channel],
                        z,
                        t,
                        scale: request.scale,
                    };
                    let operation = format!("extractor.extract({})", info.image_id);
                    let outcome = ctx
                        .run(&operation, self.extractor.extract(&extraction))
                        .await
                        .and_then(|row| set.check_width(row.vector.dim()));
                    let status = match outcome {
                        Ok(()) => ExtractionStatus::Extracted,
                        Err(Error::Cancelled(op)) => return Err(Error::Cancelled(op)),
                        Err(e) => {
                            warn!(
                                "Extraction of {} on image {} (c={}, z={}, t={}) failed: {}",
                                set.name, info.image_id, channel, z, t, e
                            );
                            ExtractionStatus::failed(&e)
                        }
                    };
                    items.push(ExtractionItem { channel, z, t, status });
                }
            }
        }
        Ok(items)
    }

    async fn index_image(
        &self,
        set: &FeatureSet,
        info: &ImageInfo,
        targets: &[Option<u64>],
        ctx: &CallContext,
    ) -> Result<Vec<LedgerOutcome>> {
        let operation = format!("extractor.get_authoritative({})", info.image_id);
        let table = match ctx
            .run(&operation, self.extractor.get_authoritative(info.image_id, &set.name))
            .await
        {
            Ok(table) => most_recent_wins(table.rows).map(|(rows, _)| (table.column_names, rows)),
            Err(Error::Cancelled(op)) => return Err(Error::Cancelled(op)),
            Err(e) => Err(e),
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for container in targets {
            let mut outcome = LedgerOutcome {
                container: *container,
                initialized: false,
                inserted: 0,
                duplicates: 0,
                scales: Vec::new(),
                error: None,
            };
            let result = match &table {
                Ok((columns, rows)) => self
                    .index_rows(set, info, columns, rows, *container, &mut outcome)
                    .map_err(|e| LedgerError::from(&e)),
                Err(e) => Err(LedgerError::from(e)),
            };
            if let Err(error) = result {
                warn!(
                    "Indexing image {} into {} failed: {}",
                    info.image_id, set.name, error.message
                );
                outcome.error = Some(error);
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn index_rows(
        &self,
        set: &FeatureSet,
        info: &ImageInfo,
        columns: &[String],
        rows: &[FeatureRow],
        container: Option<u64>,
        outcome: &mut LedgerOutcome,
    ) -> Result<()> {
        if !self.storage.exists(&set.name, container) {
            match self.storage.initialize(&set.name, columns.to_vec(), container) {
                Ok(()) => outcome.initialized = true,
                // lost a race with another indexer
                Err(Error::LedgerExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        for row in rows {
            let mut row = row.clone();
            row.owner_id = info.owner_id;
            row.container_id = container;
            let scale = row.scale;
            match self.storage.upsert(&set.name, row)? {
                UpsertOutcome::Inserted { .. } => outcome.inserted += 1,
                UpsertOutcome::Duplicate => outcome.duplicates += 1,
            }
            if !outcome.scales.contains(&scale) {
                outcome.scales.push(scale);
            }
        }
        Ok(())
    }

    /// Run [`calculate_and_index`](Self::calculate_and_index) for every image
    /// of a container, then drop duplicates at every scale that was indexed.
    ///
    /// `request` applies to each image; its `image_id` is ignored. A failing
    /// image is reported and the batch goes on; only cancellation aborts it.
    pub async fn calculate_and_index_container(
        &self,
        featureset: &str,
        container_id: u64,
        request: &IndexRequest,
        ctx: &CallContext,
    ) -> Result<ContainerIndexReport> {
        let set = self.registry().get(featureset)?.clone();
        let images = ctx
            .run("host.container_images", self.host.container_images(container_id))
            .await?;
        info!(
            "Calculating {} for {} images of container {}",
            set.name,
            images.len(),
            container_id
        );

        let mut outcomes = Vec::with_capacity(images.len());
        let mut touched: BTreeSet<(Option<u64>, OrderedFloat<f64>)> = BTreeSet::new();
        for image in &images {
            let mut per_image = request.clone();
            per_image.image_id = image.image_id;
            match self.calculate_and_index(&set.name, &per_image, ctx).await {
                Ok(report) => {
                    for ledger in &report.ledgers {
                        touched.extend(ledger.scales.iter().map(|s| (ledger.container, OrderedFloat(*s))));
                    }
                    outcomes.push(ImageOutcome {
                        image_id: image.image_id,
                        report: Some(report),
                        error: None,
                    });
                }
                Err(Error::Cancelled(op)) => return Err(Error::Cancelled(op)),
                Err(e) => {
                    warn!("Skipping image {} of container {}: {}", image.image_id, container_id, e);
                    outcomes.push(ImageOutcome {
                        image_id: image.image_id,
                        report: None,
                        error: Some(LedgerError::from(&e)),
                    });
                }
            }
        }

        let mut sweeps = Vec::with_capacity(touched.len());
        for (container, scale) in touched {
            let (removed, error) = match self.storage.remove_duplicates(scale.0, &set.name, container) {
                Ok(removed) => (removed, None),
                Err(e) => {
                    warn!("Duplicate removal at scale {} of {} failed: {}", scale, set.name, e);
                    (0, Some(LedgerError::from(&e)))
                }
            };
            sweeps.push(DuplicateSweep {
                container,
                scale: scale.0,
                removed,
                error,
            });
        }

        Ok(ContainerIndexReport {
            container_id,
            featureset: set.name,
            images: outcomes,
            sweeps,
        })
    }

    /// Recompute the global ledger of `featureset` from authoritative tables.
    pub async fn rebuild_index(&self, featureset: &str, ctx: &CallContext) -> Result<RebuildReport> {
        Compactor::new(&self.storage, self.host.as_ref(), self.extractor.as_ref())
            .rebuild(featureset, ctx)
            .await
    }

    /// Registered feature sets stored on an image, with the channel names each covers.
    pub async fn featuresets_for_image(&self, image_id: u64, ctx: &CallContext) -> Result<Vec<StoredFeatureSet>> {
        let info = self.describe(image_id, ctx).await?;
        let mut stored = Vec::new();
        for set in self.registry().iter() {
            if !ctx.run("extractor.has", self.extractor.has(image_id, &set.name)).await? {
                continue;
            }
            let channels = set
                .channels
                .channels_for(info.size_c())
                .into_iter()
                .filter_map(|c| info.channel_names.get(c as usize).cloned())
                .collect();
            stored.push(StoredFeatureSet {
                featureset: set.name.clone(),
                channels,
            });
        }
        Ok(stored)
    }
}
