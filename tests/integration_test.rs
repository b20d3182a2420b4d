// Integration tests for ContentDB
use async_trait::async_trait;
use contentdb_core::{
    CallContext, ChannelRule, Error, ErrorKind, ExtractionRequest, FeatureExtractor, FeatureRow,
    FeatureSet, FeatureSetRegistry, FeatureTable, FilterCondition, HostPlatform, ImageInfo,
    ImageRef, Locator, Result, Vector,
};
use contentdb_search::{
    ChannelSelection, ExtractionStatus, FeatureStatus, IndexRequest, SearchOutcome, SearchRequest, SearchService,
    ServiceConfig, ZScoreRanker,
};
use contentdb_storage::StorageManager;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Six images with two channels each. Odd images belong to owner 1 and
/// container 100, even images to owner 2 and container 200.
struct FakeHost {
    describe_calls: AtomicUsize,
}

fn image_info(image_id: u64) -> ImageInfo {
    ImageInfo {
        image_id,
        owner_id: if image_id % 2 == 1 { 1 } else { 2 },
        container_ids: vec![if image_id % 2 == 1 { 100 } else { 200 }],
        channel_names: vec!["DAPI".to_string(), "GFP".to_string()],
        size_z: 1,
        size_t: 1,
        pixels_id: 0,
    }
}

#[async_trait]
impl HostPlatform for FakeHost {
    async fn list_images(&self) -> Result<Vec<ImageRef>> {
        Ok((1..=6)
            .map(|image_id| ImageRef {
                image_id,
                owner_id: image_info(image_id).owner_id,
            })
            .collect())
    }

    async fn describe_images(&self, image_ids: &[u64]) -> Result<HashMap<u64, ImageInfo>> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(image_ids
            .iter()
            .filter(|id| (1..=6).contains(*id))
            .map(|id| (*id, image_info(*id)))
            .collect())
    }
}

/// Appends every extracted row to an in-memory authoritative table.
/// Vectors are `[image_id, channel, 1.0, ...]`.
#[derive(Default)]
struct FakeExtractor {
    tables: Mutex<HashMap<(u64, String), FeatureTable>>,
    fail_channel: Option<u64>,
    short_image: Option<u64>,
    extract_calls: AtomicUsize,
}

fn width_of(featureset: &str) -> usize {
    match featureset {
        "edge" => 2,
        _ => 3,
    }
}

#[async_trait]
impl FeatureExtractor for FakeExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<FeatureRow> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let channel = request.channels[0];
        if self.fail_channel == Some(channel) {
            return Err(Error::Upstream(format!("channel {} unreadable", channel)));
        }

        let mut width = width_of(&request.featureset);
        if self.short_image == Some(request.image_id) {
            width -= 1;
        }
        let values = (0..width)
            .map(|j| match j {
                0 => request.image_id as f64,
                1 => channel as f64,
                _ => 1.0,
            })
            .collect();
        let locator = Locator::new(request.image_id, request.pixels_id, channel, request.z, request.t);
        let row = FeatureRow::new(locator, request.scale, 0, Vector::new(values));

        let columns = (0..width_of(&request.featureset)).map(|j| format!("f{}", j)).collect();
        self.tables
            .lock()
            .unwrap()
            .entry((request.image_id, request.featureset.clone()))
            .or_insert_with(|| FeatureTable::new(columns, Vec::new()))
            .rows
            .push(row.clone());
        Ok(row)
    }

    async fn has(&self, image_id: u64, featureset: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(&(image_id, featureset.to_string()))
            .map(|t| !t.rows.is_empty())
            .unwrap_or(false))
    }

    async fn get_authoritative(&self, image_id: u64, featureset: &str) -> Result<FeatureTable> {
        self.tables
            .lock()
            .unwrap()
            .get(&(image_id, featureset.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("image {}", image_id)))
    }
}

fn registry() -> FeatureSetRegistry {
    FeatureSetRegistry::new(vec![
        FeatureSet::new("hist", 3, ChannelRule::EveryChannel),
        FeatureSet::new("edge", 2, ChannelRule::Channels(vec![0])),
    ])
    .unwrap()
}

fn service_with(dir: &Path, host: Arc<FakeHost>, extractor: Arc<FakeExtractor>) -> SearchService {
    let registry = registry();
    let config = ServiceConfig {
        batch_floor: 4,
        featuresets: registry.iter().cloned().collect(),
        ..ServiceConfig::default()
    };
    let storage = Arc::new(StorageManager::new(dir, registry).unwrap());
    SearchService::new(storage, host, extractor, Arc::new(ZScoreRanker::new()), config).unwrap()
}

fn host() -> Arc<FakeHost> {
    Arc::new(FakeHost {
        describe_calls: AtomicUsize::new(0),
    })
}

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

async fn index_all(service: &SearchService, featureset: &str) {
    for image_id in 1..=6 {
        let mut request = IndexRequest::new(image_id);
        request.container = Some(image_info(image_id).container_ids[0]);
        let report = service
            .calculate_and_index(featureset, &request, &ctx())
            .await
            .unwrap();
        assert!(report.ledgers.iter().all(|l| l.error.is_none()));
    }
}

fn search_request(positive: &[&str], negative: &[&str], k: usize) -> SearchRequest {
    SearchRequest {
        positive: positive.iter().map(|s| s.parse().unwrap()).collect(),
        negative: negative.iter().map(|s| s.parse().unwrap()).collect(),
        result_count: Some(k),
        filter: None,
        container: None,
    }
}

#[tokio::test]
async fn test_index_then_search() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;

    let generation = service.storage().retrieve("hist", None).unwrap();
    assert_eq!(generation.len(), 12);

    let response = service
        .search("hist", &search_request(&["1.0.0.0.0"], &[], 3), &ctx())
        .await
        .unwrap();

    assert_eq!(response.outcome, SearchOutcome::Found);
    assert_eq!(response.results.len(), 3);
    assert!(!response.exhausted);
    assert_eq!(response.scale, 1.0);
    assert_eq!(response.results[0].locator, Locator::image(1));
    let ranks: Vec<usize> = response.results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(response
        .results
        .windows(2)
        .all(|w| w[0].fused_rank <= w[1].fused_rank));
}

#[tokio::test]
async fn test_positive_and_negative_fusion() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;

    // negative only: the example itself is the worst match
    let response = service
        .search("hist", &search_request(&[], &["1.0.0.0.0"], 12), &ctx())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 12);
    assert_eq!(response.results.last().unwrap().locator, Locator::image(1));

    // image 1 wanted, image 6 not: image 1 first, image 6 channel 1 last
    let response = service
        .search("hist", &search_request(&["1.0.0.0.0"], &["6.0.1.0.0"], 20), &ctx())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 12);
    assert_eq!(response.results[0].locator, Locator::image(1));
    assert_eq!(response.results[11].locator, Locator::new(6, 0, 1, 0, 0));
    assert!(response.exhausted);
}

#[tokio::test]
async fn test_filters_applied_after_fusion() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;

    let mut request = search_request(&["1.0.0.0.0"], &[], 4);
    request.filter = Some(FilterCondition::And(vec![
        FilterCondition::OwnerIn(vec![2]),
        FilterCondition::ChannelName("GFP".to_string()),
    ]));
    let response = service.search("hist", &request, &ctx()).await.unwrap();

    // only 3 even images have a GFP row
    assert_eq!(response.results.len(), 3);
    assert!(response.exhausted);
    for result in &response.results {
        assert_eq!(result.owner_id, 2);
        assert_eq!(result.locator.channel, 1);
    }

    request.filter = Some(FilterCondition::OwnerIn(vec![99]));
    let response = service.search("hist", &request, &ctx()).await.unwrap();
    assert_eq!(response.outcome, SearchOutcome::NoResults);
    assert!(response.results.is_empty());
    assert!(response.exhausted);
}

#[tokio::test]
async fn test_container_scoped_search() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;

    let mut request = search_request(&["2.0.0.0.0"], &[], 10);
    request.container = Some(100);
    let response = service.search("hist", &request, &ctx()).await.unwrap();

    // the query image lives in container 200 but may still be used as an example
    assert_eq!(response.results.len(), 6);
    assert!(response.results.iter().all(|r| r.locator.image_id % 2 == 1));
}

#[tokio::test]
async fn test_calculate_and_index_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(FakeExtractor {
        fail_channel: Some(1),
        ..FakeExtractor::default()
    });
    let service = service_with(dir.path(), host(), extractor.clone());

    let report = service
        .calculate_and_index("hist", &IndexRequest::new(1), &ctx())
        .await
        .unwrap();
    assert_eq!(report.status, FeatureStatus::Computed);
    assert_eq!(report.extractions.len(), 2);
    assert_eq!(report.extractions[0].status, ExtractionStatus::Extracted);
    assert!(matches!(
        report.extractions[1].status,
        ExtractionStatus::Failed { kind: ErrorKind::Upstream, .. }
    ));
    assert!(report.ledgers[0].initialized);
    assert_eq!(report.ledgers[0].inserted, 1);

    // features exist now: nothing is extracted and the rows are already indexed
    let report = service
        .calculate_and_index("hist", &IndexRequest::new(1), &ctx())
        .await
        .unwrap();
    assert_eq!(report.status, FeatureStatus::AlreadyPresent);
    assert!(report.extractions.is_empty());
    assert!(!report.ledgers[0].initialized);
    assert_eq!(report.ledgers[0].inserted, 0);
    assert_eq!(report.ledgers[0].duplicates, 1);
    assert_eq!(extractor.extract_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_channel_rule_limits_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));

    let report = service
        .calculate_and_index("edge", &IndexRequest::new(2), &ctx())
        .await
        .unwrap();
    assert_eq!(report.extractions.len(), 1);
    assert_eq!(report.extractions[0].channel, 0);

    let stored = service.featuresets_for_image(2, &ctx()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].featureset, "edge");
    assert_eq!(stored[0].channels, vec!["DAPI".to_string()]);
}

#[tokio::test]
async fn test_wrong_width_reported_per_item() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(FakeExtractor {
        short_image: Some(3),
        ..FakeExtractor::default()
    });
    let service = service_with(dir.path(), host(), extractor);

    let report = service
        .calculate_and_index("hist", &IndexRequest::new(3), &ctx())
        .await
        .unwrap();
    assert!(report.extractions.iter().all(|e| matches!(
        e.status,
        ExtractionStatus::Failed { kind: ErrorKind::InvalidDimension, .. }
    )));
    let ledger = &report.ledgers[0];
    assert_eq!(ledger.inserted, 0);
    assert_eq!(ledger.error.as_ref().unwrap().kind, ErrorKind::InvalidDimension);
}

#[tokio::test]
async fn test_concurrent_indexing_of_one_image() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    service.storage().initialize("hist", Vec::new(), None).unwrap();

    let request = IndexRequest::new(5);
    let (ctx_a, ctx_b, ctx_c, ctx_d) = (ctx(), ctx(), ctx(), ctx());
    let (a, b, c, d) = tokio::join!(
        service.calculate_and_index("hist", &request, &ctx_a),
        service.calculate_and_index("hist", &request, &ctx_b),
        service.calculate_and_index("hist", &request, &ctx_c),
        service.calculate_and_index("hist", &request, &ctx_d),
    );
    for report in [a, b, c, d] {
        assert!(report.unwrap().ledgers[0].error.is_none());
    }
    assert_eq!(service.storage().retrieve("hist", None).unwrap().len(), 2);
}

#[tokio::test]
async fn test_rebuild_reproduces_indexed_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;

    let before = service.storage().retrieve("hist", None).unwrap();
    let report = service.rebuild_index("hist", &ctx()).await.unwrap();
    let after = service.storage().retrieve("hist", None).unwrap();

    assert_eq!(report.images_scanned, 6);
    assert_eq!(report.rows_written, 12);
    assert!(report.failures.is_empty());
    assert_eq!(after.number(), report.generation);
    assert_eq!(before.sorted_rows(), after.sorted_rows());

    // searches keep working against the new generation
    let response = service
        .search("hist", &search_request(&["4.0.0.0.0"], &[], 1), &ctx())
        .await
        .unwrap();
    assert_eq!(response.generation, after.number());
    assert_eq!(response.results[0].locator, Locator::image(4));
}

#[tokio::test]
async fn test_ledgers_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(FakeExtractor::default());
    {
        let service = service_with(dir.path(), host(), extractor.clone());
        index_all(&service, "hist").await;
    }

    let service = service_with(dir.path(), host(), extractor);
    assert_eq!(service.storage().list_ledgers().len(), 3);
    let response = service
        .search("hist", &search_request(&["3.0.1.0.0"], &[], 2), &ctx())
        .await
        .unwrap();
    assert_eq!(response.results[0].locator, Locator::new(3, 0, 1, 0, 0));
}

#[tokio::test]
async fn test_cancelled_search_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let service = service_with(dir.path(), host.clone(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;
    let calls_before = host.describe_calls.load(Ordering::SeqCst);

    let (ctx, handle) = service.context();
    handle.cancel();
    let err = service
        .search("hist", &search_request(&["1.0.0.0.0"], &[], 3), &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(host.describe_calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn test_unknown_example_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));
    index_all(&service, "hist").await;

    let err = service
        .search("hist", &search_request(&["1.0.7.0.0"], &[], 3), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(ref m) if m.contains("1.0.7.0.0")));
}

#[tokio::test]
async fn test_index_whole_container() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(FakeExtractor {
        short_image: Some(3),
        ..FakeExtractor::default()
    });
    let service = service_with(dir.path(), host(), extractor);

    let mut request = IndexRequest::new(0);
    request.container = Some(100);
    let report = service
        .calculate_and_index_container("hist", 100, &request, &ctx())
        .await
        .unwrap();

    let ids: Vec<u64> = report.images.iter().map(|i| i.image_id).collect();
    assert_eq!(ids, vec![1, 3, 5]);
    // the malformed image is reported without stopping the batch
    let broken = report.images[1].report.as_ref().unwrap();
    assert_eq!(broken.ledgers[0].error.as_ref().unwrap().kind, ErrorKind::InvalidDimension);
    assert!(report.images[2].report.as_ref().unwrap().ledgers.iter().all(|l| l.error.is_none()));

    let swept: Vec<(Option<u64>, f64, usize)> = report
        .sweeps
        .iter()
        .map(|s| (s.container, s.scale, s.removed))
        .collect();
    assert_eq!(swept, vec![(None, 1.0, 0), (Some(100), 1.0, 0)]);

    assert_eq!(service.storage().retrieve("hist", None).unwrap().len(), 4);
    assert_eq!(service.storage().retrieve("hist", Some(100)).unwrap().len(), 4);
}

#[tokio::test]
async fn test_index_container_collects_per_image_errors() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), host(), Arc::new(FakeExtractor::default()));

    let mut request = IndexRequest::new(0);
    request.channels = ChannelSelection::Some(vec![5]);
    let report = service
        .calculate_and_index_container("hist", 200, &request, &ctx())
        .await
        .unwrap();

    assert_eq!(report.images.len(), 3);
    for image in &report.images {
        assert!(image.report.is_none());
        assert_eq!(image.error.as_ref().unwrap().kind, ErrorKind::InvalidRequest);
    }
    assert!(report.sweeps.is_empty());
    assert!(!service.storage().exists("hist", None));
}
