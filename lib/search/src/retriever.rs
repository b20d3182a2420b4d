//! Filtered top-K over a fused ranking.
//!
//! The fused list is walked in batches of `max(K, floor)`. Each batch costs one
//! bulk `describe_images` call; up to `concurrency` of those are in flight, but
//! replies are consumed strictly in batch order so matches keep fused order.

use crate::fusion::FusedEntry;
use contentdb_core::{CallContext, Error, Filter, HostPlatform, Locator, Result};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub locator: Locator,
    /// 1-based position in the final result list.
    pub rank: usize,
    pub fused_rank: f64,
    pub owner_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalPage {
    pub results: Vec<RankedResult>,
    /// Fewer than K matches exist in the whole fused list.
    pub exhausted: bool,
}

pub struct Retriever<'a> {
    host: &'a dyn HostPlatform,
    batch_floor: usize,
    concurrency: usize,
}

impl<'a> Retriever<'a> {
    pub fn new(host: &'a dyn HostPlatform, batch_floor: usize, concurrency: usize) -> Self {
        Self {
            host,
            batch_floor: batch_floor.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn batch_size(&self, k: usize) -> usize {
        k.max(self.batch_floor)
    }

    /// Up to `k` entries of `fused` that still exist on the host and pass
    /// `filter`, in fused order. Any host failure fails the whole call.
    pub async fn top_k(
        &self,
        fused: &[FusedEntry],
        k: usize,
        filter: Option<&dyn Filter>,
        ctx: &CallContext,
    ) -> Result<RetrievalPage> {
        if k == 0 {
            return Err(Error::InvalidRequest("result count must be at least 1".to_string()));
        }

        let host = self.host;
        let mut replies = stream::iter(fused.chunks(self.batch_size(k)))
            .map(|batch| async move {
                let image_ids: Vec<u64> = batch
                    .iter()
                    .map(|e| e.locator.image_id)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let infos = ctx
                    .run("host.describe_images", host.describe_images(&image_ids))
                    .await?;
                Ok::<_, Error>((batch, infos))
            })
            .buffered(self.concurrency);

        // k comes from the client; never reserve beyond the candidate count
        let mut results = Vec::with_capacity(k.min(fused.len()));
        let mut batches = 0usize;
        'batches: while let Some(reply) = replies.next().await {
            let (batch, infos) = reply?;
            batches += 1;
            for entry in batch {
                let Some(info) = infos.get(&entry.locator.image_id) else {
                    continue;
                };
                if filter.map_or(true, |f| f.matches(&entry.locator, info)) {
                    results.push(RankedResult {
                        locator: entry.locator,
                        rank: results.len() + 1,
                        fused_rank: entry.combined_rank,
                        owner_id: info.owner_id,
                    });
                    if results.len() == k {
                        break 'batches;
                    }
                }
            }
        }

        debug!(
            "Retrieved {} of {} requested from {} fused candidates in {} batches",
            results.len(),
            k,
            fused.len(),
            batches
        );
        Ok(RetrievalPage {
            exhausted: results.len() < k,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use contentdb_core::{FilterCondition, ImageInfo, ImageRef};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Every image exists; owner = image_id % 2. Images listed in `missing` do not.
    struct Host {
        calls: AtomicUsize,
        missing: Vec<u64>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl Host {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                missing: Vec::new(),
                fail: false,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl HostPlatform for Host {
        async fn list_images(&self) -> Result<Vec<ImageRef>> {
            Ok(Vec::new())
        }

        async fn describe_images(&self, image_ids: &[u64]) -> Result<HashMap<u64, ImageInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(Error::Upstream("host unavailable".into()));
            }
            Ok(image_ids
                .iter()
                .filter(|id| !self.missing.contains(id))
                .map(|id| {
                    let info = ImageInfo {
                        image_id: *id,
                        owner_id: id % 2,
                        container_ids: vec![],
                        channel_names: vec!["DAPI".into()],
                        size_z: 1,
                        size_t: 1,
                        pixels_id: 0,
                    };
                    (*id, info)
                })
                .collect())
        }
    }

    fn fused(n: u64) -> Vec<FusedEntry> {
        (0..n)
            .map(|i| FusedEntry {
                locator: Locator::image(i),
                combined_rank: i as f64,
            })
            .collect()
    }

    fn ctx() -> CallContext {
        CallContext::with_timeout(Duration::from_secs(5))
    }

    fn ids(page: &RetrievalPage) -> Vec<u64> {
        page.results.iter().map(|r| r.locator.image_id).collect()
    }

    #[tokio::test]
    async fn test_stops_after_first_batch_when_k_found() {
        let host = Host::new();
        let retriever = Retriever::new(&host, 10, 1);
        let page = retriever.top_k(&fused(100), 3, None, &ctx()).await.unwrap();

        assert_eq!(ids(&page), vec![0, 1, 2]);
        assert_eq!(page.results[2].rank, 3);
        assert!(!page.exhausted);
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filter_preserves_fused_order_across_batches() {
        let host = Host::new();
        let retriever = Retriever::new(&host, 4, 1);
        let odd = FilterCondition::OwnerIn(vec![1]);
        let page = retriever.top_k(&fused(20), 5, Some(&odd), &ctx()).await.unwrap();

        // batch size is max(5, 4) = 5; 5 odd ids need two batches
        assert_eq!(ids(&page), vec![1, 3, 5, 7, 9]);
        assert!(page.results.iter().all(|r| r.owner_id == 1));
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_filter_matching_nothing_is_empty_and_exhausted() {
        let host = Host::new();
        let retriever = Retriever::new(&host, 10, 2);
        let nobody = FilterCondition::OwnerIn(vec![99]);
        let page = retriever.top_k(&fused(35), 5, Some(&nobody), &ctx()).await.unwrap();

        assert!(page.results.is_empty());
        assert!(page.exhausted);
        assert_eq!(host.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_missing_images_are_dropped() {
        let mut host = Host::new();
        host.missing = vec![0, 2];
        let retriever = Retriever::new(&host, 100, 1);
        let page = retriever.top_k(&fused(4), 10, None, &ctx()).await.unwrap();

        assert_eq!(ids(&page), vec![1, 3]);
        assert_eq!(page.results[1].rank, 2);
        assert_eq!(page.results[1].fused_rank, 3.0);
        assert!(page.exhausted);
    }

    #[tokio::test]
    async fn test_never_more_than_k_with_concurrency() {
        let host = Host::new();
        let retriever = Retriever::new(&host, 2, 4);
        let page = retriever.top_k(&fused(50), 7, None, &ctx()).await.unwrap();
        assert_eq!(page.results.len(), 7);
        assert_eq!(ids(&page), (0..7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_huge_result_count_returns_every_candidate() {
        let host = Host::new();
        let retriever = Retriever::new(&host, 100, 1);
        let page = retriever.top_k(&fused(3), usize::MAX / 2, None, &ctx()).await.unwrap();

        assert_eq!(ids(&page), vec![0, 1, 2]);
        assert!(page.exhausted);
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_error_discards_results() {
        let mut host = Host::new();
        host.fail = true;
        let retriever = Retriever::new(&host, 10, 1);
        let err = retriever.top_k(&fused(30), 5, None, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn test_timeout_fails_request() {
        let mut host = Host::new();
        host.delay = Some(Duration::from_secs(5));
        let retriever = Retriever::new(&host, 10, 1);
        let short = CallContext::with_timeout(Duration::from_millis(20));
        let err = retriever.top_k(&fused(30), 5, None, &short).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_zero_k_rejected() {
        let host = Host::new();
        let retriever = Retriever::new(&host, 10, 1);
        assert!(matches!(
            retriever.top_k(&fused(3), 0, None, &ctx()).await,
            Err(Error::InvalidRequest(_))
        ));
    }
}
