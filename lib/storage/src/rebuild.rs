//! Recompute a feature set's global ledger from the per-image authoritative
//! tables and swap it in as a new generation.

use crate::manager::StorageManager;
use chrono::{DateTime, Utc};
use contentdb_core::{
    most_recent_wins, scale_key, CallContext, Error, ErrorKind, FeatureExtractor, FeatureRow,
    FeatureTable, HostPlatform, ImageRef, Result, Scale,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Rows written for one (owner, scale) group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub owner_id: u64,
    pub scale: f64,
    pub rows: usize,
}

/// An image that was skipped during a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFailure {
    pub image_id: u64,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub featureset: String,
    pub generation: u64,
    pub images_scanned: usize,
    pub images_indexed: usize,
    pub rows_written: usize,
    pub duplicates_dropped: usize,
    pub groups: Vec<GroupSummary>,
    pub failures: Vec<ImageFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Compactor<'a> {
    storage: &'a StorageManager,
    host: &'a dyn HostPlatform,
    extractor: &'a dyn FeatureExtractor,
}

struct Collected {
    column_names: Option<Vec<String>>,
    groups: BTreeMap<(u64, Scale), Vec<FeatureRow>>,
    images_indexed: usize,
    duplicates_dropped: usize,
    failures: Vec<ImageFailure>,
}

impl<'a> Compactor<'a> {
    pub fn new(storage: &'a StorageManager, host: &'a dyn HostPlatform, extractor: &'a dyn FeatureExtractor) -> Self {
        Self {
            storage,
            host,
            extractor,
        }
    }

    /// Rebuild the global ledger of `featureset`.
    ///
    /// Per-image failures are reported and skipped. Listing failures,
    /// cancellation, a failed swap, or every image failing abort the rebuild
    /// and leave the current generation in place.
    pub async fn rebuild(&self, featureset: &str, ctx: &CallContext) -> Result<RebuildReport> {
        let started_at = Utc::now();
        let guard = self.storage.begin_rebuild(featureset)?;
        let set = self.storage.registry().get(featureset)?.clone();

        let images = ctx.run("host.list_images", self.host.list_images()).await?;
        info!("Rebuilding {} from {} images", set.name, images.len());

        let mut collected = Collected {
            column_names: None,
            groups: BTreeMap::new(),
            images_indexed: 0,
            duplicates_dropped: 0,
            failures: Vec::new(),
        };

        for image in &images {
            let operation = format!("extractor.get_authoritative({})", image.image_id);
            let fetched = ctx
                .run(&operation, self.extractor.get_authoritative(image.image_id, &set.name))
                .await;
            let outcome = match fetched {
                Ok(table) => collected.add_image(image, table, set.width),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {}
                Err(Error::Cancelled(op)) => return Err(Error::Cancelled(op)),
                Err(Error::NotFound(_)) => {
                    debug!("Image {} has no {} features", image.image_id, set.name);
                }
                Err(e) => {
                    warn!("Skipping image {} during rebuild of {}: {}", image.image_id, set.name, e);
                    collected.failures.push(ImageFailure {
                        image_id: image.image_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if !images.is_empty() && collected.failures.len() == images.len() {
            return Err(Error::Upstream(format!(
                "rebuild of {} aborted: all {} images failed",
                set.name,
                images.len()
            )));
        }
        ctx.check("rebuild.swap")?;

        let groups: Vec<GroupSummary> = collected
            .groups
            .iter()
            .map(|((owner_id, scale), rows)| GroupSummary {
                owner_id: *owner_id,
                scale: scale.0,
                rows: rows.len(),
            })
            .collect();
        let rows: Vec<FeatureRow> = collected.groups.into_values().flatten().collect();
        let rows_written = rows.len();

        let generation = self.storage.install_generation(
            &guard,
            collected.column_names.unwrap_or_default(),
            rows,
        )?;

        let report = RebuildReport {
            featureset: set.name,
            generation: generation.number(),
            images_scanned: images.len(),
            images_indexed: collected.images_indexed,
            rows_written,
            duplicates_dropped: collected.duplicates_dropped,
            groups,
            failures: collected.failures,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Rebuilt {} as generation {}: {} rows from {} images, {} duplicates dropped, {} failures",
            report.featureset,
            report.generation,
            report.rows_written,
            report.images_indexed,
            report.duplicates_dropped,
            report.failures.len()
        );
        Ok(report)
    }
}

impl Collected {
    fn add_image(&mut self, image: &ImageRef, table: FeatureTable, width: usize) -> Result<()> {
        match &self.column_names {
            Some(columns) if *columns != table.column_names => {
                return Err(Error::InvariantViolation(format!(
                    "image {} has {} columns, expected {}",
                    image.image_id,
                    table.column_names.len(),
                    columns.len()
                )));
            }
            _ => {}
        }
        for row in &table.rows {
            if row.vector.dim() != width {
                return Err(Error::InvariantViolation(format!(
                    "row {} has width {}, expected {}",
                    row.locator,
                    row.vector.dim(),
                    width
                )));
            }
            if !row.vector.is_finite() {
                return Err(Error::Format(format!(
                    "vector of {} has non-finite components",
                    row.locator
                )));
            }
            if row.locator.image_id != image.image_id {
                return Err(Error::InvariantViolation(format!(
                    "row {} is attached to image {}",
                    row.locator, image.image_id
                )));
            }
        }

        let (survivors, dropped) = most_recent_wins(table.rows)?;
        for mut row in survivors {
            row.owner_id = image.owner_id;
            row.container_id = None;
            let scale = scale_key(row.scale)?;
            self.groups.entry((image.owner_id, scale)).or_default().push(row);
        }

        if self.column_names.is_none() {
            self.column_names = Some(table.column_names);
        }
        self.duplicates_dropped += dropped;
        self.images_indexed += 1;
        Ok(())
    }
}
