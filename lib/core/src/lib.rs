//! # ContentDB Core
//!
//! Core types for the ContentDB content-based image retrieval engine.
//!
//! - [`Locator`] - identity of one feature extraction instance (`"i.p.c.z.t"`)
//! - [`FeatureSet`] / [`FeatureSetRegistry`] - feature families and their widths
//! - [`FeatureRow`] / [`FeatureTable`] - extracted vectors and per-image records
//! - [`FilterCondition`] - post-fusion owner/container/channel filters
//! - [`CallContext`] - per-call timeout and cancellation for collaborator calls
//! - [`HostPlatform`], [`FeatureExtractor`], [`SimilarityRanker`] - external collaborators
//!
//! ## Example
//!
//! ```rust
//! use contentdb_core::{locator, FeatureRow, Locator, Vector};
//!
//! let loc: Locator = "78615.0.0.0.0".parse().unwrap();
//! assert_eq!(locator::encode(78615, 0, 0, 0, 0), loc.to_string());
//!
//! let row = FeatureRow::new(loc, 1.0, 2, Vector::new(vec![0.1, 0.2]));
//! assert_eq!(row.key().unwrap().0, loc);
//! ```

pub mod context;
pub mod error;
pub mod extractor;
pub mod featureset;
pub mod filter;
pub mod host;
pub mod locator;
pub mod ranking;
pub mod row;
pub mod vector;

pub use context::{CallContext, CancelHandle};
pub use error::{Error, ErrorKind, Result};
pub use extractor::{ExtractionRequest, FeatureExtractor};
pub use featureset::{ChannelRule, FeatureSet, FeatureSetRegistry, KEY_SEPARATOR};
pub use filter::{Filter, FilterCondition};
pub use host::{HostPlatform, ImageInfo, ImageRef};
pub use locator::Locator;
pub use ranking::{Normalization, RankParams, Ranked, SimilarityRanker};
pub use row::{latest_row_for, most_recent_wins, scale_key, FeatureRow, FeatureTable, Scale};
pub use vector::Vector;
