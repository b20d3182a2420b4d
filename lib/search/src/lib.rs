//! # ContentDB Search
//!
//! Relevance-feedback search over feature ledgers.
//!
//! A search resolves the positive and negative examples to their stored
//! vectors, ranks the ledger once per polarity, fuses both rankings by average
//! rank, and walks the fused order through the host's membership filters until
//! enough results are found.
//!
//! ```text
//! examples ──> QueryResolver ──> SimilarityRanker (+/-) ──> fuse ──> Retriever ──> results
//!                    │                    │                               │
//!            authoritative tables   ledger generation                host platform
//! ```

pub mod config;
pub mod fusion;
pub mod ranker;
pub mod resolver;
pub mod retriever;
pub mod service;

pub use config::ServiceConfig;
pub use fusion::{fuse, FusedEntry};
pub use ranker::{power_mean, ZScoreRanker};
pub use resolver::{nearest_scale, query_scale, Polarity, QueryItem, QueryResolver};
pub use retriever::{RankedResult, RetrievalPage, Retriever};
pub use service::{
    ChannelSelection, ContainerIndexReport, DuplicateSweep, ExtractionItem, ExtractionStatus,
    FeatureStatus, ImageOutcome, IndexReport, IndexRequest, LedgerError, LedgerOutcome,
    PlaneSelection, SearchOutcome, SearchRequest, SearchResponse, SearchService, StoredFeatureSet,
};
