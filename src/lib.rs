//! # ContentDB
//!
//! Content-based image retrieval with relevance feedback.
//!
//! Given example images marked relevant ("positive") and irrelevant
//! ("negative"), ContentDB ranks every indexed image by similarity in a
//! numeric feature space and returns the best matches, optionally restricted
//! to particular owners, containers or channels.
//!
//! ## Quick Start
//!
//! ### As a Server
//!
//! ```bash
//! contentdb --http-port 6333 \
//!     --host-url http://host:8080 --extractor-url http://extractor:8081
//! ```
//!
//! ### As a Library
//!
//! ```rust
//! use contentdb::prelude::*;
//!
//! let a: Locator = "1.0.0.0.0".parse().unwrap();
//! let b: Locator = "2.0.0.0.0".parse().unwrap();
//! let c: Locator = "3.0.0.0.0".parse().unwrap();
//!
//! // positives rank A,B,C; negatives rank A,C,B (best match first)
//! let fused = fuse(Some(&[a, b, c]), Some(&[a, c, b])).unwrap();
//! let order: Vec<Locator> = fused.iter().map(|e| e.locator).collect();
//! assert_eq!(order, vec![b, a, c]);
//! ```
//!
//! ## Crate Structure
//!
//! - [`contentdb-core`](https://docs.rs/contentdb-core) - Locator, feature rows, filters, errors, collaborator traits
//! - [`contentdb-storage`](https://docs.rs/contentdb-storage) - LMDB feature ledgers, generations, rebuild
//! - [`contentdb-search`](https://docs.rs/contentdb-search) - query resolution, ranking, fusion, filtered retrieval
//! - [`contentdb-api`](https://docs.rs/contentdb-api) - REST API and HTTP collaborator clients

// Re-export core types
pub use contentdb_core::{
    CallContext, CancelHandle, ChannelRule, Error, ErrorKind, FeatureExtractor, FeatureRow,
    FeatureSet, FeatureSetRegistry, FeatureTable, Filter, FilterCondition, HostPlatform, ImageInfo,
    ImageRef, Locator, Result, SimilarityRanker, Vector,
};

// Re-export storage
pub use contentdb_storage::{Compactor, Generation, LedgerKey, RebuildReport, StorageManager, UpsertOutcome};

// Re-export search
pub use contentdb_search::{
    fuse, IndexReport, IndexRequest, SearchRequest, SearchResponse, SearchService, ServiceConfig,
    ZScoreRanker,
};

// Re-export API
pub use contentdb_api::{HttpExtractor, HttpHost, RestApi};

pub mod prelude {
    pub use contentdb_core::{
        CallContext, Error, FeatureRow, FeatureSetRegistry, FilterCondition, Locator, Result, Vector,
    };
    pub use contentdb_search::{fuse, SearchRequest, SearchService, ServiceConfig, ZScoreRanker};
    pub use contentdb_storage::StorageManager;
}
