//! # ContentDB API
//!
//! The REST surface of the search service, and HTTP clients for the external
//! collaborators it depends on.

pub mod remote;
pub mod rest;

pub use remote::{HttpExtractor, HttpHost};
pub use rest::RestApi;
