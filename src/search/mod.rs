//! Web-search enrichment contract.

use async_trait::async_trait;

use crate::error::EnrichError;

/// Contract for the optional web-search context fetch.
///
/// A failure here is never fatal: the design step logs it through a
/// status event and continues without the extra context.
#[async_trait]
pub trait Enrichment: Send + Sync {
    /// Search and extract readable text for `query`, concatenated into a
    /// single context block. `limit` bounds how many results are read.
    async fn search_context(&self, query: &str, limit: usize) -> Result<String, EnrichError>;
}
