pub mod elastic;

use async_trait::async_trait;
use docsync_core::Result;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;

/// Per-item result set of a bulk call. Item results are surfaced for logging
/// only; nothing downstream interprets them.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// One projected hit from an existing-state scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedHit {
    pub id: String,
    pub timestamp: Option<String>,
}

pub type ScanStream = BoxStream<'static, Result<ProjectedHit>>;

/// The index-store operations the pipeline needs.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Submits a flat ordered list alternating action-descriptor and body
    /// entries in a single call.
    async fn bulk(&self, entries: Vec<Value>) -> Result<BulkResponse>;

    /// Lazily enumerates every document in the index, transferring only the
    /// `id` and `timestamp` fields. Fails with `Error::NotFound` when the
    /// index does not exist; callers building a snapshot recover that as
    /// empty state.
    async fn scan_ids(&self, index: &str) -> Result<ScanStream>;

    /// Creates the index if absent. `seed_docs` populates a fresh index with
    /// sequential integer ids starting at 1; `delete_first` drops an existing
    /// index before recreating it.
    async fn prepare_index(
        &self,
        index: &str,
        seed_docs: Option<&[Value]>,
        delete_first: bool,
    ) -> Result<()>;

    async fn delete_index(&self, index: &str) -> Result<()>;
}

pub use elastic::ElasticStore;
