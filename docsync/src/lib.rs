mod bulker;
mod fetcher;
pub mod model;
pub mod source;
pub mod store;
mod sync;

pub use docsync_core::{Config, Error, Result};
pub use model::{
    iso_utc, BulkItem, Document, FetchReport, BulkReport, IndexOperation, IndexSnapshot,
    RawRecord, SyncReport,
};
pub use source::{
    AttachmentFuture, AttachmentRequest, DocumentSource, LazyAttachmentFetch, SourceItem,
    SourceStream,
};
pub use store::{BulkResponse, ElasticStore, IndexStore, ProjectedHit, ScanStream};
pub use sync::SyncPipeline;
