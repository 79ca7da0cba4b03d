use crate::model::RawRecord;
use async_trait::async_trait;
use docsync_core::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// How a scheduled attachment fetch should behave.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentRequest {
    /// The document was skipped as unchanged; release any held resources
    /// without downloading.
    Discard,
    /// The document will be indexed; resolve the attachment, stamped with the
    /// document's resolved timestamp.
    Fetch { timestamp: String },
}

pub type AttachmentFuture = BoxFuture<'static, Result<Option<RawRecord>>>;

/// Deferred attachment download paired with a source document. Invoked at
/// most once; a `None` resolution means there is nothing to attach.
pub type LazyAttachmentFetch = Box<dyn FnOnce(AttachmentRequest) -> AttachmentFuture + Send>;

pub type SourceItem = (RawRecord, Option<LazyAttachmentFetch>);

pub type SourceStream = BoxStream<'static, Result<SourceItem>>;

/// Supplier of the documents to mirror into an index. Each record must carry
/// an `_id` field; a `timestamp` field, when present, must be stably
/// comparable across runs for the same logical content.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Identifier used in logs and error reports.
    fn source_id(&self) -> &str;

    /// Opens a fresh pass over the source. Streams are restartable per call,
    /// not mid-iteration.
    async fn stream(&self) -> Result<SourceStream>;
}
