use crate::model::{
    iso_utc, pop_id, BulkItem, Document, FetchReport, IndexOperation, IndexSnapshot, RawRecord,
};
use crate::source::{AttachmentRequest, SourceStream};
use docsync_core::{Error, Result};
use futures::StreamExt;
use metrics::counter;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ScheduledFetch = JoinHandle<Result<Option<RawRecord>>>;

/// Consumes the source stream, diffs it against the snapshot and feeds the
/// hand-off channel. Two sub-flows run concurrently: the document flow emits
/// update/delete operations and schedules attachment downloads, the
/// attachment flow drains those downloads in scheduling order.
pub(crate) struct Fetcher {
    index: String,
    tx: mpsc::Sender<BulkItem>,
}

impl Fetcher {
    pub(crate) fn new(index: impl Into<String>, tx: mpsc::Sender<BulkItem>) -> Self {
        Self {
            index: index.into(),
            tx,
        }
    }

    /// Runs both sub-flows to completion. When this returns Ok, every
    /// produced operation has been enqueued and both end markers sent.
    pub(crate) async fn run(
        self,
        stream: SourceStream,
        snapshot: IndexSnapshot,
    ) -> Result<FetchReport> {
        // TODO throttle concurrent downloads instead of spawning one task per
        // attachment; a Semaphore around the spawn would bound them.
        let (sched_tx, sched_rx) = mpsc::unbounded_channel::<ScheduledFetch>();

        let documents = Self::pump_documents(
            self.index.clone(),
            self.tx.clone(),
            stream,
            snapshot,
            sched_tx,
        );
        let attachments = Self::pump_attachments(self.index.clone(), self.tx.clone(), sched_rx);

        let (mut report, (attachments_indexed, fetch_failures)) =
            tokio::try_join!(documents, attachments)?;
        report.attachments_indexed = attachments_indexed;
        report.attachment_failures += fetch_failures;
        Ok(report)
    }

    async fn pump_documents(
        index: String,
        tx: mpsc::Sender<BulkItem>,
        mut stream: SourceStream,
        snapshot: IndexSnapshot,
        sched_tx: mpsc::UnboundedSender<ScheduledFetch>,
    ) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(item) = stream.next().await {
            let (raw, lazy_fetch) = item?;
            let mut doc = Document::from_source(raw)?;
            debug!(id = %doc.id, "Looking at source document");
            seen.insert(doc.id.clone());
            report.documents_seen += 1;

            // A source-supplied timestamp equal to the snapshot's means the
            // document is unchanged; skipping it keeps bulk traffic
            // proportional to churn rather than corpus size. Sources that
            // cannot produce timestamps are updated unconditionally.
            if let Some(ts) = doc.timestamp.as_deref() {
                if snapshot.is_unchanged(&doc.id, ts) {
                    debug!(id = %doc.id, "Skipping unchanged document");
                    report.documents_skipped += 1;
                    counter!("docsync_documents_skipped").increment(1);
                    if let Some(lazy_fetch) = lazy_fetch {
                        // Invoked anyway so the source can release whatever
                        // the deferred download holds.
                        if let Err(e) = lazy_fetch(AttachmentRequest::Discard).await {
                            warn!(id = %doc.id, error = %e, "Attachment discard failed");
                            report.attachment_failures += 1;
                        }
                    }
                    continue;
                }
            }

            let timestamp = match doc.timestamp.clone() {
                Some(ts) => ts,
                None => {
                    // Stamp the write so the next run has something to diff.
                    let ts = iso_utc();
                    doc.timestamp = Some(ts.clone());
                    ts
                }
            };

            if let Some(lazy_fetch) = lazy_fetch {
                let handle = tokio::spawn(lazy_fetch(AttachmentRequest::Fetch { timestamp }));
                if sched_tx.send(handle).is_err() {
                    return Err(Error::Pipeline(
                        "attachment flow stopped before end of documents".to_string(),
                    ));
                }
            }

            let id = doc.id.clone();
            send(&tx, IndexOperation::update(index.as_str(), id, doc.into_body())).await?;
            report.updates += 1;
            counter!("docsync_operations_enqueued", "kind" => "update").increment(1);

            // Give the bulker a chance to drain between documents.
            tokio::task::yield_now().await;
        }

        // Anything in the snapshot that the source no longer yields was
        // removed upstream and gets deleted from the mirror.
        for id in snapshot.ids() {
            if seen.contains(id) {
                continue;
            }
            send(&tx, IndexOperation::delete(index.as_str(), id.clone())).await?;
            report.deletes += 1;
            counter!("docsync_operations_enqueued", "kind" => "delete").increment(1);
        }

        mark(&tx, BulkItem::DocsDone).await?;
        // Dropping the scheduling sender ends the attachment flow once the
        // already-scheduled downloads are drained.
        Ok(report)
    }

    async fn pump_attachments(
        index: String,
        tx: mpsc::Sender<BulkItem>,
        mut sched_rx: mpsc::UnboundedReceiver<ScheduledFetch>,
    ) -> Result<(u64, u64)> {
        let mut indexed = 0u64;
        let mut failures = 0u64;

        // Scheduling order, not completion order: each handle is awaited in
        // the order the document flow spawned it.
        while let Some(handle) = sched_rx.recv().await {
            let resolved = handle
                .await
                .map_err(|e| Error::Internal(format!("attachment task panicked: {e}")))?;
            let mut record = match resolved {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Attachment fetch failed, skipping");
                    failures += 1;
                    counter!("docsync_attachment_failures").increment(1);
                    continue;
                }
            };

            let id = pop_id(&mut record)?;
            send(&tx, IndexOperation::update(index.as_str(), id, record)).await?;
            indexed += 1;
            counter!("docsync_operations_enqueued", "kind" => "update").increment(1);
            tokio::task::yield_now().await;
        }

        mark(&tx, BulkItem::AttachmentsDone).await?;
        Ok((indexed, failures))
    }
}

async fn send(tx: &mpsc::Sender<BulkItem>, op: IndexOperation) -> Result<()> {
    mark(tx, BulkItem::Op(op)).await
}

async fn mark(tx: &mpsc::Sender<BulkItem>, item: BulkItem) -> Result<()> {
    tx.send(item)
        .await
        .map_err(|_| Error::Pipeline("hand-off channel closed".to_string()))
}
