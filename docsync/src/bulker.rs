use crate::model::{BulkItem, BulkReport};
use crate::store::IndexStore;
use docsync_core::{Error, Result};
use metrics::{counter, gauge, histogram};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drains the hand-off channel into fixed-size bulk chunks, submitting each
/// chunk as an independent concurrent call against the index store.
pub(crate) struct Bulker {
    store: Arc<dyn IndexStore>,
    rx: mpsc::Receiver<BulkItem>,
    chunk_size: usize,
}

impl Bulker {
    pub(crate) fn new(
        store: Arc<dyn IndexStore>,
        rx: mpsc::Receiver<BulkItem>,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            rx,
            chunk_size,
        }
    }

    /// Runs until both end markers have been observed (either order), or
    /// until the channel closes because a producer failed. Every submitted
    /// chunk is awaited before this returns.
    pub(crate) async fn run(self) -> Result<BulkReport> {
        let Self {
            store,
            mut rx,
            chunk_size,
        } = self;

        let mut entries: Vec<Value> = Vec::new();
        let mut logical = 0usize;
        let mut in_flight: Vec<JoinHandle<Result<ChunkOutcome>>> = Vec::new();
        let mut docs_done = false;
        let mut attachments_done = false;

        loop {
            let Some(item) = rx.recv().await else {
                // A producer died before its end marker. Flush whatever
                // already arrived; the orchestrator surfaces the producer's
                // error as the run result.
                warn!("Hand-off channel closed before end markers, flushing partial batch");
                break;
            };

            match item {
                BulkItem::DocsDone => {
                    docs_done = true;
                    if docs_done && attachments_done {
                        break;
                    }
                }
                BulkItem::AttachmentsDone => {
                    attachments_done = true;
                    if docs_done && attachments_done {
                        break;
                    }
                }
                BulkItem::Op(op) => {
                    op.encode_into(&mut entries);
                    logical += 1;
                    gauge!("docsync_channel_depth").set(rx.len() as f64);

                    if logical >= chunk_size {
                        in_flight.push(submit(&store, std::mem::take(&mut entries), logical));
                        logical = 0;
                    }
                }
            }
        }

        if !entries.is_empty() {
            in_flight.push(submit(&store, entries, logical));
        }

        let mut report = BulkReport::default();
        let mut first_error: Option<Error> = None;
        for handle in in_flight {
            match handle.await {
                Ok(Ok(outcome)) => {
                    report.bulk_calls += 1;
                    report.documents_indexed += outcome.operations as u64;
                    report.bulk_time += outcome.took;
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error
                        .get_or_insert(Error::Internal(format!("bulk task panicked: {e}")));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(
            bulk_calls = report.bulk_calls,
            indexed = report.documents_indexed,
            bulk_time_ms = report.bulk_time.as_millis() as u64,
            "Bulker drained"
        );
        Ok(report)
    }
}

struct ChunkOutcome {
    operations: usize,
    took: Duration,
}

fn submit(
    store: &Arc<dyn IndexStore>,
    entries: Vec<Value>,
    operations: usize,
) -> JoinHandle<Result<ChunkOutcome>> {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        let start = Instant::now();
        let response = store.bulk(entries).await?;
        let took = start.elapsed();

        if response.errors {
            // No per-item retry here; surface the rejection for operators.
            warn!(
                items = response.items.len(),
                "Bulk response reported item-level errors"
            );
        }

        counter!("docsync_documents_indexed").increment(operations as u64);
        histogram!("docsync_bulk_duration_ms").record(took.as_millis() as f64);
        info!(operations, took_ms = took.as_millis() as u64, "Indexed bulk chunk");

        Ok(ChunkOutcome { operations, took })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IndexOperation;
    use crate::store::{BulkResponse, ProjectedHit, ScanStream};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Vec<Value>>>,
        fail: bool,
    }

    #[async_trait]
    impl IndexStore for RecordingStore {
        async fn bulk(&self, entries: Vec<Value>) -> Result<BulkResponse> {
            if self.fail {
                return Err(Error::Store("rejected".to_string()));
            }
            self.calls.lock().unwrap().push(entries);
            Ok(BulkResponse {
                took: 1,
                errors: false,
                items: Vec::new(),
            })
        }

        async fn scan_ids(&self, _index: &str) -> Result<ScanStream> {
            let hits: Vec<Result<ProjectedHit>> = Vec::new();
            Ok(Box::pin(futures::stream::iter(hits)))
        }

        async fn prepare_index(
            &self,
            _index: &str,
            _seed_docs: Option<&[Value]>,
            _delete_first: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete_index(&self, _index: &str) -> Result<()> {
            Ok(())
        }
    }

    fn update(n: usize) -> BulkItem {
        BulkItem::Op(IndexOperation::update(
            "pages",
            format!("doc-{n}"),
            serde_json::Map::new(),
        ))
    }

    #[tokio::test]
    async fn chunks_split_at_the_logical_threshold() {
        let store = Arc::new(RecordingStore::default());
        let (tx, rx) = mpsc::channel(2048);

        for n in 0..1001 {
            tx.send(update(n)).await.unwrap();
        }
        tx.send(BulkItem::DocsDone).await.unwrap();
        tx.send(BulkItem::AttachmentsDone).await.unwrap();
        drop(tx);

        let report = Bulker::new(Arc::clone(&store) as Arc<dyn IndexStore>, rx, 500)
            .run()
            .await
            .unwrap();

        assert_eq!(report.bulk_calls, 3);
        assert_eq!(report.documents_indexed, 1001);

        // Updates encode to two entries each: 500, 500 and 1 logical ops.
        let sizes: Vec<usize> = store.calls.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 2]);
    }

    #[tokio::test]
    async fn terminates_on_markers_in_either_order() {
        for markers in [
            [BulkItem::DocsDone, BulkItem::AttachmentsDone],
            [BulkItem::AttachmentsDone, BulkItem::DocsDone],
        ] {
            let store = Arc::new(RecordingStore::default());
            let (tx, rx) = mpsc::channel(8);
            for marker in markers {
                tx.send(marker).await.unwrap();
            }

            // The sender stays alive: termination must come from the markers
            // alone, not channel closure.
            let report = Bulker::new(Arc::clone(&store) as Arc<dyn IndexStore>, rx, 500)
                .run()
                .await
                .unwrap();
            assert_eq!(report.bulk_calls, 0);
            drop(tx);
        }
    }

    #[tokio::test]
    async fn flushes_partial_batch_when_channel_closes_without_markers() {
        let store = Arc::new(RecordingStore::default());
        let (tx, rx) = mpsc::channel(8);
        tx.send(update(0)).await.unwrap();
        tx.send(update(1)).await.unwrap();
        drop(tx);

        let report = Bulker::new(Arc::clone(&store) as Arc<dyn IndexStore>, rx, 500)
            .run()
            .await
            .unwrap();

        assert_eq!(report.bulk_calls, 1);
        assert_eq!(report.documents_indexed, 2);
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_operations_count_one_entry_each() {
        let store = Arc::new(RecordingStore::default());
        let (tx, rx) = mpsc::channel(16);
        tx.send(update(0)).await.unwrap();
        tx.send(BulkItem::Op(IndexOperation::delete("pages", "old")))
            .await
            .unwrap();
        tx.send(BulkItem::DocsDone).await.unwrap();
        tx.send(BulkItem::AttachmentsDone).await.unwrap();

        let report = Bulker::new(Arc::clone(&store) as Arc<dyn IndexStore>, rx, 500)
            .run()
            .await
            .unwrap();

        assert_eq!(report.documents_indexed, 2);
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 3);
        assert_eq!(calls[0][2], json!({"delete": {"_index": "pages", "_id": "old"}}));
    }

    #[tokio::test]
    async fn store_failure_surfaces_after_drain() {
        let store = Arc::new(RecordingStore {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let (tx, rx) = mpsc::channel(8);
        tx.send(update(0)).await.unwrap();
        tx.send(BulkItem::DocsDone).await.unwrap();
        tx.send(BulkItem::AttachmentsDone).await.unwrap();

        let result = Bulker::new(store as Arc<dyn IndexStore>, rx, 500).run().await;
        assert!(matches!(result, Err(Error::Store(_))));
    }
}
