use crate::bulker::Bulker;
use crate::fetcher::Fetcher;
use crate::model::{BulkItem, IndexSnapshot, SyncReport};
use crate::source::DocumentSource;
use crate::store::IndexStore;
use docsync_core::{Config, Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

/// Wires scanner, fetcher and bulker together for one index per run.
pub struct SyncPipeline {
    store: Arc<dyn IndexStore>,
    config: Config,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn IndexStore>, config: Config) -> Self {
        Self { store, config }
    }

    /// Mirrors one pass over the source into the given index: documents are
    /// upserted when new or changed, skipped when unchanged, and deleted when
    /// absent from the pull.
    #[instrument(skip(self, source))]
    pub async fn synchronize(&self, index: &str, source: &dyn DocumentSource) -> Result<SyncReport> {
        let started = Instant::now();

        // The fetcher diffs against the full snapshot, so the scan has to
        // finish before the first document is pulled.
        let snapshot = self.snapshot_index(index).await?;
        info!(
            index,
            existing = snapshot.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Captured existing-state snapshot"
        );

        let stream = source.stream().await?;

        let (tx, rx) = mpsc::channel::<BulkItem>(self.config.sync.channel_capacity);
        let fetcher = Fetcher::new(index, tx);
        let bulker = Bulker::new(Arc::clone(&self.store), rx, self.config.sync.chunk_size);

        let fetcher_task = tokio::spawn(fetcher.run(stream, snapshot));
        let bulker_task = tokio::spawn(bulker.run());

        let (fetch_res, bulk_res) = tokio::join!(fetcher_task, bulker_task);
        let bulk_res =
            bulk_res.map_err(|e| Error::Internal(format!("Bulker task panicked: {e}")))?;
        let fetch_res =
            fetch_res.map_err(|e| Error::Internal(format!("Fetcher task panicked: {e}")))?;

        // A bulker failure closes the channel under the fetcher, whose own
        // error would then only be the closed-channel symptom; report the
        // bulker's first.
        let bulk = bulk_res?;
        let fetch = fetch_res?;

        let report = SyncReport {
            fetch,
            bulk,
            elapsed: started.elapsed(),
        };
        info!(
            index,
            seen = report.fetch.documents_seen,
            skipped = report.fetch.documents_skipped,
            updates = report.fetch.updates,
            deletes = report.fetch.deletes,
            attachments = report.fetch.attachments_indexed,
            indexed = report.bulk.documents_indexed,
            bulk_calls = report.bulk.bulk_calls,
            bulk_time_ms = report.bulk.bulk_time.as_millis() as u64,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Synchronization complete"
        );
        Ok(report)
    }

    /// Materializes the projected scan into the diff baseline for this run.
    async fn snapshot_index(&self, index: &str) -> Result<IndexSnapshot> {
        let mut snapshot = IndexSnapshot::new();

        let mut scan = match self.store.scan_ids(index).await {
            Ok(scan) => scan,
            Err(Error::NotFound { .. }) => {
                // A missing index means there is nothing to diff against.
                debug!(index, "Index absent, starting from an empty snapshot");
                return Ok(snapshot);
            }
            Err(e) => return Err(e),
        };

        while let Some(hit) = scan.next().await {
            let hit = hit?;
            snapshot.insert(hit.id, hit.timestamp);
        }

        Ok(snapshot)
    }
}
