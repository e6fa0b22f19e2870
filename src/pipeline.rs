use anyhow::Context as _;
use tracing::{error, info, warn};

use crate::{
    blob::BlobStore,
    har,
    queue::{UploadEvent, UploadReceiver},
    storage::{JobStatus, Storage},
};

/// Drains the upload queue until every producer handle is gone. One event
/// failing marks its job failed and moves on; the worker itself only stops
/// when the channel closes.
pub async fn run_worker(storage: Storage, blobs: BlobStore, mut receiver: UploadReceiver) {
    info!("ingestion worker started");
    while let Some(event) = receiver.next().await {
        let job_id = event.job_id;
        if let Err(err) = process_event(&storage, &blobs, event).await {
            error!(%job_id, error = %format!("{err:#}"), "ingestion failed");
            if let Err(err) = storage.set_job_status(job_id, JobStatus::Failed).await {
                error!(%job_id, error = %format!("{err:#}"), "could not mark job failed");
            }
        }
    }
    info!("ingestion worker stopped: upload queue closed");
}

/// One upload, end to end: job row, extraction, record replacement, blob
/// write, completion. Re-running the same event converges on the same
/// stored state, which is what makes at-least-once delivery safe.
pub async fn process_event(
    storage: &Storage,
    blobs: &BlobStore,
    event: UploadEvent,
) -> anyhow::Result<()> {
    let job_id = event.job_id;
    let job = storage
        .upsert_job(job_id, &event.filename, event.submitter.as_deref())
        .await?;
    if job.status.is_terminal() {
        info!(%job_id, status = %job.status, "skipping redelivered event for finished job");
        return Ok(());
    }
    if job.status == JobStatus::Pending {
        storage.set_job_status(job_id, JobStatus::Processing).await?;
    }

    let parsed = har::parse_archive(&event.archive_text)
        .with_context(|| format!("parse archive {}", event.filename))?;

    let mut records = Vec::with_capacity(parsed.entries.len());
    for (index, entry) in parsed.entries.iter().enumerate() {
        match har::extract_record(entry) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(%job_id, entry = index, error = %err, "skipping unusable entry");
            }
        }
    }

    let stored = storage.replace_records(job_id, records).await?;

    let blob_key = BlobStore::key_for(job_id);
    blobs
        .put(&blob_key, &event.archive_text)
        .await
        .context("store raw archive")?;

    storage
        .complete_ingestion(job_id, &blob_key, parsed.total_requests as i64)
        .await?;

    info!(
        %job_id,
        filename = %event.filename,
        total = parsed.total_requests,
        stored,
        "ingestion completed"
    );
    Ok(())
}
