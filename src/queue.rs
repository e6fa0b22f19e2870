use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One upload waiting to be ingested. The archive body travels with the
/// event; metadata rows are created lazily by the worker so a crashed
/// consumer can be replayed from the producer side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    pub job_id: Uuid,
    pub filename: String,
    pub archive_text: String,
    pub submitter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadQueue {
    sender: mpsc::Sender<UploadEvent>,
}

pub struct UploadReceiver {
    receiver: mpsc::Receiver<UploadEvent>,
}

/// Bounded in-process channel between upload submission and the ingestion
/// worker. Submission applies backpressure instead of buffering archives
/// without limit.
pub fn upload_channel(capacity: usize) -> (UploadQueue, UploadReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (UploadQueue { sender }, UploadReceiver { receiver })
}

#[derive(Debug)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("upload queue is closed")
    }
}

impl std::error::Error for QueueClosed {}

impl UploadQueue {
    pub async fn publish(&self, event: UploadEvent) -> Result<(), QueueClosed> {
        self.sender.send(event).await.map_err(|_| QueueClosed)
    }
}

impl UploadReceiver {
    /// Returns `None` once every producer handle is dropped and the buffer
    /// is drained.
    pub async fn next(&mut self) -> Option<UploadEvent> {
        self.receiver.recv().await
    }
}
