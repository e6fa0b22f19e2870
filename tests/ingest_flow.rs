use uuid::Uuid;

use harbinger::{
    blob::BlobStore,
    capture::{CaptureError, UrlCapture},
    config::Config,
    pipeline,
    queue::upload_channel,
    resolve::CompletionClient,
    service::Service,
    storage::{JobStatus, Storage},
};

struct NoModel;

impl CompletionClient for NoModel {
    async fn complete(&self, _model: &str, _prompt: &str) -> anyhow::Result<String> {
        anyhow::bail!("no model in ingestion tests")
    }
}

struct NoCapture;

impl UrlCapture for NoCapture {
    async fn capture(&self, _url: &str) -> Result<String, CaptureError> {
        Err(CaptureError::Failed("no capture in ingestion tests".to_owned()))
    }
}

fn archive(urls: &[&str]) -> String {
    let entries: Vec<serde_json::Value> = urls
        .iter()
        .map(|url| {
            serde_json::json!({
                "startedDateTime": "2024-03-01T12:30:00Z",
                "request": {"method": "GET", "url": url, "headers": []},
                "response": {"status": 200, "headers": [
                    {"name": "content-type", "value": "application/json"}
                ]}
            })
        })
        .collect();
    serde_json::json!({"log": {"entries": entries}}).to_string()
}

struct Harness {
    _temp_dir: tempfile::TempDir,
    storage: Storage,
    blobs: BlobStore,
}

fn harness() -> Harness {
    let temp_dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(temp_dir.path().join("requests.db")).unwrap();
    let blobs = BlobStore::new(temp_dir.path().join("blobs"));
    blobs.ensure_container_exists().unwrap();
    Harness {
        _temp_dir: temp_dir,
        storage,
        blobs,
    }
}

#[tokio::test]
async fn uploaded_archive_flows_to_completed_job_with_all_records() {
    let harness = harness();
    let (queue, receiver) = upload_channel(4);
    let service = Service::new(
        harness.storage.clone(),
        queue,
        Config::default(),
        NoModel,
        NoCapture,
    );
    let worker = tokio::spawn(pipeline::run_worker(
        harness.storage.clone(),
        harness.blobs.clone(),
        receiver,
    ));

    let submission = service
        .submit_upload(
            "three.har",
            archive(&[
                "https://api.example.com/v1/users",
                "https://api.example.com/v1/orders",
                "https://cdn.example.com/app.js",
            ]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(submission.status, JobStatus::Pending);

    drop(service);
    worker.await.unwrap();

    let status = {
        let job = harness
            .storage
            .get_job(submission.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.total_requests, 3);
        assert!(harness.blobs.get(&job.blob_key).await.is_ok());
        job.status
    };
    assert_eq!(status, JobStatus::Completed);

    let records = harness
        .storage
        .list_requests(submission.job_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|stored| stored.record.status_code == Some(200)));
}

#[tokio::test]
async fn malformed_archive_never_reaches_completed() {
    let harness = harness();
    let (queue, receiver) = upload_channel(4);
    let service = Service::new(
        harness.storage.clone(),
        queue,
        Config::default(),
        NoModel,
        NoCapture,
    );
    let worker = tokio::spawn(pipeline::run_worker(
        harness.storage.clone(),
        harness.blobs.clone(),
        receiver,
    ));

    let submission = service
        .submit_upload("broken.har", "this is not an archive".to_owned(), None)
        .await
        .unwrap();

    drop(service);
    worker.await.unwrap();

    let job = harness
        .storage
        .get_job(submission.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.total_requests, 0);
    assert!(harness
        .storage
        .list_requests(submission.job_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn several_uploads_are_processed_in_one_worker_run() {
    let harness = harness();
    let (queue, receiver) = upload_channel(4);
    let service = Service::new(
        harness.storage.clone(),
        queue,
        Config::default(),
        NoModel,
        NoCapture,
    );
    let worker = tokio::spawn(pipeline::run_worker(
        harness.storage.clone(),
        harness.blobs.clone(),
        receiver,
    ));

    let first = service
        .submit_upload("a.har", archive(&["https://a.example/x"]), None)
        .await
        .unwrap();
    let second = service
        .submit_upload("b.har", "not json".to_owned(), None)
        .await
        .unwrap();

    drop(service);
    worker.await.unwrap();

    let first_job = harness.storage.get_job(first.job_id).await.unwrap().unwrap();
    let second_job = harness
        .storage
        .get_job(second.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_job.status, JobStatus::Completed);
    assert_eq!(second_job.status, JobStatus::Failed);
}

#[tokio::test]
async fn unknown_job_is_invisible_to_status_polls() {
    let harness = harness();
    assert!(harness.storage.get_job(Uuid::new_v4()).await.unwrap().is_none());
}
