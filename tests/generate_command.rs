use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use harbinger::{
    capture::{CaptureError, UrlCapture},
    config::Config,
    queue::upload_channel,
    resolve::CompletionClient,
    service::{Service, ServiceError},
    storage::{JobStatus, Storage},
};
use uuid::Uuid;

struct NoCapture;

impl UrlCapture for NoCapture {
    async fn capture(&self, _url: &str) -> Result<String, CaptureError> {
        Err(CaptureError::Failed("no capture in these tests".to_owned()))
    }
}

/// Answers with index 0 and records which models were asked; can hang on
/// the first call to exercise the timeout fallback.
struct StubModel {
    hang_first_call: bool,
    calls: AtomicUsize,
    models: Mutex<Vec<String>>,
}

impl StubModel {
    fn answering() -> Self {
        Self {
            hang_first_call: false,
            calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }

    fn hanging_primary() -> Self {
        Self {
            hang_first_call: true,
            ..Self::answering()
        }
    }
}

impl CompletionClient for StubModel {
    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(model.to_owned());
        assert!(prompt.contains("Match this request"));
        if self.hang_first_call && call == 0 {
            std::future::pending::<()>().await;
        }
        Ok(r#"{"index": 0, "reasoning": "best ranked candidate"}"#.to_owned())
    }
}

struct Harness {
    _temp_dir: tempfile::TempDir,
    storage: Storage,
}

fn harness() -> Harness {
    let temp_dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(temp_dir.path().join("requests.db")).unwrap();
    Harness {
        _temp_dir: temp_dir,
        storage,
    }
}

async fn seeded_job(storage: &Storage) -> Uuid {
    let job_id = seed_records(storage).await;
    finish_ingestion(storage, job_id, 2).await;
    job_id
}

async fn finish_ingestion(storage: &Storage, job_id: Uuid, total: i64) {
    storage
        .set_job_status(job_id, JobStatus::Processing)
        .await
        .unwrap();
    storage
        .complete_ingestion(job_id, "hars/seed.har", total)
        .await
        .unwrap();
}

async fn seed_records(storage: &Storage) -> Uuid {
    let job_id = Uuid::new_v4();
    storage.upsert_job(job_id, "seed.har", None).await.unwrap();

    let archive = serde_json::json!({"log": {"entries": [
        {
            "request": {"method": "GET", "url": "https://shop.example.com/static/app.js",
                        "headers": []},
            "response": {"status": 200, "headers": [
                {"name": "content-type", "value": "application/javascript"}
            ]}
        },
        {
            "request": {"method": "GET", "url": "https://shop.example.com/api/users?limit=50",
                        "headers": [
                            {"name": "accept", "value": "application/json"},
                            {"name": "accept-encoding", "value": "gzip"}
                        ]},
            "response": {"status": 200, "headers": [
                {"name": "content-type", "value": "application/json; charset=utf-8"}
            ]}
        },
    ]}})
    .to_string();

    let parsed = harbinger::har::parse_archive(&archive).unwrap();
    let records = parsed
        .entries
        .iter()
        .map(|entry| harbinger::har::extract_record(entry).unwrap())
        .collect();
    storage.replace_records(job_id, records).await.unwrap();
    job_id
}

fn service_with(
    storage: &Storage,
    model: StubModel,
    config: Config,
) -> Service<StubModel, NoCapture> {
    let (queue, _receiver) = upload_channel(1);
    Service::new(storage.clone(), queue, config, model, NoCapture)
}

#[tokio::test]
async fn prompt_ranks_api_endpoint_above_static_asset_and_renders_curl() {
    let harness = harness();
    let job_id = seeded_job(&harness.storage).await;
    let service = service_with(&harness.storage, StubModel::answering(), Config::default());

    let generated = service
        .generate_command_for_prompt(job_id, "get all users")
        .await
        .unwrap();

    // Index 0 is the top-ranked candidate, which must be the API endpoint.
    assert_eq!(generated.matched_index, 0);
    assert_eq!(generated.command.metadata.path, "/api/users");
    assert!(generated
        .command
        .curl_command
        .starts_with("curl 'https://shop.example.com/api/users?limit=50'"));
    assert!(generated.command.curl_command.contains("-H 'accept: application/json'"));
    assert!(!generated.command.curl_command.contains("accept-encoding"));
}

#[tokio::test(start_paused = true)]
async fn primary_timeout_reports_the_fallback_model() {
    let harness = harness();
    let job_id = seeded_job(&harness.storage).await;

    let mut config = Config::default();
    config.llm.primary_model = "slow-primary".to_owned();
    config.llm.fallback_model = "steady-fallback".to_owned();
    config.llm.timeout_secs = 2;
    let service = service_with(&harness.storage, StubModel::hanging_primary(), config);

    let generated = service
        .generate_command_for_prompt(job_id, "get all users")
        .await
        .unwrap();
    assert_eq!(generated.model_used, "steady-fallback");
}

#[tokio::test]
async fn generation_is_rejected_until_ingestion_completes() {
    let harness = harness();
    let job_id = seed_records(&harness.storage).await;
    let service = service_with(&harness.storage, StubModel::answering(), Config::default());

    let err = service
        .generate_command_for_prompt(job_id, "get all users")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::JobNotCompleted {
            status: JobStatus::Pending,
            ..
        }
    ));

    finish_ingestion(&harness.storage, job_id, 2).await;
    let generated = service
        .generate_command_for_prompt(job_id, "get all users")
        .await
        .unwrap();
    assert_eq!(generated.command.metadata.path, "/api/users");
}

#[tokio::test]
async fn job_with_no_matching_records_yields_no_candidates() {
    let harness = harness();
    let job_id = Uuid::new_v4();
    harness
        .storage
        .upsert_job(job_id, "empty.har", None)
        .await
        .unwrap();
    finish_ingestion(&harness.storage, job_id, 0).await;
    let service = service_with(&harness.storage, StubModel::answering(), Config::default());

    let err = service
        .generate_command_for_prompt(job_id, "get all users")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Resolve(harbinger::resolve::ResolveError::NoCandidates)
    ));
}
