use std::time::Duration;

use chrono::{TimeZone as _, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::{
    analysis::{self, RequestDetails},
    capture::{self, CaptureError, UrlCapture},
    command::{self, CommandWithMetadata},
    config::Config,
    executor::{self, Execution, Overrides},
    queue::{UploadEvent, UploadQueue},
    rank,
    resolve::{self, CompletionClient, ResolveError},
    storage::{JobStatus, Storage, StoredRequest},
};

#[derive(Debug)]
pub enum ServiceError {
    InvalidFilename(String),
    JobNotFound(Uuid),
    JobNotCompleted { job_id: Uuid, status: JobStatus },
    RequestNotFound(i64),
    QueueUnavailable,
    ExecutorDisabled,
    Capture(CaptureError),
    Resolve(ResolveError),
    Internal(anyhow::Error),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFilename(filename) => {
                write!(f, "file `{filename}` must be a .har file")
            }
            Self::JobNotFound(job_id) => write!(f, "no job with id {job_id}"),
            Self::JobNotCompleted { job_id, status } => {
                write!(f, "job {job_id} is not completed yet (current status: {status})")
            }
            Self::RequestNotFound(request_id) => {
                write!(f, "no stored request with id {request_id}")
            }
            Self::QueueUnavailable => f.write_str("upload queue is unavailable"),
            Self::ExecutorDisabled => f.write_str("live execution is disabled"),
            Self::Capture(err) => write!(f, "{err}"),
            Self::Resolve(err) => write!(f, "{err}"),
            Self::Internal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

#[derive(Debug, Serialize)]
pub struct JobSubmission {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    pub total_requests: i64,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct GeneratedCommand {
    pub request_id: i64,
    pub matched_index: usize,
    pub model_used: String,
    #[serde(flatten)]
    pub command: CommandWithMetadata,
}

/// The operations exposed to an outer API layer. Thin by design: parameter
/// validation here, behavior in the components underneath.
pub struct Service<L, U> {
    storage: Storage,
    queue: UploadQueue,
    config: Config,
    llm_client: L,
    url_capture: U,
}

impl<L: CompletionClient, U: UrlCapture> Service<L, U> {
    pub fn new(
        storage: Storage,
        queue: UploadQueue,
        config: Config,
        llm_client: L,
        url_capture: U,
    ) -> Self {
        Self {
            storage,
            queue,
            config,
            llm_client,
            url_capture,
        }
    }

    pub async fn submit_upload(
        &self,
        filename: &str,
        archive_text: String,
        submitter: Option<&str>,
    ) -> Result<JobSubmission, ServiceError> {
        if !filename.ends_with(".har") {
            return Err(ServiceError::InvalidFilename(filename.to_owned()));
        }
        self.enqueue(Uuid::new_v4(), filename, archive_text, submitter)
            .await
    }

    pub async fn submit_url_conversion(
        &self,
        raw_url: &str,
        submitter: Option<&str>,
    ) -> Result<JobSubmission, ServiceError> {
        let url = capture::validate_capture_url(&self.config.capture, raw_url)
            .map_err(ServiceError::Capture)?;
        let archive_text = self
            .url_capture
            .capture(url.as_str())
            .await
            .map_err(ServiceError::Capture)?;
        let filename = capture::filename_for(&url);
        self.enqueue(Uuid::new_v4(), &filename, archive_text, submitter)
            .await
    }

    async fn enqueue(
        &self,
        job_id: Uuid,
        filename: &str,
        archive_text: String,
        submitter: Option<&str>,
    ) -> Result<JobSubmission, ServiceError> {
        // The job row exists before the event does, so status polls never
        // race the worker.
        let job = self.storage.upsert_job(job_id, filename, submitter).await?;

        let event = UploadEvent {
            job_id,
            filename: filename.to_owned(),
            archive_text,
            submitter: submitter.map(ToOwned::to_owned),
        };
        if self.queue.publish(event).await.is_err() {
            error!(%job_id, "upload queue rejected event");
            if let Err(err) = self.storage.set_job_status(job_id, JobStatus::Failed).await {
                error!(%job_id, error = %format!("{err:#}"), "could not mark job failed");
            }
            return Err(ServiceError::QueueUnavailable);
        }

        Ok(JobSubmission {
            job_id,
            status: job.status,
        })
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobStatusView, ServiceError> {
        let job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))?;

        let created_at = Utc
            .timestamp_millis_opt(job.created_at_unix_ms)
            .single()
            .map(|created| created.to_rfc3339())
            .unwrap_or_default();

        Ok(JobStatusView {
            job_id: job.job_id,
            filename: job.filename,
            status: job.status,
            total_requests: job.total_requests,
            created_at,
        })
    }

    pub async fn list_requests_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<StoredRequest>, ServiceError> {
        if self.storage.get_job(job_id).await?.is_none() {
            return Err(ServiceError::JobNotFound(job_id));
        }
        Ok(self.storage.list_requests(job_id).await?)
    }

    /// Two-phase retrieval: rank the job's records against the prompt, let
    /// the model pick among the top candidates, then render the replay
    /// command for the pick.
    pub async fn generate_command_for_prompt(
        &self,
        job_id: Uuid,
        prompt: &str,
    ) -> Result<GeneratedCommand, ServiceError> {
        let job = self
            .storage
            .get_job(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))?;
        // Records only exist once ingestion finished; matching against a
        // half-ingested job would silently answer from partial data.
        if job.status != JobStatus::Completed {
            return Err(ServiceError::JobNotCompleted {
                job_id,
                status: job.status,
            });
        }

        let ranked = rank::filter_requests(
            &self.storage,
            job_id,
            prompt,
            self.config.llm.max_candidates,
        )
        .await?;
        let candidates = resolve::build_candidates(&ranked);

        let resolution =
            resolve::resolve_match(&self.llm_client, &self.config.llm, prompt, &candidates)
                .await
                .map_err(ServiceError::Resolve)?;

        let stored = self
            .storage
            .get_request(resolution.request_id)
            .await?
            .ok_or(ServiceError::RequestNotFound(resolution.request_id))?;

        Ok(GeneratedCommand {
            request_id: stored.id,
            matched_index: resolution.index,
            model_used: resolution.model_used,
            command: command::curl_with_metadata(&stored.record),
        })
    }

    pub async fn get_request_details(
        &self,
        request_id: i64,
    ) -> Result<RequestDetails, ServiceError> {
        let stored = self
            .storage
            .get_request(request_id)
            .await?
            .ok_or(ServiceError::RequestNotFound(request_id))?;
        Ok(analysis::analyze_request(&stored))
    }

    pub async fn execute_request(
        &self,
        request_id: i64,
        overrides: &Overrides,
        follow_redirects: bool,
        timeout_override: Option<Duration>,
    ) -> Result<Execution, ServiceError> {
        if !self.config.executor.enabled {
            return Err(ServiceError::ExecutorDisabled);
        }

        let stored = self
            .storage
            .get_request(request_id)
            .await?
            .ok_or(ServiceError::RequestNotFound(request_id))?;

        Ok(executor::execute_request(
            &self.config.executor,
            &stored.record,
            overrides,
            follow_redirects,
            timeout_override,
        )
        .await)
    }
}
