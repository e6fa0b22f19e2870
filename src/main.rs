use std::{path::PathBuf, time::Duration};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use harbinger::{
    blob::BlobStore,
    capture::{CaptureError, UrlCapture},
    config::Config,
    executor::Overrides,
    logging, pipeline,
    queue::upload_channel,
    resolve::OpenAiClient,
    service::Service,
    storage::Storage,
};

#[derive(Debug, Parser)]
#[command(name = "harbinger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest one or more HAR archives through the pipeline.
    Upload {
        files: Vec<PathBuf>,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        /// Submitter recorded on the job, e.g. an originating address.
        #[arg(long)]
        submitter: Option<String>,
    },
    /// Show a job's lifecycle status.
    Status {
        job_id: Uuid,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// List the stored requests of a job.
    Requests {
        job_id: Uuid,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Match a natural-language prompt against a job's requests and render
    /// the replay command.
    Generate {
        job_id: Uuid,
        prompt: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Replay a stored request against the live endpoint.
    Execute {
        request_id: i64,
        /// Replace the stored query string, `name=value`, repeatable.
        #[arg(long = "query")]
        query: Vec<String>,
        /// Override or add a header, `name: value`, repeatable.
        #[arg(long = "header")]
        header: Vec<String>,
        /// Override the stored request body.
        #[arg(long)]
        body: Option<String>,
        /// Do not follow redirects.
        #[arg(long)]
        no_follow_redirects: bool,
        /// Per-request timeout in seconds, overriding the configured default.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect a stored request: authentication, parameters, response shape.
    Details {
        request_id: i64,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        log_level: Option<String>,
    },
}

/// The CLI has no browser backend; URL conversion is reachable only through
/// an embedding that supplies one.
struct CaptureUnavailable;

impl UrlCapture for CaptureUnavailable {
    async fn capture(&self, _url: &str) -> Result<String, CaptureError> {
        Err(CaptureError::Failed(
            "no browser capture backend configured".to_owned(),
        ))
    }
}

fn build_service(
    config: Config,
    storage: &Storage,
) -> (
    Service<OpenAiClient, CaptureUnavailable>,
    harbinger::queue::UploadReceiver,
) {
    let (queue, receiver) = upload_channel(config.queue.capacity);
    let llm_client = OpenAiClient::from_config(&config.llm);
    let service = Service::new(
        storage.clone(),
        queue,
        config,
        llm_client,
        CaptureUnavailable,
    );
    (service, receiver)
}

fn open_stores(config: &Config) -> anyhow::Result<(Storage, BlobStore)> {
    let storage = Storage::open(config.storage.db_path())?;
    let blobs = BlobStore::new(config.storage.blob_path());
    blobs.ensure_container_exists()?;
    Ok((storage, blobs))
}

fn parse_pairs(raw: &[String], separator: char) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once(separator)
                .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
                .with_context(|| format!("expected `name{separator}value`, got `{entry}`"))
        })
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("render output as JSON")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Upload {
            files,
            config,
            log_level,
            submitter,
        } => {
            if files.is_empty() {
                bail!("no archive files given");
            }
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let (storage, blobs) = open_stores(&config)?;
            let (service, receiver) = build_service(config, &storage);
            let worker = tokio::spawn(pipeline::run_worker(
                storage.clone(),
                blobs,
                receiver,
            ));

            let mut job_ids = Vec::with_capacity(files.len());
            for file in &files {
                let filename = file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .with_context(|| format!("bad archive path {}", file.display()))?;
                let archive_text = std::fs::read_to_string(file)
                    .with_context(|| format!("read archive {}", file.display()))?;
                let submission = service
                    .submit_upload(filename, archive_text, submitter.as_deref())
                    .await?;
                job_ids.push(submission.job_id);
            }

            // Dropping the service closes the queue; the worker drains what
            // was published and exits.
            drop(service);
            worker.await.context("join ingestion worker")?;

            for job_id in job_ids {
                if let Some(job) = storage.get_job(job_id).await? {
                    println!("{job_id}  {}  {} requests", job.status, job.total_requests);
                }
            }
        }
        Command::Status {
            job_id,
            config,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let (storage, _blobs) = open_stores(&config)?;
            let (service, _receiver) = build_service(config, &storage);
            print_json(&service.get_job_status(job_id).await?)?;
        }
        Command::Requests {
            job_id,
            config,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let (storage, _blobs) = open_stores(&config)?;
            let (service, _receiver) = build_service(config, &storage);
            let requests = service.list_requests_for_job(job_id).await?;
            for stored in requests {
                println!(
                    "{:>6}  {:7}  {}  {}",
                    stored.id,
                    stored.record.method,
                    stored
                        .record
                        .status_code
                        .map(|status| status.to_string())
                        .unwrap_or_else(|| "-".to_owned()),
                    stored.record.url
                );
            }
        }
        Command::Generate {
            job_id,
            prompt,
            config,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let (storage, _blobs) = open_stores(&config)?;
            let (service, _receiver) = build_service(config, &storage);
            print_json(&service.generate_command_for_prompt(job_id, &prompt).await?)?;
        }
        Command::Execute {
            request_id,
            query,
            header,
            body,
            no_follow_redirects,
            timeout,
            config,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let (storage, _blobs) = open_stores(&config)?;
            let (service, _receiver) = build_service(config, &storage);

            let overrides = Overrides {
                query_params: if query.is_empty() {
                    None
                } else {
                    Some(parse_pairs(&query, '=')?)
                },
                headers: if header.is_empty() {
                    None
                } else {
                    Some(parse_pairs(&header, ':')?)
                },
                body,
            };
            let execution = service
                .execute_request(
                    request_id,
                    &overrides,
                    !no_follow_redirects,
                    timeout.map(Duration::from_secs),
                )
                .await?;
            print_json(&execution)?;
        }
        Command::Details {
            request_id,
            config,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let (storage, _blobs) = open_stores(&config)?;
            let (service, _receiver) = build_service(config, &storage);
            print_json(&service.get_request_details(request_id).await?)?;
        }
    }

    Ok(())
}
