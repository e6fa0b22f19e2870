use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use chrono::{DateTime, TimeZone as _, Utc};
use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use serde::Serialize;
use uuid::Uuid;

use crate::har::RequestRecord;

const SCHEMA_VERSION: i32 = 1;

/// Lifecycle of one ingestion job. The variants are closed and transitions
/// are monotonic: pending -> processing -> completed | failed, with no way
/// out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown job status `{other}`"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Failed),
            Self::Processing => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub job_id: Uuid,
    pub filename: String,
    pub blob_key: String,
    pub status: JobStatus,
    pub total_requests: i64,
    pub created_at_unix_ms: i64,
    pub submitter: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRequest {
    pub id: i64,
    pub record: RequestRecord,
}

#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
}

impl Storage {
    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn now_unix_ms() -> anyhow::Result<i64> {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time before unix epoch")?;
        Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    /// Creates the job if it does not exist yet and returns the stored row
    /// either way. Safe to call again for the same job id (at-least-once
    /// queue delivery).
    pub async fn upsert_job(
        &self,
        job_id: Uuid,
        filename: &str,
        submitter: Option<&str>,
    ) -> anyhow::Result<Job> {
        let db_path = self.db_path.clone();
        let filename = filename.to_owned();
        let submitter = submitter.map(ToOwned::to_owned);
        tokio::task::spawn_blocking(move || {
            upsert_job_blocking(&db_path, job_id, &filename, submitter.as_deref())
        })
        .await
        .context("join upsert_job task")?
    }

    pub async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || get_job_blocking(&db_path, job_id))
            .await
            .context("join get_job task")?
    }

    /// Advances the job lifecycle, rejecting any non-monotonic transition.
    pub async fn set_job_status(&self, job_id: Uuid, next: JobStatus) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || set_job_status_blocking(&db_path, job_id, next))
            .await
            .context("join set_job_status task")?
    }

    /// Records the archive blob key and the total request count, then flips
    /// the job to completed, all in one transaction.
    pub async fn complete_ingestion(
        &self,
        job_id: Uuid,
        blob_key: &str,
        total_requests: i64,
    ) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        let blob_key = blob_key.to_owned();
        tokio::task::spawn_blocking(move || {
            complete_ingestion_blocking(&db_path, job_id, &blob_key, total_requests)
        })
        .await
        .context("join complete_ingestion task")?
    }

    /// Replaces the job's request records wholesale. Redelivered upload
    /// events re-run extraction, so plain inserts would duplicate rows.
    pub async fn replace_records(
        &self,
        job_id: Uuid,
        records: Vec<RequestRecord>,
    ) -> anyhow::Result<usize> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || replace_records_blocking(&db_path, job_id, &records))
            .await
            .context("join replace_records task")?
    }

    /// All records for a job, newest timestamp first (absent timestamps
    /// last).
    pub async fn list_requests(&self, job_id: Uuid) -> anyhow::Result<Vec<StoredRequest>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || list_requests_blocking(&db_path, job_id))
            .await
            .context("join list_requests task")?
    }

    /// Candidate narrowing for the relevance filter: optional exact method
    /// match plus case-insensitive substring match of any keyword against
    /// URL, domain, or path. Results come back in insertion order so the
    /// ranking sort stays stable against original retrieval order.
    pub async fn search_requests(
        &self,
        job_id: Uuid,
        method: Option<&str>,
        keywords: &[String],
    ) -> anyhow::Result<Vec<StoredRequest>> {
        let db_path = self.db_path.clone();
        let method = method.map(ToOwned::to_owned);
        let keywords = keywords.to_vec();
        tokio::task::spawn_blocking(move || {
            search_requests_blocking(&db_path, job_id, method.as_deref(), &keywords)
        })
        .await
        .context("join search_requests task")?
    }

    pub async fn get_request(&self, request_id: i64) -> anyhow::Result<Option<StoredRequest>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || get_request_blocking(&db_path, request_id))
            .await
            .context("join get_request task")?
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)?;
        Ok(())
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  job_id TEXT NOT NULL UNIQUE,
                  filename TEXT NOT NULL,
                  blob_key TEXT NOT NULL DEFAULT '',
                  status TEXT NOT NULL,
                  total_requests INTEGER NOT NULL DEFAULT 0,
                  created_at_unix_ms INTEGER NOT NULL,
                  submitter TEXT
                );

                CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs(status);

                CREATE TABLE IF NOT EXISTS requests (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  job_rowid INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                  url TEXT NOT NULL,
                  domain TEXT NOT NULL,
                  path TEXT NOT NULL,
                  method TEXT NOT NULL,
                  status_code INTEGER,
                  timestamp_unix_ms INTEGER,
                  duration_ms INTEGER,
                  content_type TEXT,
                  request_size INTEGER,
                  response_size INTEGER,
                  query_params_json TEXT,
                  request_headers_json TEXT NOT NULL,
                  request_body TEXT,
                  response_headers_json TEXT NOT NULL,
                  response_body TEXT
                );

                CREATE INDEX IF NOT EXISTS requests_job_idx ON requests(job_rowid);
                CREATE INDEX IF NOT EXISTS requests_job_method_idx ON requests(job_rowid, method);
                CREATE INDEX IF NOT EXISTS requests_status_idx ON requests(status_code);
                CREATE INDEX IF NOT EXISTS requests_content_type_idx ON requests(content_type);
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported requests.db schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn upsert_job_blocking(
    path: &Path,
    job_id: Uuid,
    filename: &str,
    submitter: Option<&str>,
) -> anyhow::Result<Job> {
    let conn = open_connection(path)?;
    conn.execute(
        r#"
        INSERT INTO jobs (job_id, filename, status, created_at_unix_ms, submitter)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(job_id) DO NOTHING
        "#,
        params![
            job_id.to_string(),
            filename,
            JobStatus::Pending.as_str(),
            Storage::now_unix_ms()?,
            submitter,
        ],
    )
    .context("upsert job")?;

    query_job(&conn, job_id)?.context("job row missing after upsert")
}

fn get_job_blocking(path: &Path, job_id: Uuid) -> anyhow::Result<Option<Job>> {
    let conn = open_connection(path)?;
    query_job(&conn, job_id)
}

fn query_job(conn: &Connection, job_id: Uuid) -> anyhow::Result<Option<Job>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, job_id, filename, blob_key, status, total_requests,
                   created_at_unix_ms, submitter
            FROM jobs
            WHERE job_id = ?1
            "#,
        )
        .context("prepare select job")?;

    let mut rows = stmt
        .query(params![job_id.to_string()])
        .context("query job")?;
    let Some(row) = rows.next().context("iterate job row")? else {
        return Ok(None);
    };

    let raw_job_id = row.get::<_, String>(1).context("deserialize job_id")?;
    let raw_status = row.get::<_, String>(4).context("deserialize status")?;

    Ok(Some(Job {
        id: row.get(0).context("deserialize job rowid")?,
        job_id: raw_job_id.parse().context("parse stored job_id as uuid")?,
        filename: row.get(2).context("deserialize filename")?,
        blob_key: row.get(3).context("deserialize blob_key")?,
        status: JobStatus::parse(&raw_status)?,
        total_requests: row.get(5).context("deserialize total_requests")?,
        created_at_unix_ms: row.get(6).context("deserialize created_at_unix_ms")?,
        submitter: row.get(7).context("deserialize submitter")?,
    }))
}

fn set_job_status_blocking(path: &Path, job_id: Uuid, next: JobStatus) -> anyhow::Result<()> {
    let mut conn = open_connection(path)?;
    let tx = conn.transaction().context("begin status transaction")?;

    let current = {
        let raw: String = tx
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .with_context(|| format!("read status for job {job_id}"))?;
        JobStatus::parse(&raw)?
    };

    if !current.can_transition_to(next) {
        anyhow::bail!("illegal job transition {current} -> {next} for job {job_id}");
    }

    tx.execute(
        "UPDATE jobs SET status = ?1 WHERE job_id = ?2",
        params![next.as_str(), job_id.to_string()],
    )
    .context("update job status")?;
    tx.commit().context("commit status transaction")
}

fn complete_ingestion_blocking(
    path: &Path,
    job_id: Uuid,
    blob_key: &str,
    total_requests: i64,
) -> anyhow::Result<()> {
    let mut conn = open_connection(path)?;
    let tx = conn.transaction().context("begin completion transaction")?;

    let current = {
        let raw: String = tx
            .query_row(
                "SELECT status FROM jobs WHERE job_id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .with_context(|| format!("read status for job {job_id}"))?;
        JobStatus::parse(&raw)?
    };
    if !current.can_transition_to(JobStatus::Completed) {
        anyhow::bail!("illegal job transition {current} -> completed for job {job_id}");
    }

    tx.execute(
        r#"
        UPDATE jobs
        SET blob_key = ?1, total_requests = ?2, status = ?3
        WHERE job_id = ?4
        "#,
        params![
            blob_key,
            total_requests,
            JobStatus::Completed.as_str(),
            job_id.to_string()
        ],
    )
    .context("finalize job")?;
    tx.commit().context("commit completion transaction")
}

fn job_rowid(conn: &Connection, job_id: Uuid) -> anyhow::Result<i64> {
    conn.query_row(
        "SELECT id FROM jobs WHERE job_id = ?1",
        params![job_id.to_string()],
        |row| row.get(0),
    )
    .with_context(|| format!("resolve rowid for job {job_id}"))
}

fn replace_records_blocking(
    path: &Path,
    job_id: Uuid,
    records: &[RequestRecord],
) -> anyhow::Result<usize> {
    let mut conn = open_connection(path)?;
    let tx = conn.transaction().context("begin records transaction")?;
    let rowid = job_rowid(&tx, job_id)?;

    tx.execute("DELETE FROM requests WHERE job_rowid = ?1", params![rowid])
        .context("clear existing records")?;

    {
        let mut stmt = tx
            .prepare(
                r#"
                INSERT INTO requests (
                  job_rowid, url, domain, path, method, status_code,
                  timestamp_unix_ms, duration_ms, content_type,
                  request_size, response_size, query_params_json,
                  request_headers_json, request_body,
                  response_headers_json, response_body
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
            )
            .context("prepare insert record")?;

        for record in records {
            let query_params_json = record
                .query_params
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("serialize query params")?;
            let request_headers_json =
                serde_json::to_string(&record.request_headers).context("serialize request headers")?;
            let response_headers_json = serde_json::to_string(&record.response_headers)
                .context("serialize response headers")?;

            stmt.execute(params![
                rowid,
                record.url,
                record.domain,
                record.path,
                record.method,
                record.status_code.map(i64::from),
                record.timestamp.map(|ts| ts.timestamp_millis()),
                record.duration_ms,
                record.content_type,
                record.request_size,
                record.response_size,
                query_params_json,
                request_headers_json,
                record.request_body,
                response_headers_json,
                record.response_body,
            ])
            .context("insert record")?;
        }
    }

    tx.commit().context("commit records transaction")?;
    Ok(records.len())
}

fn deserialize_record_at(row: &rusqlite::Row<'_>, offset: usize) -> anyhow::Result<StoredRequest> {
    let id = row.get::<_, i64>(offset).context("deserialize record id")?;
    let status_code = row
        .get::<_, Option<i64>>(offset + 5)
        .context("deserialize status_code")?
        .map(|status| u16::try_from(status).context("status_code out of range"))
        .transpose()?;
    let timestamp = row
        .get::<_, Option<i64>>(offset + 6)
        .context("deserialize timestamp")?
        .and_then(unix_ms_to_datetime);
    let query_params_json = row
        .get::<_, Option<String>>(offset + 11)
        .context("deserialize query_params_json")?;
    let request_headers_json = row
        .get::<_, String>(offset + 12)
        .context("deserialize request_headers_json")?;
    let response_headers_json = row
        .get::<_, String>(offset + 14)
        .context("deserialize response_headers_json")?;

    let record = RequestRecord {
        url: row.get(offset + 1).context("deserialize url")?,
        domain: row.get(offset + 2).context("deserialize domain")?,
        path: row.get(offset + 3).context("deserialize path")?,
        method: row.get(offset + 4).context("deserialize method")?,
        status_code,
        timestamp,
        duration_ms: row.get(offset + 7).context("deserialize duration_ms")?,
        content_type: row.get(offset + 8).context("deserialize content_type")?,
        request_size: row.get(offset + 9).context("deserialize request_size")?,
        response_size: row.get(offset + 10).context("deserialize response_size")?,
        query_params: query_params_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("deserialize query params")?,
        request_headers: serde_json::from_str(&request_headers_json)
            .context("deserialize request headers")?,
        request_body: row.get(offset + 13).context("deserialize request_body")?,
        response_headers: serde_json::from_str(&response_headers_json)
            .context("deserialize response headers")?,
        response_body: row.get(offset + 15).context("deserialize response_body")?,
    };

    Ok(StoredRequest { id, record })
}

fn unix_ms_to_datetime(unix_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(unix_ms).single()
}

const RECORD_COLUMNS: &str = r#"
    id, url, domain, path, method, status_code,
    timestamp_unix_ms, duration_ms, content_type,
    request_size, response_size, query_params_json,
    request_headers_json, request_body,
    response_headers_json, response_body
"#;

fn list_requests_blocking(path: &Path, job_id: Uuid) -> anyhow::Result<Vec<StoredRequest>> {
    let conn = open_connection(path)?;
    let rowid = job_rowid(&conn, job_id)?;

    let query = format!(
        "SELECT {RECORD_COLUMNS} FROM requests WHERE job_rowid = ?1 \
         ORDER BY timestamp_unix_ms DESC, id ASC"
    );
    let mut stmt = conn.prepare(&query).context("prepare list requests")?;
    let mut rows = stmt.query(params![rowid]).context("query list requests")?;

    let mut requests = Vec::new();
    while let Some(row) = rows.next().context("iterate list requests")? {
        requests.push(deserialize_record_at(row, 0)?);
    }
    Ok(requests)
}

fn search_requests_blocking(
    path: &Path,
    job_id: Uuid,
    method: Option<&str>,
    keywords: &[String],
) -> anyhow::Result<Vec<StoredRequest>> {
    let conn = open_connection(path)?;
    let rowid = job_rowid(&conn, job_id)?;

    let mut sql = format!("SELECT {RECORD_COLUMNS} FROM requests WHERE job_rowid = ?1");
    let mut bind_values: Vec<String> = vec![rowid.to_string()];

    if let Some(method) = method {
        bind_values.push(method.to_owned());
        sql.push_str(&format!(" AND method = ?{}", bind_values.len()));
    }

    if !keywords.is_empty() {
        let mut clauses = Vec::with_capacity(keywords.len());
        for keyword in keywords {
            bind_values.push(format!("%{}%", keyword.to_lowercase()));
            let idx = bind_values.len();
            clauses.push(format!(
                "LOWER(url) LIKE ?{idx} OR LOWER(domain) LIKE ?{idx} OR LOWER(path) LIKE ?{idx}"
            ));
        }
        sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
    }

    sql.push_str(" ORDER BY id ASC");

    let mut stmt = conn.prepare(&sql).context("prepare search requests")?;
    let mut rows = stmt
        .query(params_from_iter(bind_values.iter()))
        .context("query search requests")?;

    let mut requests = Vec::new();
    while let Some(row) = rows.next().context("iterate search requests")? {
        requests.push(deserialize_record_at(row, 0)?);
    }
    Ok(requests)
}

fn get_request_blocking(path: &Path, request_id: i64) -> anyhow::Result<Option<StoredRequest>> {
    let conn = open_connection(path)?;
    let query = format!("SELECT {RECORD_COLUMNS} FROM requests WHERE id = ?1");
    let mut stmt = conn.prepare(&query).context("prepare select request")?;
    let mut rows = stmt.query(params![request_id]).context("query request")?;

    let Some(row) = rows.next().context("iterate request row")? else {
        return Ok(None);
    };
    Ok(Some(deserialize_record_at(row, 0)?))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{JobStatus, Storage};
    use crate::har::{QueryValue, RequestRecord};

    fn record(url: &str, domain: &str, path: &str, method: &str) -> RequestRecord {
        RequestRecord {
            url: url.to_owned(),
            domain: domain.to_owned(),
            path: path.to_owned(),
            method: method.to_owned(),
            status_code: Some(200),
            timestamp: None,
            duration_ms: Some(12),
            content_type: Some("application/json".to_owned()),
            request_size: None,
            response_size: Some(128),
            query_params: Some(vec![(
                "id".to_owned(),
                QueryValue::Single("7".to_owned()),
            )]),
            request_headers: vec![("accept".to_owned(), "application/json".to_owned())],
            request_body: None,
            response_headers: vec![(
                "content-type".to_owned(),
                "application/json; charset=utf-8".to_owned(),
            )],
            response_body: Some("{}".to_owned()),
        }
    }

    async fn open_temp() -> (tempfile::TempDir, Storage) {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(temp_dir.path().join("requests.db")).unwrap();
        (temp_dir, storage)
    }

    #[tokio::test]
    async fn upsert_job_is_idempotent_by_job_id() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();

        let first = storage
            .upsert_job(job_id, "capture.har", Some("10.0.0.9"))
            .await
            .unwrap();
        let second = storage.upsert_job(job_id, "other.har", None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.filename, "capture.har");
        assert_eq!(second.status, JobStatus::Pending);
        assert_eq!(second.submitter.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn status_transitions_are_monotonic() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();

        storage
            .set_job_status(job_id, JobStatus::Processing)
            .await
            .unwrap();
        storage
            .set_job_status(job_id, JobStatus::Failed)
            .await
            .unwrap();

        let err = storage
            .set_job_status(job_id, JobStatus::Processing)
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("illegal job transition"),
            "error: {err}"
        );
        assert_eq!(
            storage.get_job(job_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn pending_cannot_jump_to_completed() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();

        let err = storage
            .complete_ingestion(job_id, "blob", 3)
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("illegal job transition"),
            "error: {err}"
        );
    }

    #[tokio::test]
    async fn complete_ingestion_sets_blob_key_and_count() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();
        storage
            .set_job_status(job_id, JobStatus::Processing)
            .await
            .unwrap();
        storage
            .complete_ingestion(job_id, "hars/2024-03-01/x.har", 42)
            .await
            .unwrap();

        let job = storage.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.blob_key, "hars/2024-03-01/x.har");
        assert_eq!(job.total_requests, 42);
    }

    #[tokio::test]
    async fn replace_records_round_trips_and_deduplicates() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();

        let records = vec![
            record("https://api.example.com/v1/users", "api.example.com", "/v1/users", "GET"),
            record("https://api.example.com/v1/orders", "api.example.com", "/v1/orders", "POST"),
        ];
        storage
            .replace_records(job_id, records.clone())
            .await
            .unwrap();
        // Simulated queue redelivery.
        storage
            .replace_records(job_id, records.clone())
            .await
            .unwrap();

        let stored = storage.list_requests(job_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].record, records[0]);
    }

    #[tokio::test]
    async fn search_filters_by_method_and_keyword_substring() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();
        storage
            .replace_records(
                job_id,
                vec![
                    record("https://api.example.com/v1/users", "api.example.com", "/v1/users", "GET"),
                    record("https://api.example.com/v1/users", "api.example.com", "/v1/users", "POST"),
                    record("https://cdn.example.com/app.js", "cdn.example.com", "/app.js", "GET"),
                ],
            )
            .await
            .unwrap();

        let results = storage
            .search_requests(job_id, Some("GET"), &["users".to_owned()])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.method, "GET");
        assert_eq!(results[0].record.path, "/v1/users");

        // Keyword hits are ORed across fields.
        let results = storage
            .search_requests(job_id, None, &["cdn".to_owned(), "users".to_owned()])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn search_without_keywords_returns_all_method_matches() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();
        storage
            .replace_records(
                job_id,
                vec![
                    record("https://a.example/x", "a.example", "/x", "GET"),
                    record("https://a.example/y", "a.example", "/y", "GET"),
                ],
            )
            .await
            .unwrap();

        let results = storage.search_requests(job_id, None, &[]).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn get_request_returns_stored_record_by_id() {
        let (_dir, storage) = open_temp().await;
        let job_id = Uuid::new_v4();
        storage.upsert_job(job_id, "a.har", None).await.unwrap();
        storage
            .replace_records(
                job_id,
                vec![record("https://a.example/x", "a.example", "/x", "GET")],
            )
            .await
            .unwrap();

        let stored = storage.list_requests(job_id).await.unwrap();
        let fetched = storage.get_request(stored[0].id).await.unwrap().unwrap();
        assert_eq!(fetched, stored[0]);
        assert_eq!(storage.get_request(9999).await.unwrap(), None);
    }
}
