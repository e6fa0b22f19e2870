use std::time::{Duration, Instant};

use reqwest::{
    Method, redirect,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::{config::ExecutorConfig, har::RequestRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    AuthenticationError,
    AuthorizationError,
    NotFound,
    RateLimitError,
    ClientError,
    ServerError,
    TimeoutError,
    ConnectionError,
    ConnectionTimeout,
    ProtocolError,
    RedirectError,
    InvalidUrl,
    BlockedDomain,
    UnknownError,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Overrides {
    pub query_params: Option<Vec<(String, String)>>,
    pub headers: Option<Vec<(String, String)>>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseDetails {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub size_bytes: usize,
}

/// Outcome of one live replay. A response is present for any exchange that
/// reached the server, including 4xx/5xx failures; an error is present for
/// anything other than a 2xx/3xx round trip.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub url: String,
    pub method: String,
    pub response: Option<ResponseDetails>,
    pub error: Option<ExecutionError>,
    pub execution_time_ms: i64,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Replays a stored request against the live endpoint: exactly one outbound
/// call, no retries, elapsed time measured end-to-end including failures.
/// The caller may override the configured timeout per invocation.
pub async fn execute_request(
    config: &ExecutorConfig,
    record: &RequestRecord,
    overrides: &Overrides,
    follow_redirects: bool,
    timeout_override: Option<Duration>,
) -> Execution {
    let start = Instant::now();
    let method = record.method.clone();

    let url = match effective_url(record, overrides) {
        Ok(url) => url,
        Err(reason) => {
            return failure(record.url.clone(), method, invalid_url_error(reason), start);
        }
    };

    if let Some(blocked) = blocked_match(&url, &config.blocked_domains) {
        return failure(
            url.to_string(),
            method,
            ExecutionError {
                kind: ErrorKind::BlockedDomain,
                message: "Domain is blocked".to_owned(),
                details: Some(format!(
                    "host matches blocklist entry `{blocked}` and cannot be accessed"
                )),
                suggestions: vec!["Contact administrator to unblock this domain".to_owned()],
            },
            start,
        );
    }

    let Ok(parsed_method) = Method::from_bytes(record.method.as_bytes()) else {
        return failure(
            url.to_string(),
            method,
            ExecutionError {
                kind: ErrorKind::UnknownError,
                message: format!("unsupported HTTP method `{}`", record.method),
                details: None,
                suggestions: vec!["Check the stored request's method".to_owned()],
            },
            start,
        );
    };

    let redirect_policy = if follow_redirects {
        redirect::Policy::limited(10)
    } else {
        redirect::Policy::none()
    };
    let client = match reqwest::Client::builder()
        .timeout(resolve_timeout(config, timeout_override))
        .redirect(redirect_policy)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return failure(
                url.to_string(),
                method,
                classify_transport_error(&err),
                start,
            );
        }
    };

    let mut request = client
        .request(parsed_method, url.clone())
        .headers(effective_headers(record, overrides));
    if let Some(body) = effective_body(record, overrides) {
        request = request.body(body.to_owned());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or("<binary>").to_owned(),
                    )
                })
                .collect();
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    return failure(
                        url.to_string(),
                        method,
                        classify_transport_error(&err),
                        start,
                    );
                }
            };

            let size_bytes = bytes.len();
            if size_bytes > config.max_response_bytes {
                warn!(
                    size_bytes,
                    max = config.max_response_bytes,
                    "response exceeds configured size limit"
                );
            }
            let body = String::from_utf8(bytes.to_vec())
                .unwrap_or_else(|_| "<binary data>".to_owned());

            let details = ResponseDetails {
                status_code: status.as_u16(),
                headers,
                body,
                size_bytes,
            };
            let error = classify_status(status.as_u16())
                .map(|mut error| {
                    error.details = Some(details.body.clone());
                    error
                });

            Execution {
                url: url.to_string(),
                method,
                response: Some(details),
                error,
                execution_time_ms: elapsed_ms(start),
            }
        }
        Err(err) => failure(
            url.to_string(),
            method,
            classify_transport_error(&err),
            start,
        ),
    }
}

fn failure(url: String, method: String, error: ExecutionError, start: Instant) -> Execution {
    Execution {
        url,
        method,
        response: None,
        error: Some(error),
        execution_time_ms: elapsed_ms(start),
    }
}

fn resolve_timeout(config: &ExecutorConfig, timeout_override: Option<Duration>) -> Duration {
    timeout_override.unwrap_or_else(|| config.timeout())
}

fn elapsed_ms(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn effective_url(record: &RequestRecord, overrides: &Overrides) -> Result<Url, String> {
    let mut url = Url::parse(&record.url).map_err(|err| err.to_string())?;
    if let Some(params) = overrides.query_params.as_ref() {
        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }
    Ok(url)
}

fn blocked_match<'a>(url: &Url, blocked_domains: &'a [String]) -> Option<&'a str> {
    let mut host = url.host_str()?.to_lowercase();
    if let Some(port) = url.port() {
        host = format!("{host}:{port}");
    }
    blocked_domains
        .iter()
        .find(|blocked| host.contains(&blocked.to_lowercase()))
        .map(String::as_str)
}

/// Stored headers first, then overrides replacing by case-insensitive name.
/// Pseudo-headers are dropped from both sources.
fn effective_headers(record: &RequestRecord, overrides: &Overrides) -> HeaderMap {
    let mut merged: Vec<(String, String)> = record
        .request_headers
        .iter()
        .filter(|(name, _)| !name.starts_with(':'))
        .cloned()
        .collect();
    if let Some(override_headers) = overrides.headers.as_ref() {
        for (name, value) in override_headers {
            if name.starts_with(':') {
                continue;
            }
            merged.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            merged.push((name.clone(), value.clone()));
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in merged {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "skipping header that cannot be sent"),
        }
    }
    headers
}

fn effective_body<'a>(record: &'a RequestRecord, overrides: &'a Overrides) -> Option<&'a str> {
    if !matches!(record.method.as_str(), "POST" | "PUT" | "PATCH") {
        return None;
    }
    overrides
        .body
        .as_deref()
        .or(record.request_body.as_deref())
}

fn invalid_url_error(details: String) -> ExecutionError {
    ExecutionError {
        kind: ErrorKind::InvalidUrl,
        message: "Invalid URL".to_owned(),
        details: Some(details),
        suggestions: vec![
            "Check the URL format".to_owned(),
            "Ensure the protocol (http/https) is correct".to_owned(),
        ],
    }
}

fn classify_status(status: u16) -> Option<ExecutionError> {
    let (kind, message, suggestions): (ErrorKind, String, &[&str]) = match status {
        400 => (
            ErrorKind::BadRequest,
            "Bad request - invalid parameters".to_owned(),
            &[
                "Check that all required parameters are provided",
                "Verify parameter values are in the correct format",
                "Review the API documentation for parameter requirements",
            ],
        ),
        401 => (
            ErrorKind::AuthenticationError,
            "Authentication failed".to_owned(),
            &[
                "Check your Authorization header is set correctly",
                "Verify your API key or token is valid",
                "Ensure the token hasn't expired",
            ],
        ),
        403 => (
            ErrorKind::AuthorizationError,
            "Access forbidden - insufficient permissions".to_owned(),
            &[
                "Verify you have permission to access this resource",
                "Check if your API key has the required scopes",
                "Ensure your account has the necessary privileges",
            ],
        ),
        404 => (
            ErrorKind::NotFound,
            "Resource not found".to_owned(),
            &[
                "Check that the URL is correct",
                "Verify the resource ID exists",
                "Ensure the endpoint path is valid",
            ],
        ),
        429 => (
            ErrorKind::RateLimitError,
            "Rate limit exceeded".to_owned(),
            &[
                "Wait before making another request",
                "Check the Retry-After header for wait time",
                "Consider implementing exponential backoff",
            ],
        ),
        400..=499 => (
            ErrorKind::ClientError,
            format!("Client error: {status}"),
            &[
                "Review the request parameters and headers",
                "Check the API documentation",
            ],
        ),
        500..=599 => (
            ErrorKind::ServerError,
            format!("Server error: {status}"),
            &[
                "The server is experiencing issues",
                "Try again later",
                "Contact the API provider if the issue persists",
            ],
        ),
        _ => return None,
    };

    Some(ExecutionError {
        kind,
        message,
        details: None,
        suggestions: suggestions.iter().map(|s| (*s).to_owned()).collect(),
    })
}

fn classify_transport_error(err: &reqwest::Error) -> ExecutionError {
    let details = Some(err.to_string());
    if err.is_timeout() {
        if err.is_connect() {
            return ExecutionError {
                kind: ErrorKind::ConnectionTimeout,
                message: "Connection timeout".to_owned(),
                details,
                suggestions: vec![
                    "The server took too long to establish a connection".to_owned(),
                    "Check if the server is reachable".to_owned(),
                    "Verify there are no firewall issues".to_owned(),
                ],
            };
        }
        return ExecutionError {
            kind: ErrorKind::TimeoutError,
            message: "Request timeout".to_owned(),
            details,
            suggestions: vec![
                "The server took too long to respond".to_owned(),
                "Try increasing the timeout value".to_owned(),
                "Check if the server is online and responsive".to_owned(),
            ],
        };
    }
    if err.is_connect() {
        return ExecutionError {
            kind: ErrorKind::ConnectionError,
            message: "Connection failed".to_owned(),
            details,
            suggestions: vec![
                "Check your internet connection".to_owned(),
                "Verify the server URL is correct".to_owned(),
                "Ensure the server is online".to_owned(),
            ],
        };
    }
    if err.is_redirect() {
        return ExecutionError {
            kind: ErrorKind::RedirectError,
            message: "Too many redirects".to_owned(),
            details,
            suggestions: vec![
                "The server is redirecting too many times".to_owned(),
                "Check the URL for redirect loops".to_owned(),
            ],
        };
    }
    if err.is_builder() {
        return invalid_url_error(err.to_string());
    }
    if err.is_body() || err.is_decode() {
        return ExecutionError {
            kind: ErrorKind::ProtocolError,
            message: "Protocol error".to_owned(),
            details,
            suggestions: vec![
                "The server sent an invalid response".to_owned(),
                "This may be a server-side issue".to_owned(),
                "Contact the API provider".to_owned(),
            ],
        };
    }

    ExecutionError {
        kind: ErrorKind::UnknownError,
        message: err.to_string(),
        details: None,
        suggestions: Vec::new(),
    }
}
