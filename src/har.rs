use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Result of parsing a raw archive: the entry count plus the ordered raw
/// entries, still as JSON values. Per-entry extraction happens separately so a
/// single malformed entry cannot fail the whole archive.
#[derive(Debug)]
pub struct ParsedArchive {
    pub total_requests: usize,
    pub entries: Vec<Value>,
}

#[derive(Debug)]
pub enum HarParseError {
    InvalidFormat(String),
}

impl std::fmt::Display for HarParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFormat(reason) => write!(f, "invalid HAR archive: {reason}"),
        }
    }
}

impl std::error::Error for HarParseError {}

#[derive(Debug)]
pub enum ExtractError {
    MissingUrl,
    InvalidUrl { url: String, reason: String },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingUrl => f.write_str("entry has no request URL"),
            Self::InvalidUrl { url, reason } => {
                write!(f, "entry URL `{url}` does not parse: {reason}")
            }
        }
    }
}

impl std::error::Error for ExtractError {}

/// A query parameter value: single values are unwrapped, repeated keys keep
/// their values as an ordered list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum QueryValue {
    Single(String),
    Many(Vec<String>),
}

/// One captured HTTP exchange, extracted from a HAR entry. Immutable once
/// stored; everything downstream (ranking, resolution, command rendering,
/// live execution) reads from this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub url: String,
    pub domain: String,
    pub path: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub timestamp: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub content_type: Option<String>,
    pub request_size: Option<i64>,
    pub response_size: Option<i64>,
    pub query_params: Option<Vec<(String, QueryValue)>>,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Option<String>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Option<String>,
}

pub fn parse_archive(archive_text: &str) -> Result<ParsedArchive, HarParseError> {
    let root: Value = serde_json::from_str(archive_text)
        .map_err(|err| HarParseError::InvalidFormat(err.to_string()))?;

    let Some(log) = root.get("log") else {
        return Err(HarParseError::InvalidFormat(
            "missing top-level `log` container".to_owned(),
        ));
    };

    let entries = match log.get("entries") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(_) => {
            return Err(HarParseError::InvalidFormat(
                "`log.entries` is not an array".to_owned(),
            ));
        }
        None => Vec::new(),
    };

    Ok(ParsedArchive {
        total_requests: entries.len(),
        entries,
    })
}

pub fn extract_record(entry: &Value) -> Result<RequestRecord, ExtractError> {
    let request = entry.get("request");
    let response = entry.get("response");

    let url_str = request
        .and_then(|request| request.get("url"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .ok_or(ExtractError::MissingUrl)?;

    let url = Url::parse(url_str).map_err(|err| ExtractError::InvalidUrl {
        url: url_str.to_owned(),
        reason: err.to_string(),
    })?;

    let mut domain = url.host_str().unwrap_or_default().to_owned();
    if let Some(port) = url.port() {
        domain = format!("{domain}:{port}");
    }
    let path = url.path().to_owned();
    let query_params = extract_query_params(&url);

    let timestamp = entry
        .get("startedDateTime")
        .and_then(Value::as_str)
        .and_then(parse_timestamp);

    let method = request
        .and_then(|request| request.get("method"))
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_ascii_uppercase();

    let status_code = response
        .and_then(|response| response.get("status"))
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok());

    let duration_ms = entry
        .get("time")
        .and_then(Value::as_f64)
        .map(|time_ms| time_ms as i64);

    let response_header_entries = headers_of(response);
    let content_type = response_header_entries
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| strip_content_type_suffix(value));

    let request_size = size_of(request, "bodySize");
    let response_size = size_of(response, "bodySize");

    let request_headers = filter_pseudo_headers(headers_of(request));
    let response_headers = filter_pseudo_headers(response_header_entries);

    let request_body = request.and_then(extract_body);
    let response_body = response.and_then(extract_body);

    Ok(RequestRecord {
        url: url_str.to_owned(),
        domain,
        path,
        method,
        status_code,
        timestamp,
        duration_ms,
        content_type,
        request_size,
        response_size,
        query_params,
        request_headers,
        request_body,
        response_headers,
        response_body,
    })
}

/// Renders `path?k=v&k2=v2...` with at most two query params shown. Used for
/// candidate construction where prompt size matters more than completeness.
pub fn path_with_query_preview(record: &RequestRecord) -> String {
    let Some(params) = record.query_params.as_ref().filter(|p| !p.is_empty()) else {
        return record.path.clone();
    };

    let mut rendered = Vec::with_capacity(2);
    for (name, value) in params.iter().take(2) {
        let value = match value {
            QueryValue::Single(value) => value.clone(),
            QueryValue::Many(values) => values.join(","),
        };
        rendered.push(format!("{name}={value}"));
    }

    let mut preview = format!("{}?{}", record.path, rendered.join("&"));
    if params.len() > 2 {
        preview.push_str("...");
    }
    preview
}

fn extract_query_params(url: &Url) -> Option<Vec<(String, QueryValue)>> {
    url.query()?;

    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in url.query_pairs() {
        let name = name.into_owned();
        match grouped.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value.into_owned()),
            None => grouped.push((name, vec![value.into_owned()])),
        }
    }

    if grouped.is_empty() {
        return None;
    }

    Some(
        grouped
            .into_iter()
            .map(|(name, mut values)| {
                let value = if values.len() == 1 {
                    QueryValue::Single(values.remove(0))
                } else {
                    QueryValue::Many(values)
                };
                (name, value)
            })
            .collect(),
    )
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn strip_content_type_suffix(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned()
}

fn size_of(section: Option<&Value>, field: &str) -> Option<i64> {
    section
        .and_then(|section| section.get(field))
        .and_then(Value::as_i64)
        .filter(|size| *size >= 0)
}

fn headers_of(section: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Array(headers)) = section.and_then(|section| section.get("headers")) else {
        return Vec::new();
    };

    headers
        .iter()
        .filter_map(|header| {
            let name = header.get("name")?.as_str()?;
            let value = header.get("value").and_then(Value::as_str).unwrap_or("");
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}

// HTTP/2 pseudo-headers are stripped at extraction time, not at use time.
fn filter_pseudo_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !name.starts_with(':'))
        .collect()
}

fn extract_body(section: &Value) -> Option<String> {
    for container in ["postData", "content"] {
        if let Some(text) = section
            .get(container)
            .and_then(|container| container.get("text"))
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            return Some(text.to_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        HarParseError, QueryValue, extract_record, parse_archive, path_with_query_preview,
    };

    fn entry(url: &str) -> serde_json::Value {
        json!({
            "startedDateTime": "2024-03-01T12:30:00Z",
            "time": 41.7,
            "request": {
                "method": "get",
                "url": url,
                "headers": [
                    {"name": ":authority", "value": "api.example.com"},
                    {"name": "accept", "value": "application/json"}
                ],
                "bodySize": -1
            },
            "response": {
                "status": 200,
                "headers": [
                    {"name": ":status", "value": "200"},
                    {"name": "Content-Type", "value": "application/json; charset=utf-8"}
                ],
                "content": {"text": "{\"ok\":true}"},
                "bodySize": 11
            }
        })
    }

    #[test]
    fn parse_rejects_non_json_text() {
        let err = parse_archive("definitely not json").unwrap_err();
        assert!(matches!(err, HarParseError::InvalidFormat(_)));
    }

    #[test]
    fn parse_rejects_missing_log_container() {
        let err = parse_archive(r#"{"entries": []}"#).unwrap_err();
        assert!(err.to_string().contains("`log`"), "error: {err}");
    }

    #[test]
    fn parse_counts_entries() {
        let archive = json!({"log": {"entries": [entry("https://a.example/x"), entry("https://a.example/y")]}});
        let parsed = parse_archive(&archive.to_string()).unwrap();
        assert_eq!(parsed.total_requests, 2);
        assert_eq!(parsed.entries.len(), 2);
    }

    #[test]
    fn parse_tolerates_missing_entries_array() {
        let parsed = parse_archive(r#"{"log": {}}"#).unwrap();
        assert_eq!(parsed.total_requests, 0);
    }

    #[test]
    fn extract_is_idempotent() {
        let entry = entry("https://api.example.com/v1/users?id=7");
        let first = extract_record(&entry).unwrap();
        let second = extract_record(&entry).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn extract_derives_domain_path_and_method() {
        let record = extract_record(&entry("https://api.example.com:8443/v1/users?id=7")).unwrap();
        assert_eq!(record.domain, "api.example.com:8443");
        assert_eq!(record.path, "/v1/users");
        assert_eq!(record.method, "GET");
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.duration_ms, Some(41));
        assert_eq!(record.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn extract_strips_pseudo_headers() {
        let record = extract_record(&entry("https://api.example.com/v1/users")).unwrap();
        assert!(
            record
                .request_headers
                .iter()
                .chain(record.response_headers.iter())
                .all(|(name, _)| !name.starts_with(':')),
            "pseudo-headers leaked: {:?}",
            record.request_headers
        );
        assert_eq!(
            record.request_headers,
            vec![("accept".to_owned(), "application/json".to_owned())]
        );
    }

    #[test]
    fn extract_normalizes_negative_sizes_to_absent() {
        let record = extract_record(&entry("https://api.example.com/v1/users")).unwrap();
        assert_eq!(record.request_size, None);
        assert_eq!(record.response_size, Some(11));
    }

    #[test]
    fn extract_unwraps_single_query_values_and_keeps_repeats_ordered() {
        let record =
            extract_record(&entry("https://api.example.com/v1/users?id=7&tag=a&tag=b")).unwrap();
        let params = record.query_params.unwrap();
        assert_eq!(
            params,
            vec![
                ("id".to_owned(), QueryValue::Single("7".to_owned())),
                (
                    "tag".to_owned(),
                    QueryValue::Many(vec!["a".to_owned(), "b".to_owned()])
                ),
            ]
        );
    }

    #[test]
    fn extract_parses_timestamp_with_zone_marker() {
        let record = extract_record(&entry("https://api.example.com/v1/users")).unwrap();
        let timestamp = record.timestamp.unwrap();
        assert_eq!(timestamp.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    }

    #[test]
    fn extract_treats_bad_timestamp_as_absent() {
        let mut entry = entry("https://api.example.com/v1/users");
        entry["startedDateTime"] = serde_json::Value::String("not-a-date".to_owned());
        let record = extract_record(&entry).unwrap();
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn extract_prefers_post_data_text_over_content_text() {
        let mut entry = entry("https://api.example.com/v1/users");
        entry["request"]["postData"] = json!({"text": "a=1"});
        entry["request"]["content"] = json!({"text": "ignored"});
        let record = extract_record(&entry).unwrap();
        assert_eq!(record.request_body.as_deref(), Some("a=1"));
        assert_eq!(record.response_body.as_deref(), Some("{\"ok\":true}"));
    }

    #[test]
    fn extract_fails_on_missing_url() {
        let err = extract_record(&json!({"request": {"method": "GET"}})).unwrap_err();
        assert!(err.to_string().contains("no request URL"), "error: {err}");
    }

    #[test]
    fn extract_defaults_method_to_get() {
        let entry = json!({
            "request": {"url": "https://example.com/plain"},
            "response": {}
        });
        let record = extract_record(&entry).unwrap();
        assert_eq!(record.method, "GET");
        assert_eq!(record.status_code, None);
        assert_eq!(record.content_type, None);
    }

    #[test]
    fn query_preview_caps_at_two_params() {
        let record =
            extract_record(&entry("https://api.example.com/v1/users?a=1&b=2&c=3")).unwrap();
        assert_eq!(path_with_query_preview(&record), "/v1/users?a=1&b=2...");

        let record = extract_record(&entry("https://api.example.com/v1/users")).unwrap();
        assert_eq!(path_with_query_preview(&record), "/v1/users");
    }
}
