use serde::Serialize;
use serde_json::Value;

use crate::{
    har::{QueryValue, RequestRecord},
    storage::StoredRequest,
};

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-api-key",
    "api-key",
    "apikey",
    "x-apikey",
    "token",
    "x-auth-token",
];

const SENSITIVE_NAME_FRAGMENTS: &[&str] = &["auth", "token", "key"];

const API_KEY_HEADERS: &[&str] = &["x-api-key", "api-key", "apikey", "x-apikey"];

const BODY_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Bearer,
    Basic,
    ApiKey,
    Cookie,
    Custom,
}

/// Authentication shape inferred from the stored request headers. Values
/// are never echoed back, only masked patterns.
#[derive(Debug, Clone, Serialize)]
pub struct AuthDetection {
    pub detected: bool,
    #[serde(rename = "type")]
    pub kind: Option<AuthKind>,
    pub header_name: Option<String>,
    pub value_pattern: Option<String>,
}

impl AuthDetection {
    fn none() -> Self {
        Self {
            detected: false,
            kind: None,
            header_name: None,
            value_pattern: None,
        }
    }

    fn found(kind: AuthKind, header_name: &str, value_pattern: &str) -> Self {
        Self {
            detected: true,
            kind: Some(kind),
            header_name: Some(header_name.to_owned()),
            value_pattern: Some(value_pattern.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: QueryValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderParameter {
    pub name: String,
    pub value: String,
    pub is_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Json,
    Form,
    Multipart,
    Text,
    Binary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterReport {
    pub query: Vec<QueryParameter>,
    pub headers: Vec<HeaderParameter>,
    pub body: Option<Value>,
    pub body_type: Option<BodyKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseInfo {
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub body_preview: Option<String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timing {
    pub total_ms: Option<i64>,
}

/// Full per-request report. Sensitive header values are masked and the
/// response body is bounded to a preview.
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetails {
    pub request_id: i64,
    pub url: String,
    pub method: String,
    pub domain: String,
    pub path: String,
    pub authentication: AuthDetection,
    pub parameters: ParameterReport,
    pub response_info: ResponseInfo,
    pub timing: Timing,
}

pub fn analyze_request(stored: &StoredRequest) -> RequestDetails {
    let record = &stored.record;
    RequestDetails {
        request_id: stored.id,
        url: record.url.clone(),
        method: record.method.clone(),
        domain: record.domain.clone(),
        path: record.path.clone(),
        authentication: detect_authentication(&record.request_headers),
        parameters: extract_parameters(record),
        response_info: response_info(record),
        timing: Timing {
            total_ms: record.duration_ms,
        },
    }
}

/// Checks header classes in priority order: Authorization scheme, known
/// API-key headers, cookies, then any auth-ish header name.
pub fn detect_authentication(headers: &[(String, String)]) -> AuthDetection {
    if let Some((name, value)) = header_named(headers, "authorization") {
        let scheme = value.to_lowercase();
        return if scheme.starts_with("bearer ") {
            AuthDetection::found(AuthKind::Bearer, name, "Bearer ***")
        } else if scheme.starts_with("basic ") {
            AuthDetection::found(AuthKind::Basic, name, "Basic ***")
        } else {
            AuthDetection::found(AuthKind::Custom, name, "***")
        };
    }

    for api_key_header in API_KEY_HEADERS {
        if let Some((name, _)) = header_named(headers, api_key_header) {
            return AuthDetection::found(AuthKind::ApiKey, name, "***");
        }
    }

    if let Some((name, _)) = header_named(headers, "cookie") {
        return AuthDetection::found(AuthKind::Cookie, name, "***");
    }

    for (name, _) in headers {
        if is_sensitive_name(name) {
            return AuthDetection::found(AuthKind::Custom, name, "***");
        }
    }

    AuthDetection::none()
}

pub fn extract_parameters(record: &RequestRecord) -> ParameterReport {
    let query = record
        .query_params
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|(name, value)| QueryParameter {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();

    let headers = record
        .request_headers
        .iter()
        .map(|(name, value)| {
            let is_auth = is_sensitive_name(name);
            HeaderParameter {
                name: name.clone(),
                value: if is_auth { "***".to_owned() } else { value.clone() },
                is_auth,
            }
        })
        .collect();

    let (body, body_type) = match record.request_body.as_deref() {
        Some(body) => {
            let content_type = header_named(&record.request_headers, "content-type")
                .map(|(_, value)| value.to_lowercase());
            let (body, kind) = classify_body(body, content_type.as_deref());
            (Some(body), Some(kind))
        }
        None => (None, None),
    };

    ParameterReport {
        query,
        headers,
        body,
        body_type,
    }
}

pub fn response_info(record: &RequestRecord) -> ResponseInfo {
    let body_preview = record.response_body.as_deref().map(|body| {
        let mut preview: String = body.chars().take(BODY_PREVIEW_CHARS).collect();
        if body.chars().count() > BODY_PREVIEW_CHARS {
            preview.push_str("...");
        }
        preview
    });

    ResponseInfo {
        status_code: record.status_code,
        content_type: record.content_type.clone(),
        size_bytes: record.response_size,
        body_preview,
        headers: record.response_headers.clone(),
    }
}

fn header_named<'a>(headers: &'a [(String, String)], wanted: &str) -> Option<(&'a str, &'a str)> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
        .map(|(name, value)| (name.as_str(), value.as_str()))
}

fn is_sensitive_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    SENSITIVE_HEADERS.contains(&lowered.as_str())
        || SENSITIVE_NAME_FRAGMENTS
            .iter()
            .any(|fragment| lowered.contains(fragment))
}

fn classify_body(body: &str, content_type: Option<&str>) -> (Value, BodyKind) {
    match content_type {
        Some(content_type) if content_type.contains("application/json") => (
            serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_owned())),
            BodyKind::Json,
        ),
        Some(content_type) if content_type.contains("application/x-www-form-urlencoded") => {
            (parse_form_body(body), BodyKind::Form)
        }
        Some(content_type) if content_type.contains("multipart/form-data") => {
            (Value::String("<multipart data>".to_owned()), BodyKind::Multipart)
        }
        Some(content_type) if content_type.contains("text/") => {
            (Value::String(body.to_owned()), BodyKind::Text)
        }
        Some(_) => (Value::String("<binary data>".to_owned()), BodyKind::Binary),
        // No declared type: JSON if it parses, raw text otherwise.
        None => match serde_json::from_str(body) {
            Ok(parsed) => (parsed, BodyKind::Json),
            Err(_) => (Value::String(body.to_owned()), BodyKind::Text),
        },
    }
}

fn parse_form_body(body: &str) -> Value {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let name = name.into_owned();
        match grouped.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value.into_owned()),
            None => grouped.push((name, vec![value.into_owned()])),
        }
    }

    let mut map = serde_json::Map::new();
    for (name, mut values) in grouped {
        let value = if values.len() == 1 {
            Value::String(values.remove(0))
        } else {
            Value::Array(values.into_iter().map(Value::String).collect())
        };
        map.insert(name, value);
    }
    Value::Object(map)
}
