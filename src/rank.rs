use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::{
    har::RequestRecord,
    storage::{Storage, StoredRequest},
};

pub const API_SUBDOMAIN_BONUS: i32 = 15;
pub const SERVICE_DOMAIN_BONUS: i32 = 10;
pub const JSON_CONTENT_TYPE_BONUS: i32 = 10;
pub const SUCCESS_STATUS_BONUS: i32 = 5;
pub const QUERY_PARAMS_BONUS: i32 = 3;
pub const API_PARAM_TERM_BONUS: i32 = 5;
pub const STATIC_EXTENSION_PENALTY: i32 = -30;
pub const STATIC_SEGMENT_PENALTY: i32 = -30;
pub const KEYWORD_IN_PATH_BONUS: i32 = 5;
pub const KEYWORD_IN_URL_BONUS: i32 = 2;
pub const GET_METHOD_BONUS: i32 = 1;
pub const LONG_URL_PENALTY: i32 = -2;
pub const VERSION_SEGMENT_BONUS: i32 = 3;
pub const API_PATH_SEGMENT_BONUS: i32 = 3;

const LONG_URL_THRESHOLD: usize = 200;

// Articles, prepositions, generic API vocabulary, and TLD-ish strings that
// carry no signal as search keywords.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "from",
    "by", "about", "as", "into", "like", "through", "after", "over", "between", "out", "against",
    "during", "without", "before", "under", "around", "among", "api", "endpoint", "request",
    "return", "get", "fetch", "that", "which", "what", "is", "are", "was", "com", "net", "org",
    "www", "http", "https",
];

const HTTP_METHODS: &[&str] = &["get", "post", "put", "delete", "patch", "head", "options"];

const STATIC_EXTENSIONS: &[&str] = &[
    ".js", ".mjs", ".css", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".woff",
    ".woff2", ".ttf", ".otf", ".map",
];

const STATIC_SEGMENTS: &[&str] = &[
    "/static/", "/bundle/", "/assets/", "/dist/", "/public/", "/_next/", "/webpack/",
];

const API_PARAM_TERMS: &[&str] = &[
    "id", "format", "api", "key", "token", "timestamp", "limit", "offset",
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w+").unwrap_or_else(|_| unreachable!("word pattern is a valid regex"))
});

static VERSION_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/v\d+/").unwrap_or_else(|_| unreachable!("version pattern is a valid regex"))
});

/// Lower-cased prompt words minus stop words and anything two characters
/// or shorter.
pub fn extract_keywords(prompt: &str) -> Vec<String> {
    let lowered = prompt.to_lowercase();
    WORD_RE
        .find_iter(&lowered)
        .map(|word| word.as_str().to_owned())
        .filter(|word| word.len() > 2 && !STOP_WORDS.contains(&word.as_str()))
        .collect()
}

/// First HTTP method named as a whole word in the prompt, if any.
pub fn detect_http_method(prompt: &str) -> Option<&'static str> {
    let lowered = prompt.to_lowercase();
    let words: Vec<&str> = WORD_RE.find_iter(&lowered).map(|word| word.as_str()).collect();
    for method in HTTP_METHODS {
        if words.iter().any(|word| word == method) {
            return Some(match *method {
                "get" => "GET",
                "post" => "POST",
                "put" => "PUT",
                "delete" => "DELETE",
                "patch" => "PATCH",
                "head" => "HEAD",
                _ => "OPTIONS",
            });
        }
    }
    None
}

/// Additive rubric biasing toward real API endpoints and away from static
/// assets. Pure over the record and keyword list so each term can be
/// exercised in isolation.
pub fn score_record(record: &RequestRecord, keywords: &[String]) -> i32 {
    let mut score = 0;
    let domain = record.domain.to_lowercase();
    let path = record.path.to_lowercase();
    let url = record.url.to_lowercase();

    // At most one domain bonus applies; a domain both api-prefixed and
    // containing "gateway" only earns the subdomain bonus.
    if domain.starts_with("api.") || domain.contains(".api.") || domain.starts_with("api-") {
        score += API_SUBDOMAIN_BONUS;
    } else if ["gateway", "service", "rest", "graphql"]
        .iter()
        .any(|term| domain.contains(term))
    {
        score += SERVICE_DOMAIN_BONUS;
    }

    if record
        .content_type
        .as_deref()
        .is_some_and(|content_type| content_type.to_lowercase().contains("json"))
    {
        score += JSON_CONTENT_TYPE_BONUS;
    }

    if record
        .status_code
        .is_some_and(|status| (200..300).contains(&status))
    {
        score += SUCCESS_STATUS_BONUS;
    }

    if let Some(params) = record.query_params.as_ref().filter(|p| !p.is_empty()) {
        score += QUERY_PARAMS_BONUS;
        let rendered = serde_json::to_string(params).unwrap_or_default().to_lowercase();
        if API_PARAM_TERMS.iter().any(|term| rendered.contains(term)) {
            score += API_PARAM_TERM_BONUS;
        }
    }

    if STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        score += STATIC_EXTENSION_PENALTY;
    }
    if STATIC_SEGMENTS.iter().any(|segment| path.contains(segment)) {
        score += STATIC_SEGMENT_PENALTY;
    }

    for keyword in keywords {
        if path.contains(keyword.as_str()) {
            score += KEYWORD_IN_PATH_BONUS;
        } else if url.contains(keyword.as_str()) {
            score += KEYWORD_IN_URL_BONUS;
        }
    }

    if record.method == "GET" {
        score += GET_METHOD_BONUS;
    }
    if record.url.len() > LONG_URL_THRESHOLD {
        score += LONG_URL_PENALTY;
    }
    if VERSION_SEGMENT_RE.is_match(&path) {
        score += VERSION_SEGMENT_BONUS;
    }
    if path.contains("/api/") {
        score += API_PATH_SEGMENT_BONUS;
    }

    score
}

/// Narrows the job's records by detected method and keyword substrings,
/// then ranks them best-first. Ties keep retrieval order.
pub async fn filter_requests(
    storage: &Storage,
    job_id: Uuid,
    prompt: &str,
    max_results: usize,
) -> anyhow::Result<Vec<StoredRequest>> {
    let keywords = extract_keywords(prompt);
    let method = detect_http_method(prompt);

    let mut candidates = storage.search_requests(job_id, method, &keywords).await?;
    candidates.sort_by_key(|candidate| -score_record(&candidate.record, &keywords));
    candidates.truncate(max_results);
    Ok(candidates)
}
