use serde::Serialize;

use crate::har::RequestRecord;

/// Renders a multi-line curl command replaying the stored exchange. Pure
/// string work, no network.
pub fn curl_command(record: &RequestRecord) -> String {
    let mut lines = vec![format!("curl '{}' \\", record.url)];

    if record.method != "GET" {
        lines.push(format!("  -X {} \\", record.method));
    }

    let mut headers: Vec<&(String, String)> = record
        .request_headers
        .iter()
        .filter(|(name, _)| !name.starts_with(':'))
        // accept-encoding invites compressed bodies curl will not decode.
        .filter(|(name, _)| !name.eq_ignore_ascii_case("accept-encoding"))
        .collect();
    headers.sort_by_key(|(name, _)| name.to_lowercase());

    for (name, value) in headers {
        lines.push(format!("  -H '{name}: {}' \\", escape_single_quotes(value)));
    }

    if let Some(body) = record.request_body.as_deref() {
        lines.push(format!("  --data-raw '{}' \\", escape_single_quotes(body)));
    }

    let mut command = lines.join("\n");
    if let Some(trimmed) = command.strip_suffix(" \\") {
        command = trimmed.to_owned();
    }
    command
}

#[derive(Debug, Serialize)]
pub struct CommandMetadata {
    pub url: String,
    pub method: String,
    pub domain: String,
    pub path: String,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandWithMetadata {
    pub curl_command: String,
    pub metadata: CommandMetadata,
}

pub fn curl_with_metadata(record: &RequestRecord) -> CommandWithMetadata {
    CommandWithMetadata {
        curl_command: curl_command(record),
        metadata: CommandMetadata {
            url: record.url.clone(),
            method: record.method.clone(),
            domain: record.domain.clone(),
            path: record.path.clone(),
            status_code: record.status_code,
            content_type: record.content_type.clone(),
        },
    }
}

// POSIX shells end the quoted span, emit an escaped quote, then reopen it.
fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', r"'\''")
}
