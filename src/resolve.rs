use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::LlmConfig,
    har::path_with_query_preview,
    storage::StoredRequest,
};

/// Compact view of one stored request, sized for a model prompt rather
/// than completeness.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub index: usize,
    pub request_id: i64,
    pub domain: String,
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
}

pub fn build_candidates(ranked: &[StoredRequest]) -> Vec<Candidate> {
    ranked
        .iter()
        .enumerate()
        .map(|(index, stored)| Candidate {
            index,
            request_id: stored.id,
            domain: stored.record.domain.clone(),
            method: stored.record.method.clone(),
            path: path_with_query_preview(&stored.record),
            content_type: stored.record.content_type.clone(),
        })
        .collect()
}

#[derive(Debug)]
pub enum ResolveError {
    NoCandidates,
    MatchFailed,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCandidates => f.write_str("no candidate requests to match against"),
            Self::MatchFailed => {
                f.write_str("neither the primary nor the fallback model produced a usable match")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub index: usize,
    pub request_id: i64,
    pub model_used: String,
    pub raw_response: String,
}

/// One bounded completion call against a named model. The production
/// implementation talks to an OpenAI-compatible endpoint; tests substitute
/// a scripted client.
pub trait CompletionClient {
    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String>;
}

/// Picks the candidate best matching the prompt: primary model first, then
/// the fallback on any error, timeout, or unusable index. Model output is
/// never trusted past bounds validation.
pub async fn resolve_match<C: CompletionClient>(
    client: &C,
    llm: &LlmConfig,
    prompt: &str,
    candidates: &[Candidate],
) -> Result<Resolution, ResolveError> {
    if candidates.is_empty() {
        return Err(ResolveError::NoCandidates);
    }

    let match_prompt = build_prompt(prompt, candidates);
    for model in [&llm.primary_model, &llm.fallback_model] {
        info!(%model, candidates = candidates.len(), "requesting match");
        let reply = tokio::time::timeout(llm.timeout(), client.complete(model, &match_prompt)).await;
        let text = match reply {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                warn!(%model, error = %format!("{err:#}"), "model call failed");
                continue;
            }
            Err(_) => {
                warn!(%model, timeout_secs = llm.timeout_secs, "model call timed out");
                continue;
            }
        };

        match parse_index(&text, candidates.len()) {
            Some(index) => {
                info!(%model, index, "model matched candidate");
                return Ok(Resolution {
                    index,
                    request_id: candidates[index].request_id,
                    model_used: model.clone(),
                    raw_response: text,
                });
            }
            None => {
                warn!(%model, "model reply had no usable index");
            }
        }
    }

    Err(ResolveError::MatchFailed)
}

fn build_prompt(user_prompt: &str, candidates: &[Candidate]) -> String {
    let mut lines = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut line = format!(
            "{}: {} - {} {}",
            candidate.index, candidate.domain, candidate.method, candidate.path
        );
        if let Some(content_type) = candidate
            .content_type
            .as_deref()
            .map(|value| value.split(';').next().unwrap_or("").trim())
            .filter(|value| !value.is_empty())
        {
            line.push_str(&format!(" [{content_type}]"));
        }
        lines.push(line);
    }

    format!(
        "Match this request: \"{user_prompt}\"\n\n\
         Candidates (format: index: domain - METHOD path [content-type]):\n{}\n\n\
         Return JSON with the index of the best match:\n\
         {{\"index\": <number>, \"reasoning\": \"<brief explanation>\"}}",
        lines.join("\n")
    )
}

static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?index"?\s*:\s*(\d+)"#)
        .unwrap_or_else(|_| unreachable!("index pattern is a valid regex"))
});

/// Structured parse first; a regex scan only when the reply is not JSON at
/// all. A reply that parses as JSON but carries a bad index is rejected,
/// not rescued.
fn parse_index(reply: &str, candidate_count: usize) -> Option<usize> {
    match serde_json::from_str::<Value>(reply) {
        Ok(parsed) => parsed
            .get("index")
            .and_then(Value::as_u64)
            .map(|index| index as usize)
            .filter(|index| *index < candidate_count),
        Err(_) => INDEX_RE
            .captures(reply)
            .and_then(|captures| captures.get(1))
            .and_then(|index| index.as_str().parse::<usize>().ok())
            .filter(|index| *index < candidate_count),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat<'a>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
        }
    }

    pub fn from_config(llm: &LlmConfig) -> Self {
        Self::new(llm.api_url.clone(), llm.api_key.clone())
    }
}

impl CompletionClient for OpenAiClient {
    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("send completion request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("completion endpoint returned {status}: {body}");
        }

        let completion: ChatResponse = response
            .json()
            .await
            .context("decode completion response")?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .context("completion response had no choices")
    }
}
