//! Client for any backend speaking the OpenAI `/chat/completions` format
//! (OpenAI, DeepSeek, local proxies).

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Message};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest response body we will buffer.
const MAX_RESPONSE_BYTES: usize = 1_024 * 1_024;

/// Prompts are bounded well below any context window we target.
const MAX_INPUT_CHARS: usize = 400_000;

/// Lowercased first-line openings that mark a refusal instead of an answer.
const REFUSAL_OPENINGS: &[&str] = &[
    "i cannot",
    "i can't",
    "i won't",
    "i will not",
    "i'm unable to",
    "i am unable to",
    "i'm sorry, but i can",
    "sorry, i can't",
];

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenAiAdapter {
    /// `OPENAI_API_KEY` is required. `OPENAI_BASE_URL` (or `OPENAI_URL`) and
    /// `OPENAI_TIMEOUT_SECONDS` override the defaults.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::config("OPENAI_API_KEY not set"))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .or_else(|_| std::env::var("OPENAI_URL"))
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let timeout = std::env::var("OPENAI_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(&api_key, &base_url, timeout)
    }

    pub fn with_config(
        api_key: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("empty API key"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("API key contains invalid header characters"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }

    /// One attempt, no retries.
    pub async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let chars = req.input_chars();
        if chars > MAX_INPUT_CHARS {
            return Err(ProviderError::rejected(format!(
                "prompt is {chars} chars; limit is {MAX_INPUT_CHARS}"
            )));
        }

        let started = Instant::now();
        let body = WireRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };
        let mut response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status().as_u16();
        let request_id = header_str(response.headers(), "x-request-id");
        let retry_after = header_str(response.headers(), RETRY_AFTER.as_str())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(ProviderError::Malformed(format!(
                    "response body exceeds {MAX_RESPONSE_BYTES} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        if !(200..300).contains(&status) {
            return Err(failure(status, &bytes, retry_after, request_id));
        }
        decode(&bytes, started.elapsed())
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(alias = "reasoning")]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn failure(
    status: u16,
    body: &[u8],
    retry_after: Option<Duration>,
    request_id: Option<String>,
) -> ProviderError {
    let wire = serde_json::from_slice::<WireResponse>(body)
        .ok()
        .and_then(|r| r.error);
    let (message, code) = match wire {
        Some(e) => (e.message.unwrap_or_default(), e.code),
        None => (format!("HTTP {status}"), None),
    };
    let context = ErrorContext::http(status, request_id).with_code(code);
    ProviderError::from_status(status, message, retry_after, context)
}

fn decode(body: &[u8], latency: Duration) -> Result<ChatResponse, ProviderError> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|e| ProviderError::Malformed(format!("invalid JSON: {e}")))?;

    if let Some(err) = wire.error {
        let message = err.message.unwrap_or_default();
        return Err(if looks_like_refusal(&message) {
            ProviderError::Refused(message)
        } else {
            ProviderError::rejected(message)
        });
    }

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("no choices".into()))?;
    let content = choice.message.content.unwrap_or_default();
    if looks_like_refusal(&content) {
        return Err(ProviderError::Refused(content));
    }

    let (input_tokens, output_tokens) = wire
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        reasoning: choice
            .message
            .reasoning_content
            .filter(|r| !r.trim().is_empty()),
        input_tokens,
        output_tokens,
        latency,
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
    })
}

fn looks_like_refusal(text: &str) -> bool {
    let first_line = text.trim_start().lines().next().unwrap_or("").to_lowercase();
    REFUSAL_OPENINGS.iter().any(|p| first_line.starts_with(p))
}
