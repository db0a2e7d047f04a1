//! Generation client: one prompt in, one text out, never an error.
//!
//! Owns the wall-clock budget and reasoning-trace extraction. Transport
//! failures and timeouts degrade to a fixed apology so callers always have
//! something to show.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message};

/// Returned in place of model output when the transport fails.
pub const DEGRADED_RESPONSE: &str =
    "Sorry, the assistant is unavailable right now. Please try again in a moment.";

/// Reasoning text attached to a degraded generation when a trace was requested.
pub const DEGRADED_REASONING: &str = "generation failed";

pub const DEFAULT_REQUEST_BUDGET: Duration = Duration::from_secs(30);

/// Model ids containing one of these return their own reasoning field.
const NATIVE_REASONING_MARKERS: &[&str] = &["deepseek"];

const SYSTEM_PROMPT: &str = "You are the assistant of a personal productivity dashboard. \
Follow the output format the user asks for exactly.";

const REASONING_INSTRUCTIONS: &str = "Before answering, think the problem through. \
Put your reasoning between <thinking> and </thinking>, then put the final answer, \
and only the answer, between <answer> and </answer>.";

static THINKING_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<thinking>(.*?)(?:</thinking>|$)").expect("Invalid thinking regex"));
static ANSWER_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<answer>(.*?)(?:</answer>|$)").expect("Invalid answer regex"));

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Sampling temperature, clamped to 0.0..=1.0.
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask for a separate reasoning trace.
    pub extract_reasoning: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            extract_reasoning: false,
        }
    }
}

impl GenerationParams {
    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.7 };
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max.max(1);
        self
    }

    pub fn with_reasoning(mut self, on: bool) -> Self {
        self.extract_reasoning = on;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub content: String,
    pub reasoning: Option<String>,
    /// True when `content` is the fallback apology.
    pub degraded: bool,
}

pub fn has_native_reasoning(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    NATIVE_REASONING_MARKERS.iter().any(|m| model.contains(m))
}

/// Split `<thinking>` / `<answer>` sections. Without delimiters the whole
/// text is the answer.
pub fn split_reasoning(text: &str) -> (String, Option<String>) {
    let reasoning = THINKING_SECTION
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    let answer = match ANSWER_SECTION.captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => match THINKING_SECTION.find(text) {
            // Reasoning without an answer tag: whatever follows it is the answer.
            Some(m) => text[m.end()..].trim().to_string(),
            None => text.trim().to_string(),
        },
    };

    (answer, reasoning)
}

#[derive(Clone)]
pub struct GenerationClient {
    gateway: Arc<dyn ChatGateway>,
    budget: Duration,
}

impl GenerationClient {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            gateway,
            budget: DEFAULT_REQUEST_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Generate text for `prompt`. Never fails.
    pub async fn invoke(
        &self,
        prompt: &str,
        model: &str,
        params: GenerationParams,
        attribution: Attribution,
    ) -> Generation {
        let native = has_native_reasoning(model);
        let wrap = params.extract_reasoning && !native;

        let user = if wrap {
            format!("{REASONING_INSTRUCTIONS}\n\n{prompt}")
        } else {
            prompt.to_string()
        };

        let req = ChatRequest::new(
            model,
            vec![Message::system(SYSTEM_PROMPT), Message::user(user)],
            attribution,
        )
        .temperature(params.temperature)
        .max_tokens(params.max_tokens);

        let resp = match tokio::time::timeout(self.budget, self.gateway.chat(req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                tracing::warn!(model, error = %err, code = err.code(), "generation failed; degrading");
                return degraded(params);
            }
            Err(_) => {
                tracing::warn!(
                    model,
                    budget_ms = self.budget.as_millis() as u64,
                    "generation exceeded request budget; degrading"
                );
                return degraded(params);
            }
        };

        if wrap {
            let (content, reasoning) = split_reasoning(&resp.content);
            Generation {
                content,
                reasoning,
                degraded: false,
            }
        } else {
            Generation {
                content: resp.content.trim().to_string(),
                reasoning: if native { resp.reasoning } else { None },
                degraded: false,
            }
        }
    }
}

fn degraded(params: GenerationParams) -> Generation {
    Generation {
        content: DEGRADED_RESPONSE.to_string(),
        reasoning: params
            .extract_reasoning
            .then(|| DEGRADED_REASONING.to_string()),
        degraded: true,
    }
}
