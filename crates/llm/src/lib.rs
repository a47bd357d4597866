use std::env;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use docsift_core::{GenerateRequest, Generation, PipelineError, Provider};
use reqwest::{header::HeaderValue, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const MAX_RETRIES: usize = 5;
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const DEEPSEEK_URL: &str = "https://api.deepseek.com/v1";
const OPENAI_URL: &str = "https://api.openai.com/v1";
const LOCAL_SUMMARY_WORDS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Deepseek,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Local => "local",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4.1-mini",
            ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
            ProviderKind::Gemini => "gemini-1.5-flash",
            ProviderKind::Deepseek => "deepseek-chat",
            ProviderKind::Local => "local",
        }
    }

    fn api_key_var(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::Deepseek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Local => None,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "deepseek" => Ok(ProviderKind::Deepseek),
            "local" => Ok(ProviderKind::Local),
            other => Err(PipelineError::Config(format!("unknown provider '{other}'"))),
        }
    }
}

/// Context window in tokens for a provider/model pair. Unknown models get a
/// conservative default.
pub fn context_window_for(kind: ProviderKind, model: &str) -> usize {
    let model = model.to_lowercase();
    match kind {
        ProviderKind::Anthropic => 200_000,
        ProviderKind::Gemini if model.starts_with("gemini-1.5") || model.starts_with("gemini-2") => {
            1_000_000
        }
        ProviderKind::Gemini => 32_768,
        ProviderKind::Deepseek => 64_000,
        ProviderKind::OpenAi if model.starts_with("gpt-4.1") => 1_000_000,
        ProviderKind::OpenAi
            if model.starts_with("gpt-4o") || model.starts_with("o1") || model.starts_with("o3") =>
        {
            128_000
        }
        ProviderKind::OpenAi if model.starts_with("gpt-3.5") => 16_385,
        ProviderKind::OpenAi => 8_192,
        ProviderKind::Local => 8_192,
    }
}

#[derive(Clone)]
enum Endpoint {
    /// OpenAI-compatible chat completions (OpenAI, DeepSeek, proxies).
    Chat { api_key: String, base_url: String },
    Anthropic { api_key: String },
    Gemini { api_key: String },
    Local,
}

/// Blocking [`Provider`] over the hosted chat APIs. One tokio runtime is
/// shared by every call made through the client.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    kind: ProviderKind,
    id: String,
    endpoint: Endpoint,
    runtime: Arc<Runtime>,
}

impl LlmClient {
    /// Reads the API key (and `OPENAI_BASE_URL`) from the environment.
    pub fn from_env(kind: ProviderKind) -> docsift_core::Result<Self> {
        Self::build(kind, |var| env::var(var).ok())
    }

    pub fn with_api_key(kind: ProviderKind, api_key: impl Into<String>) -> docsift_core::Result<Self> {
        let api_key = api_key.into();
        Self::build(kind, move |var| {
            if var.ends_with("_API_KEY") {
                Some(api_key.clone())
            } else {
                None
            }
        })
    }

    fn build(kind: ProviderKind, lookup: impl Fn(&str) -> Option<String>) -> docsift_core::Result<Self> {
        let api_key = match kind.api_key_var() {
            Some(var) => lookup(var)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| PipelineError::Config(format!("{var} is not set")))?,
            None => String::new(),
        };
        let endpoint = match kind {
            ProviderKind::OpenAi => Endpoint::Chat {
                api_key,
                base_url: lookup("OPENAI_BASE_URL").unwrap_or_else(|| OPENAI_URL.to_string()),
            },
            ProviderKind::Deepseek => Endpoint::Chat {
                api_key,
                base_url: DEEPSEEK_URL.to_string(),
            },
            ProviderKind::Anthropic => Endpoint::Anthropic { api_key },
            ProviderKind::Gemini => Endpoint::Gemini { api_key },
            ProviderKind::Local => Endpoint::Local,
        };
        let runtime = Runtime::new()
            .map_err(|e| PipelineError::Config(format!("failed to create tokio runtime: {e}")))?;
        Ok(Self {
            http: Client::new(),
            kind,
            id: kind.as_str().to_string(),
            endpoint,
            runtime: Arc::new(runtime),
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub async fn chat(&self, req: &GenerateRequest) -> anyhow::Result<Generation> {
        match &self.endpoint {
            Endpoint::Chat { api_key, base_url } => self.chat_completions(api_key, base_url, req).await,
            Endpoint::Anthropic { api_key } => self.chat_anthropic(api_key, req).await,
            Endpoint::Gemini { api_key } => self.chat_gemini(api_key, req).await,
            Endpoint::Local => Ok(summarize_locally(req)),
        }
    }

    async fn chat_completions(
        &self,
        api_key: &str,
        base_url: &str,
        req: &GenerateRequest,
    ) -> anyhow::Result<Generation> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if !req.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": req.system_prompt }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));
        let payload = json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });
        let value = self
            .send(|| self.http.post(&url).bearer_auth(api_key).json(&payload))
            .await?;
        let content = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing text in {} response", self.id))?;
        let usage: ChatUsage = value
            .get("usage")
            .and_then(|usage| serde_json::from_value(usage.clone()).ok())
            .unwrap_or_default();
        Ok(Generation::ok(content).with_usage(
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
        ))
    }

    async fn chat_anthropic(&self, api_key: &str, req: &GenerateRequest) -> anyhow::Result<Generation> {
        let mut payload = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": [ { "role": "user", "content": req.prompt } ],
        });
        if !req.system_prompt.is_empty() {
            payload["system"] = json!(req.system_prompt);
        }
        let value = self
            .send(|| {
                self.http
                    .post(ANTHROPIC_URL)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&payload)
            })
            .await?;
        let response: AnthropicResponse =
            serde_json::from_value(value).context("failed to decode anthropic response")?;
        let text = response
            .content
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("");
        let usage = response.usage.unwrap_or_default();
        Ok(Generation::ok(text).with_usage(
            usage.input_tokens.unwrap_or(0),
            usage.output_tokens.unwrap_or(0),
        ))
    }

    async fn chat_gemini(&self, api_key: &str, req: &GenerateRequest) -> anyhow::Result<Generation> {
        let mut payload = json!({
            "contents": [ { "role": "user", "parts": [ { "text": req.prompt } ] } ],
            "generationConfig": {
                "temperature": req.temperature,
                "maxOutputTokens": req.max_tokens,
            },
        });
        if !req.system_prompt.is_empty() {
            payload["systemInstruction"] = json!({ "parts": [ { "text": req.system_prompt } ] });
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            req.model
        );
        let value = self
            .send(|| {
                self.http
                    .post(&url)
                    .query(&[("key", api_key)])
                    .json(&payload)
            })
            .await?;
        let response: GeminiResponse =
            serde_json::from_value(value).context("failed to decode gemini response")?;
        let text = response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| anyhow!("missing text in gemini response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(Generation::ok(text).with_usage(
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
        ))
    }

    /// Sends a request, retrying transport errors, 429 and 5xx with backoff.
    async fn send(&self, request: impl Fn() -> RequestBuilder) -> anyhow::Result<Value> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match request().send().await {
                Ok(response) => response,
                Err(err) if attempt <= MAX_RETRIES => {
                    warn!(provider = %self.id, attempt, error = %err, "request failed, retrying");
                    sleep(backoff_delay(attempt, None)).await;
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("{} request failed", self.id));
                }
            };
            let status = response.status();
            if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
                && attempt <= MAX_RETRIES
            {
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                warn!(provider = %self.id, attempt, %status, wait_secs = wait.as_secs(), "backing off");
                sleep(wait).await;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(anyhow!("{} returned status {status}: {body}", self.id));
            }
            debug!(provider = %self.id, bytes = body.len(), "response received");
            return serde_json::from_str(&body)
                .with_context(|| format!("failed to decode {} response", self.id));
        }
    }
}

impl Provider for LlmClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate(&self, request: &GenerateRequest) -> Generation {
        match self.runtime.block_on(self.chat(request)) {
            Ok(generation) => generation,
            Err(err) => Generation::failed(format!("{err:#}")),
        }
    }
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    let hinted = retry_after
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok());
    if let Some(secs) = hinted {
        return Duration::from_secs(secs.clamp(1, 120));
    }
    Duration::from_secs(1u64 << attempt.min(6))
}

/// Offline stand-in: echoes the first words of the prompt body. Lets a job
/// be dry-run end to end without network access.
fn summarize_locally(req: &GenerateRequest) -> Generation {
    let words: Vec<&str> = req
        .prompt
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("<<<") && !line.starts_with("###"))
        .flat_map(str::split_whitespace)
        .take(LOCAL_SUMMARY_WORDS)
        .collect();
    if words.is_empty() {
        return Generation::failed("local provider received an empty prompt");
    }
    let prompt_tokens = docsift_core::estimate_tokens(&req.prompt) as u32;
    let content = format!("Summary: {}", words.join(" "));
    let completion_tokens = docsift_core::estimate_tokens(&content) as u32;
    Generation::ok(content).with_usage(prompt_tokens, completion_tokens)
}

#[derive(Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_tokens: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.to_string(),
            system_prompt: String::new(),
            model: "local".into(),
            temperature: 0.0,
            max_tokens: 128,
        }
    }

    #[test]
    fn parses_provider_names() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        let err = "mystery".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let err = LlmClient::build(ProviderKind::Anthropic, |_| None).err().unwrap();
        assert!(matches!(err, PipelineError::Config(msg) if msg.contains("ANTHROPIC_API_KEY")));
        let blank = LlmClient::build(ProviderKind::OpenAi, |_| Some("  ".into()));
        assert!(blank.is_err());
    }

    #[test]
    fn local_provider_summarizes_without_network() {
        let client = LlmClient::from_env(ProviderKind::Local).unwrap();
        let out = client.generate(&request("### Part 1\n\nThe quarterly report shows growth."));
        assert!(out.success);
        assert_eq!(out.content, "Summary: The quarterly report shows growth.");
        assert!(out.prompt_tokens > 0);
        let empty = client.generate(&request("   \n"));
        assert!(!empty.success);
    }

    #[test]
    fn context_windows_know_common_models() {
        assert_eq!(context_window_for(ProviderKind::Anthropic, "claude-3-opus"), 200_000);
        assert_eq!(context_window_for(ProviderKind::OpenAi, "gpt-4o-mini"), 128_000);
        assert_eq!(context_window_for(ProviderKind::OpenAi, "custom"), 8_192);
        assert_eq!(context_window_for(ProviderKind::Gemini, "gemini-1.5-pro"), 1_000_000);
    }

    #[test]
    fn backoff_prefers_retry_after() {
        let header = HeaderValue::from_static("7");
        assert_eq!(backoff_delay(1, Some(&header)), Duration::from_secs(7));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(20, None), Duration::from_secs(64));
    }
}
