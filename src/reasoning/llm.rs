use crate::config::config::LlmCfg;
use crate::core::error::{classify_status, classify_transport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
pub struct LlmOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct LlmReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// External LLM inference capability. Implementations must report token
/// usage so the pipeline can account for inference cost.
#[async_trait]
pub trait LlmCapability: Send + Sync + 'static {
    async fn generate(&self, system: &str, user: &str, opts: LlmOptions) -> Result<LlmReply>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    cfg: LlmCfg,
    // RateLimiter is internally synchronized; Arc because the client is cloned.
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmCfg, client: Client) -> Self {
        let rpm = NonZeroU32::new(cfg.rate_limit_rpm).unwrap_or(NonZeroU32::new(1).unwrap());
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
        Self {
            client,
            cfg,
            limiter,
        }
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }
}

#[async_trait]
impl LlmCapability for OpenAiCompatClient {
    async fn generate(&self, system: &str, user: &str, opts: LlmOptions) -> Result<LlmReply> {
        self.limiter.until_ready().await;

        let req_body = json!({
            "model": self.cfg.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.cfg.base_url))
            .bearer_auth(&self.cfg.api_key)
            .timeout(self.cfg.timeout)
            .json(&req_body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, "llm inference"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(status, "llm inference").into());
        }

        let parsed: ChatResponse = resp.json().await.context("parsing chat completion")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("chat completion had no choices")?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(LlmReply { text, usage })
    }
}
