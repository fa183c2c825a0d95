//! OpenAI Chat Completions adapter. Requires `OPENAI_API_KEY`.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{GenerationRequest, TextGenerator};

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_MODEL: &str = "LLM_MODEL";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            bail!("{ENV_API_KEY} is empty");
        }
        let http = reqwest::Client::builder()
            .user_agent("deep-research-report/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(90))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let key = std::env::var(ENV_API_KEY)
            .map_err(|_| anyhow!("{ENV_API_KEY} is not set (use GENERATOR_TEST_MODE=mock for offline runs)"))?;
        let model = std::env::var(ENV_MODEL).ok();
        Self::new(key, model.as_deref())
    }

    fn temperature(request: &GenerationRequest) -> f32 {
        match request {
            GenerationRequest::Title { .. } => 0.3,
            GenerationRequest::DraftSection { .. } => 0.7,
            GenerationRequest::Review { .. } | GenerationRequest::Judge { .. } => 0.2,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let system = request.instructions();
        let user = serde_json::to_string_pretty(request).context("serialising request")?;
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &system,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: Self::temperature(request),
        };

        let resp = self
            .http
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("sending chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("chat completion returned HTTP {status}");
        }
        let body: Resp = resp.json().await.context("decoding chat completion")?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            bail!("chat completion returned no content");
        }
        debug!(target: "generation", kind = request.kind(), model = %self.model, chars = content.len(), "completion received");
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
