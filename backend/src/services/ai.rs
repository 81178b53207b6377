// AI content generation client
//
// Talks to an OpenAI-compatible chat completions endpoint or to Gemini's
// generateContent endpoint. Only the request/response subset the
// GenerateAIContent action needs is modelled.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::config::AiConfig;
use crate::error::{WorkflowError, WorkflowResult};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Overrides the configured model
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(&self, request: AiRequest) -> WorkflowResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProviderKind {
    OpenAi,
    Gemini,
}

impl AiProviderKind {
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Gemini => "gemini-2.0-flash",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_API_BASE,
            Self::Gemini => GEMINI_API_BASE,
        }
    }
}

impl FromStr for AiProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(format!("unsupported AI provider `{}`", other)),
        }
    }
}

#[derive(Clone)]
pub struct AiClient {
    http: Client,
    kind: AiProviderKind,
    api_key: String,
    base_url: String,
    model: String,
}

impl AiClient {
    pub fn new(http: Client, config: &AiConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.provider.default_base_url().to_string());

        Self {
            http,
            kind: config.provider,
            api_key: config.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    async fn chat_completion(&self, request: AiRequest, model: &str) -> WorkflowResult<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt,
        });

        let body = ChatRequest {
            model: model.to_string(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Ai(format!("provider returned {}: {}", status, detail)));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| WorkflowError::Ai("response contained no choices".to_string()))
    }

    async fn generate_content(&self, request: AiRequest, model: &str) -> WorkflowResult<String> {
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart {
                    text: request.prompt,
                }],
            }],
            system_instruction: request.system_prompt.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
        };

        let response = self
            .http
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Ai(format!("provider returned {}: {}", status, detail)));
        }

        let parsed: GeminiResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect()
            })
            .ok_or_else(|| WorkflowError::Ai("response contained no candidates".to_string()))?;

        Ok(text)
    }
}

#[async_trait]
impl AiProvider for AiClient {
    async fn generate(&self, request: AiRequest) -> WorkflowResult<String> {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        debug!(provider = ?self.kind, model = %model, "Generating AI content");

        match self.kind {
            AiProviderKind::OpenAi => self.chat_completion(request, &model).await,
            AiProviderKind::Gemini => self.generate_content(request, &model).await,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}
