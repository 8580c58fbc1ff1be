//! OpenAI-compatible rewriter and synthesizer
//!
//! Uses reqwest against `/chat/completions` and `/audio/speech`. Any server
//! exposing the same routes works by changing `base_url`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CollaboratorError, Locale, Rewriter, Synthesizer, Tone, Voice};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SPEECH_MODEL: &str = "tts-1";

/// Connection settings shared by both collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub chat_model: String,
    pub speech_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            speech_model: DEFAULT_SPEECH_MODEL.to_string(),
        }
    }
}

impl OpenAiConfig {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            ..Default::default()
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap, CollaboratorError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| CollaboratorError::Rejected("invalid API key".to_string()))?,
        );
        Ok(headers)
    }
}

/// Prompt asking for `text` in the given tone.
pub fn tone_prompt(tone: Tone, text: &str) -> String {
    let instruction = match tone {
        Tone::Suspenseful => {
            "Rewrite the following text to make it more suspenseful and dramatic while keeping the same meaning:"
        }
        Tone::Inspiring => {
            "Rewrite the following text to make it more inspiring and motivational while keeping the same meaning:"
        }
        Tone::Neutral => {
            "Rewrite the following text in a clear and neutral tone while keeping the same meaning:"
        }
    };
    format!("{}\n\n{}\n\nRewritten version:", instruction, text)
}

/// Provider voice used for each named voice.
pub fn provider_voice(voice: Voice) -> &'static str {
    match voice {
        Voice::Sarah => "nova",
        Voice::Emma => "shimmer",
        Voice::Lisa => "alloy",
        Voice::James => "fable",
        Voice::David => "echo",
        Voice::Michael => "onyx",
    }
}

/// Map an unsuccessful HTTP status to a collaborator error.
fn classify_status(status: StatusCode, body: &str) -> CollaboratorError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        CollaboratorError::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CollaboratorError::Transient(detail)
    } else if status.is_client_error() {
        CollaboratorError::Rejected(detail)
    } else {
        CollaboratorError::Other(detail)
    }
}

fn classify_transport(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CollaboratorError::Transient(err.to_string())
    } else {
        CollaboratorError::Other(err.to_string())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Rewriter backed by chat completions.
pub struct OpenAiRewriter {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiRewriter {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, CollaboratorError> {
        let request = ChatRequest {
            model: &self.config.chat_model,
            messages,
            temperature: 0.7,
        };

        let response = self
            .client
            .post(self.config.url("chat/completions"))
            .headers(self.config.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;
        let response = ensure_success(response).await?;

        let parsed: ChatResponse = response.json().await.map_err(classify_transport)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(CollaboratorError::Other("empty completion".to_string()));
        }
        debug!(model = %self.config.chat_model, chars = text.len(), "Rewrite complete");
        Ok(text)
    }
}

#[async_trait]
impl Rewriter for OpenAiRewriter {
    async fn rewrite(&self, text: &str, tone: Tone) -> Result<String, CollaboratorError> {
        self.complete(vec![ChatMessage {
            role: "user".to_string(),
            content: tone_prompt(tone, text),
        }])
        .await
    }

    async fn rewrite_in_context(
        &self,
        context: &str,
        text: &str,
        tone: Tone,
    ) -> Result<String, CollaboratorError> {
        if context.trim().is_empty() {
            return self.rewrite(text, tone).await;
        }
        self.complete(vec![
            ChatMessage {
                role: "system".to_string(),
                content: format!(
                    "The text to rewrite continues from this passage. Use it for context only and do not repeat it:\n\n{}",
                    context
                ),
            },
            ChatMessage {
                role: "user".to_string(),
                content: tone_prompt(tone, text),
            },
        ])
        .await
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'a str,
}

/// Synthesizer backed by `/audio/speech`.
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiSynthesizer {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: Voice,
        locale: Locale,
    ) -> Result<Bytes, CollaboratorError> {
        let request = SpeechRequest {
            model: &self.config.speech_model,
            voice: provider_voice(voice),
            input: text,
            response_format: "wav",
        };

        let response = self
            .client
            .post(self.config.url("audio/speech"))
            .headers(self.config.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;
        let response = ensure_success(response).await?;

        let audio = response.bytes().await.map_err(classify_transport)?;
        debug!(voice = %voice, locale = locale.tag(), bytes = audio.len(), "Synthesis complete");
        Ok(audio)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
