use super::{ChatApi, ChatRequest, Completion, ImageRequest, LlmError};
use crate::config::AppConfig;
use crate::session::{Role, Turn};
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const TRANSCRIBE_MODEL: &str = "whisper-1";

/// 基于 reqwest 的 OpenAI 兼容接口实现
///
/// 请求体使用 async-openai 的类型构造，传输与错误分类由这里负责，
/// 以便区分限流、超时和连接错误。
pub struct HttpChatApi {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[derive(Serialize)]
struct ImageGenerationBody<'a> {
    prompt: &'a str,
    model: &'a str,
    size: &'a str,
    n: u8,
}

#[derive(Deserialize)]
struct ImageGenerationResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    url: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl HttpChatApi {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// 根据配置构造（超时、代理）
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(cfg.request_timeout()?);
        if let Some(proxy) = cfg.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self::new(
            cfg.open_ai_api_base.clone(),
            cfg.api_key(),
            builder.build()?,
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &body))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let body = build_request(request).map_err(|e| LlmError::Request(e.to_string()))?;
        debug!(model = %request.model, messages = request.messages.len(), "chat completion request");

        let resp = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: CreateChatCompletionResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Decode("response has no content".into()))?;
        let (completion_tokens, total_tokens) = parsed
            .usage
            .map(|u| (u.completion_tokens, u.total_tokens))
            .unwrap_or_default();

        Ok(Completion {
            content,
            completion_tokens,
            total_tokens,
        })
    }

    async fn create_image(&self, request: &ImageRequest) -> Result<String, LlmError> {
        let body = ImageGenerationBody {
            prompt: &request.prompt,
            model: &request.model,
            size: &request.size,
            n: 1,
        };
        let resp = self
            .http
            .post(self.url("images/generations"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: ImageGenerationResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        parsed
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| LlmError::Decode("response has no image url".into()))
    }

    async fn transcribe(&self, path: &Path) -> Result<String, LlmError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| LlmError::Request(format!("读取语音文件失败: {e}")))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voice.wav".to_string());

        let form = Form::new()
            .text("model", TRANSCRIBE_MODEL)
            .part("file", Part::bytes(bytes).file_name(file_name));
        let resp = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        let parsed: TranscriptionResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(parsed.text)
    }
}

fn build_request(request: &ChatRequest) -> Result<CreateChatCompletionRequest, OpenAIError> {
    let messages = request
        .messages
        .iter()
        .map(to_message)
        .collect::<Result<Vec<_>, _>>()?;

    CreateChatCompletionRequestArgs::default()
        .model(&request.model)
        .messages(messages)
        .temperature(request.temperature)
        .top_p(request.top_p)
        .frequency_penalty(request.frequency_penalty)
        .presence_penalty(request.presence_penalty)
        .build()
}

fn to_message(turn: &Turn) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let content = turn.content.clone();
    Ok(match turn.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()?
            .into(),
    })
}

fn transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else if e.is_connect() {
        LlmError::Connection(e.to_string())
    } else if e.is_decode() {
        LlmError::Decode(e.to_string())
    } else if let Some(status) = e.status() {
        status_error(status.as_u16(), &e.to_string())
    } else {
        LlmError::Connection(e.to_string())
    }
}

fn status_error(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        429 => LlmError::RateLimited(message),
        408 => LlmError::Timeout(message),
        _ => LlmError::Api { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_timeout_fails_client_construction() {
        let cfg = AppConfig {
            request_timeout: f64::INFINITY,
            ..AppConfig::default()
        };
        assert!(HttpChatApi::from_config(&cfg).is_err());
        assert!(HttpChatApi::from_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn classifies_status_codes() {
        let body = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
        match status_error(429, body) {
            LlmError::RateLimited(msg) => assert_eq!(msg, "Rate limit reached"),
            other => panic!("unexpected {other:?}"),
        }

        match status_error(401, "bad key") {
            LlmError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad key");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!status_error(400, "{}").is_transient());
        assert!(status_error(408, "").is_transient());
    }

    #[test]
    fn request_carries_sampling_parameters() {
        let req = ChatRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![
                Turn::new(Role::System, "sys"),
                Turn::new(Role::User, "hi"),
                Turn::new(Role::Assistant, "hello"),
            ],
            temperature: 0.5,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        };
        let built = build_request(&req).unwrap();
        let json = serde_json::to_value(&built).unwrap();
        assert_eq!(json["model"], "gpt-3.5-turbo");
        assert_eq!(json["messages"].as_array().unwrap().len(), 3);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][2]["role"], "assistant");
        assert_eq!(json["temperature"], 0.5);
    }

    #[test]
    fn base_url_is_normalised() {
        let api = HttpChatApi::new("http://localhost:8080/v1/", "k", reqwest::Client::new());
        assert_eq!(api.url("chat/completions"), "http://localhost:8080/v1/chat/completions");
    }
}
