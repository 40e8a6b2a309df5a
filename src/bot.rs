//! 大模型客户端
//!
//! `ChatApi` 是与 OpenAI 兼容接口通信的传输层，`Bot` 在其之上实现
//! 会话、限流与重试策略。

use crate::context::{Context, Reply};
use crate::session::Turn;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub mod api;
pub mod openai;

pub use api::HttpChatApi;
pub use openai::{OpenAiBot, RetryPolicy};

/// 大模型接口错误
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid request: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl LlmError {
    /// 限流、超时和连接错误可以重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }
}

/// 对话补全请求
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Turn>,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

/// 对话补全结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// 画图请求
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: String,
    pub size: String,
}

/// OpenAI 兼容接口的传输层
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<Completion, LlmError>;

    /// 返回生成图片的地址
    async fn create_image(&self, request: &ImageRequest) -> Result<String, LlmError>;

    /// 语音转文字
    async fn transcribe(&self, path: &Path) -> Result<String, LlmError>;
}

/// 自动回复机器人
#[async_trait]
pub trait Bot: Send + Sync {
    /// 根据 Context 生成回复，不会返回错误，失败时给出 ERROR 类型的回复
    async fn reply(&self, query: &str, context: &Context) -> Reply;

    async fn voice_to_text(&self, _path: &Path) -> Reply {
        Reply::error("暂不支持语音识别")
    }
}
