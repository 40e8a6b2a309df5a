use super::{Bot, ChatApi, ChatRequest, ImageRequest, LlmError};
use crate::config::AppConfig;
use crate::context::{Context, ContextType, Reply, ReplyType};
use crate::session::{Session, SessionManager};
use crate::token_bucket::TokenBucket;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 重试策略：固定间隔、有限次数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次请求之外的最大重试次数
    pub max_retries: u32,
    /// 超时与连接错误的等待时间
    pub delay: Duration,
    /// 限流后的等待时间
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(5),
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(cfg.retry_delay_secs),
            rate_limit_delay: Duration::from_secs(cfg.rate_limit_retry_delay_secs),
        }
    }
}

/// 一次对话补全的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyText {
    pub content: String,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ReplyText {
    fn failed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            completion_tokens: 0,
            total_tokens: 0,
        }
    }
}

/// 采样参数
#[derive(Debug, Clone)]
struct ChatArgs {
    model: String,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

/// 基于 OpenAI 兼容接口的机器人
pub struct OpenAiBot {
    api: Arc<dyn ChatApi>,
    sessions: Arc<SessionManager>,
    chat_bucket: Option<TokenBucket>,
    image_bucket: Option<TokenBucket>,
    args: ChatArgs,
    image_model: String,
    image_size: String,
    retry: RetryPolicy,
}

impl OpenAiBot {
    pub fn new(cfg: &AppConfig, api: Arc<dyn ChatApi>, sessions: Arc<SessionManager>) -> Self {
        let bucket = |tpm: u32| (tpm > 0).then(|| TokenBucket::new(tpm));
        Self {
            api,
            sessions,
            chat_bucket: bucket(cfg.rate_limit_chatgpt),
            image_bucket: bucket(cfg.rate_limit_dalle),
            args: ChatArgs {
                model: cfg.model.clone(),
                temperature: cfg.temperature,
                top_p: cfg.top_p,
                frequency_penalty: cfg.frequency_penalty,
                presence_penalty: cfg.presence_penalty,
            },
            image_model: cfg.text_to_image.clone(),
            image_size: cfg.image_create_size.clone(),
            retry: RetryPolicy::from_config(cfg),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 替换对话限流器（None 表示不限流）
    pub fn with_chat_bucket(mut self, bucket: Option<TokenBucket>) -> Self {
        self.chat_bucket = bucket;
        self
    }

    pub fn with_image_bucket(mut self, bucket: Option<TokenBucket>) -> Self {
        self.image_bucket = bucket;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// 调用对话补全接口，限流/超时/连接错误按固定间隔重试，
    /// 重试耗尽后清空会话并返回兜底文案（`Err`，用量为 0）
    ///
    /// 本地限流器拒绝与服务端 429 一样等待 `rate_limit_delay` 后重试。
    pub async fn reply_text(&self, session: &Session) -> Result<ReplyText, ReplyText> {
        let mut retry_count = 0;
        loop {
            let err = match self.complete_once(session).await {
                Ok(c) => {
                    return Ok(ReplyText {
                        content: c.content,
                        completion_tokens: c.completion_tokens,
                        total_tokens: c.total_tokens,
                    });
                }
                Err(e) => e,
            };

            let (fallback, delay) = match &err {
                LlmError::RateLimited(_) => ("提问太快啦，请休息一下再问我吧", self.retry.rate_limit_delay),
                LlmError::Timeout(_) => ("我没有收到你的消息", self.retry.delay),
                LlmError::Connection(_) => ("我连接不到你的网络", self.retry.delay),
                LlmError::Api { message, .. } => {
                    error!(target: "chatgpt", %err, "api error");
                    return Err(ReplyText::failed(format!("API 错误: {message}")));
                }
                LlmError::Request(_) | LlmError::Decode(_) => {
                    error!(target: "chatgpt", %err, "unexpected error");
                    return Err(ReplyText::failed("系统暂时不可用，请稍后再试"));
                }
            };

            warn!(target: "chatgpt", %err, retry_count, "transient failure");
            if retry_count < self.retry.max_retries {
                retry_count += 1;
                warn!(target: "chatgpt", "第{}次重试", retry_count);
                tokio::time::sleep(delay).await;
                continue;
            }

            self.sessions.clear_session(&session.session_id).await;
            return Err(ReplyText::failed(fallback));
        }
    }

    async fn complete_once(&self, session: &Session) -> Result<super::Completion, LlmError> {
        if let Some(bucket) = &self.chat_bucket
            && !bucket.try_acquire()
        {
            return Err(LlmError::RateLimited("rate limit exceeded".into()));
        }

        let request = ChatRequest {
            model: self.args.model.clone(),
            messages: session.turns(),
            temperature: self.args.temperature,
            top_p: self.args.top_p,
            frequency_penalty: self.args.frequency_penalty,
            presence_penalty: self.args.presence_penalty,
        };
        self.api.chat_completion(&request).await
    }

    /// 画图，成功返回图片地址，失败返回可直接展示给用户的文案
    pub async fn create_img(&self, query: &str) -> Result<String, String> {
        let mut retry_count = 0;
        loop {
            let result = if let Some(bucket) = &self.image_bucket
                && !bucket.try_acquire()
            {
                Err(LlmError::RateLimited("image rate limit exceeded".into()))
            } else {
                let request = ImageRequest {
                    prompt: query.to_string(),
                    model: self.image_model.clone(),
                    size: self.image_size.clone(),
                };
                self.api.create_image(&request).await
            };

            let err = match result {
                Ok(url) => {
                    info!(target: "openai", %url, "image created");
                    return Ok(url);
                }
                Err(e) => e,
            };

            let (fallback, delay) = match &err {
                LlmError::RateLimited(_) => ("图片生成速度太快啦，请稍后再试", self.retry.rate_limit_delay),
                LlmError::Timeout(_) => ("图片生成超时，请重试", self.retry.delay),
                LlmError::Connection(_) => ("图片生成失败，请检查网络", self.retry.delay),
                LlmError::Api { message, .. } => {
                    error!(target: "openai", %err, "api error");
                    return Err(format!("API 错误: {message}"));
                }
                LlmError::Request(_) | LlmError::Decode(_) => {
                    error!(target: "openai", %err, "unexpected error");
                    return Err("图片生成失败，请检查日志".to_string());
                }
            };

            warn!(target: "openai", %err, retry_count, "transient failure");
            if retry_count < self.retry.max_retries {
                retry_count += 1;
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(fallback.to_string());
        }
    }
}

#[async_trait]
impl Bot for OpenAiBot {
    async fn reply(&self, query: &str, context: &Context) -> Reply {
        match context.kind {
            ContextType::Text => {
                let session_id = context.session_id();
                info!(target: "chatgpt", session = %session_id, "query={}", query);

                // 被插件改写过的请求不带人设，也不计入历史
                let detached = context.contains("generate_breaked_by");
                let session = if detached {
                    self.sessions.detached(session_id, query)
                } else {
                    self.sessions.session_query(query, session_id).await
                };

                let result = match self.reply_text(&session).await {
                    Ok(result) => result,
                    Err(failed) => return Reply::error(failed.content),
                };
                debug!(
                    target: "chatgpt",
                    completion_tokens = result.completion_tokens,
                    total_tokens = result.total_tokens,
                    "new_query={:?}, session_id={}, reply_cont={:?}",
                    query,
                    session_id,
                    result.content
                );

                if !detached {
                    self.sessions
                        .session_reply(&result.content, session_id, result.total_tokens)
                        .await;
                }
                Reply::text(result.content)
            }
            ContextType::ImageCreate => match self.create_img(query).await {
                Ok(url) => Reply::new(ReplyType::ImageUrl, url),
                Err(msg) => Reply::error(msg),
            },
            other => Reply::error(format!("Bot不支持处理{other}类型的消息")),
        }
    }

    async fn voice_to_text(&self, path: &Path) -> Reply {
        match self.api.transcribe(path).await {
            Ok(text) => {
                info!(target: "openai", "voice to text: {}", text);
                Reply::text(text)
            }
            Err(e) => {
                error!(target: "openai", %e, "voice to text failed");
                Reply::error("我暂时还无法听清您的语音，请稍后再试吧~")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bot::Completion;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按脚本依次返回结果的假接口
    pub(crate) struct ScriptedApi {
        script: Mutex<VecDeque<Result<Completion, LlmError>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedApi {
        pub(crate) fn new(script: Vec<Result<Completion, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    pub(crate) fn ok(content: &str, completion_tokens: u32) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: content.to_string(),
            completion_tokens,
            total_tokens: completion_tokens + 10,
        })
    }

    #[async_trait]
    impl ChatApi for ScriptedApi {
        async fn chat_completion(&self, _request: &ChatRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Decode("script exhausted".into())))
        }

        async fn create_image(&self, request: &ImageRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://img.example/{}", request.prompt))
        }

        async fn transcribe(&self, _path: &Path) -> Result<String, LlmError> {
            Ok("transcribed".to_string())
        }
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
        }
    }

    fn bot_with(api: Arc<ScriptedApi>) -> OpenAiBot {
        let cfg = AppConfig::default();
        let sessions = Arc::new(SessionManager::from_config(&cfg));
        OpenAiBot::new(&cfg, api, sessions)
            .with_retry(no_wait())
            .with_chat_bucket(None)
    }

    fn text(content: &str) -> Context {
        Context::new(ContextType::Text, content).with_session("s1")
    }

    #[tokio::test]
    async fn timeouts_then_success_returns_content() {
        let api = Arc::new(ScriptedApi::new(vec![
            Err(LlmError::Timeout("t1".into())),
            Err(LlmError::Timeout("t2".into())),
            ok("第三次成功", 7),
        ]));
        let bot = bot_with(api.clone());

        let session = bot.sessions().session_query("你好", "s1").await;
        let result = bot.reply_text(&session).await.unwrap();
        assert_eq!(result.content, "第三次成功");
        assert_eq!(result.completion_tokens, 7);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn three_failures_return_fallback_and_clear_session() {
        let api = Arc::new(ScriptedApi::new(vec![
            Err(LlmError::Connection("c".into())),
            Err(LlmError::Connection("c".into())),
            Err(LlmError::Connection("c".into())),
            ok("不应到达", 1),
        ]));
        let bot = bot_with(api.clone());

        let reply = bot.reply("你好", &text("你好")).await;
        assert_eq!(reply, Reply::error("我连接不到你的网络"));
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert!(bot.sessions().history("s1").await.is_empty());
    }

    #[tokio::test]
    async fn api_errors_are_not_retried() {
        let api = Arc::new(ScriptedApi::new(vec![Err(LlmError::Api {
            status: 401,
            message: "invalid api key".into(),
        })]));
        let bot = bot_with(api.clone());

        let reply = bot.reply("hi", &text("hi")).await;
        assert_eq!(reply.kind, ReplyType::Error);
        assert_eq!(reply.content, "API 错误: invalid api key");
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_bucket_fails_without_calling_api_when_delays_are_zero() {
        let api = Arc::new(ScriptedApi::new(vec![ok("unused", 1)]));
        let bot = bot_with(api.clone()).with_chat_bucket(Some(TokenBucket::with_rate(0, 0.0)));

        let started = std::time::Instant::now();
        let reply = bot.reply("hi", &text("hi")).await;
        assert_eq!(reply, Reply::error("提问太快啦，请休息一下再问我吧"));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_waits_rate_limit_delay_between_attempts() {
        let api = Arc::new(ScriptedApi::new(vec![ok("unused", 1)]));
        let cfg = AppConfig::default();
        let sessions = Arc::new(SessionManager::from_config(&cfg));
        let bot = OpenAiBot::new(&cfg, api.clone(), sessions)
            .with_retry(RetryPolicy::default())
            .with_chat_bucket(Some(TokenBucket::with_rate(0, 0.0)));

        let started = tokio::time::Instant::now();
        let reply = bot.reply("hi", &text("hi")).await;
        assert_eq!(reply, Reply::error("提问太快啦，请休息一下再问我吧"));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        // 两次重试，每次等待 rate_limit_delay
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10), "waited {waited:?}");
        assert!(waited < Duration::from_secs(11), "waited {waited:?}");
    }

    #[tokio::test]
    async fn zero_usage_completion_is_still_success() {
        let api = Arc::new(ScriptedApi::new(vec![ok("你好呀", 0)]));
        let bot = bot_with(api);

        let reply = bot.reply("你好", &text("你好")).await;
        assert_eq!(reply, Reply::text("你好呀"));
        assert_eq!(bot.sessions().history("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn successful_reply_is_stored_in_session() {
        let api = Arc::new(ScriptedApi::new(vec![ok("你好呀", 3)]));
        let bot = bot_with(api);

        let reply = bot.reply("你好", &text("你好")).await;
        assert_eq!(reply, Reply::text("你好呀"));
        assert_eq!(bot.sessions().history("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn detached_query_leaves_history_untouched() {
        let api = Arc::new(ScriptedApi::new(vec![ok("欢迎新人", 3)]));
        let bot = bot_with(api);

        let mut ctx = text("请欢迎新人");
        ctx.set("generate_breaked_by", "break");
        let reply = bot.reply("请欢迎新人", &ctx).await;
        assert_eq!(reply.content, "欢迎新人");
        assert!(bot.sessions().history("s1").await.is_empty());
    }

    #[tokio::test]
    async fn image_create_returns_url() {
        let api = Arc::new(ScriptedApi::new(vec![]));
        let bot = bot_with(api).with_image_bucket(None);

        let ctx = Context::new(ContextType::ImageCreate, "cat").with_session("s1");
        let reply = bot.reply("cat", &ctx).await;
        assert_eq!(reply, Reply::new(ReplyType::ImageUrl, "https://img.example/cat"));
    }
}
