//! 通道：把外部消息转换为 Context，并驱动完整的处理流程
//!
//! 处理流程：compose_context → generate_reply → decorate_reply → send_reply。
//! 同一会话的消息进入该会话自己的队列，按到达顺序处理；不同会话之间并发执行，
//! 并发数由信号量限制。

use crate::bot::Bot;
use crate::command::strip_prefix;
use crate::context::{ChatMessage, Context, ContextType, Reply, ReplyType};
use crate::event::{Event, EventContext};
use crate::plugins::PluginContext;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod terminal;
pub mod web;

pub use terminal::TerminalChannel;
pub use web::WebChannel;

/// 内部异常时的兜底回复
pub const FALLBACK_REPLY: &str = "系统繁忙，请稍后再试";

/// 会话队列空闲多久后回收
const QUEUE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 通道接口
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// 启动通道，直到通道退出才返回
    async fn startup(&self) -> anyhow::Result<()>;
}

/// 回复的实际发送方式
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, reply: &Reply, context: &Context) -> anyhow::Result<()>;
}

/// 只记录日志的发送器（同步请求/响应的通道通过 `produce` 直接拿到回复）
pub struct LogSender;

#[async_trait]
impl ReplySender for LogSender {
    async fn send(&self, reply: &Reply, context: &Context) -> anyhow::Result<()> {
        info!(
            target: "channel",
            session = %context.session_id(),
            kind = ?reply.kind,
            "reply: {}",
            reply.content
        );
        Ok(())
    }
}

/// 最近一次收到的图片/文件
#[derive(Debug, Clone)]
pub struct CachedMedia {
    pub kind: ContextType,
    pub path: PathBuf,
    pub msg: Option<ChatMessage>,
}

struct Job {
    context: Context,
    /// 为 None 时通过 ReplySender 发送
    responder: Option<oneshot::Sender<Reply>>,
}

/// 通道公共部分
pub struct ChatChannel {
    bot: Arc<dyn Bot>,
    plugins: PluginContext,
    sender: Arc<dyn ReplySender>,
    pool: Semaphore,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    workers: Mutex<JoinSet<()>>,
    media_cache: Mutex<HashMap<String, CachedMedia>>,
    idle_timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChatChannel {
    pub fn new(bot: Arc<dyn Bot>, plugins: PluginContext, sender: Arc<dyn ReplySender>) -> Self {
        let workers = plugins.config().concurrency.max(1);
        Self {
            bot,
            plugins,
            sender,
            pool: Semaphore::new(workers),
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(JoinSet::new()),
            media_cache: Mutex::new(HashMap::new()),
            idle_timeout: QUEUE_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn plugins(&self) -> &PluginContext {
        &self.plugins
    }

    /// 当前存活的会话队列数
    pub fn active_queues(&self) -> usize {
        lock(&self.queues).len()
    }

    pub fn cached_media(&self, session_id: &str) -> Option<CachedMedia> {
        lock(&self.media_cache).get(session_id).cloned()
    }

    // ===== 1. 构造 Context =====

    /// 构造 Context 并触发 ON_RECEIVE_MESSAGE，插件可以丢弃消息（返回 None）
    pub async fn compose_context(
        &self,
        kind: ContextType,
        content: impl Into<String>,
        session_id: &str,
        msg: ChatMessage,
    ) -> Option<Context> {
        let mut context = Context::new(kind, content)
            .with_session(session_id)
            .with_msg(msg);

        let e = EventContext::new(Event::OnReceiveMessage, context.clone(), None);
        match self.plugins.emit(e).await {
            Ok(e) if e.is_pass() => {
                debug!(target: "channel", session = %session_id, "message dropped by plugin");
                return None;
            }
            Ok(e) => context = e.context,
            Err(err) => error!(target: "channel", "on_receive_message 分发失败: {:#}", err),
        }

        if context.kind == ContextType::Text
            && let Some(prompt) =
                strip_prefix(&context.content, &self.plugins.config().image_create_prefix)
        {
            let prompt = prompt.to_string();
            context.kind = ContextType::ImageCreate;
            context.content = prompt;
        }
        Some(context)
    }

    // ===== 2. 生成回复 =====

    /// 触发 ON_HANDLE_CONTEXT，未被插件拦截时执行默认处理。始终返回有效回复。
    pub async fn generate_reply(&self, context: Context) -> Reply {
        let e = EventContext::new(Event::OnHandleContext, context, None);
        let e = match self.plugins.emit(e).await {
            Ok(e) => e,
            Err(err) => {
                error!(target: "channel", "on_handle_context 分发失败: {:#}", err);
                return Reply::error(FALLBACK_REPLY);
            }
        };
        let is_pass = e.is_pass();
        let (context, reply) = e.into_parts();

        let reply = if is_pass {
            reply
        } else {
            debug!(
                target: "channel",
                kind = %context.kind,
                "handling context: {}",
                context.content
            );
            match context.kind {
                ContextType::Text | ContextType::ImageCreate => Some(self.handle_text(&context).await),
                ContextType::Voice => Some(self.handle_voice(context).await),
                ContextType::Image | ContextType::File => Some(self.handle_media(&context)),
                other => {
                    warn!(target: "channel", "unhandled context type: {}", other);
                    Some(Reply::text("暂不支持此类消息"))
                }
            }
        };

        reply.unwrap_or_else(|| {
            error!(target: "channel", "no reply generated");
            Reply::error(FALLBACK_REPLY)
        })
    }

    async fn handle_text(&self, context: &Context) -> Reply {
        self.bot.reply(&context.content, context).await
    }

    /// 语音转文字后按文本（或画图前缀）交给机器人处理
    async fn handle_voice(&self, context: Context) -> Reply {
        let path = PathBuf::from(&context.content);
        let reply = self.bot.voice_to_text(&path).await;
        if reply.kind != ReplyType::Text {
            return reply;
        }
        info!(target: "channel", "voice recognized: {}", reply.content);

        let mut text = context.clone();
        text.kind = ContextType::Text;
        text.content = reply.content;
        if let Some(prompt) = strip_prefix(&text.content, &self.plugins.config().image_create_prefix)
        {
            let prompt = prompt.to_string();
            text.kind = ContextType::ImageCreate;
            text.content = prompt;
        }
        self.handle_text(&text).await
    }

    /// 缓存最近一次收到的图片/文件，供后续请求使用
    fn handle_media(&self, context: &Context) -> Reply {
        let media = CachedMedia {
            kind: context.kind,
            path: PathBuf::from(&context.content),
            msg: context.msg.clone(),
        };
        lock(&self.media_cache).insert(context.session_id().to_string(), media);
        match context.kind {
            ContextType::Image => Reply::info("图片已收到"),
            _ => Reply::info("文件已收到"),
        }
    }

    // ===== 3. 修饰回复 =====

    pub async fn decorate_reply(&self, context: &Context, reply: Reply) -> Reply {
        let e = EventContext::new(Event::OnDecorateReply, context.clone(), Some(reply.clone()));
        let (is_pass, reply) = match self.plugins.emit(e).await {
            Ok(e) => (e.is_pass(), e.reply.unwrap_or(reply)),
            Err(err) => {
                error!(target: "channel", "on_decorate_reply 分发失败: {:#}", err);
                (false, reply)
            }
        };
        if is_pass {
            return reply;
        }

        let cfg = self.plugins.config();
        match reply.kind {
            ReplyType::Text => {
                let content = if context.is_group() {
                    let nickname = context
                        .msg
                        .as_ref()
                        .and_then(|m| m.actual_user_nickname.as_deref())
                        .unwrap_or_default();
                    format!(
                        "{}@{}\n{}",
                        cfg.group_chat_reply_prefix,
                        nickname,
                        reply.content.trim()
                    )
                } else {
                    format!(
                        "{}{}{}",
                        cfg.single_chat_reply_prefix, reply.content, cfg.single_chat_reply_suffix
                    )
                };
                Reply::text(content)
            }
            ReplyType::Error => Reply::error(format!("[ERROR]\n{}", reply.content)),
            ReplyType::Info => Reply::info(format!("[INFO]\n{}", reply.content)),
            _ => reply,
        }
    }

    // ===== 4. 发送回复 =====

    pub async fn send_reply(&self, context: &Context, reply: Reply) {
        let e = EventContext::new(Event::OnSendReply, context.clone(), Some(reply.clone()));
        let reply = match self.plugins.emit(e).await {
            Ok(e) if e.is_pass() => return,
            Ok(e) => e.reply.unwrap_or(reply),
            Err(err) => {
                error!(target: "channel", "on_send_reply 分发失败: {:#}", err);
                reply
            }
        };
        if let Err(e) = self.sender.send(&reply, context).await {
            error!(target: "channel", session = %context.session_id(), "发送回复失败: {:#}", e);
        }
    }

    // ===== 5. 调度 =====

    /// 异步处理一条消息，回复经 ReplySender 发出
    pub fn handle(self: &Arc<Self>, context: Context) {
        self.enqueue(Job {
            context,
            responder: None,
        });
    }

    /// 同步处理一条消息并返回修饰后的回复（不经过 ReplySender）
    pub async fn produce(self: &Arc<Self>, context: Context) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Job {
            context,
            responder: Some(tx),
        });
        match rx.await {
            Ok(reply) => reply,
            Err(_) => {
                error!(target: "channel", "worker dropped the request");
                Reply::error(FALLBACK_REPLY)
            }
        }
    }

    fn enqueue(self: &Arc<Self>, job: Job) {
        let session_id = job.context.session_id().to_string();
        let mut queues = lock(&self.queues);

        let job = match queues.get(&session_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // 队列的处理任务已退出
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return;
        }
        queues.insert(session_id.clone(), tx);
        drop(queues);

        let this = Arc::clone(self);
        let mut workers = lock(&self.workers);
        while workers.try_join_next().is_some() {}
        workers.spawn(async move { this.drain_session(session_id, rx).await });
    }

    /// 关闭所有会话队列，等待已入队的消息处理完毕
    pub async fn shutdown(&self) {
        lock(&self.queues).clear();
        let mut workers = std::mem::take(&mut *lock(&self.workers));
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(target: "channel", "session worker failed: {}", e);
            }
        }
        debug!(target: "channel", "all session queues drained");
    }

    /// 按顺序处理单个会话的消息，空闲超时后回收队列
    async fn drain_session(self: Arc<Self>, session_id: String, mut rx: mpsc::UnboundedReceiver<Job>) {
        debug!(target: "channel", session = %session_id, "session queue started");
        loop {
            let job = match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    let mut queues = lock(&self.queues);
                    match rx.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            queues.remove(&session_id);
                            break;
                        }
                    }
                }
            };
            self.run(job).await;
        }
        debug!(target: "channel", session = %session_id, "session queue closed");
    }

    async fn run(&self, job: Job) {
        let _permit = self.pool.acquire().await.ok();
        let Job { context, responder } = job;

        let work = async {
            let reply = self.generate_reply(context.clone()).await;
            self.decorate_reply(&context, reply).await
        };
        let reply = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!(target: "channel", session = %context.session_id(), "panic while handling message");
                Reply::error(FALLBACK_REPLY)
            }
        };

        match responder {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    warn!(target: "channel", session = %context.session_id(), "requester went away");
                }
            }
            None => {
                let send = AssertUnwindSafe(self.send_reply(&context, reply));
                if send.catch_unwind().await.is_err() {
                    error!(target: "channel", session = %context.session_id(), "panic while sending reply");
                }
            }
        }
    }
}

/// 根据名称创建通道
pub fn create_channel(
    name: &str,
    bot: Arc<dyn Bot>,
    plugins: PluginContext,
) -> anyhow::Result<Arc<dyn Channel>> {
    match name {
        "terminal" => {
            let core = ChatChannel::new(bot, plugins, Arc::new(terminal::TerminalSender));
            Ok(Arc::new(TerminalChannel::new(Arc::new(core))))
        }
        "web" => {
            let port = plugins.config().port();
            let core = ChatChannel::new(bot, plugins, Arc::new(LogSender));
            Ok(Arc::new(WebChannel::new(Arc::new(core), port)))
        }
        other => anyhow::bail!("不支持的通道类型: {}", other),
    }
}
