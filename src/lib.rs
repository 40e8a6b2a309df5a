// ================================================================================
// chatbridge
//
// 把 Web / 终端等前端接入 OpenAI 兼容的大模型接口，
// 并通过按优先级排序的插件链拦截、改写消息处理流程。
// ================================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod bot;
pub mod channel;
pub mod command;
pub mod config;
pub mod context;
pub mod event;
pub mod log;
pub mod plugins;
pub mod session;
pub mod token_bucket;

use bot::{Bot, ChatApi, HttpChatApi, OpenAiBot};
use channel::{Channel, create_channel};
use config::{AppConfig, ConfigManager};
use plugins::{Commands, Hello, Plugin, PluginContext, PluginManager};
use session::SessionManager;

// ============================================================================
// 1. Prelude
// ============================================================================

pub mod prelude {
    pub use crate::bot::{Bot, ChatApi, LlmError, OpenAiBot};
    pub use crate::channel::{Channel, ChatChannel, ReplySender};
    pub use crate::config::{AppConfig, ConfigManager, build_config};
    pub use crate::context::{ChatMessage, Context, ContextType, Reply, ReplyType};
    pub use crate::event::{Event, EventAction, EventContext};
    pub use crate::plugins::{Plugin, PluginContext, PluginManager};
    pub use crate::session::SessionManager;
    pub use crate::{ChatBridge, ChatBridgeBuilder};
    pub use async_trait::async_trait;
}

// ============================================================================
// 2. Builder
// ============================================================================

/// 应用构建器
pub struct ChatBridgeBuilder {
    config_path: Option<PathBuf>,
    config: Option<AppConfig>,
    plugins: Vec<Arc<dyn Plugin>>,
    api: Option<Arc<dyn ChatApi>>,
}

impl ChatBridgeBuilder {
    pub fn new() -> Self {
        Self {
            config_path: None,
            config: None,
            plugins: Vec::new(),
            api: None,
        }
    }

    /// 设置配置文件路径（补全的插件配置会写回该文件）
    pub fn config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// 直接使用已加载的配置
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 注册插件
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// 注册内置插件
    pub fn with_default_plugins(self) -> Self {
        self.plugin(Commands).plugin(Hello)
    }

    /// 替换大模型接口（默认根据配置创建 HTTP 客户端）
    pub fn chat_api(mut self, api: Arc<dyn ChatApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn build(self) -> anyhow::Result<ChatBridge> {
        let manager = PluginManager::new(self.plugins);

        let mut cfg = match (self.config, &self.config_path) {
            (Some(cfg), _) => cfg,
            (None, Some(path)) => ConfigManager::new(path).load()?,
            (None, None) => AppConfig::default(),
        };

        // 补全插件默认配置
        match &self.config_path {
            Some(path) => {
                if ConfigManager::new(path).merge_plugin_defaults(&mut cfg, manager.default_configs())? {
                    info!("配置文件已补全插件默认配置: {}", path.display());
                }
            }
            None => {
                for (name, value) in manager.default_configs() {
                    cfg.plugins.entry(name.to_string()).or_insert(value);
                }
            }
        }
        manager.apply_config(&cfg);

        let cfg = Arc::new(cfg);
        let sessions = Arc::new(SessionManager::from_config(&cfg));
        let api = match self.api {
            Some(api) => api,
            None => Arc::new(HttpChatApi::from_config(&cfg)?),
        };
        let bot: Arc<dyn Bot> = Arc::new(OpenAiBot::new(&cfg, api, sessions.clone()));
        let plugins = PluginContext::new(cfg.clone(), sessions, Arc::new(manager));

        Ok(ChatBridge {
            config: cfg,
            plugins,
            bot,
        })
    }
}

impl Default for ChatBridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 3. App
// ============================================================================

/// 应用核心
pub struct ChatBridge {
    config: Arc<AppConfig>,
    plugins: PluginContext,
    bot: Arc<dyn Bot>,
}

impl ChatBridge {
    pub fn builder() -> ChatBridgeBuilder {
        ChatBridgeBuilder::new()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn plugin_context(&self) -> &PluginContext {
        &self.plugins
    }

    pub fn bot(&self) -> Arc<dyn Bot> {
        self.bot.clone()
    }

    /// 加载插件（on_load）
    pub async fn load_plugins(&self) {
        info!("正在初始化插件...");
        self.plugins.plugins().load_all(&self.plugins).await;
    }

    /// 创建指定通道
    pub fn channel(&self, name: &str) -> anyhow::Result<Arc<dyn Channel>> {
        create_channel(name, self.bot.clone(), self.plugins.clone())
    }

    /// 启动应用
    ///
    /// 通道创建或启动失败只记录日志，进程继续运行直到收到 Ctrl-C。
    /// 通道正常退出（如终端输入 /exit）时返回。
    pub async fn run(&self, channel_name: &str) -> anyhow::Result<()> {
        info!("chatbridge v{} 启动中", env!("CARGO_PKG_VERSION"));
        self.load_plugins().await;

        let channel = match self.channel(channel_name) {
            Ok(channel) => channel,
            Err(e) => {
                error!("通道 {} 创建失败: {:#}", channel_name, e);
                return wait_for_shutdown().await;
            }
        };

        info!("正在启动通道: {}", channel.name());
        tokio::select! {
            res = channel.startup() => match res {
                Ok(()) => {
                    info!("通道 {} 已退出", channel.name());
                    Ok(())
                }
                Err(e) => {
                    error!("通道 {} 启动失败: {:#}", channel.name(), e);
                    wait_for_shutdown().await
                }
            },
            res = tokio::signal::ctrl_c() => {
                res?;
                warn!("收到退出信号");
                Ok(())
            }
        }
    }
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    warn!("收到退出信号");
    Ok(())
}
