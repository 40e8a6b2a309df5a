//! 插件系统
//!
//! 插件在启动时注册，按优先级从高到低排列（同优先级保持注册顺序），之后列表只读。
//! 每次分发时依次调用订阅了该事件的插件，由插件设置的 [`EventAction`] 决定是否继续：
//!
//! - `Continue`：交给下一个插件
//! - `Break`：停止分发，调用方仍执行默认处理
//! - `BreakPass`：停止分发，并跳过默认处理（`is_pass()` 为 true）

use crate::config::AppConfig;
use crate::event::{Event, EventAction, EventContext};
use crate::session::SessionManager;
use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use toml::Value;
use tracing::{debug, error, info};

pub mod commands;
pub mod hello;

pub use commands::Commands;
pub use hello::Hello;

/// 业务逻辑插件接口
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 插件名称，同时也是配置表的键
    fn name(&self) -> &str;

    /// 插件描述
    fn description(&self) -> &str {
        ""
    }

    /// 插件版本
    fn version(&self) -> &str {
        "0.1.0"
    }

    /// 插件优先级（数字越大越先执行）
    fn priority(&self) -> i32 {
        0
    }

    /// 隐藏插件不出现在帮助列表中
    fn hidden(&self) -> bool {
        false
    }

    /// 订阅的事件
    fn events(&self) -> &'static [Event];

    /// 默认配置，启动时写入配置文件
    fn default_config(&self) -> Option<Value> {
        None
    }

    fn help_text(&self) -> String {
        String::new()
    }

    /// 插件加载时调用
    async fn on_load(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// 处理事件，通过 `e.set_action()` 控制后续分发
    async fn on_event(&self, ctx: &PluginContext, e: &mut EventContext) -> anyhow::Result<()>;
}

/// 插件容器，包含插件实例和启用状态
struct PluginSlot {
    plugin: Arc<dyn Plugin>,
    enabled: AtomicBool,
}

/// 插件管理器
pub struct PluginManager {
    slots: Vec<PluginSlot>,
}

impl PluginManager {
    /// 按优先级降序排列（稳定排序，同优先级保持注册顺序）
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut plugins = plugins;
        plugins.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        let slots = plugins
            .into_iter()
            .map(|plugin| PluginSlot {
                plugin,
                enabled: AtomicBool::new(true),
            })
            .collect();
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 按分发顺序返回插件名称
    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.plugin.name()).collect()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.slot(name)
            .is_some_and(|s| s.enabled.load(Ordering::SeqCst))
    }

    /// 启用插件，插件不存在时返回 false
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// 禁用插件，插件不存在时返回 false
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.slot(name) {
            Some(slot) => {
                slot.enabled.store(enabled, Ordering::SeqCst);
                info!(target: "plugin", plugin = name, enabled, "plugin state changed");
                true
            }
            None => false,
        }
    }

    fn slot(&self, name: &str) -> Option<&PluginSlot> {
        self.slots.iter().find(|s| s.plugin.name() == name)
    }

    /// 各插件的默认配置
    pub fn default_configs(&self) -> Vec<(&str, Value)> {
        self.slots
            .iter()
            .filter_map(|s| Some((s.plugin.name(), s.plugin.default_config()?)))
            .collect()
    }

    /// 根据配置表中的 `enabled` 字段设置启用状态
    pub fn apply_config(&self, cfg: &AppConfig) {
        for slot in &self.slots {
            let enabled = cfg
                .plugins
                .get(slot.plugin.name())
                .and_then(|v| v.get("enabled"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            slot.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    /// 依次调用 on_load，失败的插件会被禁用
    pub async fn load_all(&self, ctx: &PluginContext) {
        for slot in &self.slots {
            if !slot.enabled.load(Ordering::SeqCst) {
                continue;
            }
            let plugin = &slot.plugin;
            match plugin.on_load(ctx).await {
                Ok(()) => info!(target: "plugin", "{} v{} 已加载", plugin.name(), plugin.version()),
                Err(e) => {
                    error!(target: "plugin", "插件 {} 初始化失败: {:#}", plugin.name(), e);
                    slot.enabled.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// 分发事件
    ///
    /// 插件返回错误时立即中止分发并把错误交给调用方。
    pub async fn emit_event(
        &self,
        ctx: &PluginContext,
        mut e: EventContext,
    ) -> anyhow::Result<EventContext> {
        for slot in &self.slots {
            if !slot.enabled.load(Ordering::SeqCst) || !slot.plugin.events().contains(&e.event) {
                continue;
            }
            let name = slot.plugin.name();
            debug!(target: "plugin", plugin = name, event = %e.event, "dispatch");

            slot.plugin
                .on_event(ctx, &mut e)
                .await
                .with_context(|| format!("插件 {} 处理 {} 失败", name, e.event))?;

            match e.action() {
                EventAction::Continue => {}
                EventAction::Break => {
                    debug!(target: "plugin", plugin = name, event = %e.event, "break");
                    break;
                }
                EventAction::BreakPass => {
                    debug!(target: "plugin", plugin = name, event = %e.event, "break pass");
                    e.set_pass(true);
                    break;
                }
            }
        }
        Ok(e)
    }

    /// 所有非隐藏插件的帮助信息
    pub fn help_text(&self) -> String {
        let mut out = String::from("⭐ 插件列表：\n");
        for slot in &self.slots {
            let plugin = &slot.plugin;
            if plugin.hidden() || !slot.enabled.load(Ordering::SeqCst) {
                continue;
            }
            out.push_str(&format!("\n{} v{}", plugin.name(), plugin.version()));
            if !plugin.description().is_empty() {
                out.push_str(&format!(": {}", plugin.description()));
            }
            out.push('\n');
            let help = plugin.help_text();
            if !help.is_empty() {
                out.push_str(help.trim_end());
                out.push('\n');
            }
        }
        out
    }
}

/// 插件上下文
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<PluginContextInner>,
}

struct PluginContextInner {
    config: Arc<AppConfig>,
    sessions: Arc<SessionManager>,
    plugins: Arc<PluginManager>,
}

impl PluginContext {
    pub fn new(config: Arc<AppConfig>, sessions: Arc<SessionManager>, plugins: Arc<PluginManager>) -> Self {
        Self {
            inner: Arc::new(PluginContextInner {
                config,
                sessions,
                plugins,
            }),
        }
    }

    /// 获取配置
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// 获取指定插件的配置
    pub fn plugin_config<T: DeserializeOwned>(&self, plugin: &str) -> Option<T> {
        self.inner.config.get_plugin_config(plugin)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.inner.plugins
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.inner.config.is_admin(user_id)
    }

    /// 分发事件
    pub async fn emit(&self, e: EventContext) -> anyhow::Result<EventContext> {
        self.inner.plugins.emit_event(self, e).await
    }
}
