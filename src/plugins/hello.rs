use crate::config::build_config;
use crate::context::{ContextType, Reply};
use crate::event::{Event, EventAction, EventContext};
use crate::plugins::{Plugin, PluginContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use toml::Value;
use tracing::debug;

const NAME: &str = "hello";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    /// 群名称 -> 固定欢迎语
    #[serde(default)]
    group_welc_fixed_msg: HashMap<String, String>,
    #[serde(default = "default_welc_prompt")]
    group_welc_prompt: String,
    #[serde(default = "default_exit_prompt")]
    group_exit_prompt: String,
    #[serde(default = "default_patpat_prompt")]
    patpat_prompt: String,
    /// 改写后的请求是否仍带人设
    #[serde(default)]
    use_character_desc: bool,
}

fn default_true() -> bool {
    true
}

fn default_welc_prompt() -> String {
    "请你随机使用一种风格说一句问候语来欢迎新用户\"{nickname}\"加入群聊。".to_string()
}

fn default_exit_prompt() -> String {
    "请你随机使用一种风格介绍你自己，并告诉用户输入#help可以查看帮助信息。".to_string()
}

fn default_patpat_prompt() -> String {
    "请你随机使用一种风格跟其他群用户说他违反规则\"{nickname}\"退出群聊。".to_string()
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group_welc_fixed_msg: HashMap::new(),
            group_welc_prompt: default_welc_prompt(),
            group_exit_prompt: default_exit_prompt(),
            patpat_prompt: default_patpat_prompt(),
            use_character_desc: false,
        }
    }
}

/// 示例插件：打招呼、入群欢迎、拍一拍
#[derive(Default)]
pub struct Hello;

#[async_trait]
impl Plugin for Hello {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "A simple plugin that says hello"
    }

    fn priority(&self) -> i32 {
        -1
    }

    fn hidden(&self) -> bool {
        true
    }

    fn events(&self) -> &'static [Event] {
        &[Event::OnHandleContext]
    }

    fn default_config(&self) -> Option<Value> {
        Some(build_config(HelloConfig::default()))
    }

    fn help_text(&self) -> String {
        "输入Hello，我会回复你的名字\n输入End，我会回复你世界的图片\n".to_string()
    }

    async fn on_event(&self, ctx: &PluginContext, e: &mut EventContext) -> anyhow::Result<()> {
        if !matches!(
            e.context.kind,
            ContextType::Text | ContextType::JoinGroup | ContextType::Patpat | ContextType::ExitGroup
        ) {
            return Ok(());
        }

        let cfg: HelloConfig = ctx.plugin_config(NAME).unwrap_or_default();
        let use_character_desc = cfg.use_character_desc || ctx.config().use_character_desc;

        let msg = e.context.msg.clone().unwrap_or_default();
        let group_name = msg
            .from_user_nickname
            .clone()
            .unwrap_or_else(|| "未知群组".to_string());

        match e.context.kind {
            ContextType::JoinGroup => {
                let fixed = cfg
                    .group_welc_fixed_msg
                    .get(&group_name)
                    .cloned()
                    .or_else(|| ctx.config().group_welcome_msg.clone());
                if let Some(welcome) = fixed {
                    e.set_reply(Reply::text(welcome));
                    e.set_action(EventAction::BreakPass);
                    return Ok(());
                }
                let nickname = msg.actual_user_nickname.as_deref().unwrap_or("新用户");
                rewrite_as_text(e, cfg.group_welc_prompt.replace("{nickname}", nickname));
                if !use_character_desc {
                    e.context.set("generate_breaked_by", "BREAK");
                }
                return Ok(());
            }
            ContextType::ExitGroup => {
                if ctx.config().group_chat_exit_group {
                    let nickname = msg.actual_user_nickname.as_deref().unwrap_or("离开用户");
                    rewrite_as_text(e, cfg.group_exit_prompt.replace("{nickname}", nickname));
                }
                return Ok(());
            }
            ContextType::Patpat => {
                let nickname = msg.actual_user_nickname.as_deref().unwrap_or("用户");
                rewrite_as_text(e, cfg.patpat_prompt.replace("{nickname}", nickname));
                if !use_character_desc {
                    e.context.set("generate_breaked_by", "BREAK");
                }
                return Ok(());
            }
            _ => {}
        }

        debug!(target: "hello", content = %e.context.content, "on_handle_context");
        match e.context.content.as_str() {
            "Hello" => {
                let content = if e.context.is_group() {
                    let user = msg.actual_user_nickname.as_deref().unwrap_or("用户");
                    format!("Hello, {user} from {group_name}")
                } else {
                    format!("Hello, {group_name}")
                };
                e.set_reply(Reply::text(content));
                e.set_action(EventAction::BreakPass);
            }
            "Hi" => {
                e.set_reply(Reply::text("Hi"));
                e.set_action(EventAction::Break);
            }
            "End" => {
                e.context.kind = ContextType::ImageCreate;
                e.context.content = "The World".to_string();
                e.set_action(EventAction::Continue);
            }
            _ => {}
        }
        Ok(())
    }
}

fn rewrite_as_text(e: &mut EventContext, prompt: String) {
    e.context.kind = ContextType::Text;
    e.context.content = prompt;
    e.set_action(EventAction::Break);
}
