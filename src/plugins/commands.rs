use crate::command::parse_command;
use crate::config::build_config;
use crate::context::{ContextType, Reply};
use crate::event::{Event, EventAction, EventContext};
use crate::plugins::{Plugin, PluginContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::info;

const NAME: &str = "commands";

#[derive(Serialize, Deserialize)]
struct Config {
    enabled: bool,
    /// 指令引导符
    leader: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            leader: "#".to_string(),
        }
    }
}

/// 内置指令：#help、#reset、#reset_all
#[derive(Default)]
pub struct Commands;

#[async_trait]
impl Plugin for Commands {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "内置指令"
    }

    fn priority(&self) -> i32 {
        999
    }

    fn events(&self) -> &'static [Event] {
        &[Event::OnHandleContext]
    }

    fn default_config(&self) -> Option<Value> {
        Some(build_config(Config::default()))
    }

    fn help_text(&self) -> String {
        "#help 查看帮助\n#reset 清空当前会话\n#reset_all 清空所有会话（管理员）\n".to_string()
    }

    async fn on_event(&self, ctx: &PluginContext, e: &mut EventContext) -> anyhow::Result<()> {
        if e.context.kind != ContextType::Text {
            return Ok(());
        }
        let cfg: Config = ctx.plugin_config(NAME).unwrap_or_default();
        let Some(cmd) = parse_command(&e.context.content, &cfg.leader) else {
            return Ok(());
        };

        let reply = match cmd.name {
            "help" => Reply::info(ctx.plugins().help_text()),
            "reset" => {
                let session_id = e.context.session_id().to_string();
                ctx.sessions().clear_session(&session_id).await;
                info!(target: "commands", session = %session_id, "session reset");
                Reply::info("记忆已清除")
            }
            "reset_all" => {
                let user = e
                    .context
                    .msg
                    .as_ref()
                    .map(|m| m.actual_user_id.as_str())
                    .unwrap_or_default();
                if !ctx.config().admin_users.is_empty() && !ctx.is_admin(user) {
                    Reply::error("需要管理员权限")
                } else {
                    ctx.sessions().clear_all_session().await;
                    info!(target: "commands", "all sessions reset");
                    Reply::info("所有人记忆已清除")
                }
            }
            _ => return Ok(()),
        };

        e.set_reply(reply);
        e.set_action(EventAction::BreakPass);
        Ok(())
    }
}
