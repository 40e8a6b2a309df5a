use super::{Channel, ChatChannel, ReplySender};
use crate::context::{ChatMessage, Context, ContextType, Reply, ReplyType};
use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const SESSION_ID: &str = "terminal_user";
const NICKNAME: &str = "User";

/// 打印到标准输出
pub struct TerminalSender;

#[async_trait]
impl ReplySender for TerminalSender {
    async fn send(&self, reply: &Reply, _context: &Context) -> anyhow::Result<()> {
        let label = match reply.kind {
            ReplyType::Error => "Bot (error)",
            ReplyType::ImageUrl | ReplyType::Image => "Bot (image)",
            _ => "Bot",
        };
        let mut out = std::io::stdout().lock();
        writeln!(out, "\n{}:\n{}", label, reply.content)?;
        write!(out, "\n{}: ", NICKNAME)?;
        out.flush()?;
        Ok(())
    }
}

/// 终端通道：每行输入作为一条文本消息
pub struct TerminalChannel {
    core: Arc<ChatChannel>,
}

impl TerminalChannel {
    pub fn new(core: Arc<ChatChannel>) -> Self {
        Self { core }
    }

    async fn dispatch_line(&self, line: &str) {
        let msg = ChatMessage::new(SESSION_ID, NICKNAME, line);
        if let Some(context) = self
            .core
            .compose_context(ContextType::Text, line, SESSION_ID, msg)
            .await
        {
            self.core.handle(context);
        }
    }
}

#[async_trait]
impl Channel for TerminalChannel {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn startup(&self) -> anyhow::Result<()> {
        info!(target: "terminal", "终端通道已启动，输入 /exit 退出");
        print!("\n{}: ", NICKNAME);
        std::io::stdout().flush()?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    let content = text.trim();
                    if content.is_empty() {
                        continue;
                    }
                    if content == "/exit" {
                        break;
                    }
                    self.dispatch_line(content).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "terminal", "读取输入错误: {}", e);
                    break;
                }
            }
        }
        // 等待已提交的消息处理完毕再退出
        self.core.shutdown().await;
        info!(target: "terminal", "终端通道已退出");
        Ok(())
    }
}
