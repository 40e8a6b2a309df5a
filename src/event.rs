use crate::context::{Context, Reply};
use std::fmt;

/// 插件可订阅的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// 收到消息、构造 Context 之后
    OnReceiveMessage,
    /// 处理 Context 之前（插件可直接给出回复或改写 Context）
    OnHandleContext,
    /// 回复生成之后、修饰之前
    OnDecorateReply,
    /// 发送回复之前
    OnSendReply,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OnReceiveMessage => "on_receive_message",
            Self::OnHandleContext => "on_handle_context",
            Self::OnDecorateReply => "on_decorate_reply",
            Self::OnSendReply => "on_send_reply",
        };
        f.write_str(s)
    }
}

/// 插件处理后的分发动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventAction {
    /// 继续传递给后续插件
    #[default]
    Continue,
    /// 停止传递，但仍执行默认处理
    Break,
    /// 停止传递，并跳过默认处理
    BreakPass,
}

/// 在插件链中传递的可变上下文
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event: Event,
    pub context: Context,
    /// 尚未生成回复时为 None
    pub reply: Option<Reply>,
    action: EventAction,
    is_pass: bool,
}

impl EventContext {
    pub fn new(event: Event, context: Context, reply: Option<Reply>) -> Self {
        Self {
            event,
            context,
            reply,
            action: EventAction::Continue,
            is_pass: false,
        }
    }

    pub fn action(&self) -> EventAction {
        self.action
    }

    pub fn set_action(&mut self, action: EventAction) {
        self.action = action;
    }

    /// 是否跳过默认处理
    pub fn is_pass(&self) -> bool {
        self.is_pass
    }

    pub fn set_pass(&mut self, is_pass: bool) {
        self.is_pass = is_pass;
    }

    pub fn is_break(&self) -> bool {
        matches!(self.action, EventAction::Break | EventAction::BreakPass)
    }

    /// 设置回复
    pub fn set_reply(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    pub fn into_parts(self) -> (Context, Option<Reply>) {
        (self.context, self.reply)
    }
}
