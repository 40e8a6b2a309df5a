use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// 入站：Context
// ============================================================================

/// 入站消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextType {
    /// 文本消息
    Text,
    /// 语音消息，content 为文件路径
    Voice,
    /// 图片消息，content 为文件路径
    Image,
    /// 文件消息，content 为文件路径
    File,
    /// 画图请求
    ImageCreate,
    /// 有人加入群聊
    JoinGroup,
    /// 有人退出群聊
    ExitGroup,
    /// 拍一拍
    Patpat,
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "TEXT",
            Self::Voice => "VOICE",
            Self::Image => "IMAGE",
            Self::File => "FILE",
            Self::ImageCreate => "IMAGE_CREATE",
            Self::JoinGroup => "JOIN_GROUP",
            Self::ExitGroup => "EXIT_GROUP",
            Self::Patpat => "PATPAT",
        };
        f.write_str(s)
    }
}

/// 规范化后的发送方信息
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    pub msg_id: String,
    pub content: String,
    pub from_user_id: String,
    /// 私聊时为对方昵称，群聊时为群名称
    pub from_user_nickname: Option<String>,
    /// 群聊中实际发言人
    pub actual_user_id: String,
    pub actual_user_nickname: Option<String>,
    pub is_group: bool,
    pub create_time: i64,
}

impl ChatMessage {
    pub fn new(user_id: impl Into<String>, nickname: impl Into<String>, content: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let nickname = nickname.into();
        Self {
            msg_id: String::new(),
            content: content.into(),
            from_user_id: user_id.clone(),
            from_user_nickname: Some(nickname.clone()),
            actual_user_id: user_id,
            actual_user_nickname: Some(nickname),
            is_group: false,
            create_time: chrono::Local::now().timestamp(),
        }
    }
}

/// 一次入站请求
///
/// `kwargs` 是开放的附加字段（session_id、receiver、isgroup 等），插件可以随意读写。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    #[serde(rename = "type")]
    pub kind: ContextType,
    pub content: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<ChatMessage>,
}

impl Context {
    pub fn new(kind: ContextType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            kwargs: Map::new(),
            msg: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.set("session_id", session_id.into());
        self
    }

    pub fn with_msg(mut self, msg: ChatMessage) -> Self {
        self.set("isgroup", msg.is_group);
        self.set("receiver", msg.from_user_id.clone());
        self.msg = Some(msg);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.kwargs.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.kwargs.contains_key(key)
    }

    pub fn session_id(&self) -> &str {
        self.get_str("session_id").unwrap_or_default()
    }

    pub fn receiver(&self) -> Option<&str> {
        self.get_str("receiver")
    }

    pub fn is_group(&self) -> bool {
        self.get("isgroup").and_then(Value::as_bool).unwrap_or(false)
    }
}

// ============================================================================
// 出站：Reply
// ============================================================================

/// 回复类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyType {
    Text,
    Voice,
    Image,
    ImageUrl,
    Info,
    Error,
}

/// 一次出站回复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "type")]
    pub kind: ReplyType,
    pub content: String,
}

impl Reply {
    pub fn new(kind: ReplyType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(ReplyType::Text, content)
    }

    pub fn info(content: impl Into<String>) -> Self {
        Self::new(ReplyType::Info, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(ReplyType::Error, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kwargs_accessors() {
        let msg = ChatMessage::new("u1", "Alice", "hi");
        let mut ctx = Context::new(ContextType::Text, "hi")
            .with_session("s1")
            .with_msg(msg);
        ctx.set("generate_breaked_by", "break");

        assert_eq!(ctx.session_id(), "s1");
        assert_eq!(ctx.receiver(), Some("u1"));
        assert!(!ctx.is_group());
        assert!(ctx.contains("generate_breaked_by"));
        assert_eq!(ctx.get_str("missing"), None);
    }

    #[test]
    fn context_type_wire_names() {
        let json = serde_json::to_string(&ContextType::ImageCreate).unwrap();
        assert_eq!(json, "\"IMAGE_CREATE\"");
        assert_eq!(ContextType::JoinGroup.to_string(), "JOIN_GROUP");
    }
}
