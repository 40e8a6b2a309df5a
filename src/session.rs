use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 会话中的一轮消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// 单个会话的历史记录
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub system_prompt: String,
    /// 不含系统提示词，按时间先后排列
    pub messages: Vec<Turn>,
    last_active: Instant,
}

impl Session {
    pub fn new(session_id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            last_active: Instant::now(),
        }
    }

    /// 发往模型的完整消息列表（系统提示词在最前）
    pub fn turns(&self) -> Vec<Turn> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            out.push(Turn::new(Role::System, self.system_prompt.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn add_query(&mut self, query: &str) {
        self.messages.push(Turn::new(Role::User, query));
    }

    pub fn add_reply(&mut self, reply: &str) {
        self.messages.push(Turn::new(Role::Assistant, reply));
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// 按字符数估算 token 数
    pub fn calc_tokens(&self) -> usize {
        self.system_prompt.chars().count()
            + self
                .messages
                .iter()
                .map(|m| m.content.chars().count())
                .sum::<usize>()
    }

    /// 丢弃最早的消息直到不超过上限，最后一条消息始终保留
    pub fn discard_exceeding(&mut self, max_tokens: usize) -> usize {
        let mut cur = self.calc_tokens();
        while cur > max_tokens {
            match self.messages.len() {
                0 => break,
                1 => {
                    if self.messages[0].role == Role::Assistant {
                        self.messages.clear();
                        cur = self.calc_tokens();
                    } else {
                        warn!(
                            session = %self.session_id,
                            tokens = cur,
                            "user message exceeds max tokens"
                        );
                    }
                    break;
                }
                _ => {
                    self.messages.remove(0);
                    cur = self.calc_tokens();
                }
            }
        }
        cur
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        !ttl.is_zero() && now.saturating_duration_since(self.last_active) >= ttl
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// 会话管理器
///
/// 以 session_id 为键保存各会话历史，首次访问时惰性创建，超过 `ttl` 未活跃则重建。
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    system_prompt: String,
    max_tokens: usize,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(system_prompt: impl Into<String>, max_tokens: usize, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            system_prompt: system_prompt.into(),
            max_tokens,
            ttl,
        }
    }

    pub fn from_config(cfg: &crate::config::AppConfig) -> Self {
        Self::new(
            cfg.character_desc.clone(),
            cfg.conversation_max_tokens,
            Duration::from_secs(cfg.expires_in_seconds),
        )
    }

    /// 不使用人设的临时会话，不会被保存
    pub fn detached(&self, session_id: &str, query: &str) -> Session {
        let mut session = Session::new(session_id, "");
        session.add_query(query);
        session
    }

    /// 获取或创建会话；可选地替换系统提示词并清空历史
    pub async fn build_session(&self, session_id: &str, system_prompt: Option<&str>) -> Session {
        let mut sessions = self.sessions.lock().await;
        let session = self.entry(&mut sessions, session_id);
        if let Some(prompt) = system_prompt {
            session.system_prompt = prompt.to_string();
            session.reset();
        }
        session.clone()
    }

    /// 追加用户消息并返回本次请求使用的会话快照
    pub async fn session_query(&self, query: &str, session_id: &str) -> Session {
        let mut sessions = self.sessions.lock().await;
        let max_tokens = self.max_tokens;
        let session = self.entry(&mut sessions, session_id);
        session.add_query(query);
        session.touch();
        let tokens = session.discard_exceeding(max_tokens);
        debug!(session = %session_id, tokens, "prompt tokens used");
        session.clone()
    }

    /// 追加模型回复
    pub async fn session_reply(&self, reply: &str, session_id: &str, total_tokens: u32) {
        let mut sessions = self.sessions.lock().await;
        let max_tokens = self.max_tokens;
        let session = self.entry(&mut sessions, session_id);
        session.add_reply(reply);
        session.touch();
        let tokens = session.discard_exceeding(max_tokens);
        debug!(
            session = %session_id,
            total_tokens,
            tokens,
            "reply stored"
        );
    }

    pub async fn clear_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    pub async fn clear_all_session(&self) {
        self.sessions.lock().await.clear();
    }

    /// 当前会话历史（不存在时为空）
    pub async fn history(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    fn entry<'a>(&self, sessions: &'a mut HashMap<String, Session>, session_id: &str) -> &'a mut Session {
        let now = Instant::now();
        let expired = sessions
            .get(session_id)
            .is_some_and(|s| s.is_expired(now, self.ttl));
        if expired {
            debug!(session = %session_id, "session expired, rebuilding");
            sessions.remove(session_id);
        }
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, self.system_prompt.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_oldest_turns_first() {
        let mut s = Session::new("s", "sys");
        s.add_query("aaaa");
        s.add_reply("bbbb");
        s.add_query("cc");

        // 3 + 4 + 4 + 2 = 13
        assert_eq!(s.calc_tokens(), 13);
        let left = s.discard_exceeding(6);
        assert_eq!(left, 5);
        assert_eq!(s.messages, vec![Turn::new(Role::User, "cc")]);
    }

    #[test]
    fn keeps_oversized_latest_query() {
        let mut s = Session::new("s", "");
        s.add_query("this query is longer than the limit");
        s.discard_exceeding(3);
        assert_eq!(s.messages.len(), 1);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let s = Session::new("s", "");
        let later = Instant::now() + Duration::from_secs(10_000);
        assert!(!s.is_expired(later, Duration::ZERO));
        assert!(s.is_expired(later, Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn query_then_reply_builds_history() {
        let mgr = SessionManager::new("你是助手", 1000, Duration::from_secs(3600));
        let snapshot = mgr.session_query("你好", "u1").await;
        assert_eq!(snapshot.turns()[0].role, Role::System);
        assert_eq!(snapshot.turns().len(), 2);

        mgr.session_reply("你好呀", "u1", 12).await;
        let history = mgr.history("u1").await;
        assert_eq!(
            history,
            vec![Turn::new(Role::User, "你好"), Turn::new(Role::Assistant, "你好呀")]
        );

        // 其它会话互不影响
        assert!(mgr.history("u2").await.is_empty());

        mgr.clear_session("u1").await;
        assert!(mgr.history("u1").await.is_empty());
    }

    #[tokio::test]
    async fn build_session_replaces_prompt() {
        let mgr = SessionManager::new("默认", 1000, Duration::ZERO);
        mgr.session_query("hi", "u1").await;
        let s = mgr.build_session("u1", Some("新人设")).await;
        assert_eq!(s.system_prompt, "新人设");
        assert!(s.messages.is_empty());
    }
}
