use super::{Channel, ChatChannel, FALLBACK_REPLY};
use crate::context::{ChatMessage, ContextType};
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_SESSION: &str = "web_user_001";
const NICKNAME: &str = "Web用户";
const CHAT_PAGE: &str = include_str!("../../static/chat.html");

#[derive(Deserialize)]
struct ChatBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: String,
}

/// Web 通道：`POST /chat` 提交消息，`GET /`、`GET /chatui` 返回聊天页面
pub struct WebChannel {
    core: Arc<ChatChannel>,
    port: u16,
}

impl WebChannel {
    pub fn new(core: Arc<ChatChannel>, port: u16) -> Self {
        Self { core, port }
    }

    pub fn router(core: Arc<ChatChannel>) -> Router {
        Router::new()
            .route("/", get(chat_page))
            .route("/chatui", get(chat_page))
            .route("/chat", post(chat_handler))
            .with_state(core)
    }
}

#[async_trait]
impl Channel for WebChannel {
    fn name(&self) -> &str {
        "web"
    }

    async fn startup(&self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(target: "web", "web 服务已启动: http://{local_addr}");
        axum::serve(listener, Self::router(self.core.clone())).await?;
        Ok(())
    }
}

async fn chat_page() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

async fn chat_handler(
    State(core): State<Arc<ChatChannel>>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> impl IntoResponse {
    let body = match body {
        Ok(Json(body)) => body,
        Err(e) => {
            warn!(target: "web", "invalid request body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ChatResponse {
                    reply: "请求格式错误".to_string(),
                }),
            );
        }
    };

    let session_id = body
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());
    let mut msg = ChatMessage::new(&session_id, NICKNAME, &body.message);
    msg.msg_id = format!("web-{}", chrono::Local::now().timestamp_millis());

    let Some(context) = core
        .compose_context(ContextType::Text, body.message, &session_id, msg)
        .await
    else {
        return (
            StatusCode::OK,
            Json(ChatResponse {
                reply: String::new(),
            }),
        );
    };

    let reply = core.produce(context).await;
    if reply.content.is_empty() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ChatResponse {
                reply: FALLBACK_REPLY.to_string(),
            }),
        );
    }
    (StatusCode::OK, Json(ChatResponse { reply: reply.content }))
}
