use anyhow::Context;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::Value;

/// 应用配置
///
/// 启动时加载一次，之后各组件只读。插件配置以独立表的形式存放（如 `[hello]`），
/// 通过 `flatten` 收集到 `plugins` 中。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 默认启动的通道 (terminal / web)
    #[serde(default = "default_channel_type")]
    pub channel_type: String,

    // ---------------- 模型参数 ----------------
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,

    // ---------------- 接口与网络 ----------------
    #[serde(default = "default_api_base")]
    pub open_ai_api_base: String,
    /// 环境变量 OPENAI_API_KEY 优先
    #[serde(default)]
    pub open_ai_api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    // ---------------- 限流与重试 ----------------
    /// 每分钟允许的对话请求数，0 表示不限流
    #[serde(default = "default_rate_limit_chatgpt")]
    pub rate_limit_chatgpt: u32,
    /// 每分钟允许的画图请求数，0 表示不限流
    #[serde(default = "default_rate_limit_dalle")]
    pub rate_limit_dalle: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub rate_limit_retry_delay_secs: u64,

    // ---------------- 会话 ----------------
    #[serde(default = "default_character_desc")]
    pub character_desc: String,
    #[serde(default = "default_max_tokens")]
    pub conversation_max_tokens: usize,
    #[serde(default = "default_expires_in")]
    pub expires_in_seconds: u64,

    // ---------------- 画图 ----------------
    #[serde(default = "default_text_to_image")]
    pub text_to_image: String,
    #[serde(default = "default_image_size")]
    pub image_create_size: String,
    #[serde(default = "default_image_prefix")]
    pub image_create_prefix: Vec<String>,

    // ---------------- 群聊与回复修饰 ----------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_welcome_msg: Option<String>,
    #[serde(default)]
    pub group_chat_exit_group: bool,
    #[serde(default)]
    pub use_character_desc: bool,
    #[serde(default)]
    pub single_chat_reply_prefix: String,
    #[serde(default)]
    pub single_chat_reply_suffix: String,
    #[serde(default)]
    pub group_chat_reply_prefix: String,

    // ---------------- 运行时 ----------------
    /// 工作池大小
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Web 通道端口，环境变量 PORT 优先
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default)]
    pub debug: bool,

    /// 插件配置
    #[serde(flatten)]
    pub plugins: HashMap<String, Value>,
}

fn default_channel_type() -> String {
    "terminal".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.9
}

fn default_top_p() -> f32 {
    1.0
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_rate_limit_chatgpt() -> u32 {
    20
}

fn default_rate_limit_dalle() -> u32 {
    50
}

fn default_retry_delay() -> u64 {
    5
}

fn default_character_desc() -> String {
    "你是一个乐于助人的私人助理。".to_string()
}

fn default_max_tokens() -> usize {
    1000
}

fn default_expires_in() -> u64 {
    3600
}

fn default_text_to_image() -> String {
    "dall-e-2".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_image_prefix() -> Vec<String> {
    vec!["画".to_string(), "draw".to_string()]
}

fn default_concurrency() -> usize {
    8
}

fn default_web_port() -> u16 {
    10000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel_type: default_channel_type(),
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            request_timeout: default_request_timeout(),
            open_ai_api_base: default_api_base(),
            open_ai_api_key: String::new(),
            proxy: None,
            rate_limit_chatgpt: default_rate_limit_chatgpt(),
            rate_limit_dalle: default_rate_limit_dalle(),
            retry_delay_secs: default_retry_delay(),
            rate_limit_retry_delay_secs: default_retry_delay(),
            character_desc: default_character_desc(),
            conversation_max_tokens: default_max_tokens(),
            expires_in_seconds: default_expires_in(),
            text_to_image: default_text_to_image(),
            image_create_size: default_image_size(),
            image_create_prefix: default_image_prefix(),
            group_welcome_msg: None,
            group_chat_exit_group: false,
            use_character_desc: false,
            single_chat_reply_prefix: String::new(),
            single_chat_reply_suffix: String::new(),
            group_chat_reply_prefix: String::new(),
            concurrency: default_concurrency(),
            web_port: default_web_port(),
            admin_users: Vec::new(),
            debug: false,
            plugins: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// 获取指定插件的配置
    pub fn get_plugin_config<T: DeserializeOwned>(&self, plugin: &str) -> Option<T> {
        self.plugins
            .get(plugin)
            .and_then(|v| v.clone().try_into().ok())
    }

    /// 实际使用的 API Key（环境变量优先）
    pub fn api_key(&self) -> String {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| self.open_ai_api_key.clone())
    }

    /// 实际使用的 Web 端口（环境变量 PORT 优先）
    pub fn port(&self) -> u16 {
        std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.web_port)
    }

    /// 请求超时，非有限值或超出范围时报错
    pub fn request_timeout(&self) -> anyhow::Result<Duration> {
        Duration::try_from_secs_f64(self.request_timeout.max(0.0))
            .with_context(|| format!("request_timeout 无效: {}", self.request_timeout))
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_users.iter().any(|u| u == user_id)
    }
}

/// 辅助函数：把插件默认配置序列化为 toml 表，并确保包含 enabled 字段
pub fn build_config<T: Serialize>(data: T) -> Value {
    let mut val = Value::try_from(data).unwrap_or(Value::Table(Default::default()));
    if let Value::Table(ref mut map) = val
        && !map.contains_key("enabled")
    {
        map.insert("enabled".to_string(), Value::Boolean(true));
    }
    val
}

/// 配置管理器
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载配置，如果文件不存在则写入默认配置
    pub fn load(&self) -> anyhow::Result<AppConfig> {
        if !self.path.exists() {
            let cfg = AppConfig::default();
            self.save_atomic(&cfg)?;
            return Ok(cfg);
        }

        let content = fs::read_to_string(&self.path)?;
        let cfg: AppConfig = toml::from_str(&content)?;
        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub fn save_atomic(&self, cfg: &AppConfig) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(cfg)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// 合并插件默认配置，有新增时落盘。返回是否发生了修改。
    pub fn merge_plugin_defaults<'a, I>(&self, cfg: &mut AppConfig, defaults: I) -> anyhow::Result<bool>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut modified = false;
        for (name, value) in defaults {
            if !cfg.plugins.contains_key(name) {
                cfg.plugins.insert(name.to_string(), value);
                modified = true;
            }
        }
        if modified {
            self.save_atomic(cfg)?;
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mgr = ConfigManager::new(&path);

        let cfg = mgr.load().unwrap();
        assert!(path.exists());
        assert_eq!(cfg.model, "gpt-3.5-turbo");
        assert_eq!(cfg.concurrency, 8);

        // 再次加载读取的是落盘的内容
        let again = mgr.load().unwrap();
        assert_eq!(again.channel_type, cfg.channel_type);
    }

    #[test]
    fn partial_file_fills_defaults_and_plugin_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
channel_type = "web"
temperature = 0.2
group_welcome_msg = "欢迎"

[hello]
enabled = true
patpat_prompt = "拍一拍"
"#,
        )
        .unwrap();

        let cfg = ConfigManager::new(&path).load().unwrap();
        assert_eq!(cfg.channel_type, "web");
        assert!((cfg.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(cfg.group_welcome_msg.as_deref(), Some("欢迎"));
        assert_eq!(cfg.rate_limit_chatgpt, 20);

        #[derive(Deserialize)]
        struct HelloCfg {
            patpat_prompt: String,
        }
        let hello: HelloCfg = cfg.get_plugin_config("hello").unwrap();
        assert_eq!(hello.patpat_prompt, "拍一拍");
    }

    #[test]
    fn request_timeout_rejects_non_finite_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.request_timeout().unwrap(), Duration::from_secs(30));

        let cfg = AppConfig {
            request_timeout: f64::INFINITY,
            ..AppConfig::default()
        };
        assert!(cfg.request_timeout().is_err());

        let cfg = AppConfig {
            request_timeout: -3.0,
            ..AppConfig::default()
        };
        assert_eq!(cfg.request_timeout().unwrap(), Duration::ZERO);
    }

    #[test]
    fn merge_only_adds_missing_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mgr = ConfigManager::new(&path);
        let mut cfg = mgr.load().unwrap();

        #[derive(Serialize)]
        struct Demo {
            greeting: String,
        }
        let added = mgr
            .merge_plugin_defaults(
                &mut cfg,
                vec![(
                    "demo",
                    build_config(Demo {
                        greeting: "hi".into(),
                    }),
                )],
            )
            .unwrap();
        assert!(added);
        assert_eq!(
            cfg.plugins["demo"].get("enabled").and_then(|v| v.as_bool()),
            Some(true)
        );

        let again = mgr
            .merge_plugin_defaults(&mut cfg, vec![("demo", Value::Table(Default::default()))])
            .unwrap();
        assert!(!again);
    }
}
