use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化全局日志
///
/// 默认级别为 info，`debug = true` 时降为 debug；设置了 `RUST_LOG` 则以环境变量为准。
/// 输出格式: `时间 级别 target: 消息 字段...`
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // 重复初始化（例如测试中）直接忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .try_init();
}
