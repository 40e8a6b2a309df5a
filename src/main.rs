use chatbridge::ChatBridge;
use chatbridge::config::ConfigManager;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "chatbridge", version, about = "把聊天前端接入 OpenAI 兼容接口的机器人")]
struct Cli {
    /// 使用终端通道（忽略配置中的 channel_type）
    #[arg(long)]
    cmd: bool,

    /// 配置文件路径
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match ConfigManager::new(&cli.config).load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("加载配置失败 ({}): {:#}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    chatbridge::log::init(cfg.debug);

    let channel = if cli.cmd {
        "terminal".to_string()
    } else {
        cfg.channel_type.clone()
    };

    let bridge = match ChatBridge::builder()
        .config_path(&cli.config)
        .config(cfg)
        .with_default_plugins()
        .build()
    {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("启动失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match bridge.run(&channel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("运行失败: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
