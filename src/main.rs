// main.rs — 程序入口
// 负责初始化日志与多语言、解析命令行参数、分发子命令

mod cli; // 声明 cli 模块，对应 src/cli.rs
mod config; // 声明 config 模块，对应 src/config.rs
mod generator;
mod job;
mod scheduler;
mod server;
mod service;
mod setter;
mod update;

// 初始化多语言支持，嵌入 locales 目录下的所有翻译
rust_i18n::i18n!("locales");

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser}; // 引入 Parser trait 的 parse() 方法; CommandFactory 用于生成补全脚本
use clap_complete::generate; // 引入补全脚本生成函数
use cli::{Cli, Commands, ConfigAction}; // 引入 CLI 结构体和子命令枚举
use config::{ConfigStore, SettingKey, Settings};
use generator::gemini::GeminiClient;
use rust_i18n::t; // 引入翻译宏
use service::WallpaperService;
use setter::SystemWallpaperSetter;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use update::checker::UpdateChecker;

/// `#[tokio::main]` 宏将 async main 转换为同步 main + tokio 运行时
#[tokio::main]
async fn main() -> Result<()> {
    // 自动检测系统语言并设置
    let locale = std::env::var("LANG").unwrap_or_else(|_| "en".to_string());
    if locale.starts_with("zh") {
        rust_i18n::set_locale("zh-CN");
    } else {
        rust_i18n::set_locale("en");
    }

    // 解析命令行参数
    let cli = Cli::parse();

    let store = ConfigStore::discover().context(t!("error_no_config_dir").to_string())?;
    init_tracing(&store.load());

    let service = Arc::new(WallpaperService::new(
        store,
        Arc::new(GeminiClient::new()),
        Arc::new(SystemWallpaperSetter),
        UpdateChecker::new(env!("CARGO_PKG_VERSION")),
    ));

    // 根据子命令分发执行逻辑
    match cli.command {
        Commands::Once { prompt } => handle_once(&service, prompt.as_deref()).await?,
        Commands::Schedule => handle_schedule(&service).await?,
        Commands::Ui { port, no_schedule } => handle_ui(service, port, no_schedule).await?,
        Commands::CheckUpdate => handle_check_update(&service).await,
        Commands::Update => handle_update(&service).await?,
        Commands::Config { action } => handle_config(&service, &action)?,
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "aiwall", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// RUST_LOG 优先，其次是配置中的 LOG_LEVEL，都无效时使用 info
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// 处理 once 子命令：立即生成并设置一张壁纸
async fn handle_once(service: &WallpaperService, prompt: Option<&str>) -> Result<()> {
    println!("{}", t!("refresh_start"));
    let path = service
        .run_once(prompt)
        .await
        .context(t!("refresh_failed").to_string())?;
    println!("{}", t!("refresh_done", path => path.display()));
    Ok(())
}

/// 处理 schedule 子命令：前台运行定时器直到收到退出信号
async fn handle_schedule(service: &WallpaperService) -> Result<()> {
    let run = service.start_schedule()?;
    println!("{}", t!("schedule_next", time => run.target.format("%Y-%m-%d %H:%M %:z")));
    println!("{}", t!("schedule_hint"));

    shutdown_signal().await;
    service.stop_schedule();
    println!("{}", t!("schedule_stopped"));
    Ok(())
}

/// 处理 ui 子命令：启动本地控制接口
async fn handle_ui(service: Arc<WallpaperService>, port: u16, no_schedule: bool) -> Result<()> {
    if !no_schedule {
        match service.start_schedule() {
            Ok(run) => info!("daily refresh armed for {}", run.target),
            Err(e) => warn!("could not start schedule: {e}"),
        }
    }
    info!("scheduler state: {:?}", service.schedule_state());

    println!("{}", t!("ui_listening", port => port));
    server::serve(Arc::clone(&service), port, shutdown_signal())
        .await
        .with_context(|| t!("error_bind", port => port).to_string())?;

    service.stop_schedule();
    Ok(())
}

/// 处理 check-update 子命令
async fn handle_check_update(service: &WallpaperService) {
    let info = service.check_update().await;
    if info.available {
        println!(
            "{}",
            t!("update_available", current => service.version(), latest => info.latest_version)
        );
        if let Some(notes) = info.release_notes.as_deref().filter(|n| !n.trim().is_empty()) {
            println!("{notes}");
        }
    } else {
        println!("{}", t!("update_none", current => service.version()));
    }
}

/// 处理 update 子命令：下载、生成替换脚本并退出
async fn handle_update(service: &WallpaperService) -> Result<()> {
    let info = service.check_update().await;
    if !info.available {
        println!("{}", t!("update_none", current => service.version()));
        return Ok(());
    }
    if info.download_url.is_empty() {
        bail!(t!("update_no_asset", latest => info.latest_version).to_string());
    }

    println!("{}", t!("update_downloading", latest => info.latest_version));
    let staged = service
        .install_update(&info.download_url)
        .await
        .context(t!("update_failed").to_string())?;
    staged.launch().context(t!("update_failed").to_string())?;
    println!("{}", t!("update_restarting"));
    Ok(())
}

/// 处理 config 子命令：查看或修改配置
fn handle_config(service: &WallpaperService, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let settings = service.settings();
            println!("{}", t!("config_title"));
            println!("{}", t!("config_path", path => service.config_path().display()));
            for key in SettingKey::ALL {
                let value = match key {
                    SettingKey::ApiKey => server::mask_secret(&settings.api_key),
                    _ => settings.get(key),
                };
                println!("  {key} = {value}");
            }
        }
        ConfigAction::Path => {
            println!("{}", service.config_path().display());
        }
        ConfigAction::Schema => {
            println!("{}", Settings::schema());
        }
        ConfigAction::Set { key, value } => {
            let key: SettingKey = key.parse()?;
            service.save_settings(&[(key, value.clone())])?;
            println!("{}", t!("config_updated", key => key, value => value));
        }
    }
    Ok(())
}

/// 等待 Ctrl+C，Unix 上还包括 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
