// cli.rs — 命令行接口定义模块
// 使用 clap 的 derive 模式定义所有子命令和参数

use crate::server::DEFAULT_PORT;
use clap::{Parser, Subcommand}; // Parser: 解析命令行参数的 trait; Subcommand: 定义子命令的 trait
use clap_complete::Shell; // Shell 枚举：Bash, Zsh, Fish, Elvish, PowerShell

/// AI 壁纸生成工具
///
/// 调用图片生成服务按提示词生成壁纸，并设置为系统桌面背景；
/// 支持每日定时刷新和本地控制接口。
#[derive(Parser)]
#[command(name = "aiwall")]
#[command(version)] // 自动从 Cargo.toml 读取 version 字段
#[command(author)] // 自动从 Cargo.toml 读取 authors 字段
#[command(about = "AI 壁纸生成工具 — 生成图片并设置为桌面壁纸，支持每日定时刷新")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 立即生成一张壁纸并设置
    ///
    /// 用法示例:
    ///   aiwall once
    ///   aiwall once --prompt "foggy harbour at dawn"
    Once {
        /// 本次使用的提示词（不指定则使用配置中的 PROMPT）
        #[arg(short, long)]
        prompt: Option<String>,
    },

    /// 前台运行每日定时刷新，直到收到 Ctrl+C / SIGTERM
    ///
    /// 用法示例:
    ///   aiwall schedule
    Schedule,

    /// 启动本地控制接口（同时运行定时刷新）
    ///
    /// 用法示例:
    ///   aiwall ui
    ///   aiwall ui --port 4000 --no-schedule
    Ui {
        /// 监听端口（仅绑定 127.0.0.1）
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// 不启动定时刷新
        #[arg(long)]
        no_schedule: bool,
    },

    /// 检查是否有新版本
    CheckUpdate,

    /// 下载并安装最新版本，完成后自动重启
    Update,

    /// 配置管理操作
    ///
    /// 用法示例:
    ///   aiwall config show
    ///   aiwall config set api-key "..."
    ///   aiwall config set schedule_time 07:30
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// 生成 shell 补全脚本（支持 bash, zsh, fish, elvish, powershell）
    ///
    /// 用法示例：
    ///   aiwall completions zsh > ~/.zsh/completions/_aiwall
    Completions {
        /// 目标 shell 类型
        shell: Shell,
    },
}

/// 配置管理操作
#[derive(Subcommand)]
pub enum ConfigAction {
    /// 查看当前所有配置（API Key 会被遮盖）
    Show,
    /// 打印配置文件路径
    Path,
    /// 生成配置对应的 JSON Schema
    Schema,
    /// 设置配置项的值
    Set {
        /// 要设置的键，大小写不敏感（如 PROMPT, schedule-time）
        key: String,
        /// 要设置的值
        value: String,
    },
}
