// update/mod.rs — 自更新模块入口
// checker 负责查询最新版本，installer 负责下载并生成替换脚本

pub mod checker;
pub mod installer;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 更新过程中的错误
#[derive(Debug, Error)]
pub enum UpdateError {
    /// 请求超过了固定的超时上限
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed release data: {0}")]
    Parse(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 该版本没有当前平台可用的安装包
    #[error("no download is available for this platform")]
    NoAsset,
}

impl UpdateError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpdateError::Timeout(e)
        } else {
            UpdateError::Network(e)
        }
    }

    /// 简短的错误类别，用于日志
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Timeout(_) => "timeout",
            UpdateError::Network(_) => "network",
            UpdateError::Status(_) => "http-status",
            UpdateError::Parse(_) => "parse",
            UpdateError::Io { .. } => "io",
            UpdateError::NoAsset => "no-asset",
        }
    }
}

/// 带固定超时和 User-Agent 的 HTTP 客户端（GitHub API 要求 User-Agent）
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("aiwall/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
