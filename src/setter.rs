// setter.rs — 系统壁纸设置模块

use async_trait::async_trait;
use rust_i18n::t;
use std::path::{Path, PathBuf};
use tracing::info;

/// 设置系统壁纸的抽象，测试中用记录调用的实现替换
#[async_trait]
pub trait WallpaperSetter: Send + Sync {
    async fn set(&self, path: &Path) -> Result<(), String>;
}

/// 调用第三方 `wallpaper` 库的实现
/// 这个库会自动识别操作系统并调用相应的 API
pub struct SystemWallpaperSetter;

#[async_trait]
impl WallpaperSetter for SystemWallpaperSetter {
    async fn set(&self, path: &Path) -> Result<(), String> {
        let path: PathBuf = path.to_path_buf();
        info!("setting wallpaper -> {}", path.display());

        // wallpaper 库是同步调用，放到阻塞线程池中执行
        tokio::task::spawn_blocking(move || set_from_path(&path))
            .await
            .map_err(|e| e.to_string())?
    }
}

/// 将指定路径的图片设置为系统壁纸
///
/// # 参数
/// - `path`: 图片的绝对路径
pub fn set_from_path(path: impl AsRef<Path>) -> Result<(), String> {
    let path_ref = path.as_ref();
    let path_str = path_ref.to_str().ok_or_else(|| t!("error_utf8").to_string())?;

    wallpaper::set_from_path(path_str)
        .map_err(|e| format!("{}: {}", t!("error_set_failed"), e))
}
