// job.rs — 壁纸刷新任务
// 一次刷新 = 生成图片 → 写入输出目录 → 设置为系统壁纸，任何一步失败都原样向上返回

use crate::config::Settings;
use crate::generator::{GenerateError, ImageGenerator, ImageRequest};
use crate::setter::WallpaperSetter;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File}; // tokio 提供的异步文件操作
use tokio::io::AsyncWriteExt; // 异步写入 trait，提供 write_all() 等方法
use tracing::info;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error("failed to write wallpaper to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set wallpaper: {0}")]
    SetWallpaper(String),
}

/// 刷新任务
///
/// 每次执行前由调用方根据最新配置构建，不做任何重试。
pub struct RefreshJob {
    generator: Arc<dyn ImageGenerator>,
    setter: Arc<dyn WallpaperSetter>,
    settings: Settings,
}

impl RefreshJob {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        setter: Arc<dyn WallpaperSetter>,
        settings: Settings,
    ) -> Self {
        Self {
            generator,
            setter,
            settings,
        }
    }

    /// 用给定提示词生成并设置壁纸，返回图片保存路径
    pub async fn run(&self, prompt: &str) -> Result<PathBuf, RefreshError> {
        if self.settings.api_key.is_empty() {
            return Err(GenerateError::MissingCredential.into());
        }

        let request = ImageRequest::from_settings(&self.settings, prompt);
        let image = self.generator.generate(&request).await?;

        let save_dir = self.settings.output_dir();
        let save_path = save_dir.join(artifact_name(image.extension()));
        write_artifact(&save_path, &image.bytes).await?;
        info!("saved wallpaper to {}", save_path.display());

        self.setter
            .set(&save_path)
            .await
            .map_err(RefreshError::SetWallpaper)?;

        Ok(save_path)
    }
}

/// 以生成时间命名，精确到毫秒以避免重名
pub fn artifact_name(extension: &str) -> String {
    format!(
        "wallpaper-{}.{}",
        Local::now().format("%Y%m%d-%H%M%S-%3f"),
        extension
    )
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), RefreshError> {
    let io_err = |source| RefreshError::Write {
        path: path.to_path_buf(),
        source,
    };
    // 确保壁纸目录存在
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = File::create(path).await.map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::generator::GeneratedImage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 返回固定字节的生成器，记录调用次数
    #[derive(Default)]
    pub(crate) struct FakeGenerator {
        pub calls: AtomicUsize,
        pub fail_with: Option<String>,
    }

    #[async_trait]
    impl ImageGenerator for FakeGenerator {
        async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.fail_with {
                return Err(GenerateError::classify(message.clone()));
            }
            Ok(GeneratedImage {
                bytes: request.prompt.as_bytes().to_vec(),
                mime_type: "image/png".to_string(),
            })
        }
    }

    /// 记录被设置过的路径
    #[derive(Default)]
    pub(crate) struct RecordingSetter {
        pub paths: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl WallpaperSetter for RecordingSetter {
        async fn set(&self, path: &Path) -> Result<(), String> {
            self.paths.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    pub(crate) fn settings_in(dir: &TempDir) -> Settings {
        Settings {
            api_key: "key".to_string(),
            output_dir: dir.path().join("out").to_string_lossy().into_owned(),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn writes_artifact_and_sets_it() {
        let dir = TempDir::new().unwrap();
        let setter = Arc::new(RecordingSetter::default());
        let job = RefreshJob::new(
            Arc::new(FakeGenerator::default()),
            setter.clone(),
            settings_in(&dir),
        );

        let path = job.run("misty forest").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"misty forest");
        assert!(path.starts_with(dir.path().join("out")));
        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(*setter.paths.lock(), vec![path]);
    }

    #[tokio::test]
    async fn consecutive_runs_do_not_overwrite_each_other() {
        let dir = TempDir::new().unwrap();
        let job = RefreshJob::new(
            Arc::new(FakeGenerator::default()),
            Arc::new(RecordingSetter::default()),
            settings_in(&dir),
        );
        let first = job.run("one").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = job.run("two").await.unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[tokio::test]
    async fn missing_credential_skips_the_generator() {
        let dir = TempDir::new().unwrap();
        let generator = Arc::new(FakeGenerator::default());
        let mut settings = settings_in(&dir);
        settings.api_key.clear();
        let job = RefreshJob::new(generator.clone(), Arc::new(RecordingSetter::default()), settings);

        let err = job.run("anything").await.unwrap_err();
        assert!(matches!(
            err,
            RefreshError::Generate(GenerateError::MissingCredential)
        ));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generator_failures_propagate_without_retry() {
        let dir = TempDir::new().unwrap();
        let generator = Arc::new(FakeGenerator {
            fail_with: Some("HTTP 429: RESOURCE_EXHAUSTED".to_string()),
            ..FakeGenerator::default()
        });
        let setter = Arc::new(RecordingSetter::default());
        let job = RefreshJob::new(generator.clone(), setter.clone(), settings_in(&dir));

        let err = job.run("anything").await.unwrap_err();
        assert!(matches!(err, RefreshError::Generate(GenerateError::Quota(_))));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(setter.paths.lock().is_empty());
    }

    #[test]
    fn artifact_names_carry_millisecond_timestamps() {
        let name = artifact_name("jpg");
        // wallpaper-YYYYMMDD-HHMMSS-mmm.jpg
        assert!(name.starts_with("wallpaper-"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), "wallpaper-20240101-120000-000.jpg".len());
    }
}
