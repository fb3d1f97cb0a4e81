// service.rs — 核心服务
// CLI 和本地 HTTP 接口都只通过这里操作配置、刷新、定时与更新

use crate::config::{ConfigError, ConfigStore, SettingKey, Settings};
use crate::generator::ImageGenerator;
use crate::job::{RefreshError, RefreshJob};
use crate::scheduler::{ScheduledRun, ScheduledTask, Scheduler, SchedulerError, SchedulerState};
use crate::setter::WallpaperSetter;
use crate::update::UpdateError;
use crate::update::checker::{UpdateChecker, UpdateInfo};
use crate::update::installer::{self, StagedUpdate};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// 下载的安装包缺少文件名时使用的名称
const FALLBACK_ARCHIVE_NAME: &str = "aiwall-update.zip";

/// 每次执行都重新读取配置的刷新器
#[derive(Clone)]
struct RefreshRunner {
    store: ConfigStore,
    generator: Arc<dyn ImageGenerator>,
    setter: Arc<dyn WallpaperSetter>,
}

impl RefreshRunner {
    async fn run_with(&self, prompt: Option<&str>) -> Result<PathBuf, RefreshError> {
        let settings = self.store.load();
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| settings.prompt.clone());
        let job = RefreshJob::new(
            Arc::clone(&self.generator),
            Arc::clone(&self.setter),
            settings,
        );
        job.run(&prompt).await
    }
}

#[async_trait]
impl ScheduledTask for RefreshRunner {
    async fn run(&self) -> Result<PathBuf, RefreshError> {
        self.run_with(None).await
    }
}

pub struct WallpaperService {
    runner: RefreshRunner,
    checker: UpdateChecker,
    scheduler: Scheduler,
}

impl WallpaperService {
    pub fn new(
        store: ConfigStore,
        generator: Arc<dyn ImageGenerator>,
        setter: Arc<dyn WallpaperSetter>,
        checker: UpdateChecker,
    ) -> Self {
        let runner = RefreshRunner {
            store,
            generator,
            setter,
        };
        let scheduler = Scheduler::new(Arc::new(runner.clone()));
        Self {
            runner,
            checker,
            scheduler,
        }
    }

    /// 立即刷新一次；`prompt` 为空时使用配置中的提示词
    pub async fn run_once(&self, prompt: Option<&str>) -> Result<PathBuf, RefreshError> {
        self.runner.run_with(prompt).await
    }

    /// 按当前配置布置每日定时器
    pub fn start_schedule(&self) -> Result<ScheduledRun, SchedulerError> {
        let settings = self.runner.store.load();
        self.scheduler.start(&settings)
    }

    pub fn stop_schedule(&self) {
        self.scheduler.stop();
    }

    pub fn schedule_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn version(&self) -> &str {
        self.checker.current_version()
    }

    pub async fn check_update(&self) -> UpdateInfo {
        self.checker.check_for_updates().await
    }

    /// 下载安装包并生成替换脚本；脚本尚未执行
    pub async fn install_update(&self, download_url: &str) -> Result<StagedUpdate, UpdateError> {
        let destination = std::env::temp_dir()
            .join("aiwall-update")
            .join(archive_name(download_url));
        let archive = installer::download_update(download_url, &destination).await?;

        let exe = std::env::current_exe().map_err(|source| UpdateError::Io {
            path: PathBuf::from(installer::executable_name()),
            source,
        })?;
        let install_dir = exe.parent().unwrap_or(Path::new(".")).to_path_buf();
        let restart_args: Vec<String> = std::env::args().skip(1).collect();

        info!("staging update into {}", install_dir.display());
        installer::install_update(&archive, &install_dir, &restart_args)
    }

    pub fn settings(&self) -> Settings {
        self.runner.store.load()
    }

    pub fn config_path(&self) -> &Path {
        self.runner.store.path()
    }

    /// 合并保存部分设置
    pub fn save_settings(&self, updates: &[(SettingKey, String)]) -> Result<Settings, ConfigError> {
        self.runner.store.save(updates)
    }
}

/// 取下载地址最后一段作为文件名，去掉查询串；两种路径分隔符都会切分
fn archive_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or(FALLBACK_ARCHIVE_NAME)
        .to_string()
}
