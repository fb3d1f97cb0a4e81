// checker.rs — 检查 GitHub Release 上的最新版本
//
// 网络失败、404 都不会抛给调用方：一律降级为“无可用更新”，只在日志中区分。

use super::{UpdateError, http_client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 发布源所在的仓库
pub const RELEASE_OWNER: &str = "aiwall-app";
pub const RELEASE_REPO: &str = "aiwall";

const GITHUB_API: &str = "https://api.github.com";

/// 检查请求的超时上限
const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// 安装包扩展名
pub const ARCHIVE_EXTENSION: &str = ".zip";

/// 一次检查的结果，不做持久化
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub latest_version: String,
    pub available: bool,
    /// 当前平台安装包的下载地址；为空时即使有新版本也无法安装
    pub download_url: String,
    pub release_notes: Option<String>,
    pub published_at: Option<String>,
}

impl UpdateInfo {
    fn unavailable(current_version: &str) -> Self {
        Self {
            latest_version: current_version.to_string(),
            available: false,
            download_url: String::new(),
            release_notes: None,
            published_at: None,
        }
    }
}

/// GitHub releases/latest 响应中需要的字段
#[derive(Deserialize, Debug)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
    body: Option<String>,
    published_at: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

pub struct UpdateChecker {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    current_version: String,
}

impl UpdateChecker {
    /// `current_version` 一般传入 `env!("CARGO_PKG_VERSION")`
    pub fn new(current_version: &str) -> Self {
        Self {
            client: http_client(CHECK_TIMEOUT),
            api_base: GITHUB_API.to_string(),
            owner: RELEASE_OWNER.to_string(),
            repo: RELEASE_REPO.to_string(),
            current_version: current_version.to_string(),
        }
    }

    /// 替换 API 地址（测试或自建镜像）
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// 查询最新版本，永不返回错误
    pub async fn check_for_updates(&self) -> UpdateInfo {
        match self.fetch_latest_release().await {
            Ok(Some(release)) => self.evaluate(release),
            Ok(None) => {
                debug!("no published release found for {}/{}", self.owner, self.repo);
                UpdateInfo::unavailable(&self.current_version)
            }
            Err(e) => {
                warn!("update check failed ({}): {e}", e.kind());
                UpdateInfo::unavailable(&self.current_version)
            }
        }
    }

    /// 404 视为“没有发布”，返回 Ok(None)
    async fn fetch_latest_release(&self) -> Result<Option<Release>, UpdateError> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.owner, self.repo
        );

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(UpdateError::from_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(UpdateError::Status(status.as_u16()));
        }

        let release = response
            .json::<Release>()
            .await
            .map_err(|e| UpdateError::Parse(e.to_string()))?;
        Ok(Some(release))
    }

    fn evaluate(&self, release: Release) -> UpdateInfo {
        let latest = strip_version_prefix(&release.tag_name).to_string();
        let available = is_newer_version(&latest, &self.current_version);

        let download_url = select_asset(&release.assets, platform_marker(), ARCHIVE_EXTENSION)
            .map(|asset| asset.browser_download_url.clone())
            .unwrap_or_default();
        if available && download_url.is_empty() {
            warn!("release {latest} has no {} asset for this platform", platform_marker());
        }
        if available {
            info!("update available: {} -> {latest}", self.current_version);
        }

        UpdateInfo {
            latest_version: latest,
            available,
            download_url,
            release_notes: release.body,
            published_at: release.published_at,
        }
    }
}

/// 去掉版本号前的 v / V
pub fn strip_version_prefix(version: &str) -> &str {
    version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version)
}

/// `candidate` 是否比 `current` 新
///
/// 按 '.' 切分后逐段比较数字，缺失或非数字的段视为 0；全部相等不算更新。
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        strip_version_prefix(v.trim())
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(candidate), parse(current));

    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}

/// 安装包文件名中标识当前平台的片段
pub fn platform_marker() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win",
        "macos" => "mac",
        _ => "linux",
    }
}

/// 第一个名称包含平台标识且以指定扩展名结尾的资源
pub fn select_asset<'a>(assets: &'a [Asset], marker: &str, extension: &str) -> Option<&'a Asset> {
    assets.iter().find(|asset| {
        let name = asset.name.to_lowercase();
        name.contains(marker) && name.ends_with(extension)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });
        format!("http://{addr}")
    }

    fn asset(name: &str) -> Asset {
        Asset {
            name: name.to_string(),
            browser_download_url: format!("https://example.com/{name}"),
        }
    }

    #[test]
    fn version_comparison() {
        assert!(!is_newer_version("1.2.0", "1.10.0"));
        assert!(is_newer_version("2.0.0", "1.9.9"));
        assert!(!is_newer_version("1.0", "1.0.0"));
        assert!(!is_newer_version("1.0.0", "1.0"));
        assert!(is_newer_version("1.0.1", "1.0"));
        assert!(is_newer_version("v1.10.0", "1.9.0"));
    }

    #[test]
    fn strips_only_a_leading_prefix() {
        assert_eq!(strip_version_prefix("v1.2.3"), "1.2.3");
        assert_eq!(strip_version_prefix("V2.0"), "2.0");
        assert_eq!(strip_version_prefix("1.2.3"), "1.2.3");
    }

    #[test]
    fn selects_first_matching_platform_archive() {
        let assets = vec![
            asset("aiwall-linux-x64.tar.gz"),
            asset("aiwall-win-x64.exe"),
            asset("aiwall-Win-x64.zip"),
            asset("aiwall-win-arm64.zip"),
        ];
        let picked = select_asset(&assets, "win", ".zip").unwrap();
        assert_eq!(picked.name, "aiwall-Win-x64.zip");
        assert!(select_asset(&assets, "mac", ".zip").is_none());
    }

    #[tokio::test]
    async fn newer_release_is_reported_with_its_asset() {
        let archive = format!("aiwall-{}-x64.zip", platform_marker());
        let body = serde_json::json!({
            "tag_name": "v9.1.0",
            "body": "notes",
            "published_at": "2024-05-01T00:00:00Z",
            "assets": [
                { "name": "checksums.txt", "browser_download_url": "https://example.com/sums" },
                { "name": archive, "browser_download_url": "https://example.com/pkg.zip" }
            ]
        });
        let router = Router::new().route(
            "/repos/aiwall-app/aiwall/releases/latest",
            get(move || async move { axum::Json(body) }),
        );
        let base = serve(router).await;

        let info = UpdateChecker::new("1.0.0")
            .with_api_base(base)
            .check_for_updates()
            .await;
        assert!(info.available);
        assert_eq!(info.latest_version, "9.1.0");
        assert_eq!(info.download_url, "https://example.com/pkg.zip");
        assert_eq!(info.release_notes.as_deref(), Some("notes"));
        assert_eq!(info.published_at.as_deref(), Some("2024-05-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn same_version_is_not_available() {
        let router = Router::new().route(
            "/repos/aiwall-app/aiwall/releases/latest",
            get(|| async { axum::Json(serde_json::json!({ "tag_name": "v1.0", "assets": [] })) }),
        );
        let base = serve(router).await;
        let info = UpdateChecker::new("1.0.0")
            .with_api_base(base)
            .check_for_updates()
            .await;
        assert!(!info.available);
        assert!(info.download_url.is_empty());
    }

    #[tokio::test]
    async fn not_found_degrades_to_no_update() {
        // 没有注册任何路由，axum 对所有请求返回 404
        let base = serve(Router::new()).await;
        let info = UpdateChecker::new("1.2.3")
            .with_api_base(base)
            .check_for_updates()
            .await;
        assert_eq!(info, UpdateInfo::unavailable("1.2.3"));
    }

    #[tokio::test]
    async fn server_errors_degrade_to_no_update() {
        let router = Router::new().route(
            "/repos/aiwall-app/aiwall/releases/latest",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = serve(router).await;
        let info = UpdateChecker::new("1.2.3")
            .with_api_base(base)
            .check_for_updates()
            .await;
        assert!(!info.available);
        assert_eq!(info.latest_version, "1.2.3");
    }

    #[tokio::test]
    async fn unreachable_feed_degrades_to_no_update() {
        let info = UpdateChecker::new("1.2.3")
            .with_api_base("http://127.0.0.1:9")
            .check_for_updates()
            .await;
        assert!(!info.available);
    }
}
