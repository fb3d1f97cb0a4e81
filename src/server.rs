// server.rs — 本地 HTTP 控制接口
// 只监听 127.0.0.1，供设置窗口 / 托盘等前端调用；所有操作都转发给 WallpaperService

use crate::config::SettingKey;
use crate::service::WallpaperService;
use crate::update::checker::UpdateInfo;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 默认端口
pub const DEFAULT_PORT: u16 = 3847;

/// 更新脚本启动后、进程退出前的等待时间，留给响应发送
const EXIT_DELAY: Duration = Duration::from_millis(500);

/// 被遮盖的 API Key 前缀
const MASK: &str = "****";

type AppState = Arc<WallpaperService>;

#[derive(Debug, Serialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest {
    #[serde(default)]
    download_url: String,
}

/// 操作类接口的统一响应
#[derive(Debug, Default, Serialize)]
struct ActionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/api/version", get(version_handler))
        .route("/api/check-update", get(check_update_handler))
        .route("/api/update", post(update_handler))
        .route("/api/settings", get(get_settings_handler).post(save_settings_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(service)
}

/// 监听 127.0.0.1:`port`，直到 `shutdown` 完成
pub async fn serve<F>(service: AppState, port: u16, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    info!("control surface listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn version_handler(State(service): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: service.version().to_string(),
    })
}

async fn check_update_handler(State(service): State<AppState>) -> Json<UpdateInfo> {
    Json(service.check_update().await)
}

async fn update_handler(
    State(service): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Json<ActionResponse> {
    let staged = match service.install_update(&request.download_url).await {
        Ok(staged) => staged,
        Err(e) => {
            error!("update failed ({}): {e}", e.kind());
            return Json(ActionResponse::failed(e));
        }
    };
    if let Err(e) = staged.launch() {
        error!("could not launch update script: {e}");
        return Json(ActionResponse::failed(e));
    }

    service.stop_schedule();
    tokio::spawn(async {
        tokio::time::sleep(EXIT_DELAY).await;
        info!("exiting so the update script can replace the executable");
        std::process::exit(0);
    });

    Json(ActionResponse {
        message: Some("update downloaded, restarting".to_string()),
        ..ActionResponse::ok()
    })
}

async fn get_settings_handler(State(service): State<AppState>) -> Json<BTreeMap<String, String>> {
    let settings = service.settings();
    let map = SettingKey::ALL
        .into_iter()
        .map(|key| {
            let value = match key {
                SettingKey::ApiKey => mask_secret(&settings.api_key),
                _ => settings.get(key),
            };
            (key.as_str().to_string(), value)
        })
        .collect();
    Json(map)
}

/// 部分更新；原样回传的遮盖值不会覆盖已保存的 API Key
async fn save_settings_handler(
    State(service): State<AppState>,
    Json(raw): Json<BTreeMap<String, String>>,
) -> Json<ActionResponse> {
    let current_mask = mask_secret(&service.settings().api_key);

    let mut updates = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        let key = match name.parse::<SettingKey>() {
            Ok(key) => key,
            Err(e) => return Json(ActionResponse::failed(e)),
        };
        if key == SettingKey::ApiKey && !value.is_empty() && value == current_mask {
            continue;
        }
        updates.push((key, value));
    }

    match service.save_settings(&updates) {
        Ok(_) => Json(ActionResponse::ok()),
        Err(e) => {
            warn!("rejected settings update: {e}");
            Json(ActionResponse::failed(e))
        }
    }
}

async fn refresh_handler(State(service): State<AppState>) -> Json<ActionResponse> {
    match service.run_once(None).await {
        Ok(path) => Json(ActionResponse {
            path: Some(path.display().to_string()),
            ..ActionResponse::ok()
        }),
        Err(e) => {
            error!("manual refresh failed: {e}");
            Json(ActionResponse::failed(e))
        }
    }
}

/// 只保留末尾 4 个字符
pub(crate) fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count == 0 {
        return String::new();
    }
    if count <= 8 {
        return MASK.to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("{MASK}{tail}")
}
