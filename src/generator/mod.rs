// generator/mod.rs — 图片生成服务抽象
// 定义所有生成后端（如 Gemini）必须实现的通用 Trait，以及错误分类规则

pub mod gemini;

use crate::config::{Resolution, Settings};
use async_trait::async_trait; // 异步 Trait 支持宏
use thiserror::Error;

/// 一次生成请求的全部参数
///
/// 凭据与接口地址随请求传递，这样每次执行都能读到最新保存的配置。
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub api_key: String,
    pub endpoint: String,
    pub prompt: String,
    pub aspect_ratio: String,
    pub resolution: Resolution,
}

impl ImageRequest {
    pub fn from_settings(settings: &Settings, prompt: &str) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            endpoint: settings.api_endpoint.clone(),
            prompt: prompt.to_string(),
            aspect_ratio: settings.aspect_ratio.clone(),
            resolution: settings.resolution,
        }
    }
}

/// 生成结果：原始图片字节与其 MIME 类型
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl GeneratedImage {
    /// 按 MIME 类型选择文件扩展名，未知类型按 png 处理
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

/// 图片生成失败的分类
#[derive(Debug, Error)]
pub enum GenerateError {
    /// 未配置 API_KEY，请求不会发出
    #[error("API key is not configured; set API_KEY before generating wallpapers")]
    MissingCredential,

    #[error("the image API rejected the credential, check API_KEY ({0})")]
    Credential(String),

    #[error("the image model or endpoint was not found, check API_ENDPOINT ({0})")]
    ModelNotFound(String),

    #[error("image API quota or rate limit exceeded, try again later ({0})")]
    Quota(String),

    #[error("the image API rejected the request as malformed, check ASPECT_RATIO and RESOLUTION ({0})")]
    BadRequest(String),

    /// 响应成功但没有图片（例如被安全策略拦截）
    #[error("the image API returned no image: {0}")]
    NoImage(String),

    /// 其他错误，原样透传
    #[error("{0}")]
    Other(String),
}

impl GenerateError {
    /// 根据错误信息内容归类；无法识别的信息原样保留
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        // 无效 Key 在服务端也可能以 400 返回，必须先于 BadRequest 判断
        if has(&["api key", "api_key_invalid", "permission_denied", "unauthenticated", "http 401", "http 403"]) {
            GenerateError::Credential(message)
        } else if has(&["http 429", "quota", "resource_exhausted", "rate limit"]) {
            GenerateError::Quota(message)
        } else if has(&["http 404", "not_found", "not found"]) {
            GenerateError::ModelNotFound(message)
        } else if has(&["http 400", "invalid_argument"]) {
            GenerateError::BadRequest(message)
        } else {
            GenerateError::Other(message)
        }
    }
}

/// 图片生成后端的抽象 Trait
///
/// 所有后端（如 GeminiClient）都应实现这个 Trait；测试中用内存实现替换。
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// 根据提示词生成一张图片
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage, GenerateError>;
}
