// gemini.rs — Gemini 图片生成 API 异步客户端
// 负责调用 generateContent 接口并从响应中取出 base64 编码的图片

use super::{GenerateError, GeneratedImage, ImageGenerator, ImageRequest};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 单次生成的超时时间
const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

/// generateContent 请求体
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize, Debug)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize, Debug)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    image_config: ImageConfig<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImageConfig<'a> {
    aspect_ratio: &'a str,
    image_size: &'a str,
}

/// generateContent 响应的顶层结构，只提取需要的字段
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    /// base64 编码的图片数据
    data: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// 出错时的响应体：{"error": {"code", "message", "status"}}
#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    message: String,
    status: Option<String>,
}

/// Gemini 图片生成客户端
///
/// 只持有 reqwest::Client（内部有连接池，应复用）；凭据随每次请求传入。
pub struct GeminiClient {
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(GENERATE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage, GenerateError> {
        if request.api_key.is_empty() {
            return Err(GenerateError::MissingCredential);
        }

        let body = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: &request.prompt,
                }],
            }],
            generation_config: GenerationConfig {
                response_modalities: ["IMAGE"],
                image_config: ImageConfig {
                    aspect_ratio: &request.aspect_ratio,
                    image_size: request.resolution.as_str(),
                },
            },
        };

        debug!(
            "requesting {} image ({}) from {}",
            request.resolution, request.aspect_ratio, request.endpoint
        );

        let response = self
            .client
            .post(&request.endpoint)
            .header("x-goog-api-key", &request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::classify(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerateError::classify(describe_failure(status, &text)));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::Other(format!("failed to parse image response: {e}")))?;

        extract_image(parsed)
    }
}

/// 把非 2xx 响应整理成一行信息，供分类使用
fn describe_failure(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!(
            "HTTP {}: {} {}",
            status.as_u16(),
            envelope.error.status.unwrap_or_default(),
            envelope.error.message
        ),
        Err(_) => format!("HTTP {}: {}", status, body.trim()),
    }
}

/// 取出第一张内联图片；没有图片时带上模型返回的文字或拦截原因
fn extract_image(response: GenerateResponse) -> Result<GeneratedImage, GenerateError> {
    let mut texts = Vec::new();
    let mut finish_reason = None;

    for candidate in response.candidates {
        finish_reason = finish_reason.or(candidate.finish_reason);
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for part in parts {
            if let Some(inline) = part.inline_data {
                let bytes = STANDARD.decode(inline.data.as_bytes()).map_err(|e| {
                    GenerateError::Other(format!("image data is not valid base64: {e}"))
                })?;
                return Ok(GeneratedImage {
                    bytes,
                    mime_type: inline.mime_type,
                });
            }
            if let Some(text) = part.text {
                texts.push(text);
            }
        }
    }

    let reason = response
        .prompt_feedback
        .and_then(|f| f.block_reason)
        .map(|r| format!("blocked: {r}"))
        .or_else(|| (!texts.is_empty()).then(|| texts.join(" ")))
        .or(finish_reason)
        .unwrap_or_else(|| "empty response".to_string());
    Err(GenerateError::NoImage(reason))
}
