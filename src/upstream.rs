//! # Upstream — Generation Provider Client
//!
//! Builds the `generateContent` request, posts it with the caller's bearer
//! token, and turns the response into a saved image.
//!
//! The provider answers in one of three shapes, all inside the parts list of
//! the first candidate:
//!
//! | Probe | Part shape | Saved as |
//! |-------|------------|----------|
//! | 1 | `inlineData.data` (base64) | `gen_<ns>.png` |
//! | 2 | markdown `![..](data:image/<t>;base64,..)` in `text` | `gen_<ns>.<t>` (`jpeg` → `jpg`) |
//! | 3 | markdown `![..](http(s)://..)` in `text` | downloaded, extension from `Content-Type` |
//!
//! Each part is classified into an [`ImageSource`] up front. Parts are tried
//! in order and the first source that saves cleanly wins; a failing source
//! is remembered and the next part is tried. Only when nothing saves does
//! the call fail.

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use prometheus_client::metrics::histogram::Histogram;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::artifacts::{self, ArtifactStore};

/// Deadline for one generation POST.
pub const GENERATE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Deadline for fetching an image referenced by URL.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Default cap on a downloaded image.
pub const DEFAULT_DOWNLOAD_LIMIT: usize = 64 * 1024 * 1024;

const MARKDOWN_IMAGE: &str =
    r"!\[[^\]]*\]\((data:image/[^;]+;base64,[^\s)]+|https?://[^\s)]+)\)";

const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "insufficient",
    "balance",
    "余额不足",
    "额度已用尽",
    "remainquota",
];

/// True if `message` reads like an exhausted-balance error.
pub fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("{0}")]
    Transport(String),
    #[error("{message}")]
    Status { code: u16, message: String },
    #[error("模型未返回内容")]
    NoCandidates,
    #[error("解析响应失败")]
    Undecodable,
    #[error("请求成功但未返回图片，请修改提示词后重试")]
    NoImage,
    #[error("请求成功但图片处理失败: {0}")]
    ProbeFailed(String),
}

impl UpstreamError {
    pub fn is_quota(&self) -> bool {
        is_quota_message(&self.to_string())
    }
}

// ── Wire types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn image(mime_type: &str, bytes: &[u8]) -> Self {
        Part {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: STANDARD.encode(bytes),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub aspect_ratio: String,
    pub image_size: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub image_config: ImageConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

impl GenerateRequest {
    /// One user turn: the prompt, then each reference image inline.
    pub fn new(prompt: &str, references: &[Part], aspect_ratio: &str, image_size: &str) -> Self {
        let mut parts = Vec::with_capacity(references.len() + 1);
        parts.push(Part::text(prompt));
        parts.extend(references.iter().cloned());
        GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts,
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
                image_config: ImageConfig {
                    aspect_ratio: aspect_ratio.to_string(),
                    image_size: image_size.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize, Default)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Debug, Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

// ── Image sources ───────────────────────────────────────────────

/// Where a response part says the image bytes are.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Inline(String),
    DataUrl { subtype: String, base64: String },
    HttpUrl(String),
}

impl ImageSource {
    /// Classify one part. Inline data takes precedence over text.
    pub fn from_part(part: &Part, markdown: &Regex) -> Option<ImageSource> {
        if let Some(inline) = part.inline_data.as_ref().filter(|d| !d.data.is_empty()) {
            return Some(ImageSource::Inline(inline.data.clone()));
        }
        let text = part.text.as_deref().filter(|t| !t.is_empty())?;
        let url = markdown.captures(text)?.get(1)?.as_str();
        if let Some(rest) = url.strip_prefix("data:image/") {
            let (subtype, b64) = rest.split_once(";base64,")?;
            return Some(ImageSource::DataUrl {
                subtype: subtype.to_string(),
                base64: b64.to_string(),
            });
        }
        Some(ImageSource::HttpUrl(url.to_string()))
    }

    fn kind(&self) -> &'static str {
        match self {
            ImageSource::Inline(_) => "inline",
            ImageSource::DataUrl { .. } => "data_url",
            ImageSource::HttpUrl(_) => "http_url",
        }
    }
}

// ── Client ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    artifacts: ArtifactStore,
    markdown: Regex,
    latency: Histogram,
    download_limit: usize,
}

impl UpstreamClient {
    pub fn new(artifacts: ArtifactStore, latency: Histogram) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build upstream client")?;
        Ok(UpstreamClient {
            http,
            artifacts,
            markdown: Regex::new(MARKDOWN_IMAGE)?,
            latency,
            download_limit: DEFAULT_DOWNLOAD_LIMIT,
        })
    }

    pub fn with_download_limit(mut self, bytes: usize) -> Self {
        self.download_limit = bytes;
        self
    }

    pub fn markdown_matcher(&self) -> &Regex {
        &self.markdown
    }

    /// POST one generation request and save the resulting image.
    /// Returns the relative URL of the saved file.
    pub async fn generate(
        &self,
        url: &str,
        token: &str,
        request: &GenerateRequest,
    ) -> Result<String, UpstreamError> {
        let started = Instant::now();
        let sent = self
            .http
            .post(url)
            .bearer_auth(token)
            .timeout(GENERATE_TIMEOUT)
            .json(request)
            .send()
            .await;
        let resp = match sent {
            Ok(r) => r,
            Err(e) => {
                self.latency.observe(started.elapsed().as_secs_f64());
                return Err(UpstreamError::Transport(e.to_string()));
            }
        };
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let elapsed = started.elapsed();
        self.latency.observe(elapsed.as_secs_f64());
        debug!(
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            bytes = body.len(),
            "upstream responded"
        );

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&body)
                .ok()
                .map(|b| b.error.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("API 请求失败，状态码: {}", status.as_u16()));
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse =
            serde_json::from_slice(&body).map_err(|_| UpstreamError::Undecodable)?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or(UpstreamError::NoCandidates)?;
        self.materialise(&candidate.content.parts).await
    }

    /// Try every part in order; the first source that saves wins.
    pub async fn materialise(&self, parts: &[Part]) -> Result<String, UpstreamError> {
        let mut last_error: Option<String> = None;
        for part in parts {
            let Some(source) = ImageSource::from_part(part, &self.markdown) else {
                continue;
            };
            let kind = source.kind();
            match self.save(source).await {
                Ok(url) => {
                    info!(source = kind, url = %url, "image saved");
                    return Ok(url);
                }
                Err(e) => {
                    warn!(source = kind, error = %e, "image source failed, trying next part");
                    last_error = Some(format!("{:#}", e));
                }
            }
        }
        Err(match last_error {
            Some(e) => UpstreamError::ProbeFailed(e),
            None => UpstreamError::NoImage,
        })
    }

    async fn save(&self, source: ImageSource) -> anyhow::Result<String> {
        match source {
            ImageSource::Inline(b64) => {
                let bytes = STANDARD
                    .decode(b64.as_bytes())
                    .context("inlineData base64 解码失败")?;
                self.artifacts.save_generated(&bytes, "png").await
            }
            ImageSource::DataUrl { subtype, base64 } => {
                let bytes = STANDARD
                    .decode(base64.as_bytes())
                    .context("data URL base64 解码失败")?;
                let ext = artifacts::extension_for_subtype(&subtype);
                self.artifacts.save_generated(&bytes, &ext).await
            }
            ImageSource::HttpUrl(url) => {
                let mut resp = self
                    .http
                    .get(&url)
                    .timeout(DOWNLOAD_TIMEOUT)
                    .send()
                    .await
                    .context("下载图片失败")?;
                if resp.status() != reqwest::StatusCode::OK {
                    bail!("下载图片失败，状态码: {}", resp.status().as_u16());
                }
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if let Some(len) = resp.content_length() {
                    if len > self.download_limit as u64 {
                        bail!("图片大小 {} 字节超过上限 {} 字节", len, self.download_limit);
                    }
                }
                let mut bytes = Vec::new();
                while let Some(chunk) = resp.chunk().await.context("读取图片数据失败")? {
                    if bytes.len() + chunk.len() > self.download_limit {
                        bail!("图片大小超过上限 {} 字节", self.download_limit);
                    }
                    bytes.extend_from_slice(&chunk);
                }
                let ext = artifacts::extension_for_content_type(&content_type);
                self.artifacts.save_generated(&bytes, ext).await
            }
        }
    }
}
