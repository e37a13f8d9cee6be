use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use tera::{Context as TeraContext, Tera};
use tracing::{debug, info};

use crate::data::{DataAttachment, JPEG_MIME};
use crate::fields::{FieldKind, RawDetection};
use crate::geometry::NORMALIZED_EXTENT;
use crate::providers::{Provider, ToolSpec};
use crate::raster::Page;

mod parse;

pub use parse::{parse_payload, parse_text};

pub const TOOL_NAME: &str = "report_fields";
const JPEG_QUALITY: u8 = 80;
const PROMPT_TEMPLATE: &str = include_str!("prompts/detect_fields.tera");

pub type DetectionFuture = Pin<Box<dyn Future<Output = Result<Vec<RawDetection>>> + Send>>;

/// Locates fillable regions on one page image.
///
/// An `Err` means the pass produced nothing usable; callers leave the
/// page's existing fields alone in that case.
pub trait FieldDetector: Send + Sync {
    fn detect(&self, page: &Page) -> DetectionFuture;
}

pub fn tool_spec() -> ToolSpec {
    let kinds = [FieldKind::Signature, FieldKind::Initial, FieldKind::Text]
        .iter()
        .map(FieldKind::as_str)
        .collect::<Vec<_>>();
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Report every blank on the page that a person should fill in.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "fields": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "box": {
                                "type": "array",
                                "items": {"type": "number"},
                                "minItems": 4,
                                "maxItems": 4,
                                "description": "[ymin, xmin, ymax, xmax] normalized to 0-1000"
                            },
                            "type": {"type": "string", "enum": kinds}
                        },
                        "required": ["box", "type"]
                    }
                }
            },
            "required": ["fields"]
        }),
    }
}

pub fn render_system_prompt() -> Result<String> {
    let mut context = TeraContext::new();
    context.insert("tool_name", TOOL_NAME);
    context.insert("extent", &(NORMALIZED_EXTENT as u32));
    context.insert(
        "kinds",
        &[FieldKind::Signature, FieldKind::Initial, FieldKind::Text]
            .iter()
            .map(FieldKind::as_str)
            .collect::<Vec<_>>(),
    );
    Tera::one_off(PROMPT_TEMPLATE, &context, false)
        .with_context(|| "failed to render detection prompt")
}

/// Vision-model detector driven through a tool call.
#[derive(Debug, Clone)]
pub struct LlmDetector<P> {
    provider: P,
    system_prompt: String,
}

impl<P: Provider + 'static> LlmDetector<P> {
    pub fn new(provider: P) -> Result<Self> {
        Ok(Self {
            provider,
            system_prompt: render_system_prompt()?,
        })
    }
}

impl<P: Provider + 'static> FieldDetector for LlmDetector<P> {
    fn detect(&self, page: &Page) -> DetectionFuture {
        let provider = self.provider.clone();
        let system_prompt = self.system_prompt.clone();
        let page = page.clone();
        Box::pin(async move {
            let attachment = page_attachment(&page)?;
            debug!(
                "sending page {} ({} bytes) for field detection",
                page.number(),
                attachment.bytes.len()
            );
            let response = provider
                .append_system_input(system_prompt)
                .append_user_data(attachment)
                .append_user_input(format!(
                    "Page {}. Report its blanks with {}.",
                    page.number(),
                    TOOL_NAME
                ))
                .register_tool(tool_spec())
                .call_tool(TOOL_NAME)
                .await
                .with_context(|| format!("field detection failed for page {}", page.number()))?;
            let detections = parse_payload(&response.args);
            info!(
                "page {}: {} field(s) detected{}",
                page.number(),
                detections.len(),
                response
                    .model
                    .map(|model| format!(" by {}", model))
                    .unwrap_or_default()
            );
            Ok(detections)
        })
    }
}

/// Re-encodes the page raster as JPEG for upload.
fn page_attachment(page: &Page) -> Result<DataAttachment> {
    let image = image::load_from_memory(&page.image)
        .with_context(|| format!("failed to decode page {} raster", page.number()))?;
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&rgb)
        .with_context(|| format!("failed to encode page {} as jpeg", page.number()))?;
    Ok(DataAttachment {
        bytes,
        mime: JPEG_MIME.to_string(),
        name: Some(format!("page-{}.jpg", page.number())),
    })
}
