use anyhow::{anyhow, Context, Result};
use std::path::Path;

pub const PDF_MIME: &str = "application/pdf";
pub const PNG_MIME: &str = "image/png";
pub const JPEG_MIME: &str = "image/jpeg";

#[derive(Debug, Clone)]
pub struct DataAttachment {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub name: Option<String>,
}

pub fn load_document(path: &Path, mime_hint: Option<&str>) -> Result<DataAttachment> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read document: {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(|value| value.to_string());
    accept_document(bytes, mime_hint, name.as_deref())
}

/// Admits a document only when it is typed as a PDF. A declared type wins;
/// without one the bytes are sniffed, then the file extension is consulted.
pub fn accept_document(
    bytes: Vec<u8>,
    mime_hint: Option<&str>,
    name: Option<&str>,
) -> Result<DataAttachment> {
    let mime = resolve_mime(mime_hint, &bytes, name);
    if mime.as_deref() != Some(PDF_MIME) {
        return Err(anyhow!(
            "please upload a PDF file (got {})",
            mime.as_deref().unwrap_or("unknown type")
        ));
    }
    Ok(DataAttachment {
        bytes,
        mime: PDF_MIME.to_string(),
        name: name.map(|value| value.to_string()),
    })
}

pub fn sniff_mime(bytes: &[u8]) -> Option<String> {
    infer::get(bytes).map(|kind| kind.mime_type().to_string())
}

fn resolve_mime(mime_hint: Option<&str>, bytes: &[u8], name: Option<&str>) -> Option<String> {
    let hint = mime_hint
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty() && value != "auto");
    if let Some(hint) = hint {
        let base = hint.split(';').next().unwrap_or(hint.as_str()).trim();
        return Some(match base {
            "pdf" => PDF_MIME.to_string(),
            other => other.to_string(),
        });
    }
    if let Some(sniffed) = sniff_mime(bytes) {
        return Some(sniffed);
    }
    name.map(Path::new)
        .and_then(|path| path.extension())
        .and_then(|ext| ext.to_str())
        .and_then(|ext| mime_from_extension(&ext.to_lowercase()))
        .map(|mime| mime.to_string())
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "pdf" => Some(PDF_MIME),
        "png" => Some(PNG_MIME),
        "jpg" | "jpeg" => Some(JPEG_MIME),
        _ => None,
    }
}

pub fn image_format_from_mime(mime: &str) -> Option<image::ImageFormat> {
    match mime {
        PNG_MIME => Some(image::ImageFormat::Png),
        JPEG_MIME | "image/jpg" => Some(image::ImageFormat::Jpeg),
        "image/webp" => Some(image::ImageFormat::WebP),
        "image/bmp" => Some(image::ImageFormat::Bmp),
        _ => None,
    }
}
