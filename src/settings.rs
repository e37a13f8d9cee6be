use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::signature::SignatureStyle;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub raster_dpi: u32,
    pub detection_model: Option<String>,
    pub detection_concurrency: usize,
    pub prefetch_next: bool,
    pub signature_style: SignatureStyle,
    pub signature_font_path: Option<String>,
    pub signature_width: u32,
    pub initials_width: u32,
    pub signature_height: u32,
    pub signature_font_size: f32,
    pub text_min_font_size: f32,
    pub text_height_ratio: f32,
    pub text_padding: f32,
    pub text_color: String,
    pub output_name: String,
    pub server_addr: String,
    pub server_max_upload_bytes: usize,
    /// Idle sessions are dropped after this many seconds; 0 keeps them forever.
    pub session_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            raster_dpi: 144,
            detection_model: None,
            detection_concurrency: 2,
            prefetch_next: true,
            signature_style: SignatureStyle::Classic,
            signature_font_path: None,
            signature_width: 600,
            initials_width: 300,
            signature_height: 200,
            signature_font_size: 100.0,
            text_min_font_size: 10.0,
            text_height_ratio: 0.6,
            text_padding: 2.0,
            text_color: "#000000".to_string(),
            output_name: "signed_document.pdf".to_string(),
            server_addr: "127.0.0.1:8787".to_string(),
            server_max_upload_bytes: 64 * 1024 * 1024,
            session_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    raster: Option<RasterSettings>,
    detection: Option<DetectionSettings>,
    signature: Option<SignatureSettings>,
    export: Option<ExportSettings>,
    server: Option<ServerSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct RasterSettings {
    dpi: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionSettings {
    model: Option<String>,
    concurrency: Option<usize>,
    prefetch_next: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct SignatureSettings {
    style: Option<String>,
    font_path: Option<String>,
    signature_width: Option<u32>,
    initials_width: Option<u32>,
    height: Option<u32>,
    font_size: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct ExportSettings {
    text_min_font_size: Option<f32>,
    text_height_ratio: Option<f32>,
    text_padding: Option<f32>,
    text_color: Option<String>,
    output_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSettings {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
    session_ttl_secs: Option<u64>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    let defaults: SettingsFile =
        toml::from_str(DEFAULT_SETTINGS_TOML).with_context(|| "failed to parse built-in settings")?;
    settings.merge(defaults)?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings
                .merge_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        }
    }

    Ok(settings)
}

impl Settings {
    pub fn merge_str(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(raster) = incoming.raster {
            if let Some(dpi) = raster.dpi {
                if dpi > 0 {
                    self.raster_dpi = dpi;
                }
            }
        }
        if let Some(detection) = incoming.detection {
            if let Some(model) = detection.model {
                if !model.trim().is_empty() {
                    self.detection_model = Some(model);
                }
            }
            if let Some(concurrency) = detection.concurrency {
                if concurrency > 0 {
                    self.detection_concurrency = concurrency;
                }
            }
            if let Some(prefetch) = detection.prefetch_next {
                self.prefetch_next = prefetch;
            }
        }
        if let Some(signature) = incoming.signature {
            if let Some(style) = signature.style {
                if !style.trim().is_empty() {
                    self.signature_style = style.parse()?;
                }
            }
            if let Some(path) = signature.font_path {
                if !path.trim().is_empty() {
                    self.signature_font_path = Some(path);
                }
            }
            if let Some(width) = signature.signature_width {
                if width > 0 {
                    self.signature_width = width;
                }
            }
            if let Some(width) = signature.initials_width {
                if width > 0 {
                    self.initials_width = width;
                }
            }
            if let Some(height) = signature.height {
                if height > 0 {
                    self.signature_height = height;
                }
            }
            if let Some(size) = signature.font_size {
                if size > 0.0 {
                    self.signature_font_size = size;
                }
            }
        }
        if let Some(export) = incoming.export {
            if let Some(size) = export.text_min_font_size {
                if size > 0.0 {
                    self.text_min_font_size = size;
                }
            }
            if let Some(ratio) = export.text_height_ratio {
                if ratio > 0.0 {
                    self.text_height_ratio = ratio;
                }
            }
            if let Some(padding) = export.text_padding {
                if padding >= 0.0 {
                    self.text_padding = padding;
                }
            }
            if let Some(color) = export.text_color {
                if !color.trim().is_empty() {
                    self.text_color = color;
                }
            }
            if let Some(name) = export.output_name {
                if !name.trim().is_empty() {
                    self.output_name = name;
                }
            }
        }
        if let Some(server) = incoming.server {
            if let Some(addr) = server.addr {
                if !addr.trim().is_empty() {
                    self.server_addr = addr;
                }
            }
            if let Some(limit) = server.max_upload_bytes {
                if limit > 0 {
                    self.server_max_upload_bytes = limit;
                }
            }
            if let Some(ttl) = server.session_ttl_secs {
                self.session_ttl_secs = ttl;
            }
        }
        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".pdf-autosign"))
        }
    })
}
