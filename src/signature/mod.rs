use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::data::PNG_MIME;
use crate::fields::ImageAsset;
use crate::render::{escape_xml, font_database, render_svg_bytes, svg_open};
use crate::settings::Settings;
use usvg::fontdb;

mod font;

pub use font::{FontMetrics, load_font_metrics, resolve_system_font};

const MAX_INITIALS: usize = 3;
const HORIZONTAL_MARGIN: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStyle {
    Classic,
    Modern,
    Artistic,
}

impl SignatureStyle {
    pub const ALL: [SignatureStyle; 3] = [
        SignatureStyle::Classic,
        SignatureStyle::Modern,
        SignatureStyle::Artistic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStyle::Classic => "classic",
            SignatureStyle::Modern => "modern",
            SignatureStyle::Artistic => "artistic",
        }
    }

    pub fn font_family(&self) -> &'static str {
        match self {
            SignatureStyle::Classic => "Great Vibes",
            SignatureStyle::Modern => "Dancing Script",
            SignatureStyle::Artistic => "Herr Von Muellerhoff",
        }
    }
}

impl fmt::Display for SignatureStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureStyle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|style| style.as_str() == wanted)
            .ok_or_else(|| {
                anyhow!(
                    "unknown signature style '{}' (expected classic, modern or artistic)",
                    s.trim()
                )
            })
    }
}

/// The two standing images applied to signature and initial fields.
#[derive(Debug, Clone)]
pub struct SignatureAssets {
    pub signature: Arc<ImageAsset>,
    pub initials: Arc<ImageAsset>,
}

#[derive(Debug, Clone)]
pub struct SignatureOptions {
    pub style: SignatureStyle,
    pub font_path: Option<PathBuf>,
    pub signature_width: u32,
    pub initials_width: u32,
    pub height: u32,
    pub font_size: f32,
}

impl SignatureOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            style: settings.signature_style,
            font_path: settings.signature_font_path.as_ref().map(PathBuf::from),
            signature_width: settings.signature_width,
            initials_width: settings.initials_width,
            height: settings.signature_height,
            font_size: settings.signature_font_size,
        }
    }

    pub fn with_style(mut self, style: SignatureStyle) -> Self {
        self.style = style;
        self
    }
}

impl Default for SignatureOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Uppercased first letters of the first three words.
pub fn initials(name: &str) -> String {
    name.split_whitespace()
        .take(MAX_INITIALS)
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Renders `name` and its initials in the chosen cursive style.
pub fn generate_assets(name: &str, options: &SignatureOptions) -> Result<SignatureAssets> {
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("a name is required to create a signature"));
    }
    let (font, fonts) = resolve_font(options)?;
    let family = font
        .as_ref()
        .and_then(FontMetrics::family)
        .unwrap_or(options.style.font_family())
        .to_string();
    debug!("rendering signature for '{}' with '{}'", name, family);

    let signature = render_text_asset(
        name,
        options.signature_width,
        options,
        &family,
        font.as_ref(),
        &fonts,
    )?;
    let initials = render_text_asset(
        &initials(name),
        options.initials_width,
        options,
        &family,
        font.as_ref(),
        &fonts,
    )?;
    Ok(SignatureAssets {
        signature: Arc::new(signature),
        initials: Arc::new(initials),
    })
}

/// The face used for measuring plus the database resvg renders with. The
/// database is built once and shared by both assets.
fn resolve_font(options: &SignatureOptions) -> Result<(Option<FontMetrics>, Arc<fontdb::Database>)> {
    if let Some(path) = &options.font_path {
        let font = load_font_metrics(path)?;
        let fonts = font_database(Some(font.data()));
        return Ok((Some(font), fonts));
    }
    let fonts = font_database(None);
    let font = resolve_system_font(&fonts, &[options.style.font_family()]);
    if font.is_none() {
        warn!(
            "font '{}' is not installed and no cursive fallback was found; set signature.font_path",
            options.style.font_family()
        );
    }
    Ok((font, fonts))
}

fn render_text_asset(
    text: &str,
    width: u32,
    options: &SignatureOptions,
    family: &str,
    font: Option<&FontMetrics>,
    fonts: &Arc<fontdb::Database>,
) -> Result<ImageAsset> {
    let width = width.max(1);
    let height = options.height.max(1);
    let size = font::fit_font_size(
        text,
        options.font_size,
        width as f32 * HORIZONTAL_MARGIN,
        font,
    );
    let baseline = height as f32 / 2.0 + size * 0.35;

    let mut svg = svg_open(width, height);
    svg.push_str(&format!(
        r##"<text x="{x}" y="{y}" font-size="{size}" font-family="{family}" text-anchor="middle" fill="#000000">{text}</text>"##,
        x = width as f32 / 2.0,
        y = baseline,
        size = size,
        family = escape_xml(&format!("'{}', cursive", family)),
        text = escape_xml(text)
    ));
    svg.push_str("</svg>");

    let bytes = render_svg_bytes(&svg, PNG_MIME, fonts)?;
    Ok(ImageAsset {
        bytes,
        mime: PNG_MIME.to_string(),
        width,
        height,
    })
}
