use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use futures_util::stream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub mod compose;
pub mod data;
pub mod detection;
pub mod fields;
pub mod geometry;
pub mod logging;
pub mod navigation;
mod providers;
pub mod raster;
mod render;
pub mod server;
pub mod session;
pub mod settings;
pub mod signature;
pub mod toggle;

#[cfg(test)]
mod test_util;

pub use providers::{Gemini, OpenAI, Provider, ProviderImpl, ProviderKind, ProviderUsage, ToolSpec};

use crate::compose::ExportOptions;
use crate::detection::LlmDetector;
use crate::fields::{FieldId, FieldKind};
use crate::raster::CommandRasterizer;
use crate::session::{Session, run_detection};
use crate::signature::{SignatureOptions, SignatureStyle};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub data: Option<String>,
    pub data_mime: Option<String>,
    pub name: Option<String>,
    pub style: Option<String>,
    pub sign_all: bool,
    pub fill_pages: Vec<String>,
    pub list_fields: bool,
    pub output: Option<String>,
    pub model: Option<String>,
    pub key: Option<String>,
    pub settings_path: Option<String>,
}

/// Detects every page of `--data`, applies the requested fills and writes
/// the flattened PDF. Returns the report printed by the CLI.
pub async fn run(config: Config) -> Result<String> {
    let settings = load_config_settings(&config)?;
    let path = config
        .data
        .as_deref()
        .ok_or_else(|| anyhow!("--data is required"))?;
    let document = data::load_document(Path::new(path), config.data_mime.as_deref())?;

    let detector = build_detector(config.model.as_deref(), config.key.as_deref(), &settings)?;
    let rasterizer = CommandRasterizer::new(settings.raster_dpi);
    let mut session = Session::new();
    session.load_document(&rasterizer, document).await?;

    let pending = session.pending_for_unvisited();
    let results = stream::iter(pending)
        .map(|pending| run_detection(&detector, pending))
        .buffer_unordered(settings.detection_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
    for (key, result) in results {
        session.complete_detection(key, result);
    }

    if let Some(name) = config.name.as_deref() {
        let options = SignatureOptions::from_settings(&settings);
        session.set_signature_assets(signature::generate_assets(name, &options)?);
    }
    if config.sign_all {
        if session.assets().is_none() {
            return Err(anyhow!("--sign-all requires --name"));
        }
        let signed = session.sign_all();
        info!("signed {} field(s)", signed);
    }
    for fill in &config.fill_pages {
        let (page, ordinal, text) = parse_fill_page(fill)?;
        let id = text_field_at(&session, page, ordinal).ok_or_else(|| {
            anyhow!("page {} has no text field #{}", page + 1, ordinal + 1)
        })?;
        apply_text(&mut session, id, text)?;
    }

    let mut report = Vec::new();
    if config.list_fields {
        report.push(format_field_table(&session));
    }
    let output = PathBuf::from(
        config
            .output
            .clone()
            .unwrap_or_else(|| settings.output_name.clone()),
    );
    let pdf = session.export(&ExportOptions::from_settings(&settings))?;
    std::fs::write(&output, pdf)
        .with_context(|| format!("failed to write output: {}", output.display()))?;
    report.push(format!(
        "wrote {} ({} page(s), {} field(s))",
        output.display(),
        session.page_count(),
        session.fields().len()
    ));
    Ok(report.join("\n"))
}

/// Serves the multi-session editing API until the process is stopped.
pub async fn serve(config: Config, addr: Option<String>) -> Result<()> {
    let settings = load_config_settings(&config)?;
    let detector = build_detector(config.model.as_deref(), config.key.as_deref(), &settings)?;
    let addr = addr
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| settings.server_addr.clone());
    let rasterizer = Arc::new(CommandRasterizer::new(settings.raster_dpi));
    server::run_server(settings, addr, rasterizer, Arc::new(detector)).await
}

fn load_config_settings(config: &Config) -> Result<settings::Settings> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    if let Some(style) = config.style.as_deref() {
        settings.signature_style = style.parse::<SignatureStyle>()?;
    }
    Ok(settings)
}

pub fn build_detector(
    model: Option<&str>,
    key: Option<&str>,
    settings: &settings::Settings,
) -> Result<LlmDetector<ProviderImpl>> {
    let selection = match model {
        Some(model) => providers::resolve_provider_selection(Some(model), key)?,
        // The configured model only wins when its provider has a key.
        None => match settings
            .detection_model
            .as_deref()
            .map(|model| providers::resolve_provider_selection(Some(model), key))
            .transpose()?
            .filter(|selection| providers::resolve_key(selection.provider, key).is_ok())
        {
            Some(selection) => selection,
            None => providers::resolve_provider_selection(None, key)?,
        },
    };
    let key = providers::resolve_key(selection.provider, key)
        .with_context(|| "no API key found for selected provider")?;
    info!(
        "detecting fields with {}:{}",
        selection.provider.as_str(),
        selection
            .requested_model
            .as_deref()
            .unwrap_or(selection.provider.default_model())
    );
    let provider = providers::build_provider(selection.provider, key, selection.requested_model);
    LlmDetector::new(provider)
}

fn apply_text(session: &mut Session, id: FieldId, text: String) -> Result<()> {
    if session.update_text(id, text) {
        Ok(())
    } else {
        Err(anyhow!("{} is not a text field of this document", id))
    }
}

/// `PAGE:INDEX=TEXT`, both one-based. Returns zero-based positions.
fn parse_fill_page(raw: &str) -> Result<(usize, usize, String)> {
    let (position, text) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected PAGE:INDEX=TEXT, got '{}'", raw))?;
    let (page, ordinal) = position
        .split_once(':')
        .ok_or_else(|| anyhow!("expected PAGE:INDEX=TEXT, got '{}'", raw))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|number| number.checked_sub(1))
            .ok_or_else(|| anyhow!("'{}' is not a page/field number starting at 1", value.trim()))
    };
    Ok((parse(page)?, parse(ordinal)?, text.to_string()))
}

fn text_field_at(session: &Session, page: usize, ordinal: usize) -> Option<FieldId> {
    session
        .fields()
        .fields_for_page(page)
        .into_iter()
        .filter(|field| field.kind() == FieldKind::Text)
        .nth(ordinal)
        .map(|field| field.id())
}

fn format_field_table(session: &Session) -> String {
    let mut lines = Vec::new();
    for page in 0..session.page_count() {
        let counts = session.fields().kind_counts(page);
        lines.push(format!(
            "page {}: {} signature, {} initial, {} text",
            page + 1,
            counts.signature,
            counts.initial,
            counts.text
        ));
        for field in session.fields().fields_for_page(page) {
            let bbox = field.bbox();
            let value = match field.text() {
                Some(text) => format!("\"{}\"", text),
                None if field.is_filled() => "signed".to_string(),
                None => "-".to_string(),
            };
            lines.push(format!(
                "  {}\t{}\t[{}, {}, {}, {}]\t{}",
                field.id(),
                field.kind().as_str(),
                bbox.ymin,
                bbox.xmin,
                bbox.ymax,
                bbox.xmax,
                value
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::RawDetection;
    use crate::geometry::BoundingBox;
    use crate::raster::Page;
    use crate::test_util::solid_png;

    fn session_with_text_fields() -> Session {
        let mut session = Session::new();
        session.load_pages(
            vec![Page::from_encoded(0, solid_png(10, 10, [255, 255, 255, 255])).unwrap()],
            None,
        );
        let pending = session.show_page(0).unwrap().unwrap();
        session.complete_detection(
            pending.key,
            Ok(vec![
                RawDetection::new(BoundingBox::new(100.0, 100.0, 150.0, 500.0), "text"),
                RawDetection::new(BoundingBox::new(200.0, 100.0, 300.0, 500.0), "signature"),
                RawDetection::new(BoundingBox::new(400.0, 100.0, 450.0, 500.0), "text"),
            ]),
        );
        session
    }

    #[test]
    fn page_fill_arguments_are_one_based() {
        assert_eq!(
            parse_fill_page("2:1=2024-01-01").unwrap(),
            (1, 0, "2024-01-01".to_string())
        );
        assert!(parse_fill_page("0:1=x").is_err());
        assert!(parse_fill_page("1=x").is_err());
        assert!(parse_fill_page("a:b=x").is_err());
    }

    #[test]
    fn text_fields_are_counted_per_page() {
        let session = session_with_text_fields();
        let all = session.fields().all();
        assert_eq!(text_field_at(&session, 0, 0), Some(all[0].id()));
        assert_eq!(text_field_at(&session, 0, 1), Some(all[2].id()));
        assert_eq!(text_field_at(&session, 0, 2), None);
        assert_eq!(text_field_at(&session, 1, 0), None);
    }

    #[test]
    fn text_cannot_target_signature_fields() {
        let mut session = session_with_text_fields();
        let signature = session.fields().all()[1].id();
        assert!(apply_text(&mut session, signature, "x".to_string()).is_err());
    }

    #[test]
    fn field_table_lists_counts_and_values() {
        let mut session = session_with_text_fields();
        let first = session.fields().all()[0].id();
        session.update_text(first, "Jane");
        let table = format_field_table(&session);
        let lines = table.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "page 1: 1 signature, 0 initial, 2 text");
        assert!(lines[1].ends_with("text\t[100, 100, 150, 500]\t\"Jane\""));
        assert!(lines[2].ends_with("signature\t[200, 100, 300, 500]\t-"));
    }
}
