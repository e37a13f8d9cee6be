use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::PNG_MIME;
use crate::fields::{Field, FieldId, FieldValue, ImageAsset};
use crate::geometry::{PixelRect, to_absolute_pixels};
use crate::raster::Page;
use crate::render::{escape_xml, font_database, has_sans_serif, render_svg_bytes, svg_image, svg_open};
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub dpi: u32,
    pub text_min_font_size: f32,
    pub text_height_ratio: f32,
    pub text_padding: f32,
    pub text_color: String,
    pub title: String,
}

impl ExportOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            dpi: settings.raster_dpi,
            text_min_font_size: settings.text_min_font_size,
            text_height_ratio: settings.text_height_ratio,
            text_padding: settings.text_padding,
            text_color: settings.text_color.clone(),
            title: settings.output_name.clone(),
        }
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone)]
pub enum OverlayContent {
    Image(Arc<ImageAsset>),
    Text {
        text: String,
        font_size: f64,
        x: f64,
        baseline: f64,
    },
}

/// A filled field placed in the pixel space of its page raster.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub field_id: FieldId,
    pub rect: PixelRect,
    pub content: OverlayContent,
}

/// Places the filled fields of `page`. Fields of other pages, unfilled
/// fields and boxes with no positive area are left out.
pub fn plan_page(page: &Page, fields: &[&Field], options: &ExportOptions) -> Vec<Overlay> {
    fields
        .iter()
        .filter(|field| field.page_index() == page.index)
        .filter_map(|field| {
            let rect = to_absolute_pixels(field.bbox(), page.width as f64, page.height as f64);
            if !rect.is_renderable() {
                warn!(
                    "skipping field {} on page {}: box has no drawable area",
                    field.id(),
                    page.number()
                );
                return None;
            }
            let content = match field.value()? {
                FieldValue::Image(asset) => OverlayContent::Image(asset.clone()),
                FieldValue::Text(text) if text.is_empty() => return None,
                FieldValue::Text(text) => {
                    let font_size = (rect.height * options.text_height_ratio as f64)
                        .max(options.text_min_font_size as f64);
                    OverlayContent::Text {
                        text: text.clone(),
                        font_size,
                        x: rect.x + options.text_padding as f64,
                        baseline: rect.y + rect.height / 2.0 + font_size / 3.0,
                    }
                }
            };
            Some(Overlay {
                field_id: field.id(),
                rect,
                content,
            })
        })
        .collect()
}

pub fn page_svg(page: &Page, overlays: &[Overlay], options: &ExportOptions) -> String {
    let mut svg = svg_open(page.width, page.height);
    svg.push_str(&svg_image(
        &page.image,
        &page.mime,
        0.0,
        0.0,
        page.width as f64,
        page.height as f64,
        "none",
    ));
    for overlay in overlays {
        let PixelRect {
            x,
            y,
            width,
            height,
        } = overlay.rect;
        match &overlay.content {
            OverlayContent::Image(asset) => {
                svg.push_str(&svg_image(
                    &asset.bytes,
                    &asset.mime,
                    x,
                    y,
                    width,
                    height,
                    "none",
                ));
            }
            OverlayContent::Text {
                text,
                font_size,
                x,
                baseline,
            } => {
                svg.push_str(&format!(
                    r#"<text x="{x}" y="{y}" font-size="{size}" font-family="sans-serif" fill="{color}">{text}</text>"#,
                    x = x,
                    y = baseline,
                    size = font_size,
                    color = escape_xml(&options.text_color),
                    text = escape_xml(text)
                ));
            }
        }
    }
    svg.push_str("</svg>");
    svg
}

/// Flattens every page with its filled fields and concatenates the pages,
/// in order, into one PDF.
pub fn compose_document(pages: &[Page], fields: &[&Field], options: &ExportOptions) -> Result<Vec<u8>> {
    if pages.is_empty() {
        return Err(anyhow!("no pages to export"));
    }
    let fonts = font_database(None);
    if fields.iter().any(|field| field.text().is_some()) && !has_sans_serif(&fonts) {
        warn!("no sans-serif font is installed; filled text will not be drawn");
    }
    let mut rendered = Vec::with_capacity(pages.len());
    for page in pages {
        let overlays = plan_page(page, fields, options);
        debug!("page {}: burning {} overlay(s)", page.number(), overlays.len());
        let svg = page_svg(page, &overlays, options);
        let bytes = render_svg_bytes(&svg, PNG_MIME, &fonts)
            .with_context(|| format!("failed to flatten page {}", page.number()))?;
        rendered.push(bytes);
    }
    let pdf = images_to_pdf(&rendered, options)?;
    info!("exported {} page(s), {} bytes", pages.len(), pdf.len());
    Ok(pdf)
}

fn images_to_pdf(pages: &[Vec<u8>], options: &ExportOptions) -> Result<Vec<u8>> {
    use printpdf::{Image, ImageTransform, Mm, PdfDocument};

    let dpi = options.dpi.max(1) as f32;
    let mut doc = None;
    let mut layers = Vec::new();

    for (idx, bytes) in pages.iter().enumerate() {
        let image = printpdf::image_crate::load_from_memory(bytes)
            .with_context(|| "failed to decode flattened page")?;
        let image = printpdf::image_crate::DynamicImage::ImageRgb8(image.to_rgb8());
        let width_mm = px_to_mm(image.width(), dpi);
        let height_mm = px_to_mm(image.height(), dpi);

        if idx == 0 {
            let (doc_handle, page, layer) =
                PdfDocument::new(options.title.as_str(), Mm(width_mm), Mm(height_mm), "Layer 1");
            doc = Some(doc_handle);
            layers.push((page, layer, image));
        } else if let Some(doc_handle) = doc.as_mut() {
            let (page, layer) =
                doc_handle.add_page(Mm(width_mm), Mm(height_mm), format!("Layer {}", idx + 1));
            layers.push((page, layer, image));
        }
    }

    let doc = doc.ok_or_else(|| anyhow!("no pages to render"))?;
    for (page, layer, image) in layers {
        let current_layer = doc.get_page(page).get_layer(layer);
        let pdf_image = Image::from_dynamic_image(&image);
        let transform = ImageTransform {
            translate_x: Some(Mm(0.0)),
            translate_y: Some(Mm(0.0)),
            rotate: None,
            scale_x: Some(1.0),
            scale_y: Some(1.0),
            dpi: Some(dpi),
        };
        pdf_image.add_to_layer(current_layer, transform);
    }

    let mut buffer = Vec::new();
    {
        let mut writer = std::io::BufWriter::new(&mut buffer);
        doc.save(&mut writer).with_context(|| "failed to write pdf")?;
    }
    Ok(buffer)
}

fn px_to_mm(px: u32, dpi: f32) -> f32 {
    px as f32 / dpi * 25.4
}
