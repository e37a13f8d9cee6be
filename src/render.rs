use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use resvg::render;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use crate::data::image_format_from_mime;

pub(crate) fn svg_open(width: u32, height: u32) -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    )
}

/// `<image>` element with the bytes inlined as a data URI.
pub(crate) fn svg_image(
    bytes: &[u8],
    mime: &str,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    aspect: &str,
) -> String {
    let uri = format!("data:{};base64,{}", mime, BASE64.encode(bytes));
    format!(
        r#"<image href="{uri}" xlink:href="{uri}" x="{x}" y="{y}" width="{w}" height="{h}" preserveAspectRatio="{aspect}"/>"#,
        uri = uri,
        x = x,
        y = y,
        w = width,
        h = height,
        aspect = aspect
    )
}

/// System fonts plus an optional extra face. Loading scans every font
/// directory, so callers build this once and share it across renders.
pub(crate) fn font_database(extra: Option<&[u8]>) -> Arc<fontdb::Database> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    if let Some(data) = extra {
        db.load_font_data(data.to_vec());
    }
    Arc::new(db)
}

pub(crate) fn has_sans_serif(db: &fontdb::Database) -> bool {
    let families = [fontdb::Family::SansSerif];
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    db.query(&query).is_some()
}

/// Rasterizes an SVG document and encodes it as `output_mime`.
pub fn render_svg_bytes(svg: &str, output_mime: &str, fonts: &Arc<fontdb::Database>) -> Result<Vec<u8>> {
    let options = Options {
        fontdb: fonts.clone(),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    let mut pixmap_mut = pixmap.as_mut();
    render(&tree, tiny_skia::Transform::identity(), &mut pixmap_mut);
    let image = image::RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))?;
    let format = image_format_from_mime(output_mime)
        .ok_or_else(|| anyhow!("unsupported output image mime '{}'", output_mime))?;
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    let image = image::DynamicImage::ImageRgba8(image);
    // JPEG has no alpha channel.
    let image = if format == image::ImageFormat::Jpeg {
        image::DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image
    };
    image
        .write_to(&mut cursor, format)
        .with_context(|| "failed to encode image from SVG")?;
    Ok(bytes)
}

pub(crate) fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
