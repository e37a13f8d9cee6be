use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::Face;
use ttf_parser::name_id;
use usvg::fontdb;

#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    family: Option<String>,
    face_index: u32,
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("face_index", &self.face_index)
            .finish()
    }
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(&data, None)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

/// First installed family among `families`, then any cursive face.
pub fn resolve_system_font(db: &fontdb::Database, families: &[&str]) -> Option<FontMetrics> {
    families
        .iter()
        .find_map(|&family| query_family(db, fontdb::Family::Name(family), Some(family)))
        .or_else(|| query_family(db, fontdb::Family::Cursive, None))
}

fn query_family(
    db: &fontdb::Database,
    family: fontdb::Family<'_>,
    expected: Option<&str>,
) -> Option<FontMetrics> {
    let families = [family];
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db.query(&query)?;
    let data = db.with_face_data(id, |data, _index| data.to_vec())?;
    load_font_metrics_from_data(&data, expected).ok()
}

pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font {
        if let Ok(face) = Face::parse(&font.data, font.face_index) {
            let advance = text
                .chars()
                .filter(|ch| *ch != '\n')
                .map(|ch| {
                    face.glyph_index(ch)
                        .filter(|_| ch != ' ')
                        .and_then(|glyph| face.glyph_hor_advance(glyph))
                        .unwrap_or(font.space_advance) as u32
                })
                .fold(0u32, u32::saturating_add);
            let units = font.units_per_em.max(1) as f32;
            return advance as f32 * (font_size / units);
        }
    }
    estimate_text_width_units(text) * font_size
}

/// Largest size up to `preferred` at which `text` spans at most `max_width`.
pub(crate) fn fit_font_size(
    text: &str,
    preferred: f32,
    max_width: f32,
    font: Option<&FontMetrics>,
) -> f32 {
    let measured = measure_text_width_px(text, preferred, font);
    if measured <= max_width || measured <= 0.0 {
        preferred
    } else {
        preferred * (max_width / measured)
    }
}

fn estimate_text_width_units(text: &str) -> f32 {
    text.chars()
        .map(|ch| {
            if ch.is_whitespace() {
                0.25
            } else if ch.is_ascii_alphanumeric() {
                0.55
            } else if ch.is_ascii() {
                0.35
            } else {
                0.9
            }
        })
        .sum()
}

fn load_font_metrics_from_data(data: &[u8], preferred_family: Option<&str>) -> Result<FontMetrics> {
    let mut fallback = None;
    let count = ttf_parser::fonts_in_collection(data).unwrap_or(1);
    for index in 0..count {
        let Ok(face) = Face::parse(data, index) else {
            continue;
        };
        let family = extract_family_name(&face);
        let units_per_em = face.units_per_em().max(1);
        let space_advance = face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 2);
        let metrics = FontMetrics {
            data: Arc::new(data.to_vec()),
            units_per_em,
            space_advance,
            family: family.clone(),
            face_index: index,
        };
        if let (Some(preferred), Some(found)) = (preferred_family, &family) {
            if found.eq_ignore_ascii_case(preferred) {
                return Ok(metrics);
            }
        }
        if fallback.is_none() {
            fallback = Some(metrics);
        }
    }
    if preferred_family.is_some() {
        return Err(anyhow!("font family not found in font file"));
    }
    fallback.ok_or_else(|| anyhow!("failed to parse font data"))
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
