use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::geometry::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Signature,
    Initial,
    Text,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Signature => "signature",
            FieldKind::Initial => "initial",
            FieldKind::Text => "text",
        }
    }

    /// Maps a detector type label onto the closed kind set; anything
    /// unrecognized is a text blank.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_lowercase().as_str() {
            "signature" => FieldKind::Signature,
            "initial" => FieldKind::Initial,
            _ => FieldKind::Text,
        }
    }

    pub fn takes_image(&self) -> bool {
        matches!(self, FieldKind::Signature | FieldKind::Initial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(Uuid);

impl FieldId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FieldId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Encoded raster shared by every field that displays it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Image(Arc<ImageAsset>),
    Text(String),
}

impl FieldValue {
    pub fn is_filled(&self) -> bool {
        match self {
            FieldValue::Image(_) => true,
            FieldValue::Text(text) => !text.is_empty(),
        }
    }

    fn fits(&self, kind: FieldKind) -> bool {
        match self {
            FieldValue::Image(_) => kind.takes_image(),
            FieldValue::Text(_) => !kind.takes_image(),
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Image(a), FieldValue::Image(b)) => Arc::ptr_eq(a, b) || a == b,
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    id: FieldId,
    page_index: usize,
    bbox: BoundingBox,
    kind: FieldKind,
    value: Option<FieldValue>,
}

impl Field {
    fn detected(page_index: usize, detection: RawDetection) -> Self {
        Self {
            id: FieldId::generate(),
            page_index,
            bbox: detection.bbox,
            kind: FieldKind::from_hint(&detection.hint),
            value: None,
        }
    }

    pub fn id(&self) -> FieldId {
        self.id
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn value(&self) -> Option<&FieldValue> {
        self.value.as_ref()
    }

    pub fn is_filled(&self) -> bool {
        self.value.as_ref().is_some_and(FieldValue::is_filled)
    }

    pub fn text(&self) -> Option<&str> {
        match &self.value {
            Some(FieldValue::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }
}

/// One entry of a detector batch before it becomes a field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub hint: String,
}

impl RawDetection {
    pub fn new(bbox: BoundingBox, hint: impl Into<String>) -> Self {
        Self {
            bbox,
            hint: hint.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub signature: usize,
    pub initial: usize,
    pub text: usize,
}

/// Authoritative field collection for one document.
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    fields: Vec<Field>,
}

impl FieldStore {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Replaces every field on `page_index` with one fresh field per
    /// detection. Fields on other pages keep their identity and order.
    pub fn merge_detections<I>(&mut self, page_index: usize, detections: I) -> Vec<FieldId>
    where
        I: IntoIterator<Item = RawDetection>,
    {
        let incoming = detections
            .into_iter()
            .map(|detection| Field::detected(page_index, detection))
            .collect::<Vec<_>>();
        let ids = incoming.iter().map(Field::id).collect();
        self.fields.retain(|field| field.page_index != page_index);
        self.fields.extend(incoming);
        ids
    }

    /// Overwrites a field value. Returns `false` without touching the
    /// store when the id is unknown or the value does not fit the kind.
    pub fn set_value(&mut self, id: FieldId, value: Option<FieldValue>) -> bool {
        let Some(field) = self.fields.iter_mut().find(|field| field.id == id) else {
            return false;
        };
        if let Some(value) = &value {
            if !value.fits(field.kind) {
                return false;
            }
        }
        field.value = value;
        true
    }

    pub fn get(&self, id: FieldId) -> Option<&Field> {
        self.fields.iter().find(|field| field.id == id)
    }

    pub fn fields_for_page(&self, page_index: usize) -> Vec<&Field> {
        self.fields
            .iter()
            .filter(|field| field.page_index == page_index)
            .collect()
    }

    pub fn all(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn kind_counts(&self, page_index: usize) -> KindCounts {
        let mut counts = KindCounts::default();
        for field in self.fields_for_page(page_index) {
            match field.kind {
                FieldKind::Signature => counts.signature += 1,
                FieldKind::Initial => counts.initial += 1,
                FieldKind::Text => counts.text += 1,
            }
        }
        counts
    }
}
