use serde::Serialize;

use crate::fields::{Field, FieldId, FieldKind, FieldStore, FieldValue};
use crate::signature::SignatureAssets;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleOutcome {
    Applied,
    Cleared,
    /// No signature has been created for the session yet.
    NoAssets,
    UnknownField,
    NotToggleable,
}

/// Click on a signature or initial field: clear it when filled, otherwise
/// apply the standing asset that matches the field kind.
pub fn toggle_signature(
    store: &mut FieldStore,
    assets: Option<&SignatureAssets>,
    id: FieldId,
) -> ToggleOutcome {
    let Some(assets) = assets else {
        return ToggleOutcome::NoAssets;
    };
    let Some(field) = store.get(id) else {
        return ToggleOutcome::UnknownField;
    };
    let value = match field.kind() {
        FieldKind::Text => return ToggleOutcome::NotToggleable,
        _ if field.is_filled() => None,
        FieldKind::Initial => Some(FieldValue::Image(assets.initials.clone())),
        FieldKind::Signature => Some(FieldValue::Image(assets.signature.clone())),
    };
    let cleared = value.is_none();
    if !store.set_value(id, value) {
        return ToggleOutcome::UnknownField;
    }
    if cleared {
        ToggleOutcome::Cleared
    } else {
        ToggleOutcome::Applied
    }
}

/// Overwrites a text field with whatever was typed, including nothing.
pub fn update_text(store: &mut FieldStore, id: FieldId, text: impl Into<String>) -> bool {
    store.set_value(id, Some(FieldValue::Text(text.into())))
}

/// Fields that carry something to burn into the page.
pub fn export_fields(store: &FieldStore) -> Vec<&Field> {
    store.all().iter().filter(|field| field.is_filled()).collect()
}
