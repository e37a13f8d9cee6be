use serde::{Deserialize, Serialize};

use crate::session::{FieldOverlay, PageSummary};
use crate::toggle::ToggleOutcome;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct CreateSessionRequest {
    pub(crate) data_base64: Option<String>,
    pub(crate) mime: Option<String>,
    pub(crate) name: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSessionResponse {
    pub(crate) session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    pub(crate) pages: Vec<PageSummary>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PageView {
    pub(crate) page: PageSummary,
    pub(crate) current: usize,
    pub(crate) page_count: usize,
    pub(crate) mime: String,
    pub(crate) image_base64: String,
    pub(crate) fields: Vec<FieldOverlay>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct SignatureRequest {
    pub(crate) name: Option<String>,
    pub(crate) style: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SignatureResponse {
    pub(crate) style: String,
    pub(crate) initials: String,
    pub(crate) mime: String,
    pub(crate) signature_base64: String,
    pub(crate) initials_base64: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ToggleResponse {
    pub(crate) outcome: ToggleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) field: Option<FieldOverlay>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct TextRequest {
    pub(crate) text: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FieldResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) field: Option<FieldOverlay>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExportResponse {
    pub(crate) name: String,
    pub(crate) mime: String,
    pub(crate) data_base64: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}
