use anyhow::{Result, anyhow};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compose::{ExportOptions, compose_document};
use crate::data::DataAttachment;
use crate::detection::FieldDetector;
use crate::fields::{Field, FieldId, FieldKind, FieldStore, KindCounts, RawDetection};
use crate::geometry::{OverlayRect, to_overlay_rect};
use crate::navigation::{DetectionState, DetectionTicket, DetectionTracker};
use crate::raster::{Page, Rasterizer};
use crate::signature::SignatureAssets;
use crate::toggle::{self, ToggleOutcome};

pub type SharedSession = Arc<Mutex<Session>>;

/// Identifies one detection pass within one loaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionKey {
    epoch: u64,
    ticket: DetectionTicket,
}

impl DetectionKey {
    pub fn page_index(&self) -> usize {
        self.ticket.page_index
    }
}

/// A detection the caller must run and hand back through
/// [`Session::complete_detection`].
#[derive(Debug, Clone)]
pub struct PendingDetection {
    pub key: DetectionKey,
    pub page: Page,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    Merged(Vec<FieldId>),
    /// The detector failed; the page kept its fields.
    Failed,
    /// The pass was superseded or belongs to a previous document.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldOverlay {
    pub id: FieldId,
    pub kind: FieldKind,
    pub rect: OverlayRect,
    pub style: String,
    pub filled: bool,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageSummary {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub state: DetectionState,
    pub counts: KindCounts,
}

/// Everything one document-editing session knows. Loading a document
/// resets all of it.
#[derive(Debug, Default)]
pub struct Session {
    pages: Vec<Page>,
    fields: FieldStore,
    current_page: usize,
    assets: Option<SignatureAssets>,
    tracker: DetectionTracker,
    document_name: Option<String>,
    epoch: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Rasterizes `document` and replaces the session with it. On failure
    /// the session is left as it was.
    pub async fn load_document(
        &mut self,
        rasterizer: &dyn Rasterizer,
        document: DataAttachment,
    ) -> Result<()> {
        let name = document.name.clone();
        let pages = rasterizer.rasterize(document).await?;
        self.load_pages(pages, name);
        Ok(())
    }

    pub fn load_pages(&mut self, pages: Vec<Page>, name: Option<String>) {
        info!(
            "loaded {} with {} page(s)",
            name.as_deref().unwrap_or("document"),
            pages.len()
        );
        let epoch = self.epoch + 1;
        *self = Self {
            tracker: DetectionTracker::new(pages.len()),
            pages,
            document_name: name,
            epoch,
            ..Self::default()
        };
    }

    pub fn has_document(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn document_name(&self) -> Option<&str> {
        self.document_name.as_deref()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    pub fn assets(&self) -> Option<&SignatureAssets> {
        self.assets.as_ref()
    }

    pub fn detection_state(&self, page_index: usize) -> Option<DetectionState> {
        self.tracker.state(page_index)
    }

    pub fn page_summary(&self, page_index: usize) -> Option<PageSummary> {
        let page = self.pages.get(page_index)?;
        Some(PageSummary {
            index: page.index,
            width: page.width,
            height: page.height,
            state: self.tracker.state(page_index)?,
            counts: self.fields.kind_counts(page_index),
        })
    }

    /// Makes `page_index` current. Returns the detection to run when this
    /// is the first view of a page without fields.
    pub fn show_page(&mut self, page_index: usize) -> Result<Option<PendingDetection>> {
        if page_index >= self.pages.len() {
            return Err(anyhow!(
                "page {} is out of range (document has {} page(s))",
                page_index + 1,
                self.pages.len()
            ));
        }
        self.current_page = page_index;
        let field_count = self.fields.fields_for_page(page_index).len();
        let ticket = self.tracker.on_show(page_index, field_count);
        Ok(ticket.map(|ticket| self.pending(ticket)))
    }

    /// Advances one page. With `prefetch`, detection of the page after the
    /// new one is started too. Does nothing on the last page.
    pub fn next_page(&mut self, prefetch: bool) -> Vec<PendingDetection> {
        let next = self.current_page + 1;
        if next >= self.pages.len() {
            return Vec::new();
        }
        let mut pending = self.show_page(next).ok().flatten().into_iter().collect::<Vec<_>>();
        if prefetch {
            pending.extend(self.prefetch(next + 1));
        }
        pending
    }

    /// Starts detection of a page that has not been shown yet, without
    /// making it current.
    pub fn prefetch(&mut self, page_index: usize) -> Option<PendingDetection> {
        if page_index >= self.pages.len() {
            return None;
        }
        let field_count = self.fields.fields_for_page(page_index).len();
        let ticket = self.tracker.on_show(page_index, field_count)?;
        debug!("prefetching detection for page {}", page_index + 1);
        Some(self.pending(ticket))
    }

    pub fn prev_page(&mut self) -> Option<PendingDetection> {
        let prev = self.current_page.checked_sub(1)?;
        self.show_page(prev).ok().flatten()
    }

    /// Forces a fresh pass on `page_index` unless one is already running.
    pub fn request_rescan(&mut self, page_index: usize) -> Option<PendingDetection> {
        let ticket = self.tracker.on_rescan(page_index)?;
        Some(self.pending(ticket))
    }

    /// Tickets for every page that has never been looked at.
    pub fn pending_for_unvisited(&mut self) -> Vec<PendingDetection> {
        let unvisited = (0..self.pages.len())
            .filter(|&index| self.tracker.state(index) == Some(DetectionState::Unvisited))
            .collect::<Vec<_>>();
        unvisited
            .into_iter()
            .filter_map(|index| self.request_rescan(index))
            .collect()
    }

    /// Applies a finished pass to the page it was started for.
    pub fn complete_detection(
        &mut self,
        key: DetectionKey,
        result: Result<Vec<RawDetection>>,
    ) -> DetectionOutcome {
        if key.epoch != self.epoch || !self.tracker.finish(key.ticket) {
            debug!("discarding stale detection for page {}", key.page_index() + 1);
            return DetectionOutcome::Stale;
        }
        match result {
            Ok(detections) => {
                let ids = self.fields.merge_detections(key.page_index(), detections);
                info!("page {}: {} field(s)", key.page_index() + 1, ids.len());
                DetectionOutcome::Merged(ids)
            }
            Err(err) => {
                warn!(
                    "field detection failed for page {}: {:#}",
                    key.page_index() + 1,
                    err
                );
                DetectionOutcome::Failed
            }
        }
    }

    pub fn set_signature_assets(&mut self, assets: SignatureAssets) {
        self.assets = Some(assets);
    }

    /// Forgets the standing assets. Fields already signed keep their image.
    pub fn clear_signature_assets(&mut self) {
        self.assets = None;
    }

    pub fn toggle_field(&mut self, id: FieldId) -> ToggleOutcome {
        toggle::toggle_signature(&mut self.fields, self.assets.as_ref(), id)
    }

    pub fn update_text(&mut self, id: FieldId, text: impl Into<String>) -> bool {
        toggle::update_text(&mut self.fields, id, text)
    }

    /// Signs every empty signature and initial field.
    pub fn sign_all(&mut self) -> usize {
        let empty = self
            .fields
            .all()
            .iter()
            .filter(|field| field.kind().takes_image() && !field.is_filled())
            .map(|field| field.id())
            .collect::<Vec<_>>();
        empty
            .into_iter()
            .filter(|id| self.toggle_field(*id) == ToggleOutcome::Applied)
            .count()
    }

    /// Placement of the page's fields over its rendered image.
    pub fn overlays(&self, page_index: usize) -> Vec<FieldOverlay> {
        self.fields
            .fields_for_page(page_index)
            .into_iter()
            .filter_map(field_overlay)
            .collect()
    }

    pub fn field_overlay(&self, id: FieldId) -> Option<FieldOverlay> {
        self.fields.get(id).and_then(field_overlay)
    }

    pub fn export(&self, options: &ExportOptions) -> Result<Vec<u8>> {
        if !self.has_document() {
            return Err(anyhow!("no document loaded"));
        }
        compose_document(&self.pages, &toggle::export_fields(&self.fields), options)
    }

    fn pending(&self, ticket: DetectionTicket) -> PendingDetection {
        PendingDetection {
            key: DetectionKey {
                epoch: self.epoch,
                ticket,
            },
            page: self.pages[ticket.page_index].clone(),
        }
    }
}

fn field_overlay(field: &Field) -> Option<FieldOverlay> {
    let rect = to_overlay_rect(field.bbox());
    if !rect.is_renderable() {
        return None;
    }
    Some(FieldOverlay {
        id: field.id(),
        kind: field.kind(),
        style: rect.css_style(),
        rect,
        filled: field.is_filled(),
        text: field.text().map(|text| text.to_string()),
    })
}

/// Runs one pass without touching the session.
pub async fn run_detection(
    detector: &dyn FieldDetector,
    pending: PendingDetection,
) -> (DetectionKey, Result<Vec<RawDetection>>) {
    let result = detector.detect(&pending.page).await;
    (pending.key, result)
}

/// Runs a pass for a shared session. The lock is only taken to apply the
/// result, never while the detector is working.
pub async fn detect_and_merge(
    session: &SharedSession,
    detector: &dyn FieldDetector,
    pending: PendingDetection,
) -> DetectionOutcome {
    let (key, result) = run_detection(detector, pending).await;
    session.lock().await.complete_detection(key, result)
}
