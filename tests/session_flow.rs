use anyhow::anyhow;
use pdf_autosign::compose::{ExportOptions, OverlayContent, plan_page};
use pdf_autosign::data::{DataAttachment, accept_document};
use pdf_autosign::detection::{DetectionFuture, FieldDetector};
use pdf_autosign::fields::{FieldKind, FieldValue, RawDetection};
use pdf_autosign::geometry::BoundingBox;
use pdf_autosign::navigation::DetectionState;
use pdf_autosign::raster::{Page, RasterFuture, Rasterizer};
use pdf_autosign::session::{DetectionOutcome, Session, detect_and_merge, run_detection};
use pdf_autosign::signature::{SignatureOptions, generate_assets};
use pdf_autosign::toggle::{ToggleOutcome, export_fields};
use std::collections::HashMap;
use std::sync::Mutex;

const PAGE_WIDTH: u32 = 600;
const PAGE_HEIGHT: u32 = 800;

fn blank_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

struct BlankDocument {
    pages: usize,
}

impl Rasterizer for BlankDocument {
    fn rasterize(&self, _document: DataAttachment) -> RasterFuture {
        let pages = self.pages;
        Box::pin(async move {
            (0..pages)
                .map(|index| Page::from_encoded(index, blank_png(PAGE_WIDTH, PAGE_HEIGHT)))
                .collect()
        })
    }
}

/// Answers each page from a script; pages without an entry fail.
struct ScriptedDetector {
    script: HashMap<usize, Vec<RawDetection>>,
    seen: Mutex<Vec<usize>>,
}

impl ScriptedDetector {
    fn new(script: impl IntoIterator<Item = (usize, Vec<RawDetection>)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

impl FieldDetector for ScriptedDetector {
    fn detect(&self, page: &Page) -> DetectionFuture {
        self.seen.lock().unwrap().push(page.index);
        let answer = self.script.get(&page.index).cloned();
        Box::pin(async move { answer.ok_or_else(|| anyhow!("detector unavailable")) })
    }
}

fn signature_box() -> RawDetection {
    RawDetection::new(BoundingBox::new(100.0, 100.0, 200.0, 600.0), "signature")
}

async fn two_page_session() -> Session {
    let document = accept_document(b"%PDF-1.7\n".to_vec(), None, Some("contract.pdf")).unwrap();
    let mut session = Session::new();
    session
        .load_document(&BlankDocument { pages: 2 }, document)
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn sign_a_detected_field_and_export_it() {
    let detector = ScriptedDetector::new([(0, vec![signature_box()]), (1, Vec::new())]);
    let mut session = two_page_session().await;
    assert_eq!(session.page_count(), 2);
    assert_eq!(session.document_name(), Some("contract.pdf"));

    let pending = session.show_page(0).unwrap().unwrap();
    let (key, result) = run_detection(&detector, pending).await;
    let outcome = session.complete_detection(key, result);
    let DetectionOutcome::Merged(ids) = outcome else {
        panic!("expected merged detections, got {:?}", outcome);
    };
    assert_eq!(ids.len(), 1);
    let field = ids[0];
    assert_eq!(session.fields().get(field).unwrap().kind(), FieldKind::Signature);

    assert_eq!(session.toggle_field(field), ToggleOutcome::NoAssets);
    assert!(!session.fields().get(field).unwrap().is_filled());

    let assets = generate_assets("Jane Doe", &SignatureOptions::default()).unwrap();
    let signature = assets.signature.clone();
    session.set_signature_assets(assets);
    assert_eq!(session.toggle_field(field), ToggleOutcome::Applied);
    assert_eq!(
        session.fields().get(field).unwrap().value(),
        Some(&FieldValue::Image(signature))
    );

    let exported = export_fields(session.fields());
    let overlays = plan_page(&session.pages()[0], &exported, &ExportOptions::default());
    assert_eq!(overlays.len(), 1);
    assert!(matches!(overlays[0].content, OverlayContent::Image(_)));
    let rect = overlays[0].rect;
    let (w, h) = (PAGE_WIDTH as f64, PAGE_HEIGHT as f64);
    for (actual, expected) in [
        (rect.x, 100.0 / 1000.0 * w),
        (rect.y, 100.0 / 1000.0 * h),
        (rect.width, 500.0 / 1000.0 * w),
        (rect.height, 100.0 / 1000.0 * h),
    ] {
        assert!((actual - expected).abs() < 1e-6, "{} != {}", actual, expected);
    }
    assert!(plan_page(&session.pages()[1], &exported, &ExportOptions::default()).is_empty());

    let pdf = session.export(&ExportOptions::default()).unwrap();
    assert!(pdf.starts_with(b"%PDF"));
}

#[tokio::test]
async fn late_results_land_on_their_own_page() {
    let detector = ScriptedDetector::new([
        (0, vec![signature_box()]),
        (1, vec![RawDetection::new(BoundingBox::new(50.0, 50.0, 90.0, 400.0), "text")]),
    ]);
    let mut session = two_page_session().await;

    let first = session.show_page(0).unwrap().unwrap();
    let second = session.next_page(false);
    assert_eq!(session.current_page(), 1);

    let (key, result) = run_detection(&detector, second.into_iter().next().unwrap()).await;
    session.complete_detection(key, result);
    let (key, result) = run_detection(&detector, first).await;
    session.complete_detection(key, result);

    assert_eq!(session.fields().kind_counts(0).signature, 1);
    assert_eq!(session.fields().kind_counts(0).text, 0);
    assert_eq!(session.fields().kind_counts(1).text, 1);
    assert_eq!(detector.seen(), vec![1, 0]);
}

#[tokio::test]
async fn failed_detection_keeps_fields_and_settles_page() {
    let detector = ScriptedDetector::new([(0, vec![signature_box()])]);
    let shared = two_page_session().await.shared();

    let pending = shared.lock().await.show_page(0).unwrap().unwrap();
    detect_and_merge(&shared, &detector, pending).await;
    let before = shared.lock().await.fields().all()[0].id();

    let pending = shared.lock().await.show_page(1).unwrap().unwrap();
    let outcome = detect_and_merge(&shared, &detector, pending).await;
    assert_eq!(outcome, DetectionOutcome::Failed);

    let session = shared.lock().await;
    assert_eq!(session.detection_state(1), Some(DetectionState::Detected));
    assert!(session.fields().fields_for_page(1).is_empty());
    assert_eq!(session.fields().all()[0].id(), before);
}

#[tokio::test]
async fn only_filled_text_reaches_the_composer() {
    let detector = ScriptedDetector::new([(
        0,
        vec![
            RawDetection::new(BoundingBox::new(300.0, 100.0, 340.0, 500.0), "text"),
            RawDetection::new(BoundingBox::new(400.0, 100.0, 440.0, 500.0), "text"),
            RawDetection::new(BoundingBox::new(500.0, 100.0, 540.0, 500.0), "date"),
        ],
    )]);
    let mut session = two_page_session().await;
    let pending = session.show_page(0).unwrap().unwrap();
    let (key, result) = run_detection(&detector, pending).await;
    session.complete_detection(key, result);

    let ids = session.fields().all().iter().map(|field| field.id()).collect::<Vec<_>>();
    assert_eq!(ids.len(), 3);
    assert_eq!(session.fields().kind_counts(0).text, 3);
    assert!(session.update_text(ids[0], "Jane Doe"));
    assert!(session.update_text(ids[1], ""));

    let exported = export_fields(session.fields());
    assert_eq!(exported.len(), 1);
    assert_eq!(exported[0].id(), ids[0]);
}

#[tokio::test]
async fn rescanning_one_page_leaves_the_others_untouched() {
    let detector = ScriptedDetector::new([
        (0, vec![signature_box()]),
        (1, vec![signature_box(), signature_box()]),
    ]);
    let mut session = two_page_session().await;
    for pending in session.pending_for_unvisited() {
        let (key, result) = run_detection(&detector, pending).await;
        session.complete_detection(key, result);
    }
    let page_one = session.fields().fields_for_page(0)[0].id();
    let page_two = session
        .fields()
        .fields_for_page(1)
        .iter()
        .map(|field| field.id())
        .collect::<Vec<_>>();
    assert_eq!(page_two.len(), 2);

    let pending = session.request_rescan(1).unwrap();
    let (key, result) = run_detection(&detector, pending).await;
    session.complete_detection(key, result);

    assert_eq!(session.fields().fields_for_page(0)[0].id(), page_one);
    let rescanned = session.fields().fields_for_page(1);
    assert_eq!(rescanned.len(), 2);
    assert!(rescanned.iter().all(|field| !page_two.contains(&field.id())));
}
