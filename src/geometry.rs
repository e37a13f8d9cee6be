//! Normalized detection boxes and the two projections used to draw them:
//! percentage overlays on a displayed page and absolute pixels on the
//! export raster.

use serde::{Deserialize, Serialize};

/// Side length of the normalized detection space.
pub const NORMALIZED_EXTENT: f64 = 1000.0;

/// Axis-aligned box in the 0–1000 space reported by the detector.
///
/// The producer is untrusted: `ymin <= ymax` and `xmin <= xmax` are not
/// guaranteed. Nothing here reorders or clamps the edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub ymin: f64,
    pub xmin: f64,
    pub ymax: f64,
    pub xmax: f64,
}

impl BoundingBox {
    pub const FULL_PAGE: BoundingBox = BoundingBox {
        ymin: 0.0,
        xmin: 0.0,
        ymax: NORMALIZED_EXTENT,
        xmax: NORMALIZED_EXTENT,
    };

    pub fn new(ymin: f64, xmin: f64, ymax: f64, xmax: f64) -> Self {
        Self {
            ymin,
            xmin,
            ymax,
            xmax,
        }
    }

    /// Builds a box from the detector's `[ymin, xmin, ymax, xmax]` order.
    pub fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    /// True when the box has no positive area or carries non-finite edges.
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.ymin, self.xmin, self.ymax, self.xmax]
            .iter()
            .all(|value| value.is_finite());
        !finite || self.width() <= 0.0 || self.height() <= 0.0
    }
}

/// Placement relative to a container sized like the rendered page, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayRect {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

impl OverlayRect {
    pub fn is_renderable(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    pub fn css_style(&self) -> String {
        format!(
            "top:{}%;left:{}%;width:{}%;height:{}%",
            self.top, self.left, self.width, self.height
        )
    }
}

/// Placement on a raster of known pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PixelRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl PixelRect {
    pub fn is_renderable(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

pub fn to_overlay_rect(bbox: &BoundingBox) -> OverlayRect {
    let scale = NORMALIZED_EXTENT / 100.0;
    OverlayRect {
        top: bbox.ymin / scale,
        left: bbox.xmin / scale,
        width: bbox.width() / scale,
        height: bbox.height() / scale,
    }
}

pub fn to_absolute_pixels(bbox: &BoundingBox, page_width: f64, page_height: f64) -> PixelRect {
    PixelRect {
        x: bbox.xmin / NORMALIZED_EXTENT * page_width,
        y: bbox.ymin / NORMALIZED_EXTENT * page_height,
        width: bbox.width() / NORMALIZED_EXTENT * page_width,
        height: bbox.height() / NORMALIZED_EXTENT * page_height,
    }
}

/// Inverse of [`to_absolute_pixels`] for a page of non-zero size.
pub fn from_absolute_pixels(rect: &PixelRect, page_width: f64, page_height: f64) -> BoundingBox {
    let xmin = rect.x / page_width * NORMALIZED_EXTENT;
    let ymin = rect.y / page_height * NORMALIZED_EXTENT;
    BoundingBox {
        ymin,
        xmin,
        ymax: ymin + rect.height / page_height * NORMALIZED_EXTENT,
        xmax: xmin + rect.width / page_width * NORMALIZED_EXTENT,
    }
}
