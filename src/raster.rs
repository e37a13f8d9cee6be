use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::future::Future;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::process::Command;
use std::sync::Arc;
use tempfile::tempdir;
use tracing::{debug, info};

use crate::data::DataAttachment;

/// One rendered page. Immutable once produced; the encoded raster is shared.
#[derive(Debug, Clone)]
pub struct Page {
    pub index: usize,
    pub image: Arc<Vec<u8>>,
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

impl Page {
    /// Wraps an encoded raster, reading its pixel size from the header.
    pub fn from_encoded(index: usize, bytes: Vec<u8>) -> Result<Self> {
        let reader = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .with_context(|| format!("failed to read page {} raster", index + 1))?;
        let format = reader
            .format()
            .ok_or_else(|| anyhow!("unrecognized raster format for page {}", index + 1))?;
        let (width, height) = reader
            .into_dimensions()
            .with_context(|| format!("failed to read page {} dimensions", index + 1))?;
        Ok(Self {
            index,
            image: Arc::new(bytes),
            mime: format.to_mime_type().to_string(),
            width,
            height,
        })
    }

    /// Number shown to people; pages are stored zero-based.
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

pub type RasterFuture = Pin<Box<dyn Future<Output = Result<Vec<Page>>> + Send>>;

pub trait Rasterizer: Send + Sync {
    /// Renders every page in document order. A single failing page fails
    /// the whole document.
    fn rasterize(&self, document: DataAttachment) -> RasterFuture;
}

/// Shells out to `mutool draw` (preferred) or `pdftoppm`.
#[derive(Debug, Clone)]
pub struct CommandRasterizer {
    dpi: u32,
}

impl CommandRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self { dpi: dpi.max(1) }
    }
}

impl Rasterizer for CommandRasterizer {
    fn rasterize(&self, document: DataAttachment) -> RasterFuture {
        let dpi = self.dpi;
        Box::pin(async move {
            let pages = tokio::task::spawn_blocking(move || render_pdf_pages(&document.bytes, dpi))
                .await
                .with_context(|| "rasterizer task panicked")??;
            info!("rasterized {} page(s) at {} dpi", pages.len(), dpi);
            Ok(pages)
        })
    }
}

fn render_pdf_pages(pdf_bytes: &[u8], dpi: u32) -> Result<Vec<Page>> {
    let dir = tempdir().with_context(|| "failed to create temp dir for pdf")?;
    let input_path = dir.path().join("input.pdf");
    fs::write(&input_path, pdf_bytes).with_context(|| "failed to write temp pdf")?;
    let resolution = dpi.to_string();

    if command_exists("mutool") {
        debug!("rendering with mutool");
        let output = Command::new("mutool")
            .arg("draw")
            .arg("-r")
            .arg(&resolution)
            .arg("-o")
            .arg(dir.path().join("page-%03d.png"))
            .arg(&input_path)
            .output()
            .with_context(|| "failed to run mutool")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("mutool failed: {}", stderr.trim()));
        }
    } else if command_exists("pdftoppm") {
        debug!("rendering with pdftoppm");
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(&resolution)
            .arg(&input_path)
            .arg(dir.path().join("page"))
            .output()
            .with_context(|| "failed to run pdftoppm")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("pdftoppm failed: {}", stderr.trim()));
        }
    } else {
        return Err(anyhow!(
            "pdf rendering requires mutool or pdftoppm (install mupdf or poppler)"
        ));
    }

    let pages = collect_pages(dir.path())?;
    if pages.is_empty() {
        return Err(anyhow!("document has no pages"));
    }
    Ok(pages)
}

/// Reads `page*.png` files in name order. Both renderers zero-pad page
/// numbers, so name order is page order.
fn collect_pages(dir: &Path) -> Result<Vec<Page>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| "failed to read temp pdf directory")?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let is_page = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("page"));
            let is_png = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            is_page && is_png
        })
        .collect::<Vec<_>>();
    paths.sort();

    paths
        .into_iter()
        .enumerate()
        .map(|(index, path)| {
            let bytes = fs::read(&path)
                .with_context(|| format!("failed to read rendered page: {}", path.display()))?;
            Page::from_encoded(index, bytes)
        })
        .collect()
}

fn command_exists(cmd: &str) -> bool {
    let Some(path_var) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path_var).any(|dir| is_executable(&dir.join(cmd)))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PNG_MIME;
    use crate::test_util::solid_png;

    #[test]
    fn page_reads_dimensions_from_raster() {
        let page = Page::from_encoded(1, solid_png(8, 6, [255, 255, 255, 255])).unwrap();
        assert_eq!((page.width, page.height), (8, 6));
        assert_eq!(page.mime, PNG_MIME);
        assert_eq!(page.number(), 2);
    }

    #[test]
    fn garbage_raster_is_rejected() {
        assert!(Page::from_encoded(0, b"not an image".to_vec()).is_err());
    }

    #[test]
    fn rendered_pages_are_collected_in_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("page-002.png"), solid_png(4, 4, [0, 0, 0, 255])).unwrap();
        fs::write(dir.path().join("page-001.png"), solid_png(2, 2, [0, 0, 0, 255])).unwrap();
        fs::write(dir.path().join("input.pdf"), b"%PDF-1.7").unwrap();
        fs::write(dir.path().join("page-notes.txt"), b"ignored").unwrap();

        let pages = collect_pages(dir.path()).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!((pages[0].index, pages[0].width), (0, 2));
        assert_eq!((pages[1].index, pages[1].width), (1, 4));
    }

    #[test]
    fn corrupt_page_fails_the_whole_document() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("page-001.png"), solid_png(2, 2, [0, 0, 0, 255])).unwrap();
        fs::write(dir.path().join("page-002.png"), b"truncated").unwrap();
        assert!(collect_pages(dir.path()).is_err());
    }

    #[test]
    fn missing_command_is_not_found() {
        assert!(!command_exists("definitely-not-a-real-renderer"));
    }
}
