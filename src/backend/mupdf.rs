//! MuPDF-backed document factory

use ::mupdf::{Colorspace, Document, Matrix, Pixmap};
use log::debug;

use crate::document::{DocumentFactory, DocumentHandle, PageRenderer};
use crate::error::BackendFault;
use crate::source::SourceDescriptor;
use crate::types::{ImageMode, RasterImage, Rectangle};

const PDF_MAGIC: &str = "application/pdf";

/// Samples at or above this are white in binary output
const BINARY_THRESHOLD: u8 = 128;

impl From<::mupdf::error::Error> for BackendFault {
    fn from(err: ::mupdf::error::Error) -> Self {
        let detail = err.to_string();
        if detail.to_ascii_lowercase().contains("out of memory") {
            BackendFault::OutOfMemory
        } else {
            BackendFault::Engine { detail }
        }
    }
}

/// Opens PDF documents with MuPDF
#[derive(Clone, Copy, Debug, Default)]
pub struct MupdfFactory;

impl DocumentFactory for MupdfFactory {
    type Document = MupdfDocument;
    type Renderer = MupdfRenderer;

    fn open(
        &self,
        source: &SourceDescriptor,
        _read_only: bool,
    ) -> Result<MupdfDocument, BackendFault> {
        // MuPDF never writes back to the source, so every handle is read-only.
        let document = match source {
            SourceDescriptor::Bytes(bytes) => Document::from_bytes(bytes, PDF_MAGIC)?,
            SourceDescriptor::Path(path) => Document::open(path.to_string_lossy().as_ref())?,
        };
        let page_count = document.page_count()?;
        let page_count = usize::try_from(page_count)
            .map_err(|_| BackendFault::engine(format!("invalid page count {page_count}")))?;
        Ok(MupdfDocument {
            document,
            page_count,
        })
    }

    fn bind(&self, _document: &MupdfDocument) -> MupdfRenderer {
        MupdfRenderer {
            subsampling_allowed: true,
            annotations_shown: true,
        }
    }
}

pub struct MupdfDocument {
    document: Document,
    page_count: usize,
}

// SAFETY: a document is only used by the thread that opened it. The cache
// moves it to another thread only to drop it, after its owner has stopped
// using it, and MuPDF contexts cloned for each thread share their locks.
unsafe impl Send for MupdfDocument {}

impl MupdfDocument {
    fn load_page(&self, page: usize) -> Result<::mupdf::Page, BackendFault> {
        let index = i32::try_from(page)
            .map_err(|_| BackendFault::engine(format!("page index {page} too large")))?;
        Ok(self.document.load_page(index)?)
    }
}

impl DocumentHandle for MupdfDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    // MuPDF applies /Rotate when bounding a page, so the bounds are already
    // in display orientation and the rotation reported is always zero.
    fn page_bounds(&self, page: usize) -> Result<Rectangle, BackendFault> {
        let bounds = self.load_page(page)?.bounds()?;
        Ok(Rectangle::new(
            bounds.x0,
            bounds.y0,
            bounds.x1 - bounds.x0,
            bounds.y1 - bounds.y0,
        ))
    }

    fn close(self) -> Result<(), BackendFault> {
        drop(self.document);
        Ok(())
    }
}

/// Rasterizes pages with MuPDF's draw device.
///
/// MuPDF has no switch for reduced-resolution image decoding; the flag is
/// kept only so callers can read back what they asked for.
pub struct MupdfRenderer {
    subsampling_allowed: bool,
    /// Passed to MuPDF as `show_extras`, which covers annotations and widgets
    annotations_shown: bool,
}

impl MupdfRenderer {
    #[must_use]
    pub fn subsampling_allowed(&self) -> bool {
        self.subsampling_allowed
    }

    #[must_use]
    pub fn annotations_shown(&self) -> bool {
        self.annotations_shown
    }
}

impl PageRenderer<MupdfDocument> for MupdfRenderer {
    fn set_subsampling_allowed(&mut self, allowed: bool) {
        self.subsampling_allowed = allowed;
    }

    fn set_annotations_shown(&mut self, shown: bool) {
        self.annotations_shown = shown;
    }

    fn render(
        &mut self,
        document: &MupdfDocument,
        page: usize,
        scale: f32,
        canvas: &mut RasterImage,
    ) -> Result<(), BackendFault> {
        let loaded = document.load_page(page)?;
        let transform = Matrix::new_scale(scale, scale);
        let (colorspace, alpha) = match canvas.mode() {
            ImageMode::Binary | ImageMode::Gray => (Colorspace::device_gray(), false),
            ImageMode::Rgb => (Colorspace::device_rgb(), false),
            ImageMode::Rgba => (Colorspace::device_rgb(), true),
        };
        let pixmap = loaded.to_pixmap(&transform, &colorspace, alpha, self.annotations_shown)?;
        debug!(
            "Rendered page {page} to {}x{} pixmap",
            pixmap.width(),
            pixmap.height()
        );
        copy_into(&pixmap, canvas)
    }
}

/// Copy pixmap samples into the canvas, converting to the canvas mode.
///
/// MuPDF rounds the page box outward, so the pixmap can be a pixel larger
/// than the canvas; only the overlap is copied.
fn copy_into(pixmap: &Pixmap, canvas: &mut RasterImage) -> Result<(), BackendFault> {
    let n = pixmap.n() as usize;
    let mode = canvas.mode();
    let expected = match mode {
        ImageMode::Binary | ImageMode::Gray => 1,
        ImageMode::Rgb => 3,
        ImageMode::Rgba => 4,
    };
    if n != expected {
        return Err(BackendFault::engine(format!(
            "expected {expected} channels for {mode} output, pixmap has {n}"
        )));
    }

    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let width = (pixmap.width()).min(canvas.width()) as usize;
    let height = (pixmap.height()).min(canvas.height());
    let row_bytes = width * n;
    if row_bytes > stride || samples.len() < stride.saturating_mul(height as usize) {
        return Err(BackendFault::engine("pixmap buffer size mismatch"));
    }

    for y in 0..height {
        let start = y as usize * stride;
        let src = &samples[start..start + row_bytes];
        let dst = &mut canvas.row_mut(y)[..row_bytes];
        match mode {
            ImageMode::Binary => {
                for (out, &value) in dst.iter_mut().zip(src) {
                    *out = if value >= BINARY_THRESHOLD { 0xFF } else { 0 };
                }
            }
            ImageMode::Gray | ImageMode::Rgb => dst.copy_from_slice(src),
            ImageMode::Rgba => {
                for (out, px) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                    unpremultiply(px, out);
                }
            }
        }
    }
    Ok(())
}

fn unpremultiply(src: &[u8], dst: &mut [u8]) {
    let alpha = src[3];
    dst[3] = alpha;
    if alpha == 0 {
        dst[..3].fill(0xFF);
        return;
    }
    for channel in 0..3 {
        let value = (u16::from(src[channel]) * 255 + u16::from(alpha) / 2) / u16::from(alpha);
        dst[channel] = value.min(255) as u8;
    }
}
