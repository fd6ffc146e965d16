//! Per-thread document handle and renderer pair

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use log::{debug, warn};

use crate::affinity::CacheConfig;
use crate::document::{DocumentFactory, DocumentHandle, PageRenderer};
use crate::error::{BackendFault, RenderError};
use crate::source::SourceDescriptor;
use crate::types::{ImageMode, POINTS_PER_INCH, RasterImage, Rectangle, raster_size};

/// Default maximum DPI accepted by `render_page`
pub const DEFAULT_MAX_DPI: u32 = 500;

/// Default cap on the pixel count of a single rendered page
pub const DEFAULT_MAX_PIXELS: u64 = 250_000_000;

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a bundle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(u64);

impl BundleId {
    fn next() -> Self {
        Self(NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bundle#{}", self.0)
    }
}

/// Bounds applied before any pixels are allocated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderLimits {
    pub max_dpi: u32,
    pub max_pixels: u64,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            max_dpi: DEFAULT_MAX_DPI,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

pub(crate) struct ResourceBundle<F: DocumentFactory> {
    id: BundleId,
    owner: ThreadId,
    document: F::Document,
    renderer: F::Renderer,
}

impl<F: DocumentFactory> ResourceBundle<F> {
    pub(crate) fn open(
        factory: &F,
        source: &SourceDescriptor,
        owner: ThreadId,
        config: &CacheConfig,
    ) -> Result<Self, RenderError> {
        let document =
            factory
                .open(source, true)
                .map_err(|fault| RenderError::SourceUnreadable {
                    detail: fault.to_string(),
                })?;
        let mut renderer = factory.bind(&document);
        renderer.set_subsampling_allowed(config.allow_subsampling);
        renderer.set_annotations_shown(config.include_annotations);

        let id = BundleId::next();
        debug!(
            "Opened {id} for thread {owner:?} ({} pages)",
            document.page_count()
        );

        Ok(Self {
            id,
            owner,
            document,
            renderer,
        })
    }

    pub(crate) fn id(&self) -> BundleId {
        self.id
    }

    pub(crate) fn document(&self) -> &F::Document {
        &self.document
    }

    pub(crate) fn page_count(&self) -> usize {
        self.document.page_count()
    }

    fn check_page(&self, page: usize) -> Result<(), RenderError> {
        let page_count = self.document.page_count();
        if page >= page_count {
            return Err(RenderError::PageIndexOutOfRange { page, page_count });
        }
        Ok(())
    }

    pub(crate) fn page_bounds(&self, page: usize) -> Result<Rectangle, RenderError> {
        self.check_page(page)?;
        self.document
            .page_bounds(page)
            .map_err(|source| RenderError::Backend { page, source })
    }

    /// Pixel size of `page` at `dpi`, accounting for rotation
    pub(crate) fn raster_size(&self, page: usize, dpi: u32) -> Result<(u32, u32), RenderError> {
        let bounds = self.page_bounds(page)?;
        let rotation = self
            .document
            .page_rotation(page)
            .map_err(|source| RenderError::Backend { page, source })?;
        Ok(raster_size(bounds, rotation, dpi))
    }

    pub(crate) fn render(
        &mut self,
        page: usize,
        dpi: u32,
        mode: ImageMode,
        limits: &RenderLimits,
    ) -> Result<RasterImage, RenderError> {
        let (width, height) = self.raster_size(page, dpi)?;
        if u64::from(width) * u64::from(height) > limits.max_pixels {
            return Err(RenderError::DimensionsTooLarge {
                page,
                dpi,
                width,
                height,
            });
        }

        let mut canvas = RasterImage::try_allocate(width, height, mode).map_err(|err| {
            warn!("Could not allocate {width}x{height} {mode} canvas for page {page}: {err}");
            RenderError::OutOfMemoryDuringRender { page, dpi }
        })?;

        let scale = dpi as f32 / POINTS_PER_INCH;
        match self
            .renderer
            .render(&self.document, page, scale, &mut canvas)
        {
            Ok(()) => Ok(canvas),
            Err(BackendFault::OutOfMemory) => {
                warn!("{} ran out of memory on page {page} at {dpi} DPI", self.id);
                Err(RenderError::OutOfMemoryDuringRender { page, dpi })
            }
            Err(source) => Err(RenderError::Backend { page, source }),
        }
    }

    /// Close the document. Failures are logged, never returned.
    pub(crate) fn release(self) -> bool {
        let Self {
            id,
            owner,
            document,
            renderer,
        } = self;
        drop(renderer);

        match document.close() {
            Ok(()) => {
                debug!("Released {id} (owner {owner:?})");
                true
            }
            Err(e) => {
                warn!("Failed to release {id} (owner {owner:?}): {e}");
                false
            }
        }
    }
}
