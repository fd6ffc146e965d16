//! Interfaces to the document backend.
//!
//! The cache never decodes documents itself. A [`DocumentFactory`] opens a
//! private [`DocumentHandle`] from a [`SourceDescriptor`] and binds a
//! [`PageRenderer`] to it; every worker thread gets its own pair.

use crate::error::BackendFault;
use crate::source::SourceDescriptor;
use crate::types::{RasterImage, Rectangle};

/// Opens documents and binds renderers to them
pub trait DocumentFactory: Send + Sync + 'static {
    type Document: DocumentHandle;
    type Renderer: PageRenderer<Self::Document>;

    /// Decode the source into a fresh, independent handle
    fn open(&self, source: &SourceDescriptor, read_only: bool)
    -> Result<Self::Document, BackendFault>;

    /// Create a renderer for `document`
    fn bind(&self, document: &Self::Document) -> Self::Renderer;
}

/// An opened document.
///
/// Handles are `Send` so the cache can release them from the closing thread,
/// but they are never used from two threads at once.
pub trait DocumentHandle: Send + 'static {
    fn page_count(&self) -> usize;

    /// Media box of a page; `page` is already range-checked
    fn page_bounds(&self, page: usize) -> Result<Rectangle, BackendFault>;

    /// Page rotation in degrees
    fn page_rotation(&self, _page: usize) -> Result<i32, BackendFault> {
        Ok(0)
    }

    /// Release the decoded state
    fn close(self) -> Result<(), BackendFault>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Rasterizes pages of one bound document
pub trait PageRenderer<D>: Send + 'static {
    /// Allow lower-resolution image decoding to save memory
    fn set_subsampling_allowed(&mut self, allowed: bool);

    /// Draw annotations (form fields, comments, stamps) along with the page content
    fn set_annotations_shown(&mut self, shown: bool);

    /// Draw `page` at `scale` pixels per point into `canvas`.
    ///
    /// The canvas is already sized for the page; its mode selects the color depth.
    fn render(
        &mut self,
        document: &D,
        page: usize,
        scale: f32,
        canvas: &mut RasterImage,
    ) -> Result<(), BackendFault>;
}
