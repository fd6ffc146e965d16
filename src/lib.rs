//! Parallel page rendering with one document handle per worker thread.
//!
//! [`AffinityCache`] hands every thread its own opened document, [`WorkerPool`]
//! runs render tasks on a fixed set of threads and shuts down in two phases,
//! and [`convert::PageBatchRenderer`] puts the two together to rasterize a
//! whole document.

pub mod affinity;
pub mod backend;
mod bundle;
pub mod convert;
pub mod document;
pub mod error;
pub mod executor;
pub mod export;
pub mod panic_handler;
pub mod pool;
pub mod settings;
pub mod source;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use affinity::{AffinityCache, CacheConfig};
pub use bundle::{BundleId, DEFAULT_MAX_DPI, DEFAULT_MAX_PIXELS, RenderLimits};
pub use document::{DocumentFactory, DocumentHandle, PageRenderer};
pub use error::{BackendFault, BatchError, ExportError, RenderError, TaskError};
pub use pool::{CancelToken, Interrupt, PoolPhase, ShutdownOutcome, TaskHandle, WorkerPool};
pub use source::SourceDescriptor;
pub use types::{ImageMode, RasterImage, Rectangle};
