//! Thread-affine document cache.
//!
//! Opening a document is expensive and an opened handle must not be shared
//! between threads, so [`AffinityCache`] gives every thread that touches it a
//! private resource bundle, created on first use and reused for every later
//! call from that thread. All bundles are tracked in a registry keyed by
//! [`ThreadId`] so that [`AffinityCache::close`] can release them from any
//! thread, including bundles whose owner threads have already exited.
//!
//! ```ignore
//! let cache = Arc::new(AffinityCache::new(factory, source));
//! let pool = WorkerPool::new(4)?;
//! let handles: Vec<_> = (0..page_count)
//!     .map(|page| {
//!         let cache = Arc::clone(&cache);
//!         pool.submit(move || cache.render_page(page, 150, ImageMode::Rgb))
//!     })
//!     .collect::<Result<_, _>>()?;
//! // ... join handles ...
//! pool.shutdown(DEFAULT_GRACE_PERIOD);
//! cache.close();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use log::{debug, info, warn};

use crate::bundle::{BundleId, RenderLimits, ResourceBundle};
use crate::document::DocumentFactory;
use crate::error::RenderError;
use crate::source::SourceDescriptor;
use crate::types::{ImageMode, RasterImage, Rectangle};

/// Settings fixed for the lifetime of a cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub limits: RenderLimits,
    /// Let renderers decode images at reduced resolution
    pub allow_subsampling: bool,
    pub include_annotations: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            limits: RenderLimits::default(),
            allow_subsampling: true,
            include_annotations: true,
        }
    }
}

/// A thread's bundle. `None` once the cache has released it.
type Slot<F> = Arc<Mutex<Option<ResourceBundle<F>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lazily creates one document bundle per calling thread
pub struct AffinityCache<F: DocumentFactory> {
    factory: F,
    source: SourceDescriptor,
    config: CacheConfig,
    registry: Mutex<HashMap<ThreadId, Slot<F>>>,
    closed: AtomicBool,
}

impl<F: DocumentFactory> AffinityCache<F> {
    #[must_use]
    pub fn new(factory: F, source: SourceDescriptor) -> Self {
        Self::with_config(factory, source, CacheConfig::default())
    }

    #[must_use]
    pub fn with_config(factory: F, source: SourceDescriptor, config: CacheConfig) -> Self {
        Self {
            factory,
            source,
            config,
            registry: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of bundles currently registered
    #[must_use]
    pub fn live_bundles(&self) -> usize {
        lock(&self.registry).len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Identity of the calling thread's bundle, creating it if needed
    pub fn bundle_id(&self) -> Result<BundleId, RenderError> {
        self.with_bundle(|bundle| Ok(bundle.id()))
    }

    /// Run `f` against the calling thread's document handle
    pub fn with_document<R>(&self, f: impl FnOnce(&F::Document) -> R) -> Result<R, RenderError> {
        self.with_bundle(|bundle| Ok(f(bundle.document())))
    }

    pub fn page_count(&self) -> Result<usize, RenderError> {
        self.with_bundle(|bundle| Ok(bundle.page_count()))
    }

    /// Media box of `page` in points
    pub fn page_bounds(&self, page: usize) -> Result<Rectangle, RenderError> {
        self.with_bundle(|bundle| bundle.page_bounds(page))
    }

    /// Pixel size `page` will have when rendered at `dpi`
    pub fn raster_size(&self, page: usize, dpi: u32) -> Result<(u32, u32), RenderError> {
        self.check_dpi(dpi)?;
        self.with_bundle(|bundle| bundle.raster_size(page, dpi))
    }

    /// Render `page` at `dpi` using the calling thread's bundle.
    ///
    /// An out-of-memory condition is reported as
    /// [`RenderError::OutOfMemoryDuringRender`] and leaves the bundle usable,
    /// so the caller can retry at a lower resolution.
    pub fn render_page(
        &self,
        page: usize,
        dpi: u32,
        mode: ImageMode,
    ) -> Result<RasterImage, RenderError> {
        self.check_dpi(dpi)?;
        let limits = self.config.limits;
        self.with_bundle(|bundle| bundle.render(page, dpi, mode, &limits))
    }

    fn check_dpi(&self, dpi: u32) -> Result<(), RenderError> {
        if dpi == 0 {
            return Err(RenderError::InvalidDpi);
        }
        let max = self.config.limits.max_dpi;
        if dpi > max {
            return Err(RenderError::DpiExceedsLimit { dpi, max });
        }
        Ok(())
    }

    fn with_bundle<R>(
        &self,
        f: impl FnOnce(&mut ResourceBundle<F>) -> Result<R, RenderError>,
    ) -> Result<R, RenderError> {
        let slot = self.current_slot()?;
        let mut guard = lock(&slot);
        match guard.as_mut() {
            Some(bundle) => f(bundle),
            None => Err(RenderError::CacheClosed),
        }
    }

    /// Find the calling thread's slot, opening a bundle on first use.
    ///
    /// The document is opened outside the registry lock. Only the calling
    /// thread can insert under its own id, so there is no race to open twice.
    fn current_slot(&self) -> Result<Slot<F>, RenderError> {
        if self.is_closed() {
            return Err(RenderError::CacheClosed);
        }

        let thread = thread::current().id();
        if let Some(slot) = lock(&self.registry).get(&thread) {
            return Ok(Arc::clone(slot));
        }

        let bundle = ResourceBundle::open(&self.factory, &self.source, thread, &self.config)?;

        let mut registry = lock(&self.registry);
        // close() raises the flag before draining, so checking under the
        // lock guarantees the bundle is either drained or never inserted.
        if self.is_closed() {
            drop(registry);
            bundle.release();
            return Err(RenderError::CacheClosed);
        }
        let slot = Arc::new(Mutex::new(Some(bundle)));
        registry.insert(thread, Arc::clone(&slot));
        Ok(slot)
    }

    /// Release every bundle.
    ///
    /// Safe to call more than once and on a cache that never opened anything.
    /// A failed release is logged and skipped. Call this after the threads
    /// using the cache have stopped; a thread still rendering finishes its
    /// current page first and gets [`RenderError::CacheClosed`] afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<(ThreadId, Slot<F>)> = lock(&self.registry).drain().collect();
        if drained.is_empty() {
            debug!("Closing resource cache: no bundles were opened");
            return;
        }

        let total = drained.len();
        let mut failed = 0;
        for (thread, slot) in drained {
            let bundle = lock(&slot).take();
            match bundle {
                Some(bundle) => {
                    if !bundle.release() {
                        failed += 1;
                    }
                }
                None => warn!("Bundle for thread {thread:?} was already released"),
            }
        }

        if failed == 0 {
            info!("Closed resource cache, released {total} bundles");
        } else {
            warn!(
                "Closed resource cache, {failed} of {total} bundles failed to release cleanly"
            );
        }
    }
}

impl<F: DocumentFactory> Drop for AffinityCache<F> {
    fn drop(&mut self) {
        self.close();
    }
}
