//! Render every page of a document on a worker pool.
//!
//! Pages are submitted a batch at a time so that at most one batch of images
//! is in flight, and results are handed out in page order no matter which
//! worker finished first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::affinity::{AffinityCache, CacheConfig};
use crate::document::DocumentFactory;
use crate::error::{BatchError, RenderError};
use crate::pool::{
    DEFAULT_GRACE_PERIOD, ShutdownOutcome, TaskHandle, WorkerPool, available_parallelism,
};
use crate::source::SourceDescriptor;
use crate::types::{ImageMode, RasterImage};

/// Pages submitted to the pool at a time
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Upper bound on render workers
pub const DEFAULT_MAX_PARALLELISM: usize = 64;

/// Worker count for a document of `page_count` pages: two per CPU, at
/// least two, at most [`DEFAULT_MAX_PARALLELISM`], and never more than there
/// are pages.
#[must_use]
pub fn default_parallelism(page_count: usize) -> usize {
    parallelism_for(page_count, DEFAULT_MAX_PARALLELISM)
}

fn parallelism_for(page_count: usize, max_parallelism: usize) -> usize {
    let max = max_parallelism.max(2);
    (available_parallelism() * 2)
        .clamp(2, max)
        .min(page_count)
        .max(1)
}

/// How a [`PageBatchRenderer`] sizes its pool and cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOptions {
    /// Fixed worker count; derived from the page count when `None`
    pub parallelism: Option<usize>,
    pub max_parallelism: usize,
    pub batch_size: usize,
    pub grace_period: Duration,
    pub cache: CacheConfig,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallelism: None,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            batch_size: DEFAULT_BATCH_SIZE,
            grace_period: DEFAULT_GRACE_PERIOD,
            cache: CacheConfig::default(),
        }
    }
}

/// A document opened for parallel rendering.
///
/// Owns a cache and a pool sized for the document. [`PageBatchRenderer::finish`]
/// (or dropping the renderer) shuts the pool down and then closes the cache.
pub struct PageBatchRenderer<F: DocumentFactory> {
    cache: Arc<AffinityCache<F>>,
    pool: WorkerPool,
    page_count: usize,
    batch_size: usize,
    grace_period: Duration,
}

impl<F: DocumentFactory> PageBatchRenderer<F> {
    /// Open `source` and start a pool for it.
    ///
    /// The document is opened once on the calling thread to read its page
    /// count, which also reports an unreadable source before any worker starts.
    pub fn open(
        factory: F,
        source: SourceDescriptor,
        options: &BatchOptions,
    ) -> Result<Self, BatchError> {
        let cache = Arc::new(AffinityCache::with_config(factory, source, options.cache));
        let page_count = cache.page_count()?;

        let parallelism = options
            .parallelism
            .unwrap_or_else(|| parallelism_for(page_count, options.max_parallelism))
            .clamp(1, page_count.max(1));
        let pool = WorkerPool::builder()
            .name("page-render")
            .parallelism(parallelism)
            .grace_period(options.grace_period)
            .build()?;
        debug!("Rendering {page_count} pages with {parallelism} workers");

        Ok(Self {
            cache,
            pool,
            page_count,
            batch_size: options.batch_size.max(1),
            grace_period: options.grace_period,
        })
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.pool.parallelism()
    }

    #[must_use]
    pub fn cache(&self) -> &AffinityCache<F> {
        &self.cache
    }

    /// Render every page, in page order
    pub fn render_all(&self, dpi: u32, mode: ImageMode) -> Result<Vec<RasterImage>, BatchError> {
        self.render_pages(0..self.page_count, dpi, mode)
    }

    /// Render the given pages; images come back in the order asked for
    pub fn render_pages(
        &self,
        pages: impl IntoIterator<Item = usize>,
        dpi: u32,
        mode: ImageMode,
    ) -> Result<Vec<RasterImage>, BatchError> {
        let mut images = Vec::new();
        self.render_in_batches(pages, dpi, mode, |_, image| {
            images.push(image);
            Ok(())
        })?;
        Ok(images)
    }

    /// Render pages a batch at a time, handing each image to `sink` in order.
    ///
    /// The first failure stops the run. Tasks of the current batch that are
    /// still running finish in the background and their images are dropped.
    pub fn render_in_batches<S>(
        &self,
        pages: impl IntoIterator<Item = usize>,
        dpi: u32,
        mode: ImageMode,
        mut sink: S,
    ) -> Result<(), BatchError>
    where
        S: FnMut(usize, RasterImage) -> Result<(), BatchError>,
    {
        let pages: Vec<usize> = pages.into_iter().collect();
        let started = Instant::now();

        for batch in pages.chunks(self.batch_size) {
            let handles = self.submit_batch(batch, move |cache, page| {
                cache.render_page(page, dpi, mode)
            })?;
            for (page, handle) in handles {
                let image = handle
                    .join()
                    .map_err(|source| BatchError::Task { page, source })??;
                sink(page, image)?;
            }
        }

        info!(
            "Rendered {} pages at {dpi} DPI ({mode}) with {} workers in {:.2?}",
            pages.len(),
            self.pool.parallelism(),
            started.elapsed()
        );
        Ok(())
    }

    /// Pixel size of every page at `dpi`, computed on the workers
    pub fn page_sizes(&self, dpi: u32) -> Result<Vec<(u32, u32)>, BatchError> {
        let pages: Vec<usize> = (0..self.page_count).collect();
        let mut sizes = Vec::with_capacity(pages.len());
        for batch in pages.chunks(self.batch_size) {
            let handles =
                self.submit_batch(batch, move |cache, page| cache.raster_size(page, dpi))?;
            for (page, handle) in handles {
                let size = handle
                    .join()
                    .map_err(|source| BatchError::Task { page, source })??;
                sizes.push(size);
            }
        }
        Ok(sizes)
    }

    fn submit_batch<T, W>(
        &self,
        batch: &[usize],
        work: W,
    ) -> Result<Vec<(usize, TaskHandle<Result<T, RenderError>>)>, BatchError>
    where
        T: Send + 'static,
        W: Fn(&AffinityCache<F>, usize) -> Result<T, RenderError> + Clone + Send + 'static,
    {
        batch
            .iter()
            .map(|&page| {
                let cache = Arc::clone(&self.cache);
                let work = work.clone();
                self.pool
                    .submit(move || work(&cache, page))
                    .map(|handle| (page, handle))
                    .map_err(|source| BatchError::Task { page, source })
            })
            .collect()
    }

    /// Shut the pool down, then release every bundle
    pub fn finish(self) -> ShutdownOutcome {
        self.stop()
    }

    fn stop(&self) -> ShutdownOutcome {
        let outcome = self.pool.shutdown(self.grace_period);
        self.cache.close();
        outcome
    }
}

impl<F: DocumentFactory> Drop for PageBatchRenderer<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open `source`, render every page and clean up
pub fn render_document<F: DocumentFactory>(
    factory: F,
    source: SourceDescriptor,
    dpi: u32,
    mode: ImageMode,
    options: &BatchOptions,
) -> Result<Vec<RasterImage>, BatchError> {
    let renderer = PageBatchRenderer::open(factory, source, options)?;
    let result = renderer.render_all(dpi, mode);
    renderer.finish();
    result
}
