//! In-memory document backend for tests.
//!
//! [`SyntheticFactory`] opens "documents" made of blank pages with fixed
//! bounds. Every page renders as a solid fill of its own index, so a test can
//! tell which page ended up where. Counters and injectable faults let tests
//! check how the cache drives its backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::document::{DocumentFactory, DocumentHandle, PageRenderer};
use crate::error::BackendFault;
use crate::source::SourceDescriptor;
use crate::types::{ImageMode, RasterImage, Rectangle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters shared by a factory and everything it opened
#[derive(Debug, Default)]
pub struct SyntheticStats {
    opens: AtomicUsize,
    renders: AtomicUsize,
    release_attempts: AtomicUsize,
    released: AtomicUsize,
    affinity_violations: AtomicUsize,
    subsampled_renders: AtomicUsize,
    annotated_renders: AtomicUsize,
}

impl SyntheticStats {
    /// Successful opens
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Calls that reached the renderer
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn release_attempts(&self) -> usize {
        self.release_attempts.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Times a document was used off its opening thread or by two threads at once
    pub fn affinity_violations(&self) -> usize {
        self.affinity_violations.load(Ordering::SeqCst)
    }

    /// Renders done by a renderer allowed to subsample images
    pub fn subsampled_renders(&self) -> usize {
        self.subsampled_renders.load(Ordering::SeqCst)
    }

    /// Renders done by a renderer told to draw annotations
    pub fn annotated_renders(&self) -> usize {
        self.annotated_renders.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Faults {
    failing_opens: usize,
    render: HashMap<usize, fn() -> BackendFault>,
    /// Open serials (1-based) whose release fails
    release: HashSet<usize>,
}

struct Shared {
    pages: Vec<(Rectangle, i32)>,
    stats: SyntheticStats,
    faults: Mutex<Faults>,
    render_delay: Mutex<Duration>,
}

/// Factory for synthetic documents; clones share counters and faults
#[derive(Clone)]
pub struct SyntheticFactory {
    shared: Arc<Shared>,
}

impl SyntheticFactory {
    /// Pages given as (bounds, rotation in degrees)
    pub fn new(pages: Vec<(Rectangle, i32)>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pages,
                stats: SyntheticStats::default(),
                faults: Mutex::new(Faults::default()),
                render_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// `count` unrotated pages of the same size
    pub fn uniform(count: usize, bounds: Rectangle) -> Self {
        Self::new(vec![(bounds, 0); count])
    }

    pub fn stats(&self) -> &SyntheticStats {
        &self.shared.stats
    }

    /// Make each render sleep, to keep workers busy
    pub fn set_render_delay(&self, delay: Duration) {
        *lock(&self.shared.render_delay) = delay;
    }

    /// The next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.shared.faults).failing_opens = count;
    }

    /// Rendering `page` reports that the engine ran out of memory
    pub fn fail_render_with_oom(&self, page: usize) {
        self.fail_render_with(page, || BackendFault::OutOfMemory);
    }

    /// Rendering `page` fails with the fault built by `fault`
    pub fn fail_render_with(&self, page: usize, fault: fn() -> BackendFault) {
        lock(&self.shared.faults).render.insert(page, fault);
    }

    /// Closing the `serial`-th opened document (1-based) fails
    pub fn fail_release_of(&self, serial: usize) {
        lock(&self.shared.faults).release.insert(serial);
    }
}

impl DocumentFactory for SyntheticFactory {
    type Document = SyntheticDocument;
    type Renderer = SyntheticRenderer;

    fn open(
        &self,
        source: &SourceDescriptor,
        _read_only: bool,
    ) -> Result<SyntheticDocument, BackendFault> {
        {
            let mut faults = lock(&self.shared.faults);
            if faults.failing_opens > 0 {
                faults.failing_opens -= 1;
                return Err(BackendFault::engine("synthetic open failure"));
            }
        }
        match source {
            SourceDescriptor::Bytes(bytes) if bytes.is_empty() => {
                return Err(BackendFault::engine("empty document"));
            }
            SourceDescriptor::Path(path) => {
                std::fs::metadata(path)?;
            }
            SourceDescriptor::Bytes(_) => {}
        }

        let serial = self.shared.stats.opens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SyntheticDocument {
            serial,
            opened_on: thread::current().id(),
            busy: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        })
    }

    fn bind(&self, _document: &SyntheticDocument) -> SyntheticRenderer {
        SyntheticRenderer {
            subsampling_allowed: false,
            annotations_shown: false,
        }
    }
}

pub struct SyntheticDocument {
    serial: usize,
    opened_on: ThreadId,
    busy: AtomicBool,
    shared: Arc<Shared>,
}

impl SyntheticDocument {
    /// 1-based open order
    pub fn serial(&self) -> usize {
        self.serial
    }

    fn check_affinity(&self) {
        if thread::current().id() != self.opened_on {
            self.shared
                .stats
                .affinity_violations
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl DocumentHandle for SyntheticDocument {
    fn page_count(&self) -> usize {
        self.shared.pages.len()
    }

    fn page_bounds(&self, page: usize) -> Result<Rectangle, BackendFault> {
        self.check_affinity();
        self.shared
            .pages
            .get(page)
            .map(|(bounds, _)| *bounds)
            .ok_or_else(|| BackendFault::engine(format!("no page {page}")))
    }

    fn page_rotation(&self, page: usize) -> Result<i32, BackendFault> {
        self.shared
            .pages
            .get(page)
            .map(|(_, rotation)| *rotation)
            .ok_or_else(|| BackendFault::engine(format!("no page {page}")))
    }

    fn close(self) -> Result<(), BackendFault> {
        let stats = &self.shared.stats;
        stats.release_attempts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.shared.faults).release.contains(&self.serial) {
            return Err(BackendFault::engine("synthetic release failure"));
        }
        stats.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SyntheticRenderer {
    subsampling_allowed: bool,
    annotations_shown: bool,
}

impl SyntheticRenderer {
    pub fn subsampling_allowed(&self) -> bool {
        self.subsampling_allowed
    }

    pub fn annotations_shown(&self) -> bool {
        self.annotations_shown
    }
}

impl PageRenderer<SyntheticDocument> for SyntheticRenderer {
    fn set_subsampling_allowed(&mut self, allowed: bool) {
        self.subsampling_allowed = allowed;
    }

    fn set_annotations_shown(&mut self, shown: bool) {
        self.annotations_shown = shown;
    }

    fn render(
        &mut self,
        document: &SyntheticDocument,
        page: usize,
        _scale: f32,
        canvas: &mut RasterImage,
    ) -> Result<(), BackendFault> {
        document.check_affinity();
        if document.busy.swap(true, Ordering::SeqCst) {
            document
                .shared
                .stats
                .affinity_violations
                .fetch_add(1, Ordering::SeqCst);
        }
        let stats = &document.shared.stats;
        stats.renders.fetch_add(1, Ordering::SeqCst);
        if self.subsampling_allowed() {
            stats.subsampled_renders.fetch_add(1, Ordering::SeqCst);
        }
        if self.annotations_shown() {
            stats.annotated_renders.fetch_add(1, Ordering::SeqCst);
        }

        let fault = lock(&document.shared.faults).render.get(&page).copied();
        let result = match fault {
            Some(fault) => Err(fault()),
            None => {
                let delay = *lock(&document.shared.render_delay);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                fill(canvas, page);
                Ok(())
            }
        };

        document.busy.store(false, Ordering::SeqCst);
        result
    }
}

/// Sample value every pixel of `page` is filled with
pub fn page_shade(page: usize) -> u8 {
    (page % 256) as u8
}

fn fill(canvas: &mut RasterImage, page: usize) {
    let shade = page_shade(page);
    match canvas.mode() {
        ImageMode::Binary => {
            let value = if page % 2 == 0 { 0 } else { 0xFF };
            canvas.pixels_mut().fill(value);
        }
        ImageMode::Gray | ImageMode::Rgb => canvas.pixels_mut().fill(shade),
        ImageMode::Rgba => {
            for px in canvas.pixels_mut().chunks_exact_mut(4) {
                px.copy_from_slice(&[shade, shade, shade, 0xFF]);
            }
        }
    }
}
