use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use pagepool::convert::{BatchOptions, PageBatchRenderer, render_document};
use pagepool::export::{self, ArchiveWriter, OutputFormat};
use pagepool::test_utils::{SyntheticFactory, page_shade};
use pagepool::types::raster_size;
use pagepool::{
    AffinityCache, CacheConfig, ImageMode, Rectangle, RenderError, RenderLimits, ShutdownOutcome,
    SourceDescriptor, TaskError, WorkerPool,
};

/// Ten pages of different sizes, every third one rotated
fn mixed_pages() -> Vec<(Rectangle, i32)> {
    (0..10)
        .map(|i| {
            let bounds = Rectangle::sized(100.0 + 36.0 * i as f32, 200.0 + 18.0 * i as f32);
            let rotation = if i % 3 == 0 { 90 } else { 0 };
            (bounds, rotation)
        })
        .collect()
}

fn source() -> SourceDescriptor {
    SourceDescriptor::from_bytes(b"%PDF-synthetic".to_vec())
}

#[test]
fn ten_pages_on_four_workers() {
    let pages = mixed_pages();
    let factory = SyntheticFactory::new(pages.clone());
    let cache = Arc::new(AffinityCache::new(factory.clone(), source()));
    let pool = WorkerPool::builder()
        .name("e2e")
        .parallelism(4)
        .build()
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|page| {
            let cache = Arc::clone(&cache);
            pool.submit(move || {
                let image = cache.render_page(page, 150, ImageMode::Rgb)?;
                Ok::<_, RenderError>((page, image, cache.bundle_id()?))
            })
            .unwrap()
        })
        .collect();

    let mut bundles = HashSet::new();
    for handle in handles {
        let (page, image, bundle) = handle.join().unwrap().unwrap();
        let (bounds, rotation) = pages[page];
        assert_eq!(
            (image.width(), image.height()),
            raster_size(bounds, rotation, 150),
            "page {page}"
        );
        assert_eq!(image.pixel(0, 0), &[page_shade(page); 3]);
        bundles.insert(bundle);
    }

    assert!(bundles.len() <= 4);
    assert_eq!(factory.stats().opens(), bundles.len());
    assert_eq!(factory.stats().affinity_violations(), 0);

    assert_eq!(pool.shutdown(Duration::from_secs(5)), ShutdownOutcome::Graceful);
    cache.close();
    assert_eq!(cache.live_bundles(), 0);
    assert_eq!(factory.stats().released(), bundles.len());
}

#[test]
fn path_sources_are_opened_by_each_worker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.pdf");
    std::fs::write(&path, b"%PDF-synthetic").unwrap();

    let factory = SyntheticFactory::uniform(8, Rectangle::sized(72.0, 72.0));
    factory.set_render_delay(Duration::from_millis(5));
    let options = BatchOptions {
        parallelism: Some(3),
        ..BatchOptions::default()
    };
    let images = render_document(
        factory.clone(),
        SourceDescriptor::from_path(&path),
        72,
        ImageMode::Gray,
        &options,
    )
    .unwrap();

    assert_eq!(images.len(), 8);
    // at most one bundle per worker plus the one that read the page count
    assert!(factory.stats().opens() <= 4);
    assert_eq!(factory.stats().released(), factory.stats().opens());
}

#[test]
fn missing_path_is_source_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SyntheticFactory::uniform(1, Rectangle::sized(72.0, 72.0));
    let source = SourceDescriptor::from_path(dir.path().join("gone.pdf"));
    let cache = AffinityCache::new(factory, source);

    assert!(matches!(
        cache.render_page(0, 72, ImageMode::Rgb),
        Err(RenderError::SourceUnreadable { .. })
    ));
    assert_eq!(cache.live_bundles(), 0);
}

#[test]
fn caller_can_retry_at_lower_dpi() {
    let factory = SyntheticFactory::uniform(1, Rectangle::sized(612.0, 792.0));
    let config = CacheConfig {
        limits: RenderLimits {
            max_dpi: 500,
            max_pixels: 4_000_000,
        },
        ..CacheConfig::default()
    };
    let cache = AffinityCache::with_config(factory, source(), config);

    let mut dpi = 400;
    let image = loop {
        match cache.render_page(0, dpi, ImageMode::Rgb) {
            Ok(image) => break image,
            Err(err) if err.is_out_of_memory() => dpi /= 2,
            Err(err) => panic!("unexpected error: {err}"),
        }
    };
    assert_eq!(dpi, 200);
    assert_eq!((image.width(), image.height()), (1700, 2200));
}

#[test]
fn forced_shutdown_then_close_releases_everything() {
    let factory = SyntheticFactory::uniform(20, Rectangle::sized(72.0, 72.0));
    factory.set_render_delay(Duration::from_millis(20));
    let cache = Arc::new(AffinityCache::new(factory.clone(), source()));
    let pool = WorkerPool::new(2).unwrap();

    let handles: Vec<_> = (0..20)
        .map(|page| {
            let cache = Arc::clone(&cache);
            pool.submit(move || cache.render_page(page, 72, ImageMode::Gray))
                .unwrap()
        })
        .collect();

    // 20 renders of 20ms on two workers cannot finish in 100ms
    let outcome = pool.shutdown(Duration::from_millis(100));
    assert!(matches!(outcome, ShutdownOutcome::Forced { discarded } if discarded > 0));
    cache.close();

    let cancelled = handles
        .into_iter()
        .map(|h| h.join())
        .filter(|result| matches!(result, Err(TaskError::Cancelled)))
        .count();
    assert!(cancelled > 0);
    assert_eq!(factory.stats().released(), factory.stats().opens());
    assert_eq!(factory.stats().affinity_violations(), 0);
}

#[test]
fn rendered_document_streams_into_a_zip_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("report.zip");
    let factory = SyntheticFactory::uniform(10, Rectangle::sized(36.0, 48.0));
    let renderer = PageBatchRenderer::open(
        factory,
        source(),
        &BatchOptions {
            parallelism: Some(4),
            batch_size: 4,
            ..BatchOptions::default()
        },
    )
    .unwrap();

    let written = export::write_to_path(&output, |writer| -> Result<usize, pagepool::BatchError> {
        let mut archive = ArchiveWriter::new(writer, OutputFormat::Png, "report");
        renderer.render_in_batches(0..renderer.page_count(), 72, ImageMode::Gray, |page, image| {
            archive.add_page(page, &image)?;
            Ok(())
        })?;
        let entries = archive.entries();
        archive.finish()?;
        Ok(entries)
    })
    .unwrap();
    assert!(renderer.finish().is_graceful());
    assert_eq!(written, 10);

    let bytes = std::fs::read(&output).unwrap();
    let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert_eq!(zip.len(), 10);
    let names: HashSet<String> = zip.file_names().map(str::to_string).collect();
    for page in 1..=10 {
        assert!(names.contains(&format!("report_{page}.png")));
    }
    let entry = zip.by_name("report_10.png").unwrap();
    assert!(entry.size() > 0);
}

#[test]
fn combined_image_stacks_pages_in_order() {
    let factory = SyntheticFactory::new(vec![
        (Rectangle::sized(72.0, 36.0), 0),
        (Rectangle::sized(36.0, 36.0), 0),
        (Rectangle::sized(72.0, 72.0), 0),
    ]);
    let images = render_document(
        factory,
        source(),
        72,
        ImageMode::Gray,
        &BatchOptions::default(),
    )
    .unwrap();
    let combined = export::combine_vertically(&images).unwrap();

    assert_eq!((combined.width(), combined.height()), (72, 144));
    assert_eq!(combined.pixel(0, 0), &[page_shade(0)]);
    // second page is 36 wide, centered: columns 18..54
    assert_eq!(combined.pixel(0, 36), &[0xFF]);
    assert_eq!(combined.pixel(18, 36), &[page_shade(1)]);
    assert_eq!(combined.pixel(71, 143), &[page_shade(2)]);
}
