use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use pagepool::backend::mupdf::MupdfFactory;
use pagepool::convert::PageBatchRenderer;
use pagepool::export::{self, ArchiveWriter, OutputFormat, VerticalStack};
use pagepool::panic_handler;
use pagepool::settings::{RenderSettings, default_config_path};
use pagepool::{BatchError, ImageMode, SourceDescriptor};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Rgb,
    Gray,
    Binary,
    Rgba,
}

impl From<ModeArg> for ImageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Rgb => ImageMode::Rgb,
            ModeArg::Gray => ImageMode::Gray,
            ModeArg::Binary => ImageMode::Binary,
            ModeArg::Rgba => ImageMode::Rgba,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Png,
    #[value(alias = "jpg")]
    Jpeg,
    Gif,
    Webp,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Png => OutputFormat::Png,
            FormatArg::Jpeg => OutputFormat::Jpeg,
            FormatArg::Gif => OutputFormat::Gif,
            FormatArg::Webp => OutputFormat::Webp,
        }
    }
}

/// Render every page of a PDF to images, in parallel.
#[derive(Parser, Debug)]
#[command(name = "pagepool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// PDF file to render
    input: PathBuf,

    /// Output file; defaults to the input name with .zip or the image extension
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Resolution in dots per inch
    #[arg(long)]
    dpi: Option<u32>,

    /// Color mode of the rendered pages
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Image format of each page
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Write one image with all pages stacked instead of a zip archive
    #[arg(long)]
    single: bool,

    /// Number of render workers; derived from the page count when omitted
    #[arg(long)]
    workers: Option<usize>,

    /// Render page content only, without annotations or form fields
    #[arg(long)]
    no_annotations: bool,

    /// Load the whole file into memory instead of letting each worker open it
    #[arg(long)]
    in_memory: bool,

    /// Settings file; defaults to the platform config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the log here instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn init_logging(args: &Args) -> Result<()> {
    match &args.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("could not create log file {}", path.display()))?;
            WriteLogger::init(args.log_level, Config::default(), file)?;
        }
        None => WriteLogger::init(args.log_level, Config::default(), std::io::stderr())?,
    }
    Ok(())
}

fn load_settings(args: &Args) -> Result<RenderSettings> {
    match &args.config {
        Some(path) => Ok(RenderSettings::load_from(path)?),
        None => Ok(RenderSettings::load_or_default()),
    }
}

fn default_output(input: &Path, single: bool, format: OutputFormat) -> PathBuf {
    let extension = if single { format.extension() } else { "zip" };
    input.with_extension(extension)
}

fn base_name(input: &Path) -> String {
    input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    panic_handler::initialize_panic_handler();

    let settings = load_settings(&args)?;
    if args.config.is_none() {
        if let Some(path) = default_config_path() {
            info!("Settings path: {path:?}");
        }
    }

    let dpi = args.dpi.unwrap_or(settings.default_dpi);
    let mode = args.mode.map(ImageMode::from).unwrap_or(settings.default_mode);
    let format = args.format.map(OutputFormat::from).unwrap_or(settings.default_format);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input, args.single, format));

    let mut options = settings.batch_options();
    options.parallelism = args.workers;
    if args.no_annotations {
        options.cache.include_annotations = false;
    }

    let source = if args.in_memory {
        SourceDescriptor::load(&args.input)
            .with_context(|| format!("could not read {}", args.input.display()))?
    } else {
        if !args.input.is_file() {
            bail!("{} is not a file", args.input.display());
        }
        SourceDescriptor::from_path(&args.input)
    };

    info!(
        "Rendering {} at {dpi} DPI ({mode}, {format}) to {}",
        args.input.display(),
        output.display()
    );
    let started = Instant::now();

    let renderer = PageBatchRenderer::open(MupdfFactory, source, &options)?;
    let result = if args.single {
        render_single(&renderer, &output, dpi, mode, format)
    } else {
        render_archive(&renderer, &output, &base_name(&args.input), dpi, mode, format)
    };
    let outcome = renderer.finish();
    if !outcome.is_graceful() {
        warn!("Render pool shut down with {outcome:?}");
    }

    match result {
        Ok(pages) => {
            info!(
                "Wrote {pages} pages to {} in {:.2?}",
                output.display(),
                started.elapsed()
            );
            Ok(())
        }
        Err(err) if err.is_out_of_memory() => {
            error!("{err}");
            bail!("{err}. Try a lower --dpi or fewer --workers.")
        }
        Err(err) => Err(err.into()),
    }
}

fn render_archive(
    renderer: &PageBatchRenderer<MupdfFactory>,
    output: &Path,
    base_name: &str,
    dpi: u32,
    mode: ImageMode,
    format: OutputFormat,
) -> Result<usize, BatchError> {
    let pages = renderer.page_count();
    export::write_to_path(output, |writer| {
        let mut archive = ArchiveWriter::new(writer, format, base_name);
        renderer.render_in_batches(0..pages, dpi, mode, |page, image| {
            archive.add_page(page, &image)?;
            Ok(())
        })?;
        let entries = archive.entries();
        archive.finish()?;
        Ok(entries)
    })
}

fn render_single(
    renderer: &PageBatchRenderer<MupdfFactory>,
    output: &Path,
    dpi: u32,
    mode: ImageMode,
    format: OutputFormat,
) -> Result<usize, BatchError> {
    let sizes = renderer.page_sizes(dpi)?;
    let mut stack = VerticalStack::new(&sizes, mode)?;
    renderer.render_in_batches(0..sizes.len(), dpi, mode, |_, image| {
        stack.push(&image)?;
        Ok(())
    })?;
    export::write_image(output, &stack.finish(), format)?;
    Ok(sizes.len())
}
