//! Encoding rendered pages and writing them out.
//!
//! Pages go either into a zip archive, one image file per page, or into a
//! single tall image with the pages stacked top to bottom. Files are written
//! through a temporary file beside the destination, so a failed export never
//! leaves a half-written file behind.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;
use std::str::FromStr;

use image::{DynamicImage, ExtendedColorType, ImageFormat};
use log::debug;
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ExportError;
use crate::types::{ImageMode, RasterImage};

/// Image file format for exported pages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Gif => "gif",
            OutputFormat::Webp => "webp",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Gif => ImageFormat::Gif,
            OutputFormat::Webp => ImageFormat::WebP,
        }
    }

    /// Color type this format can take directly, or `None` if the pixels
    /// must be converted first
    fn native_color(self, mode: ImageMode) -> Option<ExtendedColorType> {
        let color = match mode {
            ImageMode::Binary | ImageMode::Gray => ExtendedColorType::L8,
            ImageMode::Rgb => ExtendedColorType::Rgb8,
            ImageMode::Rgba => ExtendedColorType::Rgba8,
        };
        match (self, mode) {
            (OutputFormat::Png, _) => Some(color),
            (OutputFormat::Jpeg, ImageMode::Rgba) => None,
            (OutputFormat::Jpeg, _) => Some(color),
            (OutputFormat::Gif, _) => None,
            (OutputFormat::Webp, ImageMode::Rgb | ImageMode::Rgba) => Some(color),
            (OutputFormat::Webp, _) => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "gif" => Ok(OutputFormat::Gif),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(format!("unsupported image format: {other}")),
        }
    }
}

/// Encode one page
pub fn encode(image: &RasterImage, format: OutputFormat) -> Result<Vec<u8>, ExportError> {
    let mut buffer = Cursor::new(Vec::new());
    encode_into(image, format, &mut buffer)?;
    Ok(buffer.into_inner())
}

fn encode_into<W: Write + Seek>(
    image: &RasterImage,
    format: OutputFormat,
    writer: &mut W,
) -> Result<(), ExportError> {
    if let Some(color) = format.native_color(image.mode()) {
        image::write_buffer_with_format(
            writer,
            image.pixels(),
            image.width(),
            image.height(),
            color,
            format.image_format(),
        )?;
        return Ok(());
    }

    let dynamic = image.clone().into_dynamic_image();
    let converted = match format {
        OutputFormat::Gif => DynamicImage::ImageRgba8(dynamic.to_rgba8()),
        // JPEG has no alpha channel and WebP takes color input only
        _ => DynamicImage::ImageRgb8(dynamic.to_rgb8()),
    };
    converted.write_to(writer, format.image_format())?;
    Ok(())
}

/// Zip archive of page images, written one page at a time.
///
/// Entries are named `{base_name}_{page + 1}.{ext}`.
pub struct ArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    format: OutputFormat,
    base_name: String,
    entries: usize,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    pub fn new(writer: W, format: OutputFormat, base_name: impl Into<String>) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            format,
            base_name: base_name.into(),
            entries: 0,
        }
    }

    /// Name of the entry for zero-based `page`
    #[must_use]
    pub fn entry_name(&self, page: usize) -> String {
        format!("{}_{}.{}", self.base_name, page + 1, self.format.extension())
    }

    pub fn add_page(&mut self, page: usize, image: &RasterImage) -> Result<(), ExportError> {
        let bytes = encode(image, self.format)?;
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        self.zip.start_file(self.entry_name(page), options)?;
        self.zip.write_all(&bytes)?;
        self.entries += 1;
        Ok(())
    }

    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Write the central directory and hand back the writer
    pub fn finish(mut self) -> Result<W, ExportError> {
        let writer = self.zip.finish()?;
        debug!("Wrote archive with {} entries", self.entries);
        Ok(writer)
    }
}

/// Write `images` (in page order) as a zip archive into `writer`
pub fn write_archive<W: Write + Seek>(
    images: &[RasterImage],
    format: OutputFormat,
    base_name: &str,
    writer: W,
) -> Result<W, ExportError> {
    if images.is_empty() {
        return Err(ExportError::NoPages);
    }
    let mut archive = ArchiveWriter::new(writer, format, base_name);
    for (page, image) in images.iter().enumerate() {
        archive.add_page(page, image)?;
    }
    archive.finish()
}

/// Builds one image out of pages stacked top to bottom.
///
/// The canvas is as wide as the widest page; narrower pages are centered.
/// Uncovered areas stay white, or transparent for RGBA output.
pub struct VerticalStack {
    canvas: RasterImage,
    next_row: u32,
}

impl VerticalStack {
    /// Allocate a canvas for pages of the given sizes
    pub fn new(sizes: &[(u32, u32)], mode: ImageMode) -> Result<Self, ExportError> {
        if sizes.is_empty() {
            return Err(ExportError::NoPages);
        }
        let width = sizes.iter().map(|&(w, _)| u64::from(w)).max().unwrap_or(1);
        let height: u64 = sizes.iter().map(|&(_, h)| u64::from(h)).sum();
        let too_large = || ExportError::CombinedTooLarge { width, height };

        let (Ok(w), Ok(h)) = (u32::try_from(width), u32::try_from(height)) else {
            return Err(too_large());
        };
        let canvas = RasterImage::try_allocate(w, h, mode).map_err(|_| too_large())?;
        Ok(Self {
            canvas,
            next_row: 0,
        })
    }

    /// Draw the next page below the previous one
    pub fn push(&mut self, page: &RasterImage) -> Result<(), ExportError> {
        if page.mode() != self.canvas.mode() {
            return Err(ExportError::ModeMismatch {
                expected: self.canvas.mode(),
                found: page.mode(),
            });
        }
        let fits = page.width() <= self.canvas.width()
            && u64::from(self.next_row) + u64::from(page.height())
                <= u64::from(self.canvas.height());
        if !fits {
            return Err(ExportError::PageOutsideCanvas {
                width: page.width(),
                height: page.height(),
            });
        }

        let bpp = page.mode().bytes_per_pixel();
        let offset = ((self.canvas.width() - page.width()) / 2) as usize * bpp;
        for y in 0..page.height() {
            let src = page.row(y);
            let dst = self.canvas.row_mut(self.next_row + y);
            dst[offset..offset + src.len()].copy_from_slice(src);
        }
        self.next_row += page.height();
        Ok(())
    }

    #[must_use]
    pub fn finish(self) -> RasterImage {
        self.canvas
    }
}

/// Stack `images` into one image, in order
pub fn combine_vertically(images: &[RasterImage]) -> Result<RasterImage, ExportError> {
    let Some(first) = images.first() else {
        return Err(ExportError::NoPages);
    };
    let sizes: Vec<(u32, u32)> = images.iter().map(|i| (i.width(), i.height())).collect();
    let mut stack = VerticalStack::new(&sizes, first.mode())?;
    for image in images {
        stack.push(image)?;
    }
    Ok(stack.finish())
}

/// Create `path` by letting `write` fill a temporary file in the same
/// directory, then moving it into place.
///
/// The temporary file is removed if `write` fails or the move does.
pub fn write_to_path<R, E>(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<R, E>,
) -> Result<R, E>
where
    E: From<ExportError>,
{
    let io = |err: std::io::Error| E::from(ExportError::Io(err));
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let temp = tempfile::Builder::new()
        .prefix(".pagepool-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(io)?;
    let (file, temp_path) = temp.into_parts();

    let mut writer = BufWriter::new(file);
    let result = write(&mut writer)?;
    let file = writer.into_inner().map_err(|err| io(err.into_error()))?;
    file.sync_all().map_err(io)?;

    temp_path.persist(path).map_err(|err| io(err.error))?;
    debug!("Wrote {path:?}");
    Ok(result)
}

/// Encode a single image straight to `path`
pub fn write_image(
    path: &Path,
    image: &RasterImage,
    format: OutputFormat,
) -> Result<(), ExportError> {
    write_to_path(path, |writer| encode_into(image, format, writer))
}
