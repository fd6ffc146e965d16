//! Error types shared by the cache, the bundles and the pools

/// Faults reported by a document backend
#[derive(Debug, thiserror::Error)]
pub enum BackendFault {
    #[error("document engine: {detail}")]
    Engine { detail: String },

    #[error("document engine ran out of memory")]
    OutOfMemory,

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendFault {
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine { detail: msg.into() }
    }
}

/// Errors returned by [`crate::AffinityCache`] operations
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("source document could not be opened: {detail}")]
    SourceUnreadable { detail: String },

    #[error("page index {page} is out of range (document has {page_count} pages)")]
    PageIndexOutOfRange { page: usize, page_count: usize },

    /// The caller should retry at a lower resolution.
    #[error("out of memory rendering page {page} at {dpi} DPI")]
    OutOfMemoryDuringRender { page: usize, dpi: u32 },

    #[error("DPI must be greater than zero")]
    InvalidDpi,

    #[error("DPI value {dpi} exceeds maximum safe limit of {max}")]
    DpiExceedsLimit { dpi: u32, max: u32 },

    #[error("page {page} at {dpi} DPI would be {width}x{height} pixels, which is too large to render")]
    DimensionsTooLarge {
        page: usize,
        dpi: u32,
        width: u32,
        height: u32,
    },

    #[error("resource cache is closed")]
    CacheClosed,

    #[error("rendering page {page} failed: {source}")]
    Backend {
        page: usize,
        #[source]
        source: BackendFault,
    },
}

impl RenderError {
    /// True for failures that a retry at a lower DPI may fix
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemoryDuringRender { .. } | Self::DimensionsTooLarge { .. }
        )
    }
}

/// Why a submitted task produced no value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task rejected: {name} is shut down")]
    Rejected { name: String },

    #[error("task was cancelled before it could run")]
    Cancelled,

    #[error("task panicked: {message}")]
    Panicked { message: String },

    #[error("timed out waiting for task result")]
    TimedOut,

    #[error("could not start a thread for the task: {detail}")]
    SpawnFailed { detail: String },

    #[error("period between runs of a periodic task must be greater than zero")]
    ZeroPeriod,
}

/// Errors from rendering a whole document in batches
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("page {page}: {source}")]
    Task {
        page: usize,
        #[source]
        source: TaskError,
    },

    #[error("could not start worker threads: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Export(#[from] ExportError),
}

impl BatchError {
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::Render(err) if err.is_out_of_memory())
    }
}

/// Errors from encoding and writing rendered pages
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("image encoding: {0}")]
    Image(#[from] image::ImageError),

    #[error("there are no pages to write")]
    NoPages,

    #[error("combined image would be {width}x{height} pixels, which is too large")]
    CombinedTooLarge { width: u64, height: u64 },

    #[error("page is {found} but the combined image is {expected}")]
    ModeMismatch {
        expected: crate::types::ImageMode,
        found: crate::types::ImageMode,
    },

    #[error("{width}x{height} page does not fit in the remaining canvas")]
    PageOutsideCanvas { width: u32, height: u32 },
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_distinct_from_backend_failure() {
        let oom = RenderError::OutOfMemoryDuringRender { page: 3, dpi: 600 };
        let io = RenderError::Backend {
            page: 3,
            source: BackendFault::Io(std::io::Error::other("disk")),
        };

        assert!(oom.is_out_of_memory());
        assert!(!io.is_out_of_memory());
        assert_eq!(oom.to_string(), "out of memory rendering page 3 at 600 DPI");
    }

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
