//! Immutable description of where the source document lives

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The document every bundle is opened from.
///
/// Cloning is cheap: in-memory sources share one buffer.
#[derive(Clone)]
pub enum SourceDescriptor {
    /// Document bytes already loaded into memory
    Bytes(Arc<[u8]>),
    /// Document on disk, opened independently by each bundle
    Path(PathBuf),
}

impl SourceDescriptor {
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes(bytes.into())
    }

    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Read a file fully into memory
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::Bytes(bytes.into()))
    }

    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Bytes(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Path(_) => None,
        }
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Path(path) => write!(f, "Path({})", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_buffer() {
        let source = SourceDescriptor::from_bytes(vec![1_u8, 2, 3]);
        let copy = source.clone();

        match (&source, &copy) {
            (SourceDescriptor::Bytes(a), SourceDescriptor::Bytes(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected byte sources"),
        }
        assert_eq!(copy.as_bytes(), Some(&[1_u8, 2, 3][..]));
        assert!(copy.as_path().is_none());
    }

    #[test]
    fn debug_does_not_dump_bytes() {
        let source = SourceDescriptor::from_bytes(vec![0_u8; 2048]);
        assert_eq!(format!("{source:?}"), "Bytes(2048 bytes)");
    }

    #[test]
    fn load_reads_file_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        let source = SourceDescriptor::load(&path).unwrap();
        assert_eq!(source.as_bytes(), Some(&b"%PDF-1.7"[..]));
    }
}
