//! Document backends

#[cfg(feature = "pdf")]
pub mod mupdf;
