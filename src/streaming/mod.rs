//! Streaming utilities for writing downloads to disk.
//!
//! Downloads land in a temporary file next to the destination and are
//! atomically renamed into place, with automatic cleanup on failure.

mod atomic_writer;

pub use atomic_writer::AtomicDownload;
