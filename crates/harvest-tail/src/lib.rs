//! Rotating-log tail engine
//!
//! Follows append-only files the way `tail -f` does, surviving the ways
//! log files actually change underneath a reader: in-place truncation,
//! rename-and-recreate rotation, and rotation schemes that leave a glob
//! of suffixed siblings behind. Lines are delivered whole, at most once
//! per physical line.
//!
//! [`Tail`] follows one exact path; [`RotatingTail`] follows whichever
//! file matching a glob pattern is newest by mtime.

use std::path::PathBuf;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

mod rotate;
mod tailer;

pub use rotate::RotatingTail;
pub use tailer::{Tail, TailConfig};

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the tail engine
///
/// A missing file or an empty glob is not an error: reads yield nothing
/// and the caller retries on its next cycle. These variants are the
/// failures that are worth tearing a tailer down for.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

pub type Result<T> = core::result::Result<T, TailError>;
