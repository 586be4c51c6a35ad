//! Glob-directed tail across rotated files

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::{Result, Tail, TailConfig, TailError};

// ----------------------------------------------------------------------------
// Rotating Tail
// ----------------------------------------------------------------------------

/// Follows the newest file matching a glob pattern
///
/// Rotation schemes like `access.log` / `access.log.1` leave a family of
/// files behind one pattern. On every [`scan`] the matches are sorted by
/// mtime and the newest becomes the tailed file; when that selection
/// changes, the old tail is torn down and the replacement is read from
/// byte 0 so nothing written to it before the swap is lost.
///
/// [`scan`]: RotatingTail::scan
pub struct RotatingTail {
    pattern: String,
    config: TailConfig,
    current: Option<Tail>,
}

impl RotatingTail {
    /// Follow `pattern` with the default configuration
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        Self::with_config(pattern, TailConfig::default())
    }

    pub fn with_config(pattern: impl Into<String>, config: TailConfig) -> Result<Self> {
        let pattern = pattern.into();
        // Validate eagerly; the scan loop treats the pattern as trusted.
        glob::Pattern::new(&pattern).map_err(|source| TailError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        Ok(Self {
            pattern,
            config,
            current: None,
        })
    }

    /// The newest match by mtime, if any
    ///
    /// Matches whose metadata cannot be read (deleted between the glob
    /// expansion and the stat) are dropped from the scan.
    fn newest_match(&self) -> Result<Option<PathBuf>> {
        let paths = glob::glob(&self.pattern).map_err(|source| TailError::Pattern {
            pattern: self.pattern.clone(),
            source,
        })?;

        let mut candidates: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(%err, "skipping unreadable glob match");
                    continue;
                }
            };
            match std::fs::metadata(&path).and_then(|md| md.modified()) {
                Ok(mtime) => candidates.push((mtime, path)),
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping match that vanished during the scan");
                }
            }
        }

        candidates.sort_by_key(|(mtime, _)| *mtime);
        Ok(candidates.pop().map(|(_, path)| path))
    }

    /// Re-select the tailed file; returns whether the selection changed
    pub fn scan(&mut self) -> Result<bool> {
        let Some(path) = self.newest_match()? else {
            if self.current.take().is_some() {
                warn!(pattern = %self.pattern, "no file matches the pattern any more");
            }
            return Ok(false);
        };

        if let Some(tail) = &self.current {
            if tail.path() == path {
                return Ok(false);
            }
            info!(
                old = %tail.path().display(),
                new = %path.display(),
                "log rotation detected"
            );
            // Data lands in the fresh file between our last read and this
            // swap; start at byte 0, never at the end.
            let config = TailConfig {
                seek_to_end_on_first_open: false,
                ..self.config.clone()
            };
            self.current = Some(Tail::with_config(path, config));
            return Ok(true);
        }

        debug!(path = %path.display(), "started following");
        self.current = Some(Tail::with_config(path, self.config.clone()));
        Ok(true)
    }

    /// Read the next line of the currently tailed file
    pub fn read_line(&mut self) -> Result<Option<String>> {
        match self.current.as_mut() {
            Some(tail) => tail.read_line(),
            None => Ok(None),
        }
    }

    /// Re-scan the pattern, then deliver every available line
    pub fn dispatch<B, F>(&mut self, callback: F) -> Result<Option<B>>
    where
        F: FnMut(&str) -> ControlFlow<B>,
    {
        self.scan()?;
        match self.current.as_mut() {
            Some(tail) => tail.dispatch(callback),
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn from_start() -> TailConfig {
        TailConfig {
            seek_to_end_on_first_open: false,
            ..Default::default()
        }
    }

    fn drain(tail: &mut RotatingTail) -> Vec<String> {
        let mut lines = Vec::new();
        tail.dispatch(|line| {
            lines.push(line.to_owned());
            ControlFlow::<()>::Continue(())
        })
        .unwrap();
        lines
    }

    /// Let mtimes tell rotated files apart even on coarse filesystems.
    fn settle() {
        std::thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn test_rotation_switches_to_the_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t.log");
        let pattern = format!("{}/t.log*", dir.path().display());
        fs::write(&log, "a\nb\nc\n").unwrap();

        let mut tail = RotatingTail::with_config(&pattern, from_start()).unwrap();
        assert_eq!(drain(&mut tail), ["a\n", "b\n", "c\n"]);

        fs::rename(&log, dir.path().join("t.log.1")).unwrap();
        settle();
        fs::write(&log, "d\ne\n").unwrap();

        // Only the fresh file's lines; nothing from t.log.1 re-emitted.
        assert_eq!(drain(&mut tail), ["d\n", "e\n"]);
        assert_eq!(drain(&mut tail), Vec::<String>::new());
    }

    #[test]
    fn test_newest_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), "old\n").unwrap();
        settle();
        fs::write(dir.path().join("b.log"), "new\n").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let mut tail = RotatingTail::with_config(&pattern, from_start()).unwrap();
        assert_eq!(drain(&mut tail), ["new\n"]);
    }

    #[test]
    fn test_empty_pattern_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/absent*.log", dir.path().display());

        let mut tail = RotatingTail::with_config(&pattern, from_start()).unwrap();
        assert_eq!(drain(&mut tail), Vec::<String>::new());

        // A file appearing later is picked up on the next scan.
        fs::write(dir.path().join("absent-1.log"), "x\n").unwrap();
        assert_eq!(drain(&mut tail), ["x\n"]);
    }

    #[test]
    fn test_swapped_in_file_starts_at_byte_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("access.1.log"), "history\n").unwrap();

        // Default config: the first selection starts at the end, the
        // usual tail -f behavior.
        let pattern = format!("{}/access.*.log", dir.path().display());
        let mut tail = RotatingTail::new(&pattern).unwrap();
        assert_eq!(drain(&mut tail), Vec::<String>::new());

        // A rotated-in sibling must be read from the start instead, or
        // everything written before the swap would be lost.
        settle();
        fs::write(dir.path().join("access.2.log"), "fresh\n").unwrap();
        assert_eq!(drain(&mut tail), ["fresh\n"]);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(matches!(
            RotatingTail::new("logs/[unterminated"),
            Err(TailError::Pattern { .. })
        ));
    }

    #[test]
    fn test_rotation_swap_loses_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("t.log");
        let pattern = format!("{}/t.log*", dir.path().display());
        fs::write(&log, "1\n").unwrap();

        let mut tail = RotatingTail::with_config(&pattern, from_start()).unwrap();
        assert_eq!(drain(&mut tail), ["1\n"]);

        // Rotate, and write to the replacement before the next scan.
        fs::rename(&log, dir.path().join("t.log.1")).unwrap();
        settle();
        fs::write(&log, "2\n3\n").unwrap();
        settle();

        assert_eq!(drain(&mut tail), ["2\n", "3\n"]);
    }
}
