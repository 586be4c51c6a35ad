//! Single-file tail follower

use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::{Result, TailError};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Default cap on the length of a single delivered line
pub const DEFAULT_MAX_LINE_LEN: usize = 8192;

/// Tuning knobs for a [`Tail`]
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Longest line delivered in one piece. A line that outgrows this
    /// while more data follows is delivered in chunks; size it for the
    /// largest expected record.
    pub max_line_len: usize,
    /// Start reading at the end of the file on the very first open, the
    /// `tail -f` behavior. Files opened after a rotation are always read
    /// from the start regardless.
    pub seek_to_end_on_first_open: bool,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
            seek_to_end_on_first_open: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Tail
// ----------------------------------------------------------------------------

/// Device and inode pair identifying the physical file behind a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

/// Follows one path across truncation and replacement
///
/// Every [`read_line`] call re-stats the path first: a changed inode
/// means the file was replaced and the new one is opened (from byte 0,
/// so nothing written to it is skipped); a shrunken size means in-place
/// truncation and rewinds the open handle. A missing file is a
/// transient condition, not an error.
///
/// [`read_line`]: Tail::read_line
pub struct Tail {
    path: PathBuf,
    config: TailConfig,
    file: Option<BufReader<File>>,
    id: Option<FileId>,
    size: u64,
}

fn io_error(path: &Path, source: std::io::Error) -> TailError {
    TailError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Tail {
    /// Follow `path` with the default configuration
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, TailConfig::default())
    }

    pub fn with_config(path: impl Into<PathBuf>, config: TailConfig) -> Self {
        Self {
            path: path.into(),
            config,
            file: None,
            id: None,
            size: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next complete line, newline included
    ///
    /// `Ok(None)` means nothing to deliver right now: end of file, the
    /// file is absent, or the final line is still being written.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let md = match fs::metadata(&self.path) {
            Ok(md) => md,
            Err(err) => {
                // Briefly absent during a rotation; retry next cycle.
                trace!(path = %self.path.display(), %err, "stat failed, treating as absent");
                return Ok(None);
            }
        };
        let id = FileId {
            dev: md.dev(),
            ino: md.ino(),
        };

        if self.id != Some(id) {
            let file = match File::open(&self.path) {
                Ok(file) => file,
                // Unlinked between stat and open.
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(io_error(&self.path, err)),
            };
            let mut reader = BufReader::new(file);
            if self.id.is_none() && self.config.seek_to_end_on_first_open {
                reader
                    .seek(SeekFrom::End(0))
                    .map_err(|err| io_error(&self.path, err))?;
            }
            if self.id.is_some() {
                debug!(path = %self.path.display(), "file was replaced, reading the new one from the start");
            }
            self.file = Some(reader);
            self.id = Some(id);
        } else if md.len() < self.size {
            debug!(path = %self.path.display(), "file was truncated in place, rewinding");
            if let Some(reader) = self.file.as_mut() {
                reader
                    .seek(SeekFrom::Start(0))
                    .map_err(|err| io_error(&self.path, err))?;
            }
        }
        self.size = md.len();

        let Some(reader) = self.file.as_mut() else {
            return Ok(None);
        };
        read_one_line(reader, &self.path, self.config.max_line_len)
    }

    /// Deliver every available complete line to `callback`
    ///
    /// Stops at end of input, on error, or when the callback breaks; a
    /// break value is returned verbatim. Lines already delivered are
    /// never re-delivered by a later call.
    pub fn dispatch<B, F>(&mut self, mut callback: F) -> Result<Option<B>>
    where
        F: FnMut(&str) -> ControlFlow<B>,
    {
        while let Some(line) = self.read_line()? {
            if let ControlFlow::Break(value) = callback(&line) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

// ----------------------------------------------------------------------------
// Line Reader
// ----------------------------------------------------------------------------

enum Step {
    Eof,
    Line(usize),
    Chunk(usize),
}

fn read_one_line(
    reader: &mut BufReader<File>,
    path: &Path,
    max_line_len: usize,
) -> Result<Option<String>> {
    let mut line: Vec<u8> = Vec::new();

    loop {
        let step = {
            let available = reader.fill_buf().map_err(|err| io_error(path, err))?;
            if available.is_empty() {
                Step::Eof
            } else {
                let room = max_line_len - line.len();
                let scan = &available[..available.len().min(room)];
                match scan.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        line.extend_from_slice(&scan[..=pos]);
                        Step::Line(pos + 1)
                    }
                    None => {
                        line.extend_from_slice(scan);
                        Step::Chunk(scan.len())
                    }
                }
            }
        };

        match step {
            Step::Eof => {
                if !line.is_empty() {
                    // The writer has not finished this line yet. Hold it
                    // back so the next cycle delivers it whole.
                    reader
                        .seek_relative(-(line.len() as i64))
                        .map_err(|err| io_error(path, err))?;
                }
                return Ok(None);
            }
            Step::Line(consumed) => {
                reader.consume(consumed);
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            Step::Chunk(consumed) => {
                reader.consume(consumed);
                if line.len() == max_line_len {
                    let at_eof = reader
                        .fill_buf()
                        .map_err(|err| io_error(path, err))?
                        .is_empty();
                    if at_eof {
                        reader
                            .seek_relative(-(line.len() as i64))
                            .map_err(|err| io_error(path, err))?;
                        return Ok(None);
                    }
                    // More data follows; deliver the buffer-sized chunk.
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn from_start() -> TailConfig {
        TailConfig {
            seek_to_end_on_first_open: false,
            ..Default::default()
        }
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    fn drain(tail: &mut Tail) -> Vec<String> {
        let mut lines = Vec::new();
        tail.dispatch(|line| {
            lines.push(line.to_owned());
            ControlFlow::<()>::Continue(())
        })
        .unwrap();
        lines
    }

    #[test]
    fn test_plain_tail_delivers_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "a\nb\nc\n").unwrap();

        let mut tail = Tail::with_config(&path, from_start());
        assert_eq!(drain(&mut tail), ["a\n", "b\n", "c\n"]);
        assert_eq!(drain(&mut tail), Vec::<String>::new());
    }

    #[test]
    fn test_default_starts_at_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "old\n").unwrap();

        let mut tail = Tail::new(&path);
        assert_eq!(tail.read_line().unwrap(), None);

        append(&path, "new\n");
        assert_eq!(tail.read_line().unwrap().as_deref(), Some("new\n"));
    }

    #[test]
    fn test_in_place_truncation_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "a\nb\nc\n").unwrap();

        let mut tail = Tail::with_config(&path, from_start());
        assert_eq!(drain(&mut tail).len(), 3);

        // Same inode, smaller size.
        fs::write(&path, "x\n").unwrap();
        assert_eq!(drain(&mut tail), ["x\n"]);
    }

    #[test]
    fn test_replacement_is_read_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "a\n").unwrap();

        // Even with seek-to-end configured, a rotated-in file must be
        // read from byte 0.
        let mut tail = Tail::new(&path);
        assert_eq!(tail.read_line().unwrap(), None);

        fs::rename(&path, dir.path().join("t.log.1")).unwrap();
        fs::write(&path, "d\ne\n").unwrap();
        assert_eq!(drain(&mut tail), ["d\n", "e\n"]);
    }

    #[test]
    fn test_absent_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");

        let mut tail = Tail::with_config(&path, from_start());
        assert_eq!(tail.read_line().unwrap(), None);

        fs::write(&path, "here\n").unwrap();
        assert_eq!(drain(&mut tail), ["here\n"]);
    }

    #[test]
    fn test_unfinished_line_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "abc").unwrap();

        let mut tail = Tail::with_config(&path, from_start());
        assert_eq!(tail.read_line().unwrap(), None);

        append(&path, "def\n");
        assert_eq!(drain(&mut tail), ["abcdef\n"]);
    }

    #[test]
    fn test_overlong_line_is_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "0123456789AB\n").unwrap();

        let config = TailConfig {
            max_line_len: 8,
            seek_to_end_on_first_open: false,
        };
        let mut tail = Tail::with_config(&path, config);
        assert_eq!(drain(&mut tail), ["01234567", "89AB\n"]);
    }

    #[test]
    fn test_full_buffer_at_eof_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "01234567").unwrap();

        let config = TailConfig {
            max_line_len: 8,
            seek_to_end_on_first_open: false,
        };
        let mut tail = Tail::with_config(&path, config);
        // Exactly a buffer's worth with no newline and no data after it:
        // could still be a line in progress.
        assert_eq!(tail.read_line().unwrap(), None);
    }

    #[test]
    fn test_callback_break_is_returned_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        fs::write(&path, "a\nb\nc\n").unwrap();

        let mut tail = Tail::with_config(&path, from_start());
        let stopped = tail
            .dispatch(|line| {
                if line.starts_with('b') {
                    ControlFlow::Break(42)
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(stopped, Some(42));

        // The scan resumes after the line that stopped it.
        assert_eq!(drain(&mut tail), ["c\n"]);
    }
}
