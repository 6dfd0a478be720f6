// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails a single file and hands every complete line to a callback.
//!
//! A `LineBuffer` starts at the end of the file, so history is never replayed.
//! Each call to [`LineBuffer::read_new_lines`] consumes the newline-terminated
//! lines appended since the last call. An incomplete trailing line is left in
//! place and picked up once its newline arrives.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{LineBufferError, ShipperError};

/// Per-line callback: registered filename and the line without its terminator.
pub type LineHandler = Arc<dyn Fn(&Path, &[u8]) -> Result<(), ShipperError> + Send + Sync>;

pub struct LineBuffer {
    name: PathBuf,
    file: File,
    offset: u64,
    handler: LineHandler,
}

impl fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBuffer")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl LineBuffer {
    /// Opens `path` and positions the read offset at its current end.
    pub fn new(path: impl Into<PathBuf>, handler: LineHandler) -> Result<Self, LineBufferError> {
        let name = path.into();
        let mut file = File::open(&name).map_err(|source| LineBufferError::Open {
            path: name.clone(),
            source,
        })?;
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|source| LineBufferError::Io {
                path: name.clone(),
                source,
            })?;
        debug!("Tailing {} from offset {}", name.display(), offset);

        Ok(Self {
            name,
            file,
            offset,
            handler,
        })
    }

    #[must_use]
    pub fn name(&self) -> &Path {
        &self.name
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_size(&self) -> Result<u64, LineBufferError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|source| self.io_error(source))
    }

    /// Resets the offset to the end of the file if the file shrank under it.
    ///
    /// Returns `true` when a reset happened.
    pub fn validate_offset(&mut self) -> Result<bool, LineBufferError> {
        let size = self.file_size()?;
        if self.offset <= size {
            return Ok(false);
        }
        warn!(
            "{} was truncated (offset {} > size {}), resuming from end of file",
            self.name.display(),
            self.offset,
            size
        );
        self.offset = size;
        Ok(true)
    }

    /// Reads every complete line appended since the last call.
    ///
    /// The offset only moves past a line after the handler accepted it, so a
    /// handler failure leaves the failing line to be read again.
    pub fn read_new_lines(&mut self) -> Result<usize, LineBufferError> {
        (&self.file)
            .seek(SeekFrom::Start(self.offset))
            .map_err(|source| self.io_error(source))?;
        let mut reader = BufReader::new(&self.file);
        let mut line = Vec::new();
        let mut count = 0;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|source| LineBufferError::Io {
                    path: self.name.clone(),
                    source,
                })?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }

            (self.handler)(&self.name, strip_terminator(&line)).map_err(|source| {
                LineBufferError::Handler {
                    path: self.name.clone(),
                    source: Box::new(source),
                }
            })?;
            self.offset += read as u64;
            count += 1;
        }
        Ok(count)
    }

    fn io_error(&self, source: std::io::Error) -> LineBufferError {
        LineBufferError::Io {
            path: self.name.clone(),
            source,
        }
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    fn collecting_handler() -> (LineHandler, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let handler: LineHandler = Arc::new(move |_path: &Path, line: &[u8]| {
            sink.lock()
                .expect("lock poisoned")
                .push(String::from_utf8_lossy(line).into_owned());
            Ok(())
        });
        (handler, lines)
    }

    #[test]
    fn test_starts_at_end_of_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "history").unwrap();

        let (handler, lines) = collecting_handler();
        let mut buffer = LineBuffer::new(file.path(), handler).unwrap();
        assert_eq!(buffer.offset(), 8);
        assert_eq!(buffer.read_new_lines().unwrap(), 0);

        writeln!(file, "fresh").unwrap();
        assert_eq!(buffer.read_new_lines().unwrap(), 1);
        assert_eq!(*lines.lock().unwrap(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_partial_line_is_not_consumed() {
        let mut file = NamedTempFile::new().unwrap();
        let (handler, lines) = collecting_handler();
        let mut buffer = LineBuffer::new(file.path(), handler).unwrap();

        write!(file, "first\nsec").unwrap();
        file.flush().unwrap();
        assert_eq!(buffer.read_new_lines().unwrap(), 1);
        assert_eq!(buffer.offset(), 6);

        write!(file, "ond\r\nthird\n").unwrap();
        file.flush().unwrap();
        assert_eq!(buffer.read_new_lines().unwrap(), 2);
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["first".to_string(), "second".to_string(), "third".to_string()]
        );
        assert_eq!(buffer.offset(), buffer.file_size().unwrap());
    }

    #[test]
    fn test_handler_failure_keeps_offset() {
        let mut file = NamedTempFile::new().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let handler: LineHandler = Arc::new(move |_path: &Path, line: &[u8]| {
            *counter.lock().expect("lock poisoned") += 1;
            if line == b"bad" {
                Err(ShipperError::Stopped)
            } else {
                Ok(())
            }
        });
        let mut buffer = LineBuffer::new(file.path(), handler).unwrap();

        write!(file, "good\nbad\nlater\n").unwrap();
        file.flush().unwrap();
        let err = buffer.read_new_lines().unwrap_err();
        assert!(matches!(err, LineBufferError::Handler { .. }));
        assert_eq!(buffer.offset(), 5);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_truncation_resets_offset() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "some old content").unwrap();
        let (handler, lines) = collecting_handler();
        let mut buffer = LineBuffer::new(file.path(), handler).unwrap();

        file.as_file().set_len(0).unwrap();
        assert!(buffer.validate_offset().unwrap());
        assert_eq!(buffer.offset(), 0);
        assert!(!buffer.validate_offset().unwrap());

        let mut reopened = file.reopen().unwrap();
        writeln!(reopened, "after truncate").unwrap();
        assert_eq!(buffer.read_new_lines().unwrap(), 1);
        assert_eq!(*lines.lock().unwrap(), vec!["after truncate".to_string()]);
    }

    #[test]
    fn test_missing_file() {
        let (handler, _) = collecting_handler();
        assert!(matches!(
            LineBuffer::new("/nonexistent/file.log", handler),
            Err(LineBufferError::Open { .. })
        ));
    }

    #[test]
    fn test_no_loss_no_duplication_across_partial_writes() {
        let mut file = NamedTempFile::new().unwrap();
        let (handler, lines) = collecting_handler();
        let mut buffer = LineBuffer::new(file.path(), handler).unwrap();

        let expected: Vec<String> = (0..50).map(|i| format!("line-{i}-{}", "x".repeat(i))).collect();
        let content: String = expected.iter().map(|l| format!("{l}\n")).collect();
        let bytes = content.as_bytes();

        // Uneven chunk sizes so writes split lines at arbitrary points.
        let mut start = 0;
        let mut step = 1;
        while start < bytes.len() {
            let end = (start + step).min(bytes.len());
            file.write_all(&bytes[start..end]).unwrap();
            file.flush().unwrap();
            buffer.read_new_lines().unwrap();
            start = end;
            step = step % 13 + 3;
        }

        assert_eq!(*lines.lock().unwrap(), expected);
    }
}
