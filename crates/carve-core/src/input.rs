//! Random-access byte sources.
//!
//! An [`Input`] is anything the engine can read at arbitrary positions: a file
//! on disk, an in-memory buffer, or a window of the decode cache. Inputs never
//! carry decoding logic; they are shared as `Arc<dyn Input>` between the
//! result tree and the scheduler.

use bytes::Bytes;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// A randomly addressable byte source
pub trait Input: Send + Sync + fmt::Debug {
    /// Display name of this input
    fn name(&self) -> &str;

    /// Total number of addressable bytes
    fn size(&self) -> u64;

    /// Reads into `buf` starting at `position`.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of input.
    fn read(&self, buf: &mut [u8], position: u64) -> io::Result<usize>;

    /// Error that cut this input short while it was being produced, if any
    fn failure(&self) -> Option<&io::Error> {
        None
    }

    /// Releases OS resources held for reading; later reads reacquire them
    fn close(&self) {}
}

/// Reads until `buf` is full or the input ends, returning the bytes read
pub fn read_fully(input: &dyn Input, buf: &mut [u8], position: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..], position + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Input backed by a file on disk.
///
/// The file is checked when the input is created, but the handle is only
/// held between the first read and [`Input::close`].
pub struct FileInput {
    name: String,
    path: PathBuf,
    size: u64,
    file: Mutex<Option<File>>,
}

impl FileInput {
    /// Opens the file at `path` to check it is readable and record its size
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::file_read(path, e))?
            .len();

        Ok(Self {
            name: path.display().to_string(),
            path: path.to_path_buf(),
            size,
            file: Mutex::new(None),
        })
    }

    /// Path this input was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a read handle is currently held
    pub fn is_open(&self) -> bool {
        self.handle().is_some()
    }

    fn handle(&self) -> std::sync::MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for FileInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileInput")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl Input for FileInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        if position >= self.size {
            return Ok(0);
        }
        let mut handle = self.handle();
        if handle.is_none() {
            *handle = Some(File::open(&self.path)?);
        }
        let Some(file) = handle.as_mut() else {
            return Ok(0);
        };
        file.seek(SeekFrom::Start(position))?;
        file.read(buf)
    }

    fn close(&self) {
        self.handle().take();
    }
}

/// Input backed by an in-memory buffer
#[derive(Debug, Clone)]
pub struct MemoryInput {
    name: String,
    data: Bytes,
}

impl MemoryInput {
    /// Creates a new in-memory input
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Returns the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Input for MemoryInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        let Ok(start) = usize::try_from(position) else {
            return Ok(0);
        };
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Sequential [`Read`] adapter over a range of an [`Input`]
///
/// Decoders pull their compressed bytes through this; the range ends at
/// `limit` bytes past the start, or at the end of the input.
#[derive(Debug)]
pub struct InputReader {
    input: Arc<dyn Input>,
    position: u64,
    end: u64,
}

impl InputReader {
    /// Creates a reader starting at `position`, optionally bounded to `limit` bytes
    pub fn new(input: Arc<dyn Input>, position: u64, limit: Option<u64>) -> Self {
        let size = input.size();
        let end = match limit {
            Some(limit) => position.saturating_add(limit).min(size),
            None => size,
        };
        Self {
            input,
            position,
            end,
        }
    }

    /// Current absolute position in the input
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left before the end of the range
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position)
    }
}

impl Read for InputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = remaining.min(buf.len() as u64) as usize;
        let n = self.input.read(&mut buf[..max], self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}
