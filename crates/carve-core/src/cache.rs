//! Append-only scratch store for decoded streams.
//!
//! Every decoded substream is appended to one scratch file and exposed as a
//! [`CachedInput`]: an immutable window `[start, end)` of that file. Writes
//! are serialized through a mutex. Reads go through a separate file handle
//! per reading thread, opened lazily and closed when the thread exits, so a
//! renderer can read finished windows while the worker keeps appending new
//! ones.
//!
//! ## Failure handling
//!
//! A decoder error or a failed write ends the window at the last byte fully
//! written and is attached to the resulting input (see [`Input::failure`]);
//! the cache itself stays usable for later streams.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::input::{Input, InputReader};

/// Default size of each decoded chunk handed to a decoder
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default upper bound for a single decoded stream (1 GiB)
pub const DEFAULT_MAX_DECODED_SIZE: u64 = 1024 * 1024 * 1024;

/// Configuration for the decode cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory for the scratch file (system temp dir when `None`)
    pub dir: Option<PathBuf>,
    /// Decoder output chunk size
    pub chunk_size: usize,
    /// Maximum number of bytes a single stream may decode to
    pub max_decoded_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_decoded_size: DEFAULT_MAX_DECODED_SIZE,
        }
    }
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// This thread's read handles, keyed by cache id
    static READ_HANDLES: RefCell<HashMap<u64, (Weak<CacheInner>, File)>> = RefCell::new(HashMap::new());
}

struct Writer {
    file: NamedTempFile,
    len: u64,
}

struct CacheInner {
    id: u64,
    path: PathBuf,
    config: CacheConfig,
    writer: Mutex<Writer>,
    ranges: AtomicUsize,
    published: AtomicU64,
}

impl CacheInner {
    /// Runs `read` with the calling thread's handle, opening it on first use
    fn with_reader<T>(self: &Arc<Self>, read: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        READ_HANDLES
            .try_with(|handles| {
                let mut handles = handles.borrow_mut();
                if !handles.contains_key(&self.id) {
                    // Handles of dropped caches are closed here
                    handles.retain(|_, (cache, _)| cache.strong_count() > 0);
                    trace!("opening cache read handle for {:?}", thread::current().id());
                    let file = File::open(&self.path)?;
                    handles.insert(self.id, (Arc::downgrade(self), file));
                }
                match handles.get(&self.id) {
                    Some((_, file)) => read(file),
                    None => Err(io::Error::new(io::ErrorKind::Other, "cache read handle missing")),
                }
            })
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "cache read handles are being torn down",
                ))
            })
    }

    /// Whether the calling thread holds a read handle for this cache
    #[cfg(test)]
    fn has_reader(&self) -> bool {
        READ_HANDLES.with(|handles| handles.borrow().contains_key(&self.id))
    }
}

/// Shared handle to a scan session's decode cache
#[derive(Clone)]
pub struct DecodeCache {
    inner: Arc<CacheInner>,
}

/// Outcome of decoding one encoded region into the cache
#[derive(Debug, Clone)]
pub struct DecodedRange {
    /// The decoded bytes as a new input
    pub input: Arc<CachedInput>,
    /// Number of encoded bytes the decoder consumed from the source
    pub consumed: u64,
}

impl DecodeCache {
    /// Creates a cache with a fresh scratch file.
    ///
    /// Failure to create the scratch file is fatal to a scan session.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let dir = config.dir.clone().unwrap_or_else(std::env::temp_dir);
        let file = tempfile::Builder::new()
            .prefix("carve-cache-")
            .suffix(".bin")
            .tempfile_in(&dir)
            .map_err(|e| Error::cache_create(&dir, e))?;
        let path = file.path().to_path_buf();
        debug!("created decode cache at {}", path.display());

        Ok(Self {
            inner: Arc::new(CacheInner {
                id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                path,
                config,
                writer: Mutex::new(Writer { file, len: 0 }),
                ranges: AtomicUsize::new(0),
                published: AtomicU64::new(0),
            }),
        })
    }

    /// Path of the scratch file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Total bytes published to decoded ranges
    pub fn len(&self) -> u64 {
        self.inner.published.load(Ordering::Acquire)
    }

    /// Whether nothing has been decoded yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of decoded ranges created
    pub fn range_count(&self) -> usize {
        self.inner.ranges.load(Ordering::Acquire)
    }

    /// Decodes `source` from `position` with `decoder` and stores the output.
    ///
    /// `limit` bounds the encoded bytes the decoder may read. The returned
    /// input covers exactly the bytes written for this stream; if decoding or
    /// writing failed partway, the range is truncated and the error is
    /// available through [`Input::failure`].
    pub fn decode_input(
        &self,
        name: impl Into<String>,
        source: &Arc<dyn Input>,
        position: u64,
        limit: Option<u64>,
        mut decoder: Box<dyn Decoder>,
    ) -> Result<DecodedRange> {
        let name = name.into();
        let chunk_size = self.inner.config.chunk_size.max(1);
        let max_size = self.inner.config.max_decoded_size;

        let mut writer = match self.inner.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => {
                // A decoder panicked mid-stream; continue after whatever it
                // left in the file.
                let mut writer = poisoned.into_inner();
                writer.len = writer.file.as_file_mut().seek(SeekFrom::End(0))?;
                debug!("decode cache writer recovered at {} bytes", writer.len);
                writer
            }
        };
        let start = writer.len;

        let mut reader = InputReader::new(source.clone(), position, limit);
        let mut chunk = vec![0u8; chunk_size];
        let mut written = 0u64;
        let mut failure = None;

        loop {
            let n = match decoder.decode(&mut chunk, &mut reader) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let allowed = (max_size - written).min(n as u64) as usize;
            if let Err(e) = writer.file.as_file_mut().write_all(&chunk[..allowed]) {
                failure = Some(e);
                break;
            }
            written += allowed as u64;

            if allowed < n {
                failure = Some(io::Error::new(
                    io::ErrorKind::Other,
                    format!("decoded stream exceeds {} bytes", max_size),
                ));
                break;
            }
        }

        // A failed write may have left a partial chunk behind; the next range
        // starts after whatever actually reached the file.
        writer.len = match failure {
            Some(_) => writer
                .file
                .as_file_mut()
                .seek(SeekFrom::End(0))
                .unwrap_or(start + written),
            None => start + written,
        };
        let end = start + written;
        drop(writer);

        if let Some(e) = &failure {
            warn!("decoding '{}' with {} failed after {} bytes: {}", name, decoder.name(), written, e);
        } else {
            trace!("decoded '{}' with {}: {} bytes", name, decoder.name(), written);
        }

        self.inner.ranges.fetch_add(1, Ordering::AcqRel);
        self.inner.published.fetch_add(written, Ordering::AcqRel);

        let input = Arc::new(CachedInput {
            cache: self.inner.clone(),
            name,
            start,
            end,
            failure,
        });
        Ok(DecodedRange {
            input,
            consumed: decoder.consumed(),
        })
    }
}

impl fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeCache")
            .field("path", &self.inner.path)
            .field("len", &self.len())
            .field("ranges", &self.range_count())
            .finish()
    }
}

/// A decoded stream: an immutable window of the cache file
pub struct CachedInput {
    cache: Arc<CacheInner>,
    name: String,
    start: u64,
    end: u64,
    failure: Option<io::Error>,
}

impl CachedInput {
    /// Window of the scratch file holding this stream
    pub fn range(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl fmt::Debug for CachedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedInput")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("failure", &self.failure)
            .finish()
    }
}

impl Input for CachedInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.end - self.start
    }

    fn read(&self, buf: &mut [u8], position: u64) -> io::Result<usize> {
        let size = self.size();
        if position >= size || buf.is_empty() {
            return Ok(0);
        }
        let n = (size - position).min(buf.len() as u64) as usize;
        let offset = self.start + position;
        self.cache.with_reader(|file| {
            let mut handle = file;
            handle.seek(SeekFrom::Start(offset))?;
            handle.read(&mut buf[..n])
        })
    }

    fn failure(&self) -> Option<&io::Error> {
        self.failure.as_ref()
    }
}
