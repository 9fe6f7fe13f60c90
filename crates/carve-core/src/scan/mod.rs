//! Queue-driven scan sessions.
//!
//! A [`Scheduler`] owns a FIFO queue of result nodes whose content still has
//! to be scanned. Its loop runs on a single thread:
//!
//! 1. Dequeue a node and read the first bytes of its content
//! 2. Probe every registered format's header, in registration order; the
//!    first match wins
//! 3. Decode the full spec into a new format node
//! 4. Queue every encoded input the decode discovered
//!
//! Discovered inputs go back onto the queue instead of being scanned
//! recursively, so nesting depth never grows the call stack.
//!
//! ## Failures
//!
//! A failed or panicking decode marks its own node and the scan moves on.
//! Only errors that make the session itself unusable (the decode cache
//! cannot be created) stop the loop, reported through
//! [`ScanListener::on_scan_exception`].
//!
//! ## Cancellation
//!
//! [`ScanHandle::cancel`] sets a flag checked between queue items. The input
//! being decoded when the flag is raised is finished first; nothing is
//! dequeued afterwards.

mod listener;

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::cache::{CacheConfig, DecodeCache, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_DECODED_SIZE};
use crate::context::{DecodeContext, UndeclaredWrite};
use crate::error::{Error, Result};
use crate::format::{Format, FormatRegistry};
use crate::input::{read_fully, FileInput, Input};
use crate::result::{ResultNode, ResultTree};

pub use listener::{NullListener, ScanListener, StatsListener};

/// Default upper bound on bytes read for header probing
pub const DEFAULT_PROBE_SIZE: usize = 4096;

/// Default maximum nesting of encoded inputs
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Configuration for a scan session
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Upper bound on bytes read for header probing
    pub probe_size: usize,
    /// Maximum number of encoded inputs above a derived input
    pub max_depth: usize,
    /// Directory for the decode cache scratch file
    pub cache_dir: Option<PathBuf>,
    /// Decoder output chunk size
    pub chunk_size: usize,
    /// Maximum decoded size of a single stream
    pub max_decoded_size: u64,
    /// How writes to undeclared attributes are handled
    pub context_policy: UndeclaredWrite,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            probe_size: DEFAULT_PROBE_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            cache_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_decoded_size: DEFAULT_MAX_DECODED_SIZE,
            context_policy: UndeclaredWrite::default(),
        }
    }
}

impl ScannerConfig {
    /// Creates a new scanner config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the upper bound on bytes read for probing
    pub fn probe_size(mut self, size: usize) -> Self {
        self.probe_size = size;
        self
    }

    /// Sets the maximum nesting of encoded inputs
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the directory for the decode cache scratch file
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Sets the decoder output chunk size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sets the maximum decoded size of a single stream
    pub fn max_decoded_size(mut self, size: u64) -> Self {
        self.max_decoded_size = size;
        self
    }

    /// Sets the policy for writes to undeclared attributes
    pub fn context_policy(mut self, policy: UndeclaredWrite) -> Self {
        self.context_policy = policy;
        self
    }

    fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            dir: self.cache_dir.clone(),
            chunk_size: self.chunk_size,
            max_decoded_size: self.max_decoded_size,
        }
    }
}

/// Lifecycle of a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Not started, or waiting for another run
    Idle,
    /// The worker is draining the queue
    Running,
    /// The queue drained
    Finished,
    /// The worker stopped after a cancellation request
    Cancelled,
    /// The worker stopped on a fatal error
    Failed,
}

/// Counters accumulated over a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Inputs dequeued and probed
    pub inputs_scanned: usize,
    /// Inputs a format was detected in
    pub formats_matched: usize,
    /// Inputs no format matched
    pub unrecognized: usize,
    /// Nodes that ended with a failure attached
    pub failures: usize,
    /// Encoded inputs discovered while decoding
    pub derived_inputs: usize,
    /// Total size of the discovered encoded inputs
    pub decoded_bytes: u64,
    /// Encoded inputs not queued because they nest too deep
    pub skipped_depth: usize,
}

/// Snapshot reported after every processed input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    /// Inputs processed so far in this run
    pub processed: usize,
    /// Inputs still queued
    pub pending: usize,
}

struct Shared {
    queue: Mutex<VecDeque<Arc<ResultNode>>>,
    cancelled: AtomicBool,
    state: Mutex<ScanState>,
    tree: ResultTree,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<ResultNode>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ScanState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> ScanState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Thread-safe handle for submitting inputs to and controlling a session
#[derive(Clone)]
pub struct ScanHandle {
    shared: Arc<Shared>,
}

impl ScanHandle {
    /// Adds a root input to the tree and queues it
    pub fn queue_input(&self, input: Arc<dyn Input>) -> Arc<ResultNode> {
        let node = self.shared.tree.add_input(input);
        debug!("queued input '{}' ({} bytes)", node.name(), node.input().size());
        self.shared.queue().push_back(node.clone());
        node
    }

    /// Opens `path` and queues it
    pub fn queue_file(&self, path: impl AsRef<Path>) -> Result<Arc<ResultNode>> {
        let input = FileInput::open(path)?;
        Ok(self.queue_input(Arc::new(input)))
    }

    /// Requests cancellation; the current input finishes first
    pub fn cancel(&self) {
        debug!("cancellation requested");
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Current session state
    pub fn state(&self) -> ScanState {
        self.shared.state()
    }

    /// Number of queued inputs
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }

    /// Result tree of the session
    pub fn tree(&self) -> &ResultTree {
        &self.shared.tree
    }
}

impl std::fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHandle")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scan session: a format registry, a work queue and a decode cache
pub struct Scheduler {
    registry: FormatRegistry,
    config: ScannerConfig,
    handle: ScanHandle,
    cache: Option<DecodeCache>,
    stats: ScanStats,
}

impl Scheduler {
    /// Creates an idle session probing the formats of `registry`
    pub fn new(registry: FormatRegistry, config: ScannerConfig) -> Self {
        Self {
            registry,
            config,
            handle: ScanHandle {
                shared: Arc::new(Shared {
                    queue: Mutex::new(VecDeque::new()),
                    cancelled: AtomicBool::new(false),
                    state: Mutex::new(ScanState::Idle),
                    tree: ResultTree::new(),
                }),
            },
            cache: None,
            stats: ScanStats::default(),
        }
    }

    /// Handle usable from other threads
    pub fn handle(&self) -> ScanHandle {
        self.handle.clone()
    }

    /// Adds a root input to the tree and queues it
    pub fn queue_input(&self, input: Arc<dyn Input>) -> Arc<ResultNode> {
        self.handle.queue_input(input)
    }

    /// Result tree of the session
    pub fn tree(&self) -> &ResultTree {
        self.handle.tree()
    }

    /// Registered formats
    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// Session configuration
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Decode cache, once the first run created it
    pub fn cache(&self) -> Option<&DecodeCache> {
        self.cache.as_ref()
    }

    /// Drains the queue on the calling thread.
    ///
    /// Returns the accumulated stats when the queue is empty or cancellation
    /// was observed, and the fatal error when the session failed.
    pub fn run(&mut self, listener: &mut dyn ScanListener) -> Result<ScanStats> {
        let shared = self.handle.shared.clone();
        shared.set_state(ScanState::Running);
        listener.on_scan_start();
        debug!("scan started with {} queued input(s)", self.handle.pending());

        let cache = match self.cache.clone() {
            Some(cache) => cache,
            None => {
                let cache = DecodeCache::new(self.config.cache_config()).map_err(|e| self.fail(listener, e))?;
                self.cache = Some(cache.clone());
                cache
            }
        };

        let mut processed = 0usize;
        loop {
            if shared.cancelled.load(Ordering::SeqCst) {
                debug!("scan cancelled after {} input(s)", processed);
                shared.set_state(ScanState::Cancelled);
                listener.on_scan_cancelled(&self.stats);
                return Ok(self.stats.clone());
            }

            let Some(node) = shared.queue().pop_front() else {
                break;
            };

            let scanned = self.scan_node(&node, &cache);
            // Retired: nothing reads this input again during the session
            if let Some(content) = node.content() {
                content.close();
            }
            let discovered = match scanned {
                Ok(discovered) => discovered,
                Err(e) => return Err(self.fail(listener, e)),
            };
            let queued = self.enqueue_discovered(discovered);
            processed += 1;
            trace!("'{}' queued {} derived input(s)", node.name(), queued);

            listener.on_scan_result(&node);
            listener.on_scan_progress(&ScanProgress {
                processed,
                pending: shared.queue().len(),
            });
        }

        debug!("scan finished: {:?}", self.stats);
        shared.set_state(ScanState::Finished);
        listener.on_scan_finished(&self.stats);
        Ok(self.stats.clone())
    }

    /// Runs the session on a dedicated worker thread
    pub fn spawn<L>(mut self, mut listener: L) -> io::Result<JoinHandle<Result<ScanStats>>>
    where
        L: ScanListener + Send + 'static,
    {
        thread::Builder::new()
            .name("carve-scan".to_string())
            .spawn(move || self.run(&mut listener))
    }

    fn fail(&self, listener: &mut dyn ScanListener, error: Error) -> Error {
        warn!("scan failed: {}", error);
        self.handle.shared.set_state(ScanState::Failed);
        listener.on_scan_exception(&error);
        error
    }

    /// Probes and decodes one queued node, returning the inputs it discovered
    fn scan_node(&mut self, node: &Arc<ResultNode>, cache: &DecodeCache) -> Result<Vec<Arc<ResultNode>>> {
        let Some(content) = node.content().cloned() else {
            return Ok(Vec::new());
        };
        self.stats.inputs_scanned += 1;

        let header = match self.read_header(content.as_ref()) {
            Ok(header) => header,
            Err(e) => {
                warn!("failed to read header of '{}': {}", node.name(), e);
                node.set_failure(Error::Io(e));
                self.stats.failures += 1;
                return Ok(Vec::new());
            }
        };

        let Some(format) = self.registry.detect(&header) else {
            debug!("no format matched '{}'", node.name());
            self.stats.unrecognized += 1;
            return Ok(Vec::new());
        };
        debug!("'{}' detected as {}", node.name(), format.name());
        self.stats.formats_matched += 1;

        let format_node = ResultNode::add_format(node, format.name(), 0);
        let mut cx = DecodeContext::new(format_node)
            .with_cache(cache)
            .with_policy(self.config.context_policy);

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| decode_format(format.as_ref(), &mut cx))) {
            Ok(Ok(consumed)) => {
                trace!("{} consumed {} bytes of '{}'", format.name(), consumed, node.name());
                None
            }
            Ok(Err(e)) if e.is_fatal() => {
                cx.finish(None);
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!("{} decode of '{}' failed: {}", format.name(), node.name(), e);
                Some(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("{} decode of '{}' panicked: {}", format.name(), node.name(), message);
                Some(Error::Panicked(message))
            }
        };

        self.stats.failures += cx.failures() + cx.stream_failures() + usize::from(failure.is_some());
        Ok(cx.finish(failure))
    }

    fn read_header(&self, content: &dyn Input) -> io::Result<Vec<u8>> {
        let wanted = self
            .registry
            .header_size()
            .min(self.config.probe_size as u64)
            .min(content.size());
        let mut header = vec![0u8; wanted as usize];
        let n = read_fully(content, &mut header, 0)?;
        header.truncate(n);
        Ok(header)
    }

    /// Queues discovered inputs that are within the depth limit
    fn enqueue_discovered(&mut self, discovered: Vec<Arc<ResultNode>>) -> usize {
        let mut queue = self.handle.shared.queue();
        let mut queued = 0;
        for node in discovered {
            self.stats.derived_inputs += 1;
            if let Some(content) = node.content() {
                self.stats.decoded_bytes += content.size();
            }

            let depth = node.encoded_depth();
            if depth > self.config.max_depth {
                warn!("'{}' nested {} levels deep, not scanned", node.name(), depth);
                node.set_failure(Error::DepthExceeded {
                    depth,
                    max: self.config.max_depth,
                });
                self.stats.skipped_depth += 1;
                continue;
            }
            queue.push_back(node);
            queued += 1;
        }
        queued
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("handle", &self.handle)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn decode_format(format: &dyn Format, cx: &mut DecodeContext<'_>) -> Result<u64> {
    format.spec().decode(cx)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Attribute, Length};
    use crate::decoder::{Decoder, StoreDecoder};
    use crate::format::SpecFormat;
    use crate::input::MemoryInput;
    use crate::result::NodeKind;
    use crate::spec::{ConditionalSpec, EncodedSpec, StructSpec};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn memory(name: &str, data: &[u8]) -> Arc<dyn Input> {
        Arc::new(MemoryInput::new(name, data.to_vec()))
    }

    fn config(dir: &TempDir) -> ScannerConfig {
        ScannerConfig::new().cache_dir(dir.path())
    }

    /// `0xAA` then one byte: a plain record
    fn record() -> SpecFormat {
        let magic = Attribute::u8("magic").final_value(0xAAu8);
        SpecFormat::new(
            "record",
            &magic,
            StructSpec::new("record").child(&magic).child(Attribute::u8("value")),
        )
    }

    /// `0xEE`, a length byte, then that many bytes stored as an encoded input
    fn envelope() -> SpecFormat {
        let magic = Attribute::u8("magic").final_value(0xEEu8);
        let len = Attribute::u8("length").bind();
        SpecFormat::new(
            "envelope",
            &magic,
            StructSpec::new("envelope")
                .child(&magic)
                .child(&len)
                .child(EncodedSpec::new("payload", |_| Box::new(StoreDecoder::new())).length(Length::of(&len))),
        )
    }

    fn by_name<'a>(nodes: &'a [Arc<ResultNode>], name: &str) -> &'a Arc<ResultNode> {
        nodes.iter().find(|n| n.name() == name).unwrap()
    }

    #[test]
    fn test_config_builder() {
        let config = ScannerConfig::new()
            .probe_size(64)
            .max_depth(2)
            .chunk_size(0)
            .context_policy(UndeclaredWrite::Reject);
        assert_eq!(config.probe_size, 64);
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.context_policy, UndeclaredWrite::Reject);
    }

    #[test]
    fn test_scan_detects_and_finishes() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = Scheduler::new(FormatRegistry::new().register(record()), config(&dir));
        let matched = scheduler.queue_input(memory("a", &[0xAA, 0x07]));
        let unknown = scheduler.queue_input(memory("b", &[0x00, 0x07]));

        let mut listener = StatsListener::default();
        let stats = scheduler.run(&mut listener).unwrap();

        assert_eq!(scheduler.handle().state(), ScanState::Finished);
        assert_eq!(stats.inputs_scanned, 2);
        assert_eq!(stats.formats_matched, 1);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(listener.results, 2);
        assert_eq!(listener.finished, 1);
        assert_eq!(
            listener.last_progress,
            Some(ScanProgress {
                processed: 2,
                pending: 0
            })
        );

        let children = matched.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind(), NodeKind::Format);
        assert_eq!(children[0].name(), "record");
        assert_eq!(children[0].span(), Some(0..2));
        assert!(unknown.children().is_empty());
    }

    #[test]
    fn test_registration_order_decides() {
        let dir = TempDir::new().unwrap();
        let first = Attribute::u8("magic").final_value(0xAAu8);
        let shadowed = SpecFormat::new("shadowed", &first, StructSpec::new("shadowed").child(&first));
        let registry = FormatRegistry::new().register(record()).register(shadowed);
        let mut scheduler = Scheduler::new(registry, config(&dir));
        let node = scheduler.queue_input(memory("a", &[0xAA, 0x01]));
        scheduler.run(&mut NullListener).unwrap();
        assert_eq!(node.children()[0].name(), "record");
    }

    #[test]
    fn test_encoded_inputs_are_rescanned() {
        let dir = TempDir::new().unwrap();
        let registry = FormatRegistry::new().register(envelope()).register(record());
        let mut scheduler = Scheduler::new(registry, config(&dir));
        let root = scheduler.queue_input(memory("outer", &[0xEE, 0x02, 0xAA, 0x05]));

        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.inputs_scanned, 2);
        assert_eq!(stats.derived_inputs, 1);
        assert_eq!(stats.decoded_bytes, 2);

        let envelope = &root.children()[0];
        let payload = by_name(&envelope.children(), "payload").clone();
        assert_eq!(payload.kind(), NodeKind::EncodedInput);
        assert_eq!(payload.span(), Some(2..4));
        let inner = &payload.children()[0];
        assert_eq!(inner.name(), "record");
        assert_eq!(inner.path(), vec!["outer", "envelope", "payload", "record"]);
    }

    #[test]
    fn test_depth_limit() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = Scheduler::new(
            FormatRegistry::new().register(envelope()),
            config(&dir).max_depth(2),
        );
        // Three nested envelopes around a single byte
        let root = scheduler.queue_input(memory(
            "nested",
            &[0xEE, 0x07, 0xEE, 0x05, 0xEE, 0x03, 0xEE, 0x01, 0x00],
        ));

        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.derived_inputs, 3);
        assert_eq!(stats.skipped_depth, 1);

        let mut deepest = None;
        root.walk(&mut |node, _| {
            if node.kind() == NodeKind::EncodedInput {
                deepest = Some(node.clone());
            }
        });
        let deepest = deepest.unwrap();
        assert_eq!(deepest.encoded_depth(), 3);
        assert!(matches!(
            deepest.failure().as_deref(),
            Some(Error::DepthExceeded { depth: 3, max: 2 })
        ));
        assert!(deepest.children().is_empty());
    }

    #[test]
    fn test_decode_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = Scheduler::new(FormatRegistry::new().register(record()), config(&dir));
        // Matches the header but ends before the value byte
        let truncated = scheduler.queue_input(memory("short", &[0xAA]));
        let good = scheduler.queue_input(memory("good", &[0xAA, 0x01]));

        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.failures, 1);
        assert!(matches!(
            truncated.children()[0].failure().as_deref(),
            Some(Error::Truncated { .. })
        ));
        assert!(good.children()[0].failure().is_none());
        assert_eq!(scheduler.handle().state(), ScanState::Finished);
    }

    #[test]
    fn test_panic_is_isolated() {
        let dir = TempDir::new().unwrap();
        let magic = Attribute::u8("magic").final_value(0x66u8);
        let faulty = SpecFormat::new(
            "faulty",
            &magic,
            StructSpec::new("faulty")
                .child(&magic)
                .child(ConditionalSpec::new("boom", |_| panic!("provider bug"))),
        );
        let registry = FormatRegistry::new().register(faulty).register(record());
        let mut scheduler = Scheduler::new(registry, config(&dir));
        let bad = scheduler.queue_input(memory("bad", &[0x66]));
        let good = scheduler.queue_input(memory("good", &[0xAA, 0x01]));

        scheduler.run(&mut NullListener).unwrap();
        let failure = bad.children()[0].failure().unwrap();
        assert!(matches!(failure.as_ref(), Error::Panicked(msg) if msg == "provider bug"));
        assert!(good.children()[0].failure().is_none());
    }

    struct PanickingDecoder;

    impl Decoder for PanickingDecoder {
        fn decode(&mut self, _output: &mut [u8], _input: &mut dyn io::Read) -> io::Result<usize> {
            panic!("decoder bug")
        }

        fn consumed(&self) -> u64 {
            0
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    #[test]
    fn test_decoder_panic_leaves_cache_usable() {
        let dir = TempDir::new().unwrap();
        let magic = Attribute::u8("magic").final_value(0xBDu8);
        let faulty = SpecFormat::new(
            "faulty stream",
            &magic,
            StructSpec::new("faulty stream")
                .child(&magic)
                .child(EncodedSpec::new("payload", |_| Box::new(PanickingDecoder)).length(Length::Fixed(1))),
        );
        let registry = FormatRegistry::new()
            .register(faulty)
            .register(envelope())
            .register(record());
        let mut scheduler = Scheduler::new(registry, config(&dir));
        let bad = scheduler.queue_input(memory("bad", &[0xBD, 0x00]));
        let good = scheduler.queue_input(memory("good", &[0xEE, 0x02, 0xAA, 0x05]));

        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.failures, 1);
        assert!(matches!(
            bad.children()[0].failure().as_deref(),
            Some(Error::Panicked(msg)) if msg == "decoder bug"
        ));

        let envelope = &good.children()[0];
        assert!(envelope.failure().is_none());
        let payload = by_name(&envelope.children(), "payload").clone();
        assert!(payload.failure().is_none());
        assert_eq!(payload.content().unwrap().size(), 2);
        assert_eq!(payload.children()[0].name(), "record");
    }

    #[test]
    fn test_file_handles_released_after_scan() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = Scheduler::new(FormatRegistry::new().register(record()), config(&dir));
        let mut files = Vec::new();
        for i in 0..300u32 {
            let path = dir.path().join(format!("f{}.bin", i));
            std::fs::write(&path, [0xAA, i as u8]).unwrap();
            let input = Arc::new(FileInput::open(&path).unwrap());
            scheduler.queue_input(input.clone());
            files.push(input);
        }
        assert!(files.iter().all(|f| !f.is_open()));

        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.inputs_scanned, 300);
        assert_eq!(stats.formats_matched, 300);
        assert!(files.iter().all(|f| !f.is_open()));
    }

    #[test]
    fn test_cancel_finishes_current_input() {
        let dir = TempDir::new().unwrap();
        let scheduler_handle: Arc<Mutex<Option<ScanHandle>>> = Arc::new(Mutex::new(None));
        let slot = scheduler_handle.clone();

        let magic = Attribute::u8("magic").final_value(0xCCu8);
        let cancelling = SpecFormat::new(
            "cancelling",
            &magic,
            StructSpec::new("cancelling")
                .child(&magic)
                .child(ConditionalSpec::new("cancel", move |_| {
                    if let Some(handle) = slot.lock().unwrap().as_ref() {
                        handle.cancel();
                    }
                    None
                }))
                .child(Attribute::u8("after cancel")),
        );
        let mut scheduler = Scheduler::new(FormatRegistry::new().register(cancelling), config(&dir));
        *scheduler_handle.lock().unwrap() = Some(scheduler.handle());

        let first = scheduler.queue_input(memory("first", &[0xCC, 0x01]));
        let second = scheduler.queue_input(memory("second", &[0xCC, 0x02]));

        let mut listener = StatsListener::default();
        let stats = scheduler.run(&mut listener).unwrap();

        assert_eq!(scheduler.handle().state(), ScanState::Cancelled);
        assert_eq!(listener.cancelled, 1);
        assert_eq!(listener.finished, 0);
        assert_eq!(stats.inputs_scanned, 1);

        // The in-flight input decoded completely
        let format = &first.children()[0];
        assert_eq!(format.span(), Some(0..2));
        assert_eq!(format.sections().len(), 2);
        assert!(second.children().is_empty());
        assert_eq!(scheduler.handle().pending(), 1);
    }

    #[test]
    fn test_cache_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        let mut scheduler = Scheduler::new(
            FormatRegistry::new().register(record()),
            ScannerConfig::new().cache_dir(missing),
        );
        scheduler.queue_input(memory("a", &[0xAA, 0x01]));

        let mut listener = StatsListener::default();
        let err = scheduler.run(&mut listener).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(listener.exceptions, 1);
        assert_eq!(scheduler.handle().state(), ScanState::Failed);
    }

    #[test]
    fn test_spawn_on_worker_thread() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(FormatRegistry::new().register(record()), config(&dir));
        let handle = scheduler.handle();
        let node = handle.queue_input(memory("a", &[0xAA, 0x01]));

        let stats = scheduler.spawn(NullListener).unwrap().join().unwrap().unwrap();
        assert_eq!(stats.formats_matched, 1);
        assert_eq!(handle.state(), ScanState::Finished);
        assert_eq!(handle.tree().roots().len(), 1);
        assert_eq!(node.children().len(), 1);
    }

    #[test]
    fn test_probe_reads_only_header_bytes() {
        let dir = TempDir::new().unwrap();
        let wide = Attribute::u32_be("magic").final_value(0xDEAD_BEEFu32);
        let format = SpecFormat::new("wide", &wide, StructSpec::new("wide").child(&wide));
        let mut scheduler = Scheduler::new(
            FormatRegistry::new().register(format),
            config(&dir).probe_size(2),
        );
        // Capped below the header size, so the probe is incomplete
        let node = scheduler.queue_input(memory("a", &[0xDE, 0xAD, 0xBE, 0xEF]));
        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.unrecognized, 1);
        assert!(node.children().is_empty());
    }

    #[test]
    fn test_runs_again_after_finishing() {
        let dir = TempDir::new().unwrap();
        let mut scheduler = Scheduler::new(FormatRegistry::new().register(record()), config(&dir));
        scheduler.queue_input(memory("a", &[0xAA, 0x01]));
        scheduler.run(&mut NullListener).unwrap();
        scheduler.queue_input(memory("b", &[0xAA, 0x02]));
        let stats = scheduler.run(&mut NullListener).unwrap();
        assert_eq!(stats.formats_matched, 2);
        assert_eq!(scheduler.tree().roots().len(), 2);
    }
}
