//! Callbacks fired by the scheduler on its worker thread.

use std::sync::Arc;

use super::{ScanProgress, ScanStats};
use crate::error::Error;
use crate::result::ResultNode;

/// Receives scan lifecycle events
///
/// Every method has a no-op default, so implementations only override what
/// they need. Events fire on the thread running the scan.
pub trait ScanListener {
    /// The session started running
    fn on_scan_start(&mut self) {}

    /// An input finished and the queue changed
    fn on_scan_progress(&mut self, progress: &ScanProgress) {
        let _ = progress;
    }

    /// An input node was fully decoded; its children are the detected formats
    fn on_scan_result(&mut self, node: &Arc<ResultNode>) {
        let _ = node;
    }

    /// The session hit a fatal error and stopped
    fn on_scan_exception(&mut self, error: &Error) {
        let _ = error;
    }

    /// The queue drained
    fn on_scan_finished(&mut self, stats: &ScanStats) {
        let _ = stats;
    }

    /// The session stopped after a cancellation request
    fn on_scan_cancelled(&mut self, stats: &ScanStats) {
        let _ = stats;
    }
}

/// A listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl ScanListener for NullListener {}

/// A listener that counts events
#[derive(Debug, Default, Clone)]
pub struct StatsListener {
    /// Number of sessions started
    pub started: usize,
    /// Number of progress events
    pub progress_events: usize,
    /// Number of result events
    pub results: usize,
    /// Number of fatal errors
    pub exceptions: usize,
    /// Number of sessions finished
    pub finished: usize,
    /// Number of sessions cancelled
    pub cancelled: usize,
    /// Most recent progress report
    pub last_progress: Option<ScanProgress>,
}

impl ScanListener for StatsListener {
    fn on_scan_start(&mut self) {
        self.started += 1;
    }

    fn on_scan_progress(&mut self, progress: &ScanProgress) {
        self.progress_events += 1;
        self.last_progress = Some(*progress);
    }

    fn on_scan_result(&mut self, _node: &Arc<ResultNode>) {
        self.results += 1;
    }

    fn on_scan_exception(&mut self, _error: &Error) {
        self.exceptions += 1;
    }

    fn on_scan_finished(&mut self, _stats: &ScanStats) {
        self.finished += 1;
    }

    fn on_scan_cancelled(&mut self, _stats: &ScanStats) {
        self.cancelled += 1;
    }
}
