//! Per-worker transfer counters and the aggregated end-of-run report

use std::fmt;
use std::time::Duration;

use crate::protocol::ErrorKind;

/// How the wire was protected. The receive path runs on plain sockets,
/// so this is always `None`; the field stays in the stats so report
/// consumers have a stable shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionKind {
    #[default]
    None,
}

/// Counters one worker accumulates across a session. Header bytes and
/// data bytes count everything that crossed the wire; effective bytes
/// count only work that was committed (a block that failed its checksum
/// or died mid-transfer contributes data bytes but no effective bytes
/// beyond the partial prefix recorded for resumption).
#[derive(Debug, Clone, Default)]
pub struct ThreadStats {
    header_bytes: i64,
    data_bytes: i64,
    effective_header_bytes: i64,
    effective_data_bytes: i64,
    num_blocks: i64,
    num_files: i64,
    failed_attempts: i64,
    num_blocks_send: i64,
    total_sender_bytes: i64,
    local_error: Option<ErrorKind>,
    remote_error: Option<ErrorKind>,
    encryption_kind: EncryptionKind,
}

impl ThreadStats {
    pub fn new() -> Self {
        ThreadStats {
            num_blocks_send: -1,
            total_sender_bytes: -1,
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        *self = ThreadStats::new();
    }

    pub fn add_header_bytes(&mut self, bytes: i64) {
        self.header_bytes += bytes;
    }

    pub fn add_data_bytes(&mut self, bytes: i64) {
        self.data_bytes += bytes;
    }

    pub fn add_effective_bytes(&mut self, header: i64, data: i64) {
        self.effective_header_bytes += header;
        self.effective_data_bytes += data;
    }

    pub fn incr_num_blocks(&mut self) {
        self.num_blocks += 1;
    }

    pub fn incr_num_files(&mut self) {
        self.num_files += 1;
    }

    pub fn incr_failed_attempts(&mut self) {
        self.failed_attempts += 1;
    }

    pub fn set_local_error(&mut self, err: ErrorKind) {
        self.local_error = Some(err);
    }

    pub fn set_remote_error(&mut self, err: ErrorKind) {
        self.remote_error = Some(err);
    }

    pub fn set_num_blocks_send(&mut self, n: i64) {
        self.num_blocks_send = n;
    }

    pub fn set_total_sender_bytes(&mut self, n: i64) {
        self.total_sender_bytes = n;
    }

    pub fn set_encryption_kind(&mut self, kind: EncryptionKind) {
        self.encryption_kind = kind;
    }

    pub fn local_error(&self) -> ErrorKind {
        self.local_error.unwrap_or(ErrorKind::Ok)
    }

    pub fn remote_error(&self) -> ErrorKind {
        self.remote_error.unwrap_or(ErrorKind::Ok)
    }

    pub fn header_bytes(&self) -> i64 {
        self.header_bytes
    }

    pub fn data_bytes(&self) -> i64 {
        self.data_bytes
    }

    pub fn effective_bytes(&self) -> i64 {
        self.effective_header_bytes + self.effective_data_bytes
    }

    pub fn effective_data_bytes(&self) -> i64 {
        self.effective_data_bytes
    }

    pub fn num_blocks(&self) -> i64 {
        self.num_blocks
    }

    pub fn num_files(&self) -> i64 {
        self.num_files
    }

    pub fn failed_attempts(&self) -> i64 {
        self.failed_attempts
    }

    pub fn num_blocks_send(&self) -> i64 {
        self.num_blocks_send
    }

    pub fn total_sender_bytes(&self) -> i64 {
        self.total_sender_bytes
    }

    pub fn encryption_kind(&self) -> EncryptionKind {
        self.encryption_kind
    }
}

impl fmt::Display for ThreadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks={} files={} headerBytes={} dataBytes={} effectiveBytes={} \
             failedAttempts={} localErr={:?} remoteErr={:?}",
            self.num_blocks,
            self.num_files,
            self.header_bytes,
            self.data_bytes,
            self.effective_bytes(),
            self.failed_attempts,
            self.local_error(),
            self.remote_error(),
        )
    }
}

/// What `Receiver::run` hands back: one stats record per worker plus the
/// wall-clock time of the whole run.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub thread_stats: Vec<ThreadStats>,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn total_effective_bytes(&self) -> i64 {
        self.thread_stats.iter().map(|s| s.effective_bytes()).sum()
    }

    pub fn total_data_bytes(&self) -> i64 {
        self.thread_stats.iter().map(|s| s.data_bytes()).sum()
    }

    pub fn total_blocks(&self) -> i64 {
        self.thread_stats.iter().map(|s| s.num_blocks()).sum()
    }

    pub fn total_failed_attempts(&self) -> i64 {
        self.thread_stats.iter().map(|s| s.failed_attempts()).sum()
    }

    /// First non-Ok local error across workers, if any.
    pub fn first_error(&self) -> ErrorKind {
        self.thread_stats
            .iter()
            .map(|s| s.local_error())
            .find(|e| *e != ErrorKind::Ok)
            .unwrap_or(ErrorKind::Ok)
    }

    pub fn throughput_mbytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.total_effective_bytes() as f64 / 1_048_576.0) / secs
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "threads={} blocks={} effectiveBytes={} failedAttempts={} {:.2} MB/s",
            self.thread_stats.len(),
            self.total_blocks(),
            self.total_effective_bytes(),
            self.total_failed_attempts(),
            self.throughput_mbytes_per_sec(),
        )
    }
}
