//! warpsink Library
//!
//! Receiver-side workers for a multi-stream bulk file transfer service:
//! one blocking thread per port, a resumable framed-protocol state
//! machine per connection, and a shared controller that stitches the
//! workers into one consistent session.

use std::path::PathBuf;

pub mod checkpoint;
pub mod controller;
pub mod log;
pub mod logger;
pub mod protocol;
pub mod receiver;
pub mod session;
pub mod socket;
pub mod stats;
pub mod throttle;
pub mod writer;

pub mod cli;

pub use session::Receiver;
pub use stats::TransferReport;

/// Runtime knobs for a receiver. This decouples library code from the
/// binary's Clap structs; the daemon maps its flags onto this.
#[derive(Clone, Debug)]
pub struct Options {
    /// Bind address for every worker port.
    pub host: String,
    /// First worker port; 0 lets each worker pick a free port.
    pub start_port: u16,
    /// Worker (and port) count.
    pub num_ports: usize,
    /// Destination directory blocks are written under.
    pub root: PathBuf,
    /// Opaque id both peers must agree on.
    pub transfer_id: String,
    /// Per-worker receive buffer size in bytes.
    pub buffer_size: usize,
    /// Accept and discard payloads without touching disk.
    pub skip_writes: bool,
    /// Listen/bind attempts before giving up.
    pub max_retries: usize,
    /// Sleep between listen retries.
    pub sleep_millis: u64,
    /// First-connection accept attempts.
    pub max_accept_retries: usize,
    /// Per-attempt timeout while waiting for the first connection.
    pub accept_timeout_millis: u64,
    /// Re-accept window before sender timeouts are known.
    pub accept_window_millis: u64,
    /// Offer previously received chunks to a resuming sender.
    pub enable_download_resumption: bool,
    /// Record every committed block in the durable transfer log.
    pub log_based_resumption: bool,
    /// Session-wide receive rate limit; 0 disables throttling.
    pub throttle_mbytes_per_sec: f64,
    /// Optional session event log file.
    pub event_log: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            host: "0.0.0.0".to_string(),
            start_port: 22356,
            num_ports: 8,
            root: PathBuf::from("."),
            transfer_id: String::new(),
            buffer_size: 256 * 1024,
            skip_writes: false,
            max_retries: 20,
            sleep_millis: 50,
            max_accept_retries: 500,
            accept_timeout_millis: 100,
            accept_window_millis: 2000,
            enable_download_resumption: false,
            log_based_resumption: false,
            throttle_mbytes_per_sec: 0.0,
            event_log: None,
        }
    }
}
