//! Session parent: owns the worker set and everything workers share
//!
//! Workers hold a non-owning handle (`Arc<SessionHandle>`) back to the
//! parent; the parent outlives them by construction since `run` joins
//! every worker thread before returning.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::checkpoint::Checkpoint;
use crate::controller::ThreadsController;
use crate::log::TransferLogManager;
use crate::logger::{Logger, NoopLogger, TextLogger};
use crate::protocol::{ErrorKind, FileChunksInfo, MIN_BUF_LENGTH, PROTOCOL_VERSION};
use crate::receiver::ReceiverWorker;
use crate::stats::TransferReport;
use crate::throttle::Throttler;
use crate::writer::FileCreator;
use crate::Options;

/// Shared, mutex-or-atomic protected session state plus the collaborator
/// handles every worker consumes.
pub struct SessionHandle {
    options: Options,
    protocol_version: i32,
    abort_code: AtomicU8,
    new_transfer_started: Mutex<bool>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    file_chunks: Mutex<Vec<FileChunksInfo>>,
    file_creator: FileCreator,
    throttler: Option<Throttler>,
    transfer_log: Option<TransferLogManager>,
    logger: Box<dyn Logger>,
}

impl SessionHandle {
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn transfer_id(&self) -> &str {
        &self.options.transfer_id
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn cur_abort_code(&self) -> ErrorKind {
        ErrorKind::from_wire(self.abort_code.load(Ordering::Acquire))
    }

    /// Request global cancellation. The first abort wins; later codes do
    /// not overwrite it.
    pub fn abort(&self, code: ErrorKind) {
        let _ = self.abort_code.compare_exchange(
            ErrorKind::Ok as u8,
            code as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn has_new_transfer_started(&self) -> bool {
        *self.new_transfer_started.lock()
    }

    /// Invoked exactly once per session, by whichever worker wins the
    /// first accept.
    pub fn start_new_global_session(&self, peer_ip: &str) {
        *self.new_transfer_started.lock() = true;
        eprintln!(
            "starting new transfer session id={} peer={}",
            self.transfer_id(),
            peer_ip
        );
        self.logger.session_start(self.transfer_id(), peer_ip);
    }

    /// Invoked exactly once, by the last worker out.
    pub fn end_cur_global_session(&self) {
        eprintln!("transfer session id={} ended", self.transfer_id());
    }

    pub fn add_checkpoint(&self, checkpoint: Checkpoint) {
        eprintln!(
            "adding global checkpoint port={} blocks={}",
            checkpoint.port, checkpoint.num_blocks
        );
        self.checkpoints.lock().push(checkpoint);
    }

    /// Checkpoints appended after `since_index`, in order.
    pub fn get_new_checkpoints(&self, since_index: usize) -> Vec<Checkpoint> {
        let checkpoints = self.checkpoints.lock();
        if since_index >= checkpoints.len() {
            return Vec::new();
        }
        checkpoints[since_index..].to_vec()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }

    pub fn file_chunks_info(&self) -> Vec<FileChunksInfo> {
        self.file_chunks.lock().clone()
    }

    pub fn file_creator(&self) -> &FileCreator {
        &self.file_creator
    }

    pub fn throttler(&self) -> Option<&Throttler> {
        self.throttler.as_ref()
    }

    pub fn transfer_log(&self) -> Option<&TransferLogManager> {
        self.transfer_log.as_ref()
    }

    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    pub fn add_transfer_log_header(&self, block_mode: bool, sender_resuming: bool) {
        if let Some(log) = &self.transfer_log {
            if let Err(e) = log.add_header_entry(block_mode, sender_resuming) {
                eprintln!("transfer log header write failed: {}", e);
            }
        }
    }
}

/// The receiver: builds the shared session state, binds one worker per
/// port, then runs them to completion.
pub struct Receiver {
    shared: Arc<SessionHandle>,
    workers: Vec<ReceiverWorker>,
    initialized: bool,
}

impl Receiver {
    pub fn new(options: Options) -> Result<Receiver> {
        if options.num_ports == 0 {
            bail!("at least one port is required");
        }
        if options.buffer_size < 4 * MIN_BUF_LENGTH {
            bail!(
                "buffer size {} too small, need at least {}",
                options.buffer_size,
                4 * MIN_BUF_LENGTH
            );
        }
        let file_creator = FileCreator::new(&options.root, options.skip_writes)?;
        let throttler = if options.throttle_mbytes_per_sec > 0.0 {
            Some(Throttler::new(options.throttle_mbytes_per_sec * 1_048_576.0))
        } else {
            None
        };
        let transfer_log = if options.enable_download_resumption || options.log_based_resumption {
            Some(TransferLogManager::new(&options.root))
        } else {
            None
        };
        let mut file_chunks = Vec::new();
        if options.enable_download_resumption {
            if let Some(log) = &transfer_log {
                file_chunks = log
                    .file_chunks_from_log()
                    .context("seed resumption state from transfer log")?;
            }
        }
        let logger: Box<dyn Logger> = match &options.event_log {
            Some(path) => Box::new(TextLogger::new(path)?),
            None => Box::new(NoopLogger),
        };

        let num_ports = options.num_ports;
        let host = options.host.clone();
        let start_port = options.start_port;
        let shared = Arc::new(SessionHandle {
            options,
            protocol_version: PROTOCOL_VERSION,
            abort_code: AtomicU8::new(ErrorKind::Ok as u8),
            new_transfer_started: Mutex::new(false),
            checkpoints: Mutex::new(Vec::new()),
            file_chunks: Mutex::new(file_chunks),
            file_creator,
            throttler,
            transfer_log,
            logger,
        });
        let controller = Arc::new(ThreadsController::new(num_ports));
        let workers = (0..num_ports)
            .map(|thread_index| {
                // start_port 0 lets every worker pick its own free port
                let port = if start_port == 0 {
                    0
                } else {
                    start_port + thread_index as u16
                };
                ReceiverWorker::new(
                    shared.clone(),
                    controller.clone(),
                    thread_index,
                    &host,
                    port,
                )
            })
            .collect();
        Ok(Receiver {
            shared,
            workers,
            initialized: false,
        })
    }

    /// Bind and listen on every worker port. Returns the actual ports in
    /// worker order.
    pub fn init(&mut self) -> Result<Vec<u16>> {
        if !self.initialized {
            for worker in &mut self.workers {
                worker.init()?;
            }
            self.initialized = true;
        }
        Ok(self.workers.iter().map(|w| w.port()).collect())
    }

    /// Handle for out-of-band control (abort) and post-run inspection.
    pub fn session(&self) -> Arc<SessionHandle> {
        self.shared.clone()
    }

    /// Run every worker to END/FAILED and aggregate their stats.
    pub fn run(mut self) -> Result<TransferReport> {
        self.init()?;
        let start = Instant::now();
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            let name = format!("receiver-{}", worker.thread_index());
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker.run())
                .context("spawn receiver worker thread")?;
            handles.push(handle);
        }
        let mut thread_stats = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(stats) => thread_stats.push(stats),
                Err(_) => bail!("receiver worker thread panicked"),
            }
        }
        let report = TransferReport {
            thread_stats,
            elapsed: start.elapsed(),
        };
        self.shared.logger().session_done(
            report.total_blocks(),
            report.total_effective_bytes(),
            report.elapsed.as_secs_f64(),
        );
        eprintln!("transfer report: {}", report);
        Ok(report)
    }
}
