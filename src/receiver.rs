//! The per-connection receive state machine
//!
//! One worker owns one port, one socket, and one buffer, and cycles
//! through the states below until the session completes or dies. The
//! machine is a plain sum type: every state handler returns the next
//! state, and the driver loop polls the parent's abort code between
//! transitions. Transport failures are recoverable (the worker closes
//! the connection and re-accepts, preserving its checkpoint); protocol
//! and identity failures are fatal for the worker.

use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::controller::{
    FunnelStatus, ThreadsController, WorkerState, SEND_FILE_CHUNKS_FUNNEL,
    WAIT_FOR_FINISH_OR_CHECKPOINT_CV,
};
use crate::protocol::{self, cmd, BlockDetails, ErrorKind, BLOCK_FLAG_WHOLE_FILE};
use crate::session::SessionHandle;
use crate::socket::{read_at_least, read_at_most, ServerSocket};
use crate::stats::{EncryptionKind, ThreadStats};
use crate::Options;

const TIMEOUT_BUFFER_MILLIS: u64 = 1000;
const WAIT_TIMEOUT_FACTOR: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Listen,
    AcceptFirstConnection,
    AcceptWithTimeout,
    SendLocalCheckpoint,
    ReadNextCmd,
    ProcessFileCmd,
    ProcessSettingsCmd,
    ProcessDoneCmd,
    ProcessSizeCmd,
    SendFileChunks,
    SendGlobalCheckpoints,
    SendDoneCmd,
    SendAbortCmd,
    WaitForFinishOrNewCheckpoint,
    FinishWithError,
    End,
    Failed,
}

pub struct ReceiverWorker {
    thread_index: usize,
    options: Options,
    parent: Arc<SessionHandle>,
    controller: Arc<ThreadsController>,
    socket: ServerSocket,
    buf: Vec<u8>,
    // cursor invariant: off <= old_offset + num_read <= buf.len()
    num_read: usize,
    off: usize,
    old_offset: usize,
    protocol_version: i32,
    sender_read_timeout: i32,
    sender_write_timeout: i32,
    enable_checksum: bool,
    is_block_mode: bool,
    done_send_failure: bool,
    checkpoint_index: usize,
    pending_checkpoint_index: usize,
    checkpoint: Checkpoint,
    new_checkpoints: Vec<Checkpoint>,
    stats: ThreadStats,
}

impl ReceiverWorker {
    pub fn new(
        parent: Arc<SessionHandle>,
        controller: Arc<ThreadsController>,
        thread_index: usize,
        host: &str,
        port: u16,
    ) -> ReceiverWorker {
        let options = parent.options().clone();
        let mut buf = Vec::new();
        if buf.try_reserve_exact(options.buffer_size).is_ok() {
            buf.resize(options.buffer_size, 0);
        }
        controller.register_thread(thread_index);
        let protocol_version = parent.protocol_version();
        ReceiverWorker {
            thread_index,
            options,
            parent,
            controller,
            socket: ServerSocket::new(host, port),
            buf,
            num_read: 0,
            off: 0,
            old_offset: 0,
            protocol_version,
            sender_read_timeout: -1,
            sender_write_timeout: -1,
            enable_checksum: false,
            is_block_mode: true,
            done_send_failure: false,
            checkpoint_index: 0,
            pending_checkpoint_index: 0,
            checkpoint: Checkpoint::new(port),
            new_checkpoints: Vec::new(),
            stats: ThreadStats::new(),
        }
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    fn tag(&self) -> String {
        format!("Thread[{}, port:{}]", self.thread_index, self.socket.port())
    }

    /// Bind and listen, retrying a few times for ports stuck in
    /// TIME_WAIT. Must succeed before `run`.
    pub fn init(&mut self) -> anyhow::Result<()> {
        for _ in 0..self.options.max_retries {
            if self.socket.listen().is_ok() {
                break;
            }
        }
        self.socket.listen()?;
        self.checkpoint = Checkpoint::new(self.socket.port());
        eprintln!("{} listening", self.tag());
        Ok(())
    }

    /// Drive the state machine to completion and hand back the stats.
    pub fn run(mut self) -> ThreadStats {
        if self.buf.len() < self.options.buffer_size {
            eprintln!(
                "{} could not allocate {} byte buffer",
                self.tag(),
                self.options.buffer_size
            );
            self.stats.set_local_error(ErrorKind::MemoryAllocationError);
        } else {
            self.run_loop();
        }
        self.controller.deregister_thread(self.thread_index);
        let parent = self.parent.clone();
        self.controller
            .execute_at_end(|| parent.end_cur_global_session());
        self.stats.set_encryption_kind(EncryptionKind::None);
        eprintln!("{} {}", self.tag(), self.stats);
        self.stats
    }

    fn run_loop(&mut self) {
        let mut state = ReceiverState::Listen;
        loop {
            let abort_code = self.parent.cur_abort_code();
            if abort_code != ErrorKind::Ok {
                eprintln!("{} transfer aborted: {:?}", self.tag(), abort_code);
                self.stats.set_local_error(ErrorKind::Aborted);
                return;
            }
            if state == ReceiverState::Failed || state == ReceiverState::End {
                return;
            }
            state = match state {
                ReceiverState::Listen => self.listen(),
                ReceiverState::AcceptFirstConnection => self.accept_first_connection(),
                ReceiverState::AcceptWithTimeout => self.accept_with_timeout(),
                ReceiverState::SendLocalCheckpoint => self.send_local_checkpoint(),
                ReceiverState::ReadNextCmd => self.read_next_cmd(),
                ReceiverState::ProcessFileCmd => self.process_file_cmd(),
                ReceiverState::ProcessSettingsCmd => self.process_settings_cmd(),
                ReceiverState::ProcessDoneCmd => self.process_done_cmd(),
                ReceiverState::ProcessSizeCmd => self.process_size_cmd(),
                ReceiverState::SendFileChunks => self.send_file_chunks(),
                ReceiverState::SendGlobalCheckpoints => self.send_global_checkpoints(),
                ReceiverState::SendDoneCmd => self.send_done_cmd(),
                ReceiverState::SendAbortCmd => self.send_abort_cmd(),
                ReceiverState::WaitForFinishOrNewCheckpoint => {
                    self.wait_for_finish_or_new_checkpoint()
                }
                ReceiverState::FinishWithError => self.finish_with_error(),
                ReceiverState::End | ReceiverState::Failed => unreachable!(),
            };
        }
    }

    /// Fresh-session state: buffer cursors, negotiation fields, stats and
    /// checkpoint all return to zero. The negotiated protocol version
    /// deliberately survives so a downgraded sender can reconnect.
    fn reset(&mut self) {
        self.num_read = 0;
        self.off = 0;
        self.checkpoint_index = 0;
        self.pending_checkpoint_index = 0;
        self.done_send_failure = false;
        self.sender_read_timeout = -1;
        self.sender_write_timeout = -1;
        self.stats.reset();
        self.new_checkpoints.clear();
        self.checkpoint = Checkpoint::new(self.socket.port());
    }

    fn listen(&mut self) -> ReceiverState {
        for retry in 1..self.options.max_retries {
            match self.socket.listen() {
                Ok(()) => break,
                Err(e) if ServerSocket::is_fatal(&e) => {
                    eprintln!("{} listen failed fatally: {}", self.tag(), e);
                    self.stats.set_local_error(ErrorKind::ConnError);
                    return ReceiverState::Failed;
                }
                Err(e) => {
                    eprintln!("{} sleeping after failed listen attempt {}: {}", self.tag(), retry, e);
                    std::thread::sleep(Duration::from_millis(self.options.sleep_millis));
                }
            }
        }
        // one more/last try (no-op if it worked above)
        if self.socket.listen().is_err() {
            eprintln!("{} unable to listen/bind despite retries", self.tag());
            self.stats.set_local_error(ErrorKind::ConnError);
            return ReceiverState::Failed;
        }
        ReceiverState::AcceptFirstConnection
    }

    fn accept_first_connection(&mut self) -> ReceiverState {
        self.reset();
        self.socket.close_connection();
        let timeout = self.options.accept_timeout_millis;
        let mut accept_attempts = 0;
        loop {
            // a sibling already opened the session; fall through to the
            // long-timeout accept
            if self.parent.has_new_transfer_started() {
                return ReceiverState::AcceptWithTimeout;
            }
            if accept_attempts == self.options.max_accept_retries {
                eprintln!("{} unable to accept after {} attempts", self.tag(), accept_attempts);
                self.stats.set_local_error(ErrorKind::ConnError);
                return ReceiverState::Failed;
            }
            if self.parent.cur_abort_code() != ErrorKind::Ok {
                eprintln!(
                    "{} marked to abort while waiting for first connection, attempts {}",
                    self.tag(),
                    accept_attempts
                );
                return ReceiverState::Failed;
            }
            match self.socket.accept_next_connection(timeout) {
                Ok(()) => break,
                Err(_) => accept_attempts += 1,
            }
        }
        // only the first worker through here starts the global session
        let parent = self.parent.clone();
        let peer = self
            .socket
            .peer_ip()
            .unwrap_or("unknown")
            .to_string();
        self.controller
            .execute_at_start(move || parent.start_new_global_session(&peer));
        ReceiverState::ReadNextCmd
    }

    fn accept_with_timeout(&mut self) -> ReceiverState {
        eprintln!("{} entered ACCEPT_WITH_TIMEOUT state", self.tag());
        let socket_err = self.socket.non_retryable_err_code();
        if socket_err != ErrorKind::Ok {
            eprintln!("{} socket has non-retryable error {:?}", self.tag(), socket_err);
            self.stats.set_local_error(socket_err);
            return ReceiverState::End;
        }
        self.socket.close_connection();

        let mut timeout = self.options.accept_window_millis;
        if self.sender_read_timeout > 0 {
            // transfer in progress and sender settings are known
            timeout = self.sender_read_timeout.max(self.sender_write_timeout) as u64
                + TIMEOUT_BUFFER_MILLIS;
        }
        if let Err(e) = self.socket.accept_next_connection(timeout) {
            eprintln!("{} accept failed with timeout {}: {}", self.tag(), timeout, e);
            self.stats.set_local_error(ErrorKind::ConnError);
            if self.done_send_failure {
                // DONE was already attempted; no point waiting for siblings
                return ReceiverState::End;
            }
            return ReceiverState::FinishWithError;
        }
        if self.sender_read_timeout > 0 {
            let stream_timeout = self.sender_read_timeout.max(self.sender_write_timeout)
                + TIMEOUT_BUFFER_MILLIS as i32;
            self.socket.set_stream_timeouts(stream_timeout, stream_timeout);
        }

        if self.done_send_failure {
            // session state stays as-is; re-announce the failure
            return ReceiverState::SendLocalCheckpoint;
        }

        self.num_read = 0;
        self.off = 0;
        self.pending_checkpoint_index = self.checkpoint_index;
        let next = if self.stats.local_error() != ErrorKind::Ok {
            ReceiverState::SendLocalCheckpoint
        } else {
            ReceiverState::ReadNextCmd
        };
        self.stats.set_local_error(ErrorKind::Ok);
        next
    }

    fn send_local_checkpoint(&mut self) -> ReceiverState {
        eprintln!("{} entered SEND_LOCAL_CHECKPOINT state", self.tag());
        let checkpoint = if self.done_send_failure {
            // special checkpoint to signal the lost DONE exchange
            let mut sentinel = Checkpoint::new(self.socket.port());
            sentinel.num_blocks = -1;
            sentinel
        } else {
            self.checkpoint.clone()
        };
        let checkpoint_len = protocol::max_local_checkpoint_len(self.protocol_version);
        let mut off = 0;
        if protocol::encode_checkpoints(
            self.protocol_version,
            &mut self.buf,
            &mut off,
            &[checkpoint],
        )
        .is_err()
        {
            self.stats.set_local_error(ErrorKind::ProtocolError);
            return ReceiverState::FinishWithError;
        }
        debug_assert_eq!(off, checkpoint_len);
        let written = self.socket.write(&self.buf[..checkpoint_len]).unwrap_or(0);
        if written != checkpoint_len {
            eprintln!(
                "{} local checkpoint write mismatch {} {}",
                self.tag(),
                checkpoint_len,
                written
            );
            self.stats.set_local_error(ErrorKind::SocketWriteError);
            return ReceiverState::AcceptWithTimeout;
        }
        self.stats.add_header_bytes(checkpoint_len as i64);
        if self.done_send_failure {
            return ReceiverState::SendDoneCmd;
        }
        ReceiverState::ReadNextCmd
    }

    fn read_next_cmd(&mut self) -> ReceiverState {
        self.old_offset = self.off;
        self.num_read = match read_at_least(
            &mut self.socket,
            &mut self.buf[self.old_offset..],
            protocol::MIN_BUF_LENGTH,
            self.num_read,
        ) {
            Ok(n) => n,
            Err(e) => {
                eprintln!("{} read error: {}", self.tag(), e);
                0
            }
        };
        if self.num_read < protocol::MIN_BUF_LENGTH {
            eprintln!(
                "{} socket read failure {} {}",
                self.tag(),
                protocol::MIN_BUF_LENGTH,
                self.num_read
            );
            self.stats.set_local_error(ErrorKind::SocketReadError);
            return ReceiverState::AcceptWithTimeout;
        }
        let magic = self.buf[self.off];
        self.off += 1;
        match magic {
            cmd::DONE => ReceiverState::ProcessDoneCmd,
            cmd::FILE => ReceiverState::ProcessFileCmd,
            cmd::SETTINGS => ReceiverState::ProcessSettingsCmd,
            cmd::SIZE => ReceiverState::ProcessSizeCmd,
            other => {
                eprintln!("{} received an unknown cmd {}", self.tag(), other);
                self.stats.set_local_error(ErrorKind::ProtocolError);
                ReceiverState::FinishWithError
            }
        }
    }

    fn process_settings_cmd(&mut self) -> ReceiverState {
        let mut off = self.off;
        let sender_version = match protocol::decode_version(
            &self.buf,
            &mut off,
            self.old_offset + protocol::MAX_VERSION_LEN,
        ) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{} unable to decode version: {}", self.tag(), e);
                self.stats.set_local_error(ErrorKind::ProtocolError);
                return ReceiverState::FinishWithError;
            }
        };
        if sender_version != self.protocol_version {
            eprintln!(
                "{} sender and receiver protocol version mismatch {} {}",
                self.tag(),
                sender_version,
                self.protocol_version
            );
            let negotiated = protocol::negotiate_protocol(sender_version, self.protocol_version);
            if negotiated == 0 {
                eprintln!(
                    "{} can not support sender with version {}, aborting",
                    self.tag(),
                    sender_version
                );
                self.stats.set_local_error(ErrorKind::VersionIncompatible);
                return ReceiverState::SendAbortCmd;
            }
            if negotiated != self.protocol_version {
                eprintln!("{} changing receiver protocol version to {}", self.tag(), negotiated);
            }
            self.protocol_version = negotiated;
            if negotiated != sender_version {
                self.stats.set_local_error(ErrorKind::VersionMismatch);
                return ReceiverState::SendAbortCmd;
            }
        }
        let settings = match protocol::decode_settings(
            &self.buf,
            &mut off,
            self.old_offset + protocol::MAX_VERSION_LEN + protocol::MAX_SETTINGS_LEN,
        ) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{} unable to decode settings cmd: {}", self.tag(), e);
                self.stats.set_local_error(ErrorKind::ProtocolError);
                return ReceiverState::FinishWithError;
            }
        };
        if settings.transfer_id != self.parent.transfer_id() {
            eprintln!(
                "{} transfer id mismatch {} {}",
                self.tag(),
                settings.transfer_id,
                self.parent.transfer_id()
            );
            self.stats.set_local_error(ErrorKind::IdMismatch);
            return ReceiverState::SendAbortCmd;
        }
        self.sender_read_timeout = settings.read_timeout_millis;
        self.sender_write_timeout = settings.write_timeout_millis;
        self.enable_checksum = settings.enable_checksum;
        self.is_block_mode = !settings.block_mode_disabled;
        let stream_timeout = self.sender_read_timeout.max(self.sender_write_timeout)
            + TIMEOUT_BUFFER_MILLIS as i32;
        self.socket.set_stream_timeouts(stream_timeout, stream_timeout);
        if settings.send_file_chunks {
            // the chunks exchange starts from a clean buffer; the sender
            // padded this command knowing we discard the remainder
            self.num_read = 0;
            self.off = 0;
            return ReceiverState::SendFileChunks;
        }
        let msg_len = off - self.old_offset;
        self.num_read -= msg_len;
        self.off = off;
        ReceiverState::ReadNextCmd
    }

    fn process_file_cmd(&mut self) -> ReceiverState {
        let next = self.process_file_cmd_inner();
        if self.stats.local_error() != ErrorKind::Ok {
            self.stats.incr_failed_attempts();
        }
        next
    }

    /// Partially transferred blocks still count: their on-disk prefix is
    /// advertised in the next local checkpoint so the sender can resume
    /// mid-block instead of resending everything.
    fn record_partial_block(&mut self, details: &BlockDetails, header_bytes: i64, written: i64) {
        if self.protocol_version >= protocol::CHECKPOINT_OFFSET_VERSION {
            self.checkpoint
                .set_last_block_details(details.seq_id, details.offset, written);
            self.stats.add_effective_bytes(header_bytes, written);
        }
    }

    fn process_file_cmd_inner(&mut self) -> ReceiverState {
        // first FILE of the session while the chunks funnel is still
        // open means the sender chose not to resume
        if self.options.enable_download_resumption && self.stats.num_blocks() == 0 {
            let funnel = self.controller.get_funnel(SEND_FILE_CHUNKS_FUNNEL);
            if funnel.status() == FunnelStatus::Start {
                self.parent.add_transfer_log_header(self.is_block_mode, false);
                funnel.notify_success();
            }
        }
        self.checkpoint.reset_last_block_details();

        let transfer_status = ErrorKind::from_wire(self.buf[self.off]);
        self.off += 1;
        if transfer_status != ErrorKind::Ok {
            eprintln!("{} sender entered error state {:?}", self.tag(), transfer_status);
        }
        let header_len =
            i16::from_le_bytes([self.buf[self.off], self.buf[self.off + 1]]) as i64;
        if header_len <= 0 {
            eprintln!("{} bad file cmd header length {}", self.tag(), header_len);
            self.stats.set_local_error(ErrorKind::ProtocolError);
            return ReceiverState::FinishWithError;
        }
        if header_len > self.num_read as i64 {
            self.num_read = match read_at_least(
                &mut self.socket,
                &mut self.buf[self.old_offset..],
                header_len as usize,
                self.num_read,
            ) {
                Ok(n) => n,
                Err(_) => 0,
            };
        }
        if (self.num_read as i64) < header_len {
            eprintln!(
                "{} unable to read full header {} {}",
                self.tag(),
                header_len,
                self.num_read
            );
            self.stats.set_local_error(ErrorKind::SocketReadError);
            return ReceiverState::AcceptWithTimeout;
        }
        self.off += 2;
        let mut off = self.off;
        let decoded = protocol::decode_header(
            &self.buf,
            &mut off,
            self.old_offset + self.num_read,
        );
        self.off = off;
        let header_bytes = (self.off - self.old_offset) as i64;
        let details = match decoded {
            Ok(d) => d,
            Err(e) => {
                eprintln!(
                    "{} error decoding header at ooff:{} off:{} numRead:{}: {}",
                    self.tag(),
                    self.old_offset,
                    self.off,
                    self.num_read,
                    e
                );
                self.stats.set_local_error(ErrorKind::ProtocolError);
                return ReceiverState::FinishWithError;
            }
        };
        // transferred header length must match decoded header length
        if header_bytes != header_len {
            eprintln!(
                "{} header length mismatch {} {} for {}",
                self.tag(),
                header_len,
                header_bytes,
                details.file_name
            );
            self.stats.set_local_error(ErrorKind::ProtocolError);
            return ReceiverState::FinishWithError;
        }
        self.stats.add_header_bytes(header_bytes);

        // a well formed file cmd commits the pending checkpoint batch
        self.checkpoint_index = self.pending_checkpoint_index;

        let mut writer = match self.parent.file_creator().open_for_block(&details) {
            Ok(w) => w,
            Err(e) => {
                eprintln!("{} open failed for {}: {}", self.tag(), details.file_name, e);
                self.stats.set_local_error(ErrorKind::FileWriteError);
                self.record_partial_block(&details, header_bytes, 0);
                return ReceiverState::SendAbortCmd;
            }
        };
        let mut checksum: u32 = 0;
        let mut remaining_data = (self.num_read + self.old_offset - self.off) as i64;
        let to_write = remaining_data.min(details.data_size);
        self.stats.add_data_bytes(to_write);
        if self.enable_checksum {
            checksum = crc32c::crc32c_append(checksum, &self.buf[self.off..self.off + to_write as usize]);
        }
        if let Some(throttler) = self.parent.throttler() {
            // whatever we over-read into the next frame still crossed
            // the wire, so it is billed here too
            throttler.limit(to_write + header_bytes);
        }
        if writer.write(&self.buf[self.off..self.off + to_write as usize]) != ErrorKind::Ok {
            self.stats.set_local_error(ErrorKind::FileWriteError);
            self.record_partial_block(&details, header_bytes, writer.total_written());
            return ReceiverState::SendAbortCmd;
        }
        self.off += to_write as usize;
        remaining_data -= to_write;
        // no leftover past this point, so reads restart at buffer start
        while writer.total_written() < details.data_size {
            if self.parent.cur_abort_code() != ErrorKind::Ok {
                eprintln!("{} marked for abort while processing a block", self.tag());
                self.record_partial_block(&details, header_bytes, writer.total_written());
                return ReceiverState::Failed;
            }
            let wanted = (details.data_size - writer.total_written()) as usize;
            let nres = match read_at_most(&mut self.socket, &mut self.buf, wanted) {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("{} read error mid-block: {}", self.tag(), e);
                    0
                }
            };
            if nres == 0 {
                break;
            }
            if let Some(throttler) = self.parent.throttler() {
                // only known after the read returns: bill the bytes the
                // wire actually surfaced
                throttler.limit(nres as i64);
            }
            self.stats.add_data_bytes(nres as i64);
            if self.enable_checksum {
                checksum = crc32c::crc32c_append(checksum, &self.buf[..nres]);
            }
            if writer.write(&self.buf[..nres]) != ErrorKind::Ok {
                self.stats.set_local_error(ErrorKind::FileWriteError);
                self.record_partial_block(&details, header_bytes, writer.total_written());
                return ReceiverState::SendAbortCmd;
            }
        }
        if writer.total_written() != details.data_size {
            // transmission died mid-block; disk errors were handled above
            eprintln!(
                "{} could not read entire content for {} ({} of {})",
                self.tag(),
                details.file_name,
                writer.total_written(),
                details.data_size
            );
            self.stats.set_local_error(ErrorKind::SocketReadError);
            self.record_partial_block(&details, header_bytes, writer.total_written());
            return ReceiverState::AcceptWithTimeout;
        }

        if remaining_data > 0 {
            // over-read into the next frame; keep those bytes
            self.num_read = remaining_data as usize;
            if (remaining_data as usize) < protocol::MAX_HEADER_LEN
                && self.off > self.buf.len() / 2
            {
                // rare so inefficient is ok
                self.buf.copy_within(self.off..self.off + remaining_data as usize, 0);
                self.off = 0;
            }
        } else {
            self.num_read = 0;
            self.off = 0;
        }

        if self.enable_checksum {
            self.old_offset = self.off;
            self.num_read = match read_at_least(
                &mut self.socket,
                &mut self.buf[self.old_offset..],
                protocol::MIN_BUF_LENGTH,
                self.num_read,
            ) {
                Ok(n) => n,
                Err(_) => 0,
            };
            if self.num_read < protocol::MIN_BUF_LENGTH {
                eprintln!(
                    "{} socket read failure {} {}",
                    self.tag(),
                    protocol::MIN_BUF_LENGTH,
                    self.num_read
                );
                self.stats.set_local_error(ErrorKind::SocketReadError);
                return ReceiverState::AcceptWithTimeout;
            }
            let magic = self.buf[self.off];
            self.off += 1;
            if magic != cmd::FOOTER {
                eprintln!("{} expected footer cmd, received {}", self.tag(), magic);
                self.stats.set_local_error(ErrorKind::ProtocolError);
                return ReceiverState::FinishWithError;
            }
            let mut off = self.off;
            let received_checksum = match protocol::decode_footer(
                &self.buf,
                &mut off,
                self.old_offset + protocol::MAX_FOOTER_LEN,
            ) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("{} unable to decode footer cmd: {}", self.tag(), e);
                    self.stats.set_local_error(ErrorKind::ProtocolError);
                    return ReceiverState::FinishWithError;
                }
            };
            self.off = off;
            if checksum as i32 != received_checksum {
                eprintln!(
                    "{} checksum mismatch {} {} for {}",
                    self.tag(),
                    checksum as i32,
                    received_checksum,
                    details.file_name
                );
                self.stats.set_local_error(ErrorKind::ChecksumMismatch);
                return ReceiverState::AcceptWithTimeout;
            }
            let msg_len = self.off - self.old_offset;
            self.num_read -= msg_len;
        }

        if self.options.log_based_resumption {
            if let Some(log) = self.parent.transfer_log() {
                if let Err(e) = log.add_block_write_entry(
                    details.seq_id,
                    &details.file_name,
                    details.file_size,
                    details.offset,
                    details.data_size,
                ) {
                    eprintln!("{} transfer log append failed: {}", self.tag(), e);
                }
            }
        }
        self.parent
            .logger()
            .block_done(&details.file_name, details.offset, details.data_size);
        self.stats.add_effective_bytes(header_bytes, details.data_size);
        self.stats.incr_num_blocks();
        if !self.is_block_mode || details.flags & BLOCK_FLAG_WHOLE_FILE != 0 {
            self.stats.incr_num_files();
        }
        self.checkpoint.incr_num_blocks();
        ReceiverState::ReadNextCmd
    }

    fn process_done_cmd(&mut self) -> ReceiverState {
        if self.num_read != protocol::MIN_BUF_LENGTH {
            // DONE is never pipelined behind another command
            eprintln!(
                "{} unexpected state for done command off:{} numRead:{}",
                self.tag(),
                self.off,
                self.num_read
            );
            self.stats.set_local_error(ErrorKind::ProtocolError);
            return ReceiverState::FinishWithError;
        }
        let sender_status = ErrorKind::from_wire(self.buf[self.off]);
        self.off += 1;
        let mut off = self.off;
        let (num_blocks_send, total_sender_bytes) = match protocol::decode_done(
            &self.buf,
            &mut off,
            self.old_offset + protocol::MAX_DONE_LEN,
        ) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{} unable to decode done cmd: {}", self.tag(), e);
                self.stats.set_local_error(ErrorKind::ProtocolError);
                return ReceiverState::FinishWithError;
            }
        };
        self.off = off;
        self.stats.set_num_blocks_send(num_blocks_send);
        self.stats.set_total_sender_bytes(total_sender_bytes);
        self.stats.set_remote_error(sender_status);

        // a valid command commits the pending checkpoint batch
        self.checkpoint_index = self.pending_checkpoint_index;
        ReceiverState::WaitForFinishOrNewCheckpoint
    }

    fn process_size_cmd(&mut self) -> ReceiverState {
        let mut off = self.off;
        let total_sender_bytes = match protocol::decode_size(
            &self.buf,
            &mut off,
            self.old_offset + protocol::MAX_SIZE_LEN,
        ) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("{} unable to decode size cmd: {}", self.tag(), e);
                self.stats.set_local_error(ErrorKind::ProtocolError);
                return ReceiverState::FinishWithError;
            }
        };
        self.off = off;
        self.stats.set_total_sender_bytes(total_sender_bytes);
        let msg_len = self.off - self.old_offset;
        self.num_read -= msg_len;
        ReceiverState::ReadNextCmd
    }

    fn send_file_chunks(&mut self) -> ReceiverState {
        eprintln!("{} entered SEND_FILE_CHUNKS state", self.tag());
        debug_assert!(self.sender_read_timeout > 0); // settings must be in
        let waiting = Duration::from_millis(
            (self.sender_read_timeout / WAIT_TIMEOUT_FACTOR).max(1) as u64,
        );
        let funnel = self.controller.get_funnel(SEND_FILE_CHUNKS_FUNNEL);
        loop {
            match funnel.status() {
                FunnelStatus::End => {
                    if !matches!(self.socket.write(&[cmd::ACK]), Ok(1)) {
                        eprintln!("{} ack write failed", self.tag());
                        self.stats.set_local_error(ErrorKind::SocketWriteError);
                        return ReceiverState::AcceptWithTimeout;
                    }
                    self.stats.add_header_bytes(1);
                    return ReceiverState::ReadNextCmd;
                }
                FunnelStatus::Progress => {
                    if !matches!(self.socket.write(&[cmd::WAIT]), Ok(1)) {
                        eprintln!("{} wait write failed", self.tag());
                        self.stats.set_local_error(ErrorKind::SocketWriteError);
                        return ReceiverState::AcceptWithTimeout;
                    }
                    self.stats.add_header_bytes(1);
                    funnel.wait(waiting);
                }
                FunnelStatus::Start => {
                    let infos = self.parent.file_chunks_info();
                    let mut off = 0;
                    self.buf[off] = cmd::CHUNKS;
                    off += 1;
                    if protocol::encode_chunks_cmd(&mut self.buf, &mut off, infos.len() as i64)
                        .is_err()
                    {
                        self.stats.set_local_error(ErrorKind::SocketWriteError);
                        funnel.notify_fail();
                        return ReceiverState::AcceptWithTimeout;
                    }
                    let written = self.socket.write(&self.buf[..off]).unwrap_or(0);
                    if written > 0 {
                        self.stats.add_header_bytes(written as i64);
                    }
                    if written != off {
                        eprintln!("{} chunks envelope write error {} {}", self.tag(), off, written);
                        // historical observable code for this failure
                        self.stats.set_local_error(ErrorKind::SocketReadError);
                        funnel.notify_fail();
                        return ReceiverState::AcceptWithTimeout;
                    }
                    // pack as many entries as fit per size-prefixed packet
                    let mut num_entries_written = 0;
                    while num_entries_written < infos.len() {
                        let mut off = std::mem::size_of::<i32>();
                        let encoded = protocol::encode_file_chunks_info_list(
                            &mut self.buf,
                            &mut off,
                            num_entries_written,
                            &infos,
                        );
                        if encoded == 0 {
                            // an entry that cannot fit at all would stall
                            // the exchange forever
                            eprintln!("{} chunks entry larger than buffer", self.tag());
                            break;
                        }
                        let data_size = (off - std::mem::size_of::<i32>()) as i32;
                        self.buf[..4].copy_from_slice(&data_size.to_le_bytes());
                        let written = self.socket.write(&self.buf[..off]).unwrap_or(0);
                        if written > 0 {
                            self.stats.add_header_bytes(written as i64);
                        }
                        if written != off {
                            break;
                        }
                        num_entries_written += encoded;
                    }
                    if num_entries_written != infos.len() {
                        eprintln!(
                            "{} could not write all the file chunks {} {}",
                            self.tag(),
                            infos.len(),
                            num_entries_written
                        );
                        self.stats.set_local_error(ErrorKind::SocketWriteError);
                        funnel.notify_fail();
                        return ReceiverState::AcceptWithTimeout;
                    }
                    let mut ack = [0u8; 1];
                    if !matches!(self.socket.read(&mut ack), Ok(1)) {
                        eprintln!("{} no ack for file chunks", self.tag());
                        self.stats.set_local_error(ErrorKind::SocketReadError);
                        funnel.notify_fail();
                        return ReceiverState::AcceptWithTimeout;
                    }
                    self.parent.add_transfer_log_header(self.is_block_mode, true);
                    funnel.notify_success();
                    return ReceiverState::ReadNextCmd;
                }
            }
        }
    }

    fn send_global_checkpoints(&mut self) -> ReceiverState {
        eprintln!("{} entered SEND_GLOBAL_CHECKPOINTS state", self.tag());
        self.buf[0] = cmd::ERR;
        // leave space for the length field
        let mut off = 1 + std::mem::size_of::<i16>();
        let payload_start = off;
        if protocol::encode_checkpoints(
            self.protocol_version,
            &mut self.buf,
            &mut off,
            &self.new_checkpoints,
        )
        .is_err()
        {
            eprintln!("{} checkpoint batch does not fit the buffer", self.tag());
            self.stats.set_local_error(ErrorKind::SocketWriteError);
            return ReceiverState::AcceptWithTimeout;
        }
        let length = (off - payload_start) as i16;
        self.buf[1..3].copy_from_slice(&length.to_le_bytes());

        let written = self.socket.write(&self.buf[..off]).unwrap_or(0);
        if written != off {
            eprintln!("{} unable to write error checkpoints", self.tag());
            self.stats.set_local_error(ErrorKind::SocketWriteError);
            return ReceiverState::AcceptWithTimeout;
        }
        self.stats.add_header_bytes(off as i64);
        self.pending_checkpoint_index = self.checkpoint_index + self.new_checkpoints.len();
        self.num_read = 0;
        self.off = 0;
        ReceiverState::ReadNextCmd
    }

    fn send_abort_cmd(&mut self) -> ReceiverState {
        eprintln!("{} entered SEND_ABORT_CMD state", self.tag());
        let mut off = 0;
        self.buf[off] = cmd::ABORT;
        off += 1;
        let _ = protocol::encode_abort(
            &mut self.buf,
            &mut off,
            self.protocol_version,
            self.stats.local_error(),
            self.stats.num_files(),
        );
        // fire and forget: the sender notices the disconnect and times
        // out whether or not this write lands
        let _ = self.socket.write(&self.buf[..off]);
        self.socket.close_connection();
        self.stats.add_header_bytes(off as i64);
        if self.stats.local_error() == ErrorKind::VersionMismatch {
            // sender is expected to retry at the negotiated version
            return ReceiverState::AcceptWithTimeout;
        }
        ReceiverState::FinishWithError
    }

    fn send_done_cmd(&mut self) -> ReceiverState {
        if !matches!(self.socket.write(&[cmd::DONE]), Ok(1)) {
            eprintln!("{} unable to send DONE", self.tag());
            self.done_send_failure = true;
            self.stats.set_local_error(ErrorKind::SocketWriteError);
            return ReceiverState::AcceptWithTimeout;
        }
        self.stats.add_header_bytes(1);

        let mut ack = [0u8; 1];
        let got_ack = matches!(self.socket.read(&mut ack), Ok(1)) && ack[0] == cmd::DONE;
        if !got_ack {
            eprintln!("{} did not receive ack for DONE", self.tag());
            self.done_send_failure = true;
            self.stats.set_local_error(ErrorKind::SocketReadError);
            return ReceiverState::AcceptWithTimeout;
        }

        let mut tail = [0u8; protocol::MIN_BUF_LENGTH];
        if !matches!(self.socket.read(&mut tail), Ok(0)) {
            eprintln!("{} EOF not found where expected", self.tag());
            self.done_send_failure = true;
            self.stats.set_local_error(ErrorKind::SocketReadError);
            return ReceiverState::AcceptWithTimeout;
        }
        self.socket.close_connection();
        eprintln!("{} got ack for DONE, transfer finished", self.tag());
        ReceiverState::End
    }

    fn check_for_finish_or_new_checkpoints(&mut self) -> Option<ReceiverState> {
        let checkpoints = self.parent.get_new_checkpoints(self.checkpoint_index);
        if !checkpoints.is_empty() {
            self.new_checkpoints = checkpoints;
            self.controller
                .mark_state(self.thread_index, WorkerState::Running);
            return Some(ReceiverState::SendGlobalCheckpoints);
        }
        if !self
            .controller
            .has_threads(self.thread_index, WorkerState::Running)
        {
            self.controller
                .mark_state(self.thread_index, WorkerState::Finished);
            return Some(ReceiverState::SendDoneCmd);
        }
        None
    }

    fn wait_for_finish_or_new_checkpoint(&mut self) -> ReceiverState {
        eprintln!("{} entered WAIT_FOR_FINISH_OR_NEW_CHECKPOINT state", self.tag());
        debug_assert_eq!(self.stats.local_error(), ErrorKind::Ok);
        debug_assert!(self.sender_read_timeout > 0); // settings must be in
        let cv = self.controller.get_condition(WAIT_FOR_FINISH_OR_CHECKPOINT_CV);
        let timeout = Duration::from_millis(
            (self.sender_read_timeout / WAIT_TIMEOUT_FACTOR).max(1) as u64,
        );
        self.controller
            .mark_state(self.thread_index, WorkerState::Waiting);
        loop {
            {
                let mut guard = cv.acquire();
                if let Some(next) = self.check_for_finish_or_new_checkpoints() {
                    guard.notify_one();
                    return next;
                }
                guard.wait(timeout);
                if let Some(next) = self.check_for_finish_or_new_checkpoints() {
                    guard.notify_one();
                    return next;
                }
            }
            // keep the sender connection alive, outside the mutex
            if !matches!(self.socket.write(&[cmd::WAIT]), Ok(1)) {
                eprintln!("{} unable to write WAIT", self.tag());
                self.stats.set_local_error(ErrorKind::SocketWriteError);
                self.controller
                    .mark_state(self.thread_index, WorkerState::Running);
                return ReceiverState::AcceptWithTimeout;
            }
            self.stats.add_header_bytes(1);
        }
    }

    fn finish_with_error(&mut self) -> ReceiverState {
        eprintln!("{} entered FINISH_WITH_ERROR state", self.tag());
        // only reachable with a pending error
        debug_assert_ne!(self.stats.local_error(), ErrorKind::Ok);
        self.parent.logger().error(
            "worker",
            &format!(
                "thread {} port {} finished with {:?}",
                self.thread_index,
                self.socket.port(),
                self.stats.local_error()
            ),
        );
        // close everything so the sender sees an error on connect
        self.socket.close_all();
        let cv = self.controller.get_condition(WAIT_FOR_FINISH_OR_CHECKPOINT_CV);
        let guard = cv.acquire();
        self.parent.add_checkpoint(self.checkpoint.clone());
        self.controller
            .mark_state(self.thread_index, WorkerState::Finished);
        guard.notify_one();
        ReceiverState::End
    }
}
