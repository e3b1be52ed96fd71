//! End-to-end receiver scenarios driven by a scripted sender over
//! localhost TCP: happy paths, version negotiation, mid-block resume,
//! checksum failures, DONE-ack loss and multi-worker checkpointing.

use anyhow::Result;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use warpsink::checkpoint::Checkpoint;
use warpsink::log::{TransferLogEntry, TransferLogManager};
use warpsink::protocol::{self, cmd, BlockDetails, ErrorKind, Settings, PROTOCOL_VERSION};
use warpsink::session::SessionHandle;
use warpsink::stats::TransferReport;
use warpsink::{Options, Receiver};

const TRANSFER_ID: &str = "xfer-test";
const SENDER_READ_TIMEOUT: i32 = 1000;
const SENDER_WRITE_TIMEOUT: i32 = 1000;

fn test_options(root: &Path, num_ports: usize) -> Options {
    Options {
        host: "127.0.0.1".into(),
        start_port: 0,
        num_ports,
        root: root.to_path_buf(),
        transfer_id: TRANSFER_ID.into(),
        buffer_size: 8192,
        accept_timeout_millis: 100,
        max_accept_retries: 100,
        accept_window_millis: 3000,
        ..Default::default()
    }
}

struct Harness {
    ports: Vec<u16>,
    session: Arc<SessionHandle>,
    handle: thread::JoinHandle<Result<TransferReport>>,
}

impl Harness {
    fn start(options: Options) -> Harness {
        let mut receiver = Receiver::new(options).unwrap();
        let ports = receiver.init().unwrap();
        let session = receiver.session();
        let handle = thread::spawn(move || receiver.run());
        Harness {
            ports,
            session,
            handle,
        }
    }

    fn join(self) -> TransferReport {
        self.handle.join().unwrap().unwrap()
    }
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("could not connect to port {}", port);
}

fn pattern_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    let mut val: u8 = 0;
    for b in buf.iter_mut() {
        *b = val;
        val = val.wrapping_add(1);
    }
    buf
}

fn block(name: &str, seq_id: i64, offset: i64, data_size: i64, file_size: i64) -> BlockDetails {
    BlockDetails {
        file_name: name.to_string(),
        seq_id,
        file_size,
        offset,
        data_size,
        flags: 0,
    }
}

/// SETTINGS command. Padded to MIN_BUF_LENGTH when the sender either
/// requests the chunks handshake or will not pipeline anything after it.
fn settings_frame(version: i32, transfer_id: &str, enable_checksum: bool, send_file_chunks: bool, pad: bool) -> Vec<u8> {
    let mut buf = vec![0u8; protocol::MIN_BUF_LENGTH];
    let mut off = 0;
    buf[off] = cmd::SETTINGS;
    off += 1;
    protocol::encode_version(&mut buf, &mut off, version).unwrap();
    protocol::encode_settings(
        &mut buf,
        &mut off,
        &Settings {
            transfer_id: transfer_id.into(),
            read_timeout_millis: SENDER_READ_TIMEOUT,
            write_timeout_millis: SENDER_WRITE_TIMEOUT,
            enable_checksum,
            block_mode_disabled: false,
            send_file_chunks,
        },
    )
    .unwrap();
    if !pad {
        buf.truncate(off);
    }
    buf
}

/// FILE command: header plus `payload.len()` payload bytes (which may be
/// fewer than the advertised data size, to script mid-block failures).
fn file_frame(details: &BlockDetails, payload: &[u8], with_footer: bool) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + protocol::MAX_HEADER_LEN];
    let mut off = 0;
    buf[off] = cmd::FILE;
    off += 1;
    buf[off] = ErrorKind::Ok as u8;
    off += 1;
    let len_at = off;
    off += 2;
    protocol::encode_header(&mut buf, &mut off, details).unwrap();
    let header_len = off as i16; // counts from the magic
    buf[len_at..len_at + 2].copy_from_slice(&header_len.to_le_bytes());
    buf.truncate(off);
    buf.extend_from_slice(payload);
    if with_footer {
        buf.push(cmd::FOOTER);
        buf.extend_from_slice(&(crc32c::crc32c(payload) as i32).to_le_bytes());
    }
    buf
}

fn size_frame(total_bytes: i64) -> Vec<u8> {
    let mut buf = vec![0u8; protocol::MAX_SIZE_LEN];
    let mut off = 0;
    buf[off] = cmd::SIZE;
    off += 1;
    protocol::encode_size(&mut buf, &mut off, total_bytes).unwrap();
    buf
}

/// DONE command, zero-padded to exactly MIN_BUF_LENGTH.
fn done_frame(num_blocks: i64, total_bytes: i64) -> Vec<u8> {
    let mut buf = vec![0u8; protocol::MIN_BUF_LENGTH];
    let mut off = 0;
    buf[off] = cmd::DONE;
    off += 1;
    protocol::encode_done(&mut buf, &mut off, ErrorKind::Ok, num_blocks, total_bytes).unwrap();
    buf
}

fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Waiting receivers heartbeat WAIT bytes; skip them.
fn next_cmd_skipping_waits(stream: &mut TcpStream) -> u8 {
    loop {
        let b = read_exact_n(stream, 1)[0];
        if b != cmd::WAIT {
            return b;
        }
    }
}

fn read_local_checkpoint(stream: &mut TcpStream, version: i32) -> Checkpoint {
    let len = protocol::max_local_checkpoint_len(version);
    let buf = read_exact_n(stream, len);
    let mut off = 0;
    let mut cps = protocol::decode_checkpoints(version, &buf, &mut off, len).unwrap();
    assert_eq!(cps.len(), 1);
    cps.pop().unwrap()
}

/// Ack the receiver's DONE and close, giving it the EOF it expects.
fn finish_done_handshake(mut stream: TcpStream) {
    let b = next_cmd_skipping_waits(&mut stream);
    assert_eq!(b, cmd::DONE);
    stream.write_all(&[cmd::DONE]).unwrap();
    drop(stream);
}

#[test]
fn single_block_happy_path() {
    // checksum convention: CRC-32C, seed 0
    assert_eq!(crc32c::crc32c(b"hello"), 0x9a71bb4c);

    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let mut stream = connect(harness.ports[0]);

    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, true, false, false);
    bytes.extend(size_frame(5));
    bytes.extend(file_frame(&block("a", 0, 0, 5, 5), b"hello", true));
    bytes.extend(done_frame(1, 5));
    stream.write_all(&bytes).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(report.total_blocks(), 1);
    let stats = &report.thread_stats[0];
    assert_eq!(stats.effective_data_bytes(), 5);
    // effective bytes = header bytes of the FILE command + payload
    assert_eq!(stats.effective_bytes(), 40 + 5);
    assert_eq!(stats.num_blocks_send(), 1);
    assert_eq!(stats.total_sender_bytes(), 5);
    assert_eq!(std::fs::read(tmp.path().join("a")).unwrap(), b"hello");
}

#[test]
fn ancient_sender_version_is_incompatible() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let mut stream = connect(harness.ports[0]);
    stream
        .write_all(&settings_frame(
            protocol::MIN_SUPPORTED_VERSION - 1,
            TRANSFER_ID,
            false,
            false,
            true,
        ))
        .unwrap();
    let magic = read_exact_n(&mut stream, 1)[0];
    assert_eq!(magic, cmd::ABORT);
    let frame = read_exact_n(&mut stream, protocol::MAX_ABORT_LEN - 1);
    let mut off = 0;
    let (_, err, _) = protocol::decode_abort(&frame, &mut off, frame.len()).unwrap();
    assert_eq!(err, ErrorKind::VersionIncompatible);
    drop(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::VersionIncompatible);
}

#[test]
fn abort_cancels_workers() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let stream = connect(harness.ports[0]);
    thread::sleep(Duration::from_millis(100));
    harness.session.abort(ErrorKind::Aborted);
    drop(stream);
    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Aborted);
}

#[test]
fn zero_byte_block_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let mut stream = connect(harness.ports[0]);

    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, true, false, false);
    bytes.extend(file_frame(&block("empty.bin", 0, 0, 0, 0), b"", true));
    bytes.extend(done_frame(1, 0));
    stream.write_all(&bytes).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(report.total_blocks(), 1);
    let meta = std::fs::metadata(tmp.path().join("empty.bin")).unwrap();
    assert_eq!(meta.len(), 0);
}

#[test]
fn version_mismatch_aborts_then_accepts_downgraded_sender() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));

    // connection 1: newer sender
    let mut stream = connect(harness.ports[0]);
    stream
        .write_all(&settings_frame(
            PROTOCOL_VERSION + 1,
            TRANSFER_ID,
            false,
            false,
            true,
        ))
        .unwrap();
    let magic = read_exact_n(&mut stream, 1)[0];
    assert_eq!(magic, cmd::ABORT);
    let frame = read_exact_n(&mut stream, protocol::MAX_ABORT_LEN - 1);
    let mut off = 0;
    let (version, err, _num_files) =
        protocol::decode_abort(&frame, &mut off, frame.len()).unwrap();
    // receiver already downgraded to the negotiated version
    assert_eq!(version, PROTOCOL_VERSION);
    assert_eq!(err, ErrorKind::VersionMismatch);
    drop(stream);

    // connection 2: sender retries at the negotiated version
    let mut stream = connect(harness.ports[0]);
    let checkpoint = read_local_checkpoint(&mut stream, PROTOCOL_VERSION);
    assert_eq!(checkpoint.port, harness.ports[0]);
    assert_eq!(checkpoint.num_blocks, 0);

    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, true, false, false);
    bytes.extend(file_frame(&block("v.bin", 0, 0, 5, 5), b"hello", true));
    bytes.extend(done_frame(1, 5));
    stream.write_all(&bytes).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(std::fs::read(tmp.path().join("v.bin")).unwrap(), b"hello");
}

#[test]
fn mid_block_disconnect_records_partial_progress() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let payload = pattern_bytes(1024);

    // connection 1: header promises 1024 bytes, wire delivers 400
    let mut stream = connect(harness.ports[0]);
    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, false, false, false);
    bytes.extend(file_frame(&block("r.bin", 3, 0, 1024, 1024), &payload[..400], false));
    stream.write_all(&bytes).unwrap();
    drop(stream);

    // connection 2: the local checkpoint advertises the partial block
    let mut stream = connect(harness.ports[0]);
    let checkpoint = read_local_checkpoint(&mut stream, PROTOCOL_VERSION);
    assert_eq!(checkpoint.num_blocks, 0);
    assert_eq!(checkpoint.last_block_seq_id, 3);
    assert_eq!(checkpoint.last_block_offset, 0);
    assert_eq!(checkpoint.last_block_bytes_written, 400);

    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, false, false, false);
    bytes.extend(file_frame(&block("r.bin", 3, 0, 1024, 1024), &payload, false));
    bytes.extend(done_frame(1, 1024));
    stream.write_all(&bytes).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(report.total_blocks(), 1);
    assert_eq!(report.total_failed_attempts(), 1);
    assert_eq!(std::fs::read(tmp.path().join("r.bin")).unwrap(), payload);
}

#[test]
fn checksum_mismatch_is_retried_and_kept_out_of_the_log() {
    let tmp = tempfile::tempdir().unwrap();
    let mut options = test_options(tmp.path(), 1);
    options.log_based_resumption = true;
    let harness = Harness::start(options);
    let payload = pattern_bytes(512);

    // connection 1: correct payload, footer CRC off by one
    let mut stream = connect(harness.ports[0]);
    let mut frame = file_frame(&block("c.bin", 0, 0, 512, 512), &payload, false);
    frame.push(cmd::FOOTER);
    let bad_crc = (crc32c::crc32c(&payload) as i32).wrapping_add(1);
    frame.extend_from_slice(&bad_crc.to_le_bytes());
    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, true, false, false);
    bytes.extend(frame);
    // DONE rides behind the footer; the mismatch makes the receiver drop
    // the connection before looking at it
    bytes.extend(done_frame(1, 512));
    stream.write_all(&bytes).unwrap();
    drop(stream);

    // connection 2: clean retry
    let mut stream = connect(harness.ports[0]);
    let checkpoint = read_local_checkpoint(&mut stream, PROTOCOL_VERSION);
    assert_eq!(checkpoint.num_blocks, 0);
    // a checksum failure leaves no partial-block claim
    assert_eq!(checkpoint.last_block_bytes_written, 0);

    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, true, false, false);
    bytes.extend(file_frame(&block("c.bin", 0, 0, 512, 512), &payload, true));
    bytes.extend(done_frame(1, 512));
    stream.write_all(&bytes).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(report.total_blocks(), 1);
    assert_eq!(report.total_failed_attempts(), 1);
    assert_eq!(std::fs::read(tmp.path().join("c.bin")).unwrap(), payload);

    // exactly one committed block write in the durable log
    let entries = TransferLogManager::new(tmp.path()).read_entries().unwrap();
    let block_writes: Vec<_> = entries
        .iter()
        .filter(|e| matches!(e, TransferLogEntry::BlockWrite { .. }))
        .collect();
    assert_eq!(block_writes.len(), 1);
}

#[test]
fn done_ack_loss_triggers_sentinel_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));

    // connection 1: full transfer, but disconnect instead of acking DONE
    let mut stream = connect(harness.ports[0]);
    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, true, false, false);
    bytes.extend(file_frame(&block("d.bin", 0, 0, 5, 5), b"hello", true));
    bytes.extend(done_frame(1, 5));
    stream.write_all(&bytes).unwrap();
    let b = next_cmd_skipping_waits(&mut stream);
    assert_eq!(b, cmd::DONE);
    drop(stream); // no ack

    // connection 2: sentinel checkpoint, then DONE is retried at once
    let mut stream = connect(harness.ports[0]);
    let checkpoint = read_local_checkpoint(&mut stream, PROTOCOL_VERSION);
    assert_eq!(checkpoint.num_blocks, -1);
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(report.total_blocks(), 1);
    assert_eq!(std::fs::read(tmp.path().join("d.bin")).unwrap(), b"hello");
}

#[test]
fn transfer_id_mismatch_finishes_with_error() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let mut stream = connect(harness.ports[0]);
    stream
        .write_all(&settings_frame(PROTOCOL_VERSION, "some-other-id", false, false, true))
        .unwrap();
    let magic = read_exact_n(&mut stream, 1)[0];
    assert_eq!(magic, cmd::ABORT);
    let frame = read_exact_n(&mut stream, protocol::MAX_ABORT_LEN - 1);
    let mut off = 0;
    let (_, err, _) = protocol::decode_abort(&frame, &mut off, frame.len()).unwrap();
    assert_eq!(err, ErrorKind::IdMismatch);
    drop(stream);

    let session = harness.session.clone();
    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::IdMismatch);
    // the failed worker still published its checkpoint to the parent
    assert_eq!(session.checkpoints().len(), 1);
}

#[test]
fn unknown_command_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 1));
    let mut stream = connect(harness.ports[0]);
    stream.write_all(&[0xee; protocol::MIN_BUF_LENGTH]).unwrap();
    drop(stream);
    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::ProtocolError);
}

#[test]
fn pipelined_blocks_with_leftover_in_buffer() {
    // small buffer so the first block pushes the cursor past the
    // midpoint and the trailing frame rides in as leftover bytes
    let tmp = tempfile::tempdir().unwrap();
    let mut options = test_options(tmp.path(), 1);
    options.buffer_size = 1024;
    let harness = Harness::start(options);
    let first = pattern_bytes(600);
    let second = pattern_bytes(100);

    let mut stream = connect(harness.ports[0]);
    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, false, false, false);
    bytes.extend(file_frame(&block("one.bin", 0, 0, 600, 600), &first, false));
    bytes.extend(file_frame(&block("two.bin", 1, 0, 100, 100), &second, false));
    stream.write_all(&bytes).unwrap();
    thread::sleep(Duration::from_millis(300));
    stream.write_all(&done_frame(2, 700)).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(report.total_blocks(), 2);
    assert_eq!(std::fs::read(tmp.path().join("one.bin")).unwrap(), first);
    assert_eq!(std::fs::read(tmp.path().join("two.bin")).unwrap(), second);
}

#[test]
fn file_chunks_handshake_replays_logged_progress() {
    let tmp = tempfile::tempdir().unwrap();
    // a previous session committed the first half of big.bin
    let payload = pattern_bytes(400);
    TransferLogManager::new(tmp.path())
        .add_block_write_entry(7, "big.bin", 400, 0, 200)
        .unwrap();
    std::fs::write(tmp.path().join("big.bin"), &payload[..200]).unwrap();

    let mut options = test_options(tmp.path(), 1);
    options.enable_download_resumption = true;
    options.log_based_resumption = true;
    let harness = Harness::start(options);

    let mut stream = connect(harness.ports[0]);
    stream
        .write_all(&settings_frame(PROTOCOL_VERSION, TRANSFER_ID, false, true, true))
        .unwrap();

    // CHUNKS envelope, then one size-prefixed packet
    let envelope = read_exact_n(&mut stream, 1 + 8);
    assert_eq!(envelope[0], cmd::CHUNKS);
    let mut off = 1;
    let num_entries = protocol::decode_chunks_cmd(&envelope, &mut off, envelope.len()).unwrap();
    assert_eq!(num_entries, 1);
    let size_bytes = read_exact_n(&mut stream, 4);
    let packet_len = i32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]) as usize;
    let packet = read_exact_n(&mut stream, packet_len);
    let mut off = 0;
    let infos = protocol::decode_file_chunks_info_list(&packet, &mut off, packet_len).unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].seq_id, 7);
    assert_eq!(infos[0].file_name, "big.bin");
    assert_eq!(infos[0].chunks.len(), 1);
    assert_eq!(infos[0].chunks[0].start, 0);
    assert_eq!(infos[0].chunks[0].end, 200);
    stream.write_all(&[cmd::ACK]).unwrap();

    // sender resumes with just the missing tail
    let mut bytes = file_frame(&block("big.bin", 7, 200, 200, 400), &payload[200..], false);
    bytes.extend(done_frame(1, 200));
    stream.write_all(&bytes).unwrap();
    finish_done_handshake(stream);

    let report = harness.join();
    assert_eq!(report.first_error(), ErrorKind::Ok);
    assert_eq!(std::fs::read(tmp.path().join("big.bin")).unwrap(), payload);

    // the log gained a resuming-session header and the new block
    let entries = TransferLogManager::new(tmp.path()).read_entries().unwrap();
    assert!(entries.iter().any(|e| matches!(
        e,
        TransferLogEntry::Header {
            sender_resuming: true,
            ..
        }
    )));
    let block_writes = entries
        .iter()
        .filter(|e| matches!(e, TransferLogEntry::BlockWrite { .. }))
        .count();
    assert_eq!(block_writes, 2);
}

#[test]
fn sibling_failure_is_broadcast_as_global_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::start(test_options(tmp.path(), 2));

    // worker 0: complete session immediately, then hold the connection
    let mut stream0 = connect(harness.ports[0]);
    let mut bytes = settings_frame(PROTOCOL_VERSION, TRANSFER_ID, false, false, false);
    bytes.extend(done_frame(0, 0));
    stream0.write_all(&bytes).unwrap();

    // worker 1: a connection that never says anything, then vanishes
    let stream1 = connect(harness.ports[1]);
    thread::sleep(Duration::from_millis(200));
    drop(stream1);

    // worker 0 heartbeats WAIT until worker 1 gives up, then relays the
    // failed sibling's checkpoint as an ERR frame
    let magic = next_cmd_skipping_waits(&mut stream0);
    assert_eq!(magic, cmd::ERR);
    let len_bytes = read_exact_n(&mut stream0, 2);
    let len = i16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let payload = read_exact_n(&mut stream0, len);
    let mut off = 0;
    let checkpoints = protocol::decode_checkpoints(PROTOCOL_VERSION, &payload, &mut off, len).unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].port, harness.ports[1]);
    assert_eq!(checkpoints[0].num_blocks, 0);

    // sender acknowledges by finishing the session again
    stream0.write_all(&done_frame(0, 0)).unwrap();
    finish_done_handshake(stream0);

    let report = harness.join();
    assert_eq!(report.thread_stats[0].local_error(), ErrorKind::Ok);
    assert_eq!(report.thread_stats[1].local_error(), ErrorKind::ConnError);
}
