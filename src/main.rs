//! warpsinkd - receiver daemon for warp-speed bulk transfers
//!
//! Binds one worker thread per port, receives a full transfer session,
//! and prints the aggregate report.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use warpsink::cli::ReceiverOpts;
use warpsink::protocol::ErrorKind;
use warpsink::{Options, Receiver};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "warpsink receiver daemon - multi-stream bulk file transfer sink"
)]
struct Args {
    #[command(flatten)]
    receiver: ReceiverOpts,

    /// Per-worker receive buffer in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    buffer_size: usize,

    /// Accept payloads but skip disk writes (wire benchmarking)
    #[arg(long)]
    skip_writes: bool,

    /// Listen/bind attempts before giving up
    #[arg(long, default_value_t = 20)]
    max_retries: usize,

    /// Sleep between listen retries (ms)
    #[arg(long, default_value_t = 50)]
    sleep_millis: u64,

    /// First-connection accept attempts
    #[arg(long, default_value_t = 500)]
    max_accept_retries: usize,

    /// Per-attempt first-connection accept timeout (ms)
    #[arg(long, default_value_t = 100)]
    accept_timeout_millis: u64,

    /// Re-accept window before sender timeouts are known (ms)
    #[arg(long, default_value_t = 2000)]
    accept_window_millis: u64,

    /// Offer previously received chunks to a resuming sender
    #[arg(long)]
    enable_download_resumption: bool,

    /// Record committed blocks in the durable transfer log
    #[arg(long)]
    log_based_resumption: bool,

    /// Receive rate limit in MB/s (0 = unlimited)
    #[arg(long, default_value_t = 0.0)]
    throttle_mbytes_per_sec: f64,

    /// Append session events to this file
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Per-thread stats in the final summary
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let options = Options {
        host: args.receiver.host.clone(),
        start_port: args.receiver.start_port,
        num_ports: args.receiver.num_ports,
        root: args.receiver.root.clone(),
        transfer_id: args.receiver.transfer_id.clone(),
        buffer_size: args.buffer_size,
        skip_writes: args.skip_writes,
        max_retries: args.max_retries,
        sleep_millis: args.sleep_millis,
        max_accept_retries: args.max_accept_retries,
        accept_timeout_millis: args.accept_timeout_millis,
        accept_window_millis: args.accept_window_millis,
        enable_download_resumption: args.enable_download_resumption,
        log_based_resumption: args.log_based_resumption,
        throttle_mbytes_per_sec: args.throttle_mbytes_per_sec,
        event_log: args.event_log.clone(),
    };

    let mut receiver = Receiver::new(options)?;
    let ports = receiver.init()?;
    println!(
        "warpsinkd id={} root={} ports={:?}",
        args.receiver.transfer_id,
        args.receiver.root.display(),
        ports
    );

    let report = receiver.run()?;

    println!("Blocks: {}", report.total_blocks());
    println!("Bytes: {}", report.total_effective_bytes());
    println!("Time: {:.2}s", report.elapsed.as_secs_f64());
    println!("Throughput: {:.2} MB/s", report.throughput_mbytes_per_sec());
    if args.verbose {
        for (i, stats) in report.thread_stats.iter().enumerate() {
            println!("  thread {}: {}", i, stats);
        }
    }
    if report.first_error() != ErrorKind::Ok {
        bail!("transfer finished with error {:?}", report.first_error());
    }
    Ok(())
}
