//! Shared CLI fragments for the warpsink daemon

use clap::Parser;
use std::path::PathBuf;

/// Core receiver options shared by the daemon binary.
#[derive(Clone, Debug, Parser)]
pub struct ReceiverOpts {
    /// Bind address for worker ports
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// First worker port (0 = let each worker pick a free port)
    #[arg(long, default_value_t = 22356)]
    pub start_port: u16,

    /// Number of worker ports, one OS thread each
    #[arg(long, default_value_t = 8)]
    pub num_ports: usize,

    /// Destination directory to receive into
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Transfer id both peers must agree on
    #[arg(long, default_value = "")]
    pub transfer_id: String,
}
