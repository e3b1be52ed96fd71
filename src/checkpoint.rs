//! Per-port progress record exchanged with the sender on reconnects

/// Receiver-side acknowledgment of progress on one port. `num_blocks` is
/// the count of fully committed blocks; `-1` signals that a previous
/// DONE exchange failed and the session must restart from here. The
/// last-block fields describe an in-progress block whose partial prefix
/// is already on disk (all zero when there is none); they are only put
/// on the wire at protocol versions that understand checkpoint offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub port: u16,
    pub num_blocks: i64,
    pub last_block_seq_id: i64,
    pub last_block_offset: i64,
    pub last_block_bytes_written: i64,
}

impl Checkpoint {
    pub fn new(port: u16) -> Self {
        Checkpoint {
            port,
            ..Default::default()
        }
    }

    pub fn incr_num_blocks(&mut self) {
        self.num_blocks += 1;
    }

    pub fn reset_last_block_details(&mut self) {
        self.last_block_seq_id = 0;
        self.last_block_offset = 0;
        self.last_block_bytes_written = 0;
    }

    pub fn set_last_block_details(&mut self, seq_id: i64, offset: i64, bytes_written: i64) {
        self.last_block_seq_id = seq_id;
        self.last_block_offset = offset;
        self.last_block_bytes_written = bytes_written;
    }

    pub fn has_last_block(&self) -> bool {
        self.last_block_bytes_written > 0
    }
}
