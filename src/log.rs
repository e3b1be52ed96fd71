//! Durable transfer log: one JSON object per line, append-only
//!
//! The log records session headers and every committed block write. On
//! restart it can be folded into per-file chunk maps so a resuming
//! sender skips work that already reached disk.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::protocol::{FileChunksInfo, Interval};

const LOG_FILE_NAME: &str = ".warpsink_transfer.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferLogEntry {
    Header {
        timestamp: String,
        block_mode: bool,
        sender_resuming: bool,
    },
    BlockWrite {
        timestamp: String,
        seq_id: i64,
        file_name: String,
        file_size: i64,
        offset: i64,
        data_size: i64,
    },
}

pub struct TransferLogManager {
    log_file_path: PathBuf,
}

impl TransferLogManager {
    pub fn new(destination_root: &Path) -> Self {
        TransferLogManager {
            log_file_path: destination_root.join(LOG_FILE_NAME),
        }
    }

    fn append(&self, entry: &TransferLogEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("open transfer log for append")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn add_header_entry(&self, block_mode: bool, sender_resuming: bool) -> Result<()> {
        self.append(&TransferLogEntry::Header {
            timestamp: Utc::now().to_rfc3339(),
            block_mode,
            sender_resuming,
        })
    }

    pub fn add_block_write_entry(
        &self,
        seq_id: i64,
        file_name: &str,
        file_size: i64,
        offset: i64,
        data_size: i64,
    ) -> Result<()> {
        self.append(&TransferLogEntry::BlockWrite {
            timestamp: Utc::now().to_rfc3339(),
            seq_id,
            file_name: file_name.to_string(),
            file_size,
            offset,
            data_size,
        })
    }

    pub fn read_entries(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path).context("open transfer log for read")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// Fold the block-write entries into per-file chunk maps, merging
    /// touching ranges, for the download-resumption handshake.
    pub fn file_chunks_from_log(&self) -> Result<Vec<FileChunksInfo>> {
        let mut by_seq: BTreeMap<i64, FileChunksInfo> = BTreeMap::new();
        for entry in self.read_entries()? {
            if let TransferLogEntry::BlockWrite {
                seq_id,
                file_name,
                file_size,
                offset,
                data_size,
                ..
            } = entry
            {
                let info = by_seq.entry(seq_id).or_insert_with(|| FileChunksInfo {
                    seq_id,
                    file_name: file_name.clone(),
                    file_size,
                    chunks: Vec::new(),
                });
                info.chunks.push(Interval {
                    start: offset,
                    end: offset + data_size,
                });
            }
        }
        let mut out: Vec<FileChunksInfo> = by_seq.into_values().collect();
        for info in &mut out {
            info.chunks = merge_intervals(std::mem::take(&mut info.chunks));
        }
        Ok(out)
    }
}

fn merge_intervals(mut chunks: Vec<Interval>) -> Vec<Interval> {
    chunks.sort_by_key(|c| c.start);
    let mut merged: Vec<Interval> = Vec::with_capacity(chunks.len());
    for c in chunks {
        match merged.last_mut() {
            Some(last) if c.start <= last.end => last.end = last.end.max(c.end),
            _ => merged.push(c),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let log = TransferLogManager::new(tmp.path());
        log.add_header_entry(true, false).unwrap();
        log.add_block_write_entry(1, "a.bin", 100, 0, 50).unwrap();
        log.add_block_write_entry(1, "a.bin", 100, 50, 50).unwrap();
        let entries = log.read_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], TransferLogEntry::Header { .. }));
        assert!(matches!(
            entries[2],
            TransferLogEntry::BlockWrite { offset: 50, .. }
        ));
    }

    #[test]
    fn missing_log_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let log = TransferLogManager::new(tmp.path());
        assert!(log.read_entries().unwrap().is_empty());
        assert!(log.file_chunks_from_log().unwrap().is_empty());
    }

    #[test]
    fn chunks_merge_touching_ranges() {
        let tmp = TempDir::new().unwrap();
        let log = TransferLogManager::new(tmp.path());
        log.add_block_write_entry(7, "big.bin", 400, 100, 100).unwrap();
        log.add_block_write_entry(7, "big.bin", 400, 0, 100).unwrap();
        log.add_block_write_entry(7, "big.bin", 400, 300, 100).unwrap();
        log.add_block_write_entry(9, "other.bin", 10, 0, 10).unwrap();

        let infos = log.file_chunks_from_log().unwrap();
        assert_eq!(infos.len(), 2);
        let big = infos.iter().find(|i| i.seq_id == 7).unwrap();
        assert_eq!(big.file_name, "big.bin");
        assert_eq!(
            big.chunks,
            vec![
                Interval { start: 0, end: 200 },
                Interval { start: 300, end: 400 }
            ]
        );
    }
}
