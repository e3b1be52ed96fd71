use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Session-level event sink. Workers stay chatty on stderr; this trait
/// is for the durable, user-facing record of what a session did.
pub trait Logger: Send + Sync {
    fn session_start(&self, _transfer_id: &str, _peer: &str) {}
    fn block_done(&self, _file: &str, _offset: i64, _bytes: i64) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn session_done(&self, _blocks: i64, _bytes: i64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn session_start(&self, transfer_id: &str, peer: &str) {
        self.line(&format!("START id={} peer={}", transfer_id, peer));
    }
    fn block_done(&self, file: &str, offset: i64, bytes: i64) {
        self.line(&format!("BLOCK file={} offset={} bytes={}", file, offset, bytes));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn session_done(&self, blocks: i64, bytes: i64, seconds: f64) {
        self.line(&format!("DONE blocks={blocks} bytes={bytes} seconds={seconds:.3}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn text_logger_appends_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.session_start("t1", "127.0.0.1");
        logger.block_done("a.bin", 0, 42);
        logger.session_done(1, 42, 0.5);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("START id=t1"));
        assert!(lines[1].contains("BLOCK file=a.bin"));
        assert!(lines[2].contains("DONE blocks=1"));
    }
}
