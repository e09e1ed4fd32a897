//! Capture of script stderr for post-mortem logging
//!
//! Everything a script writes to stderr is kept in a bounded, tail-keeping
//! buffer. The buffer only reaches disk when the script exits non-zero.

use super::protocol::read_line_capped;
use chrono::Utc;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};

/// Written after every entry in a script log.
pub const ENTRY_SEPARATOR: &str = "-----------------------------";

/// Diagnostic buffer shared by the stderr reader and, with the capture
/// stdout policy, the response decoder.
pub type SharedDiagnostics = Arc<Mutex<DiagnosticBuffer>>;

/// Newline-terminated lines, oldest dropped first once over the limit
#[derive(Debug)]
pub struct DiagnosticBuffer {
    lines: VecDeque<Vec<u8>>,
    len: usize,
    limit: usize,
    dropped_bytes: usize,
}

impl DiagnosticBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            len: 0,
            limit: limit.max(1),
            dropped_bytes: 0,
        }
    }

    pub fn shared(limit: usize) -> SharedDiagnostics {
        Arc::new(Mutex::new(Self::new(limit)))
    }

    pub fn push_line(&mut self, line: &[u8]) {
        let keep = line.len().min(self.limit - 1);
        let mut entry = Vec::with_capacity(keep + 1);
        entry.extend_from_slice(&line[..keep]);
        entry.push(b'\n');
        self.dropped_bytes += line.len() - keep;

        self.len += entry.len();
        self.lines.push_back(entry);

        while self.len > self.limit {
            match self.lines.pop_front() {
                Some(old) => {
                    self.len -= old.len();
                    self.dropped_bytes += old.len();
                }
                None => break,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.dropped_bytes == 0
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for line in &self.lines {
            out.extend_from_slice(line);
        }
        out
    }

    /// Render one log entry for a failed run.
    pub fn render_entry(&self, exit_code: i32) -> Vec<u8> {
        let mut entry = format!("=== {} exit code {} ===\n", Utc::now().to_rfc3339(), exit_code)
            .into_bytes();
        if self.dropped_bytes > 0 {
            entry.extend_from_slice(
                format!("[{} earlier bytes dropped]\n", self.dropped_bytes).as_bytes(),
            );
        }
        entry.extend_from_slice(&self.contents());
        entry.extend_from_slice(format!("\n{}\n", ENTRY_SEPARATOR).as_bytes());
        entry
    }
}

/// Append a line to a shared diagnostic buffer, tolerating a poisoned lock.
pub fn push_shared(buffer: &SharedDiagnostics, line: &[u8]) {
    buffer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push_line(line);
}

/// Read `stream` line by line into `buffer` until it closes.
pub async fn collect<R: AsyncRead + Unpin>(stream: R, buffer: SharedDiagnostics) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        match read_line_capped(&mut reader, &mut line).await {
            Ok(true) => push_shared(&buffer, &line),
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read script stderr");
                break;
            }
        }
    }
}

/// Path of the failure log for `script` inside `log_dir`.
pub fn script_log_path(log_dir: &Path, script: &str) -> PathBuf {
    log_dir.join(format!("{}.log", script))
}

/// Append one entry for a failed run to the script's log file.
///
/// The entry goes out in a single write so concurrent failures of the same
/// script do not interleave inside an entry.
pub async fn write_failure_log(
    log_dir: &Path,
    script: &str,
    exit_code: i32,
    buffer: &DiagnosticBuffer,
) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(log_dir).await?;

    let path = script_log_path(log_dir, script);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;

    file.write_all(&buffer.render_entry(exit_code)).await?;
    file.flush().await?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lines_are_newline_terminated() {
        let mut buffer = DiagnosticBuffer::new(1024);
        buffer.push_line(b"Traceback (most recent call last):");
        buffer.push_line(b"ValueError: boom");

        assert_eq!(
            buffer.contents(),
            b"Traceback (most recent call last):\nValueError: boom\n".to_vec()
        );
        assert_eq!(buffer.dropped_bytes(), 0);
    }

    #[test]
    fn test_oldest_lines_dropped_over_limit() {
        let mut buffer = DiagnosticBuffer::new(10);
        buffer.push_line(b"aaaa"); // 5 bytes
        buffer.push_line(b"bbbb"); // 10 bytes
        buffer.push_line(b"cc"); // 13 bytes, drops "aaaa\n"

        assert_eq!(buffer.contents(), b"bbbb\ncc\n".to_vec());
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.dropped_bytes(), 5);
    }

    #[test]
    fn test_oversized_line_is_cut() {
        let mut buffer = DiagnosticBuffer::new(4);
        buffer.push_line(b"abcdefgh");

        assert_eq!(buffer.contents(), b"abc\n".to_vec());
        assert_eq!(buffer.dropped_bytes(), 5);
    }

    #[tokio::test]
    async fn test_collect_reads_until_eof() {
        let buffer = DiagnosticBuffer::shared(1024);
        let stderr: &[u8] = b"warning: one\r\nerror: two";

        collect(stderr, buffer.clone()).await;

        let contents = buffer.lock().unwrap().contents();
        assert_eq!(contents, b"warning: one\nerror: two\n".to_vec());
    }

    #[tokio::test]
    async fn test_failure_log_appends_entries() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");

        let mut buffer = DiagnosticBuffer::new(1024);
        buffer.push_line(b"first failure");
        let path = write_failure_log(&log_dir, "greet", 2, &buffer)
            .await
            .unwrap();
        assert_eq!(path, log_dir.join("greet.log"));

        let mut buffer = DiagnosticBuffer::new(1024);
        buffer.push_line(b"second failure");
        write_failure_log(&log_dir, "greet", 3, &buffer)
            .await
            .unwrap();

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.contains("exit code 2"));
        assert!(log.contains("first failure\n"));
        assert!(log.contains("exit code 3"));
        assert!(log.contains("second failure\n"));
        assert_eq!(log.matches(ENTRY_SEPARATOR).count(), 2);
        assert!(log.find("first failure").unwrap() < log.find("second failure").unwrap());
    }

    #[test]
    fn test_entry_mentions_dropped_bytes() {
        let mut buffer = DiagnosticBuffer::new(6);
        buffer.push_line(b"old");
        buffer.push_line(b"new");
        buffer.push_line(b"newer");

        let entry = String::from_utf8(buffer.render_entry(1)).unwrap();
        assert!(entry.contains("earlier bytes dropped"));
        assert!(entry.ends_with(&format!("\n{}\n", ENTRY_SEPARATOR)));
    }
}
