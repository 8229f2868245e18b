//! Per-task output capture.
//!
//! Worker stdout/stderr arrive as discrete chunks and are buffered in
//! memory with per-task and global byte limits. An over-limit chunk is
//! dropped whole; there is no partial capture. Once a task's total output
//! crosses the spill threshold the capture flips to file-backed mode: full
//! content goes to disk, a bounded in-memory tail keeps recent chunks
//! addressable, and reads report the backing file path.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use foreman_db::models::OutputStream;
use foreman_db::{Error, Result};

/// Default per-task byte ceiling: 10 MiB.
pub const DEFAULT_MAX_OUTPUT_BUFFER: u64 = 10 * 1024 * 1024;
/// Total bytes after which capture spills to disk: 100 KiB.
pub const DEFAULT_SPILL_THRESHOLD: u64 = 100 * 1024;
/// In-memory tail retained per stream after spilling: 64 KiB.
pub const DEFAULT_TAIL_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub default_limit: u64,
    pub spill_threshold: u64,
    pub tail_bytes: u64,
    /// Directory for spill files.
    pub spill_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_MAX_OUTPUT_BUFFER,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            tail_bytes: DEFAULT_TAIL_BYTES,
            spill_dir: std::env::temp_dir().join("foreman-output"),
        }
    }
}

/// Bounded view of a task's captured output, as served to `logs` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogs {
    pub task_id: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Set once the stream has spilled to disk; the file holds the full
    /// content while `stdout`/`stderr` hold the retained tail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
}

struct StreamBuffer {
    chunks: VecDeque<String>,
    bytes_in_memory: u64,
    file: Option<PathBuf>,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes_in_memory: 0,
            file: None,
        }
    }

    fn push(&mut self, chunk: String) {
        self.bytes_in_memory += chunk.len() as u64;
        self.chunks.push_back(chunk);
    }

    /// Drop oldest chunks until the in-memory tail fits the budget.
    fn trim_to(&mut self, tail_bytes: u64) {
        while self.bytes_in_memory > tail_bytes && self.chunks.len() > 1 {
            if let Some(front) = self.chunks.pop_front() {
                self.bytes_in_memory -= front.len() as u64;
            }
        }
    }

    fn view(&self, tail: Option<usize>) -> Vec<String> {
        match tail {
            Some(n) => {
                let skip = self.chunks.len().saturating_sub(n);
                self.chunks.iter().skip(skip).cloned().collect()
            }
            None => self.chunks.iter().cloned().collect(),
        }
    }
}

struct TaskCapture {
    limit: u64,
    total: u64,
    stdout: StreamBuffer,
    stderr: StreamBuffer,
}

impl TaskCapture {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            total: 0,
            stdout: StreamBuffer::new(),
            stderr: StreamBuffer::new(),
        }
    }

    fn buffer_mut(&mut self, stream: OutputStream) -> &mut StreamBuffer {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    fn buffer(&self, stream: OutputStream) -> &StreamBuffer {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }
}

pub struct OutputCapture {
    config: CaptureConfig,
    tasks: Mutex<HashMap<String, TaskCapture>>,
}

impl OutputCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Install the per-task ceiling before the first chunk arrives.
    /// `None` keeps the global default.
    pub async fn configure_task(&self, task_id: &str, max_output_buffer: Option<u64>) {
        let limit = max_output_buffer.unwrap_or(self.config.default_limit);
        let mut tasks = self.tasks.lock().await;
        tasks
            .entry(task_id.to_string())
            .and_modify(|c| c.limit = limit)
            .or_insert_with(|| TaskCapture::new(limit));
    }

    /// Append one chunk. Fails (and drops the chunk whole) when the task's
    /// effective limit would be exceeded.
    pub async fn capture(&self, task_id: &str, stream: OutputStream, chunk: &[u8]) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let capture = tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskCapture::new(self.config.default_limit));

        let len = chunk.len() as u64;
        if capture.total + len > capture.limit {
            return Err(Error::system("Output buffer limit exceeded")
                .with_ctx("task_id", task_id)
                .with_ctx("limit", capture.limit));
        }
        capture.total += len;

        let text = String::from_utf8_lossy(chunk).into_owned();
        if let Some(path) = capture.buffer(stream).file.clone() {
            append_to_file(&path, &text).await?;
            let buffer = capture.buffer_mut(stream);
            buffer.push(text);
            buffer.trim_to(self.config.tail_bytes);
        } else {
            capture.buffer_mut(stream).push(text);
            if capture.total > self.config.spill_threshold {
                self.spill(task_id, capture).await?;
            }
        }
        Ok(())
    }

    /// Move both streams to file backing, retaining the in-memory tail.
    async fn spill(&self, task_id: &str, capture: &mut TaskCapture) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.spill_dir).await?;
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let path = self.spill_path(task_id, stream);
            let content: String = capture.buffer(stream).chunks.iter().cloned().collect();
            tokio::fs::write(&path, content).await?;
            let buffer = capture.buffer_mut(stream);
            buffer.file = Some(path);
            buffer.trim_to(self.config.tail_bytes);
        }
        debug!(task_id, "output capture spilled to disk");
        Ok(())
    }

    fn spill_path(&self, task_id: &str, stream: OutputStream) -> PathBuf {
        self.config.spill_dir.join(format!("{task_id}-{stream}.log"))
    }

    /// Bounded view of a task's output: the last `tail` chunks of each
    /// stream when given, everything retained otherwise. `None` when the
    /// task has no capture state.
    pub async fn get_output(&self, task_id: &str, tail: Option<usize>) -> Option<TaskLogs> {
        let tasks = self.tasks.lock().await;
        let capture = tasks.get(task_id)?;
        Some(TaskLogs {
            task_id: task_id.to_string(),
            stdout: capture.stdout.view(tail),
            stderr: capture.stderr.view(tail),
            stdout_path: capture
                .stdout
                .file
                .as_ref()
                .map(|p| p.display().to_string()),
            stderr_path: capture
                .stderr
                .file
                .as_ref()
                .map(|p| p.display().to_string()),
        })
    }

    /// Last `max_chars` characters of one stream's retained content.
    pub async fn tail_chars(
        &self,
        task_id: &str,
        stream: OutputStream,
        max_chars: usize,
    ) -> Option<String> {
        let tasks = self.tasks.lock().await;
        let capture = tasks.get(task_id)?;
        let joined: String = capture.buffer(stream).chunks.iter().cloned().collect();
        if joined.is_empty() {
            return None;
        }
        let chars: Vec<char> = joined.chars().collect();
        let skip = chars.len().saturating_sub(max_chars);
        Some(chars[skip..].iter().collect())
    }

    /// Drop the configuration and buffers for a task, removing spill files
    /// best-effort.
    pub async fn cleanup(&self, task_id: &str) {
        let removed = self.tasks.lock().await.remove(task_id);
        if let Some(capture) = removed {
            for buffer in [capture.stdout, capture.stderr] {
                if let Some(path) = buffer.file {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        warn!(task_id, path = %path.display(), error = %err, "failed to remove spill file");
                    }
                }
            }
        }
    }
}

async fn append_to_file(path: &PathBuf, text: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_with(limit: u64, spill: u64, dir: &std::path::Path) -> OutputCapture {
        OutputCapture::new(CaptureConfig {
            default_limit: limit,
            spill_threshold: spill,
            tail_bytes: 32,
            spill_dir: dir.to_path_buf(),
        })
    }

    #[tokio::test]
    async fn chunks_accumulate_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(1024, 1024, dir.path());

        capture.capture("t", OutputStream::Stdout, b"hello ").await.unwrap();
        capture.capture("t", OutputStream::Stdout, b"world").await.unwrap();
        capture.capture("t", OutputStream::Stderr, b"oops").await.unwrap();

        let logs = capture.get_output("t", None).await.unwrap();
        assert_eq!(logs.stdout, vec!["hello ", "world"]);
        assert_eq!(logs.stderr, vec!["oops"]);
        assert!(logs.stdout_path.is_none());
    }

    #[tokio::test]
    async fn over_limit_chunk_is_dropped_whole() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(10, 1024, dir.path());

        capture.capture("t", OutputStream::Stdout, b"123456").await.unwrap();
        let err = capture
            .capture("t", OutputStream::Stdout, b"7890!")
            .await
            .unwrap_err();
        assert_eq!(err.code, foreman_db::ErrorCode::SystemError);
        assert!(err.message.contains("Output buffer limit exceeded"));

        // Nothing partial was written.
        let logs = capture.get_output("t", None).await.unwrap();
        assert_eq!(logs.stdout, vec!["123456"]);

        // A small chunk that still fits is accepted afterwards.
        capture.capture("t", OutputStream::Stdout, b"ok").await.unwrap();
    }

    #[tokio::test]
    async fn per_task_limit_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(1024, 2048, dir.path());

        capture.configure_task("small", Some(4)).await;
        capture.capture("small", OutputStream::Stdout, b"1234").await.unwrap();
        assert!(
            capture
                .capture("small", OutputStream::Stdout, b"5")
                .await
                .is_err()
        );

        // Another task still gets the default.
        capture.capture("other", OutputStream::Stdout, b"12345").await.unwrap();
    }

    #[tokio::test]
    async fn tail_view_returns_last_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(1024, 1024, dir.path());

        for i in 0..5 {
            capture
                .capture("t", OutputStream::Stdout, format!("chunk{i}\n").as_bytes())
                .await
                .unwrap();
        }

        let logs = capture.get_output("t", Some(2)).await.unwrap();
        assert_eq!(logs.stdout, vec!["chunk3\n", "chunk4\n"]);
    }

    #[tokio::test]
    async fn crossing_threshold_spills_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(10_000, 20, dir.path());

        capture.capture("t", OutputStream::Stdout, b"first chunk ").await.unwrap();
        capture.capture("t", OutputStream::Stdout, b"second chunk").await.unwrap();

        let logs = capture.get_output("t", None).await.unwrap();
        let path = logs.stdout_path.expect("spill path reported");
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, "first chunk second chunk");

        // Later writes land in the file too.
        capture.capture("t", OutputStream::Stdout, b" third").await.unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, "first chunk second chunk third");
    }

    #[tokio::test]
    async fn tail_chars_returns_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(1024, 1024, dir.path());

        capture
            .capture("t", OutputStream::Stderr, b"a long error message")
            .await
            .unwrap();
        let tail = capture
            .tail_chars("t", OutputStream::Stderr, 7)
            .await
            .unwrap();
        assert_eq!(tail, "message");

        assert!(capture.tail_chars("t", OutputStream::Stdout, 10).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_drops_buffers_and_spill_files() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(10_000, 4, dir.path());

        capture.capture("t", OutputStream::Stdout, b"spill me").await.unwrap();
        let path = capture
            .get_output("t", None)
            .await
            .unwrap()
            .stdout_path
            .unwrap();
        assert!(std::path::Path::new(&path).exists());

        capture.cleanup("t").await;
        assert!(capture.get_output("t", None).await.is_none());
        assert!(!std::path::Path::new(&path).exists());
    }
}
