//! Per-task log capture.
//!
//! Each launch owns a [`LogSink`]. The task writes to it through
//! [`TaskWriter`]s handed out by its context, child process output is drained
//! into it line by line, and appenders can observe it live or be replayed
//! once the task is done.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use tasklaunch_core::{Error, LogEvent, LogStream, Result, TaskLogs};

/// Receives log events of a task as they are written
pub trait LogAppender: Send + Sync {
    fn append(&self, event: &LogEvent);

    /// Called once when the sink is closed
    fn close(&self) {}
}

/// Mirrors task output to a file, one timestamped line per event
pub struct FileAppender {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileAppender {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::file_system(parent, "create log directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::file_system(&path, "open task log", e))?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogAppender for FileAppender {
    fn append(&self, event: &LogEvent) {
        if let Some(writer) = self.writer.lock().as_mut() {
            if let Err(e) = writeln!(writer, "{}", event.render(true)) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to write task log");
            }
        }
    }

    fn close(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = writer.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to flush task log");
            }
        }
    }
}

/// Forwards task output to this process's own stdout and stderr
#[derive(Debug, Default)]
pub struct StdAppender;

impl LogAppender for StdAppender {
    fn append(&self, event: &LogEvent) {
        let result = match event.stream {
            LogStream::Stdout => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{}", event.line).and_then(|()| out.flush())
            }
            LogStream::Stderr => {
                let mut err = std::io::stderr().lock();
                writeln!(err, "{}", event.line).and_then(|()| err.flush())
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to forward task output");
        }
    }
}

struct SinkState {
    events: VecDeque<LogEvent>,
    max_events: usize,
    dropped: usize,
    appenders: Vec<Arc<dyn LogAppender>>,
    closed: bool,
}

/// Bounded, shareable log buffer of one task
#[derive(Clone)]
pub struct LogSink {
    state: Arc<Mutex<SinkState>>,
}

impl LogSink {
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                events: VecDeque::new(),
                max_events: max_events.max(1),
                dropped: 0,
                appenders: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Attach an appender that only sees events written from now on
    pub fn add_appender(&self, appender: Arc<dyn LogAppender>) {
        self.state.lock().appenders.push(appender);
    }

    /// Attach an appender and replay everything stored so far into it.
    ///
    /// On an already closed sink the appender receives the stored events
    /// and is closed straight away.
    pub fn activate(&self, appender: Arc<dyn LogAppender>) {
        let mut state = self.state.lock();
        for event in &state.events {
            appender.append(event);
        }
        if state.closed {
            appender.close();
        } else {
            state.appenders.push(appender);
        }
    }

    /// Record one line. Lines written after close are discarded.
    pub fn push(&self, stream: LogStream, line: impl Into<String>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let event = LogEvent::new(stream, line);
        for appender in &state.appenders {
            appender.append(&event);
        }
        if state.events.len() == state.max_events {
            state.events.pop_front();
            state.dropped += 1;
        }
        state.events.push_back(event);
    }

    #[must_use]
    pub fn snapshot(&self) -> TaskLogs {
        TaskLogs::new(self.state.lock().events.iter().cloned().collect())
    }

    /// Number of events evicted by the size bound
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the sink and every appender. Idempotent.
    pub fn close(&self) {
        let appenders = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.appenders)
        };
        for appender in appenders {
            appender.close();
        }
    }

    #[must_use]
    pub fn writer(&self, stream: LogStream) -> TaskWriter {
        TaskWriter {
            sink: self.clone(),
            stream,
            pending: Vec::new(),
        }
    }
}

/// Line-buffered `io::Write` adapter over a [`LogSink`]
pub struct TaskWriter {
    sink: LogSink,
    stream: LogStream,
    pending: Vec<u8>,
}

impl TaskWriter {
    fn emit(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        self.sink
            .push(self.stream, text.trim_end_matches('\r').to_string());
    }
}

impl Write for TaskWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        Ok(())
    }
}

impl Drop for TaskWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Closes its sink on every exit path of a launch
pub struct LogScope {
    sink: LogSink,
}

impl LogScope {
    #[must_use]
    pub fn open(sink: LogSink) -> Self {
        Self { sink }
    }

    /// Snapshot the captured output, then close the sink
    pub fn finish(self) -> TaskLogs {
        self.sink.snapshot()
        // dropping self closes the sink
    }
}

impl Drop for LogScope {
    fn drop(&mut self) {
        self.sink.close();
    }
}

/// Copy lines from a child stream into the sink until it reaches EOF
pub fn spawn_drain<R>(reader: R, stream: LogStream, sink: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.push(stream, line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, ?stream, "output drain stopped");
                    break;
                }
            }
        }
    })
}

/// Join drains within `timeout`. Drains that do not finish are abandoned.
pub async fn join_drains(drains: Vec<JoinHandle<()>>, timeout: Duration) {
    for mut drain in drains {
        match tokio::time::timeout(timeout, &mut drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "output drain failed"),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "output drain did not finish, leaving it behind"
                );
                drain.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect {
        lines: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    impl LogAppender for Collect {
        fn append(&self, event: &LogEvent) {
            self.lines.lock().push(event.line.clone());
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    #[test]
    fn writer_splits_lines_and_flushes_tail() {
        let sink = LogSink::new(100);
        {
            let mut out = sink.writer(LogStream::Stdout);
            write!(out, "hel").unwrap();
            write!(out, "lo\r\nwor").unwrap();
            writeln!(out, "ld").unwrap();
            write!(out, "tail").unwrap();
        }
        let logs = sink.snapshot();
        assert_eq!(logs.stdout_logs(false), "hello\nworld\ntail\n");
    }

    #[test]
    fn storage_is_bounded() {
        let sink = LogSink::new(2);
        for i in 0..5 {
            sink.push(LogStream::Stdout, format!("line {i}"));
        }
        assert_eq!(sink.snapshot().all_logs(false), "line 3\nline 4\n");
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn activation_replays_and_follows() {
        let sink = LogSink::new(10);
        sink.push(LogStream::Stdout, "early");
        let appender = Arc::new(Collect::default());
        sink.activate(appender.clone());
        sink.push(LogStream::Stderr, "late");
        assert_eq!(*appender.lines.lock(), vec!["early", "late"]);

        sink.close();
        assert!(*appender.closed.lock());
        sink.push(LogStream::Stdout, "ignored");
        assert_eq!(sink.snapshot().events().len(), 2);
    }

    #[test]
    fn activation_after_close_replays_and_closes() {
        let sink = LogSink::new(10);
        sink.push(LogStream::Stdout, "kept");
        let scope = LogScope::open(sink.clone());
        let logs = scope.finish();
        assert_eq!(logs.all_logs(false), "kept\n");
        assert!(sink.is_closed());

        let appender = Arc::new(Collect::default());
        sink.activate(appender.clone());
        assert_eq!(*appender.lines.lock(), vec!["kept"]);
        assert!(*appender.closed.lock());
    }

    #[test]
    fn file_appender_writes_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("10001.log");
        let sink = LogSink::new(10);
        sink.add_appender(Arc::new(FileAppender::create(&path).unwrap()));
        sink.push(LogStream::Stdout, "to file");
        sink.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_end().ends_with("to file"));
    }

    #[tokio::test]
    async fn drains_child_output() {
        let sink = LogSink::new(10);
        let (reader, mut writer) = tokio::io::duplex(64);
        let drain = spawn_drain(reader, LogStream::Stderr, sink.clone());
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"one\ntwo\n")
            .await
            .unwrap();
        drop(writer);
        join_drains(vec![drain], Duration::from_secs(1)).await;
        assert_eq!(sink.snapshot().stderr_logs(false), "one\ntwo\n");
    }
}
