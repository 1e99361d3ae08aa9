//! Human-readable build progress.
//!
//! ```text
//! [build] STEP 2/4: COPY . /src
//! --> Using cache 1f2e3d4c5b6a
//! [build] STEP 3/4: RUN make
//! ...command output...
//! --> 9a8b7c6d5e4f
//! ```
//!
//! The stage prefix is only printed when the build has more than one stage.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Shared byte sink for progress messages.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Write one line; sink failures never fail the build.
    pub fn line(&self, line: &str) {
        let mut out = self.inner.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            debug!(error = %e, "Progress sink write failed");
        }
    }

    /// Write raw bytes, adding a newline if they do not end with one.
    pub fn bytes(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut out = self.inner.lock();
        let mut result = out.write_all(data);
        if result.is_ok() && !data.ends_with(b"\n") {
            result = out.write_all(b"\n");
        }
        if let Err(e) = result.and_then(|_| out.flush()) {
            debug!(error = %e, "Progress sink write failed");
        }
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogSink")
    }
}

/// Progress reporter of one stage.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    sink: Option<LogSink>,
    prefix: String,
}

impl Progress {
    pub fn new(sink: Option<LogSink>, stage_label: Option<String>) -> Self {
        Self {
            sink,
            prefix: stage_label.map(|l| format!("[{}] ", l)).unwrap_or_default(),
        }
    }

    pub fn step(&self, n: usize, total: usize, text: &str) {
        if let Some(sink) = &self.sink {
            sink.line(&format!("{}STEP {}/{}: {}", self.prefix, n, total, text));
        }
    }

    pub fn cache_hit(&self, id: &str) {
        if let Some(sink) = &self.sink {
            sink.line(&format!("--> Using cache {}", id));
        }
    }

    pub fn committed(&self, id: &str) {
        if let Some(sink) = &self.sink {
            sink.line(&format!("--> {}", id));
        }
    }

    pub fn output(&self, data: &[u8]) {
        if let Some(sink) = &self.sink {
            sink.bytes(data);
        }
    }

    pub fn note(&self, text: &str) {
        if let Some(sink) = &self.sink {
            sink.line(text);
        }
    }
}
