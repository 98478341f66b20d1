// Call-indented trace file, enabled with --log.
//
// A Tracer is handed explicitly to the components that trace; the disabled
// variant is a no-op and costs one branch per call. Scope entry/exit lines
// are written as `--> name` / `<-- name`, indented two spaces per depth.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TrafgenError};

#[derive(Clone, Default)]
pub struct Tracer {
    inner: Option<Arc<Mutex<TraceState>>>,
}

struct TraceState {
    file: File,
    depth: usize,
}

impl Tracer {
    /// A tracer that writes nothing.
    pub fn disabled() -> Tracer {
        Tracer { inner: None }
    }

    /// Open `logs/log_<tag>_<timestamp>.txt`, creating `logs/` if needed.
    /// Each run gets its own file; nothing is ever read back.
    pub fn to_file(tag: &str) -> Result<Tracer> {
        Tracer::to_file_in(Path::new("logs"), tag)
    }

    fn to_file_in(dir: &Path, tag: &str) -> Result<Tracer> {
        fs::create_dir_all(dir).map_err(TrafgenError::Trace)?;
        let path = dir.join(format!("log_{}_{}.txt", tag, timestamp()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(TrafgenError::Trace)?;
        log::info!("trace file: {}", path.display());
        Ok(Tracer {
            inner: Some(Arc::new(Mutex::new(TraceState { file, depth: 0 }))),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Enter a named scope; the returned guard writes the exit line on drop.
    pub fn scope(&self, name: &str) -> Scope {
        if let Some(inner) = &self.inner {
            let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
            state.write_line(&format!("--> {name}"));
            state.depth += 1;
        }
        Scope {
            tracer: self.clone(),
            name: self.inner.as_ref().map(|_| name.to_string()),
        }
    }

    /// Write one message at the current depth.
    pub fn message(&self, msg: &str) {
        if let Some(inner) = &self.inner {
            let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
            state.write_line(msg);
        }
    }

    fn leave(&self, name: &str) {
        if let Some(inner) = &self.inner {
            let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
            state.depth = state.depth.saturating_sub(1);
            state.write_line(&format!("<-- {name}"));
        }
    }
}

impl TraceState {
    fn write_line(&mut self, line: &str) {
        // Trace output is best-effort; a full disk must not kill the tool.
        let indent = "  ".repeat(self.depth);
        let _ = writeln!(self.file, "{indent}{line}");
    }
}

/// RAII guard for one traced scope.
pub struct Scope {
    tracer: Tracer,
    name: Option<String>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            self.tracer.leave(&name);
        }
    }
}

fn timestamp() -> String {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let t = unsafe { libc::time(std::ptr::null_mut()) };
    unsafe { libc::localtime_r(&t, &mut tm) };
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}
