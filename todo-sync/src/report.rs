//! Error-reporting collaborator.
//!
//! Fire-and-forget: implementations must never block or fail the caller.

use std::sync::Arc;
use std::sync::Mutex;

/// Sink for breadcrumbs and captured errors.
pub trait Reporter: Send + Sync {
    fn breadcrumb(&self, category: &str, message: &str);
    fn capture(&self, error: &(dyn std::error::Error + 'static));
}

/// Reporter writing to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn breadcrumb(&self, category: &str, message: &str) {
        log::trace!(target: "todo_sync::report", "[{category}] {message}");
    }

    fn capture(&self, error: &(dyn std::error::Error + 'static)) {
        log::error!(target: "todo_sync::report", "captured error: {error}");
    }
}

/// Shared handle to the process reporter.
pub type SharedReporter = Arc<dyn Reporter>;

/// Reporter that keeps everything in memory; used by tests to assert on
/// what was reported.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    breadcrumbs: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breadcrumbs(&self) -> Vec<(String, String)> {
        self.breadcrumbs.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Reporter for RecordingReporter {
    fn breadcrumb(&self, category: &str, message: &str) {
        if let Ok(mut b) = self.breadcrumbs.lock() {
            b.push((category.to_string(), message.to_string()));
        }
    }

    fn capture(&self, error: &(dyn std::error::Error + 'static)) {
        if let Ok(mut e) = self.errors.lock() {
            e.push(error.to_string());
        }
    }
}
