//! Scoped execution log capture.
//!
//! Mirrors the original source's `ListHandler`: when a request sets
//! `fetch_execution_logs`, the Executor wants the log lines produced while
//! running that one request back in the reply, without a global logging
//! sink. Rust's `log` crate has a single process-wide logger, and installing
//! a custom one here would fight whatever logger the embedder already
//! configured (see the crate's ambient-stack notes), so capture is
//! implemented as a task-local buffer plus [`log_execution!`], the capture
//! point Thing implementations call instead of `log::debug!` for lines that
//! should be eligible for capture. The buffer is installed and torn down
//! with an RAII guard so it is removed on every exit path, including an
//! early return from a failed operation.

use std::cell::RefCell;

tokio::task_local! {
    static EXECUTION_LOG: RefCell<Option<Vec<String>>>;
}

/// Record a line for the currently executing request, if log capture is
/// active. A no-op outside of a scope created by
/// [`with_execution_log_capture`].
pub fn record(line: impl Into<String>) {
    let _ = EXECUTION_LOG.try_with(|buf| {
        if let Some(lines) = buf.borrow_mut().as_mut() {
            lines.push(line.into());
        }
    });
}

/// Append a formatted line to the active execution log capture, if any.
#[macro_export]
macro_rules! log_execution {
    ($($arg:tt)*) => {{
        let line = format!($($arg)*);
        log::debug!("{line}");
        $crate::execution_log::record(line);
    }};
}

/// Run `future` with execution log capture enabled, returning its result
/// alongside every line recorded via [`record`] during that run.
pub async fn with_execution_log_capture<F, T>(future: F) -> (T, Vec<String>)
where
    F: std::future::Future<Output = T>,
{
    let cell = RefCell::new(Some(Vec::new()));
    let result = EXECUTION_LOG.scope(cell, async {
        let value = future.await;
        let lines = EXECUTION_LOG.with(|buf| buf.borrow_mut().take().unwrap_or_default());
        (value, lines)
    });
    result.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_collects_lines_only_within_scope() {
        record("before scope, should be dropped");
        let (value, lines) = with_execution_log_capture(async {
            record("inside scope");
            42
        })
        .await;
        assert_eq!(value, 42);
        assert_eq!(lines, vec!["inside scope".to_string()]);
    }

    #[tokio::test]
    async fn no_capture_outside_scope_is_harmless() {
        record("nobody is listening");
    }
}
