//! Thread management and cancellation
//!
//! Playback runs on its own named thread so the alarm wait and the message
//! output stay responsive. This module provides:
//! - `Thread<T>`: a named `std::thread` with an explicit `join` point
//! - `CancelToken`: a cloneable shutdown flag that long-running loops poll
//! - `sleep_cancellable`: a sleep that wakes early when cancelled


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for threading operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Thread spawn failed
    SpawnFailed(String),
    /// Thread join failed
    JoinFailed(String),
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadError::SpawnFailed(s) => write!(f, "Thread spawn failed: {}", s),
            ThreadError::JoinFailed(s) => write!(f, "Thread join failed: {}", s),
        }
    }
}

impl std::error::Error for ThreadError {}

pub type Result<T> = std::result::Result<T, ThreadError>;

// ============================================================================
// Thread Handle
// ============================================================================

/// Handle to a spawned thread
///
/// Wraps a `JoinHandle`; the thread is joined explicitly with `join`.
pub struct Thread<T> {
    handle: Option<JoinHandle<T>>,
    name: Option<String>,
}

impl<T> Thread<T> {
    /// Spawn a new thread that executes the given function
    ///
    /// # Errors
    /// Returns `ThreadError::SpawnFailed` if thread creation fails
    pub fn spawn<F>(name: Option<&str>, f: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(n) = name {
            builder = builder.name(n.to_string());
        }

        let handle = builder
            .spawn(f)
            .map_err(|e| ThreadError::SpawnFailed(format!("Failed to spawn thread: {}", e)))?;

        Ok(Self {
            handle: Some(handle),
            name: name.map(String::from),
        })
    }

    /// Wait for the thread to finish and return its result
    ///
    /// # Errors
    /// Returns `ThreadError::JoinFailed` if the thread panicked
    pub fn join(mut self) -> Result<T> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<T> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ThreadError::JoinFailed("Thread panicked".to_string())),
            None => Err(ThreadError::JoinFailed("Thread already joined".to_string())),
        }
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared shutdown flag
///
/// Clones observe the same flag. Cancelling is sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sleep for `duration`, waking early if `cancel` fires.
///
/// Returns `false` if the sleep was cut short by cancellation.
pub fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
}
