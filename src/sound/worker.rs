//! Background playback thread
//!
//! The device is opened on the worker thread and never leaves it. The owner
//! only holds the join handle and the cancellation token.

use super::device::PcmBackend;
use super::playback::PlaybackReport;
use super::session::{PlaybackRequest, PlaybackSession, SessionError};
use crate::threading::{self, CancelToken, Thread, ThreadError};

pub const PLAYBACK_THREAD_NAME: &str = "alarm-playback";

pub type SessionResult = Result<PlaybackReport, SessionError>;

/// Runs one `PlaybackSession` on a dedicated thread.
///
/// Dropping the worker without joining cancels playback and waits for the
/// thread, so the device is always released before the owner goes away.
pub struct PlaybackWorker {
    thread: Option<Thread<SessionResult>>,
    cancel: CancelToken,
}

impl PlaybackWorker {
    pub fn spawn<B>(backend: B, request: PlaybackRequest) -> threading::Result<Self>
    where
        B: PcmBackend + Send + 'static,
    {
        Self::spawn_with_cancel(backend, request, CancelToken::new())
    }

    /// Like `spawn`, but playback also stops when `cancel` is cancelled
    /// from elsewhere, e.g. a signal handler.
    pub fn spawn_with_cancel<B>(
        backend: B,
        request: PlaybackRequest,
        cancel: CancelToken,
    ) -> threading::Result<Self>
    where
        B: PcmBackend + Send + 'static,
    {
        let session_cancel = cancel.clone();
        log::debug!(
            "starting playback of {} on \"{}\"",
            request.sound_path.display(),
            request.device_name
        );

        let thread = Thread::spawn(Some(PLAYBACK_THREAD_NAME), move || {
            PlaybackSession::new(backend, request, session_cancel).run()
        })?;

        Ok(Self {
            thread: Some(thread),
            cancel,
        })
    }

    /// Ask the session to stop at the next period boundary.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| t.is_running())
    }

    /// Wait for the session to end and return its outcome.
    pub fn join(mut self) -> threading::Result<SessionResult> {
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Err(ThreadError::JoinFailed("worker already joined".to_string())),
        }
    }
}

impl Drop for PlaybackWorker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel.cancel();
            if let Err(e) = thread.join() {
                log::error!("playback worker: {}", e);
            }
        }
    }
}
