/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Channel abstraction and completion primitives.
//!
//! A [`Channel`] is one open endpoint: a connected TCP stream, a listening
//! socket, or a multicast UDP socket. Writes complete through a
//! [`WriteCompletion`] the caller may block on; closing completes a
//! [`CloseFuture`] that can be awaited, polled, or observed with listeners.

use crate::pipeline::Pipeline;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use ironsim_core::{ChannelError, ChannelId};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Outcome a [`CloseFuture`] completes with.
pub type CloseOutcome = Result<(), ChannelError>;

type CloseListener = Box<dyn FnOnce(&CloseOutcome) + Send>;

/// An open network endpoint.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Returns the channel identifier.
    fn id(&self) -> ChannelId;

    /// Returns the local socket address, if bound.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Returns the remote socket address, if connected.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Returns the inbound handler pipeline.
    fn pipeline(&self) -> &Pipeline;

    /// Starts delivering inbound traffic to the pipeline.
    ///
    /// Channels are created unregistered so the pipeline can be assembled
    /// before the first byte is read.
    ///
    /// # Errors
    /// Returns an error if the channel is closed or already registered.
    fn register(&self) -> Result<(), ChannelError>;

    /// Queues `payload` for writing.
    fn write(&self, payload: Bytes) -> WriteCompletion;

    /// Initiates close and returns the close future.
    fn close(&self) -> CloseFuture;

    /// Returns the close future without closing.
    fn close_future(&self) -> CloseFuture;

    /// Returns true until close has been initiated.
    fn is_open(&self) -> bool;

    /// Returns true while the channel's I/O tasks are running.
    fn is_active(&self) -> bool;
}

/// Completion of a channel close.
///
/// Cloning shares the same completion. The first call to
/// [`CloseFuture::complete`] wins.
#[derive(Clone)]
pub struct CloseFuture {
    inner: Arc<CloseInner>,
}

struct CloseInner {
    outcome: watch::Sender<Option<CloseOutcome>>,
    listeners: Mutex<Vec<CloseListener>>,
}

impl CloseFuture {
    /// Creates a pending close future.
    #[must_use]
    pub fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(CloseInner {
                outcome,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a close future that is already complete.
    #[must_use]
    pub fn completed(outcome: CloseOutcome) -> Self {
        let future = Self::new();
        future.complete(outcome);
        future
    }

    /// Returns true once the close has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Returns the outcome, if complete.
    #[must_use]
    pub fn outcome(&self) -> Option<CloseOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Completes the future. Returns false if it was already complete.
    pub fn complete(&self, outcome: CloseOutcome) -> bool {
        let updated = self.inner.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome.clone());
            true
        });
        if updated {
            let listeners = std::mem::take(&mut *self.inner.listeners.lock());
            for listener in listeners {
                listener(&outcome);
            }
        }
        updated
    }

    /// Registers `listener` to run on completion.
    ///
    /// Runs immediately on the calling thread if already complete,
    /// otherwise on the thread that completes the future.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&CloseOutcome) + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        match self.outcome() {
            Some(outcome) => {
                drop(listeners);
                listener(&outcome);
            }
            None => listeners.push(Box::new(listener)),
        }
    }

    /// Waits for completion.
    pub async fn wait(&self) -> CloseOutcome {
        let mut rx = self.inner.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(ChannelError::Closed)),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    /// Blocks the calling thread until completion or `timeout`.
    ///
    /// Must not be called from inside an async task.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CloseOutcome> {
        let (tx, rx) = bounded(1);
        self.add_listener(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx.recv_timeout(timeout).ok()
    }
}

impl Default for CloseFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseFuture")
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Caller side of a queued write.
#[derive(Debug)]
pub struct WriteCompletion {
    rx: Receiver<Result<(), ChannelError>>,
}

/// I/O side of a queued write.
#[derive(Debug)]
pub struct WritePromise {
    tx: Sender<Result<(), ChannelError>>,
}

impl WriteCompletion {
    /// Creates a linked completion/promise pair.
    #[must_use]
    pub fn pair() -> (WritePromise, Self) {
        let (tx, rx) = bounded(1);
        (WritePromise { tx }, Self { rx })
    }

    /// Creates a completion that has already failed.
    #[must_use]
    pub fn failed(error: ChannelError) -> Self {
        let (promise, completion) = Self::pair();
        promise.complete(Err(error));
        completion
    }

    /// Blocks until the write completes or `timeout` elapses.
    ///
    /// # Errors
    /// Returns the write error, [`ChannelError::WriteTimeout`] if the write
    /// did not complete in time, or [`ChannelError::Closed`] if the channel
    /// dropped the write.
    pub fn wait(&self, timeout: Duration) -> Result<(), ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ChannelError::WriteTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Closed),
        }
    }
}

impl WritePromise {
    /// Completes the write.
    pub fn complete(self, result: Result<(), ChannelError>) {
        let _ = self.tx.send(result);
    }
}

/// A payload queued for the writer task.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) payload: Bytes,
    pub(crate) promise: WritePromise,
}

/// State shared by every channel implementation.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) id: ChannelId,
    pub(crate) pipeline: Pipeline,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) open: AtomicBool,
    pub(crate) active: AtomicBool,
    pub(crate) close_future: CloseFuture,
    close_error: Mutex<Option<ChannelError>>,
}

impl ChannelState {
    pub(crate) fn new() -> Self {
        Self {
            id: ChannelId::next(),
            pipeline: Pipeline::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            open: AtomicBool::new(true),
            active: AtomicBool::new(true),
            close_future: CloseFuture::new(),
            close_error: Mutex::new(None),
        }
    }

    /// Records an error raised while the channel shut down. The first one
    /// becomes the close outcome.
    pub(crate) fn record_close_error(&self, error: ChannelError) {
        let mut slot = self.close_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Outcome the close future completes with.
    pub(crate) fn close_outcome(&self) -> CloseOutcome {
        self.close_error.lock().clone().map_or(Ok(()), Err)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the channel closed and stops its tasks. Returns false if close
    /// was already initiated.
    pub(crate) fn initiate_close(&self) -> bool {
        let first = self.open.swap(false, Ordering::AcqRel);
        self.cancel.cancel();
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_close_future_first_completion_wins() {
        let future = CloseFuture::new();
        assert!(!future.is_done());

        assert!(future.complete(Ok(())));
        assert!(!future.complete(Err(ChannelError::Closed)));
        assert_eq!(future.outcome(), Some(Ok(())));
    }

    #[test]
    fn test_close_future_listeners() {
        let future = CloseFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let before = Arc::clone(&calls);
        future.add_listener(move |outcome| {
            assert!(outcome.is_err());
            before.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        future.complete(Err(ChannelError::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let after = Arc::clone(&calls);
        future.add_listener(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_future_wait_timeout() {
        let future = CloseFuture::new();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());

        let clone = future.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            clone.complete(Ok(()));
        });
        assert_eq!(future.wait_timeout(Duration::from_secs(2)), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_close_future_wait() {
        let future = CloseFuture::new();
        let clone = future.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clone.complete(Ok(()));
        });
        assert_eq!(future.wait().await, Ok(()));
        assert_eq!(CloseFuture::completed(Ok(())).wait().await, Ok(()));
    }

    #[test]
    fn test_close_outcome_keeps_first_error() {
        let state = ChannelState::new();
        assert_eq!(state.close_outcome(), Ok(()));

        let reset = ChannelError::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "reset".to_string(),
        };
        state.record_close_error(reset.clone());
        state.record_close_error(ChannelError::Closed);
        assert_eq!(state.close_outcome(), Err(reset));
    }

    #[test]
    fn test_write_completion() {
        let (promise, completion) = WriteCompletion::pair();
        promise.complete(Ok(()));
        assert_eq!(completion.wait(Duration::from_millis(10)), Ok(()));

        let (_promise, completion) = WriteCompletion::pair();
        assert_eq!(
            completion.wait(Duration::from_millis(5)),
            Err(ChannelError::WriteTimeout { timeout_ms: 5 })
        );

        let (promise, completion) = WriteCompletion::pair();
        drop(promise);
        assert_eq!(
            completion.wait(Duration::from_millis(5)),
            Err(ChannelError::Closed)
        );

        let failed = WriteCompletion::failed(ChannelError::Closed);
        assert_eq!(failed.wait(Duration::from_millis(5)), Err(ChannelError::Closed));
    }
}
