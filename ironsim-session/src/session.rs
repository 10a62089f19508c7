/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Live-connection handle.
//!
//! A [`Session`] wraps one channel. Sends encode through the protocol, queue
//! the bytes on the channel and block the calling thread on the write
//! completion; they never block an event-loop worker without handing its
//! queue to another worker first.

use crate::protocol::{Metadata, Protocol};
use bytes::Bytes;
use ironsim_core::{ChannelError, SessionError, SessionId};
use ironsim_transport::{Channel, CloseFuture, WriteCompletion};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::trace;

/// A live connection offered to protocol and business code.
pub struct Session<P: Protocol> {
    id: SessionId,
    name: String,
    protocol: Arc<P>,
    channel: Option<Arc<dyn Channel>>,
    write_lock: Mutex<()>,
}

impl<P: Protocol> Session<P> {
    /// Creates a session over `channel`.
    #[must_use]
    pub fn new(name: impl Into<String>, protocol: Arc<P>, channel: Arc<dyn Channel>) -> Self {
        Self {
            id: SessionId::next(),
            name: name.into(),
            protocol,
            channel: Some(channel),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates a session with no channel. Every send fails with
    /// [`SessionError::ChannelNotReady`].
    #[must_use]
    pub fn detached(name: impl Into<String>, protocol: Arc<P>) -> Self {
        Self {
            id: SessionId::next(),
            name: name.into(),
            protocol,
            channel: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the session identifier.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the session name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the protocol.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Returns the channel, if attached.
    #[must_use]
    pub fn channel(&self) -> Option<&Arc<dyn Channel>> {
        self.channel.as_ref()
    }

    /// Encodes and sends `message`, blocking until the write completes.
    ///
    /// # Errors
    /// - [`SessionError::InvalidTimeout`] if `timeout_millis` is 0
    /// - [`SessionError::ChannelNotReady`] if there is no open channel
    /// - [`SessionError::Encode`] if the protocol cannot encode the message
    /// - [`SessionError::SendFailed`] if the write fails or times out
    pub fn send(
        &self,
        message: P::Message,
        timeout_millis: u64,
    ) -> Result<P::Message, SessionError> {
        let channel = self.ready_channel(timeout_millis)?;
        let payload = self
            .protocol
            .encode(&message)
            .map_err(|err| SessionError::Encode {
                session: self.name.clone(),
                reason: err.to_string(),
            })?;
        self.write_and_wait(channel, payload, timeout_millis)?;
        Ok(message)
    }

    /// Sends an uninterpreted payload, blocking until the write completes.
    ///
    /// # Errors
    /// Same as [`Session::send`].
    pub fn send_raw(
        &self,
        payload: &[u8],
        metadata: &Metadata,
        timeout_millis: u64,
    ) -> Result<(), SessionError> {
        let channel = self.ready_channel(timeout_millis)?;
        let payload = self
            .protocol
            .encode_raw(payload, metadata)
            .map_err(|err| SessionError::Encode {
                session: self.name.clone(),
                reason: err.to_string(),
            })?;
        self.write_and_wait(channel, payload, timeout_millis)
    }

    /// Requests the channel to close. Idempotent and non-blocking.
    pub fn close(&self) -> CloseFuture {
        match &self.channel {
            Some(channel) => channel.close(),
            None => CloseFuture::completed(Ok(())),
        }
    }

    /// Returns true if there is no channel or it is neither open nor active.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel
            .as_ref()
            .is_none_or(|channel| !channel.is_open() && !channel.is_active())
    }

    /// Runs `initializer` while holding this session's write lock.
    ///
    /// The lock is released on every exit path, including a panic in
    /// `initializer`. Never call blocking I/O inside it.
    pub fn with_write_lock<R>(&self, initializer: impl FnOnce() -> R) -> R {
        let _guard = self.write_lock.lock();
        initializer()
    }

    fn ready_channel(&self, timeout_millis: u64) -> Result<&Arc<dyn Channel>, SessionError> {
        if timeout_millis < 1 {
            return Err(SessionError::InvalidTimeout(timeout_millis));
        }
        self.channel
            .as_ref()
            .filter(|channel| channel.is_open())
            .ok_or_else(|| SessionError::ChannelNotReady {
                session: self.name.clone(),
            })
    }

    fn write_and_wait(
        &self,
        channel: &Arc<dyn Channel>,
        payload: Bytes,
        timeout_millis: u64,
    ) -> Result<(), SessionError> {
        let bytes = payload.len();
        let completion = channel.write(payload);
        wait_for_write(&completion, Duration::from_millis(timeout_millis)).map_err(|cause| {
            SessionError::SendFailed {
                session: self.name.clone(),
                cause,
            }
        })?;
        trace!(session = %self.name, bytes, "sent");
        Ok(())
    }
}

/// Waits on a write completion, moving off the worker first when called
/// from inside a multi-threaded runtime.
fn wait_for_write(completion: &WriteCompletion, timeout: Duration) -> Result<(), ChannelError> {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| completion.wait(timeout))
        }
        _ => completion.wait(timeout),
    }
}

impl<P: Protocol> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol.name())
            .field("channel", &self.channel.as_ref().map(|c| c.id()))
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironsim_core::{ChannelId, ProtocolError};
    use ironsim_transport::{Pipeline, WritePromise};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TextProtocol;

    impl Protocol for TextProtocol {
        type Message = String;

        fn name(&self) -> &str {
            "text"
        }

        fn encode(&self, message: &String) -> Result<Bytes, ProtocolError> {
            if message.is_empty() {
                return Err(ProtocolError::Encode("empty message".to_string()));
            }
            Ok(Bytes::copy_from_slice(message.as_bytes()))
        }

        fn decode(&self, frame: &[u8]) -> Result<String, ProtocolError> {
            String::from_utf8(frame.to_vec()).map_err(|e| ProtocolError::Decode(e.to_string()))
        }
    }

    enum WriteBehavior {
        Succeed,
        Fail,
        Hang,
    }

    struct FakeChannel {
        pipeline: Pipeline,
        open: AtomicBool,
        active: AtomicBool,
        writes: AtomicUsize,
        behavior: WriteBehavior,
        pending: Mutex<Vec<WritePromise>>,
    }

    impl FakeChannel {
        fn new(behavior: WriteBehavior) -> Arc<Self> {
            Arc::new(Self {
                pipeline: Pipeline::new(),
                open: AtomicBool::new(true),
                active: AtomicBool::new(true),
                writes: AtomicUsize::new(0),
                behavior,
                pending: Mutex::new(Vec::new()),
            })
        }
    }

    impl fmt::Debug for FakeChannel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("FakeChannel")
        }
    }

    impl Channel for FakeChannel {
        fn id(&self) -> ChannelId {
            ChannelId::next()
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn pipeline(&self) -> &Pipeline {
            &self.pipeline
        }
        fn register(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        fn write(&self, _payload: Bytes) -> WriteCompletion {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let (promise, completion) = WriteCompletion::pair();
            match self.behavior {
                WriteBehavior::Succeed => promise.complete(Ok(())),
                WriteBehavior::Fail => promise.complete(Err(ChannelError::Io {
                    kind: std::io::ErrorKind::BrokenPipe,
                    message: "broken pipe".to_string(),
                })),
                WriteBehavior::Hang => self.pending.lock().push(promise),
            }
            completion
        }
        fn close(&self) -> CloseFuture {
            self.open.store(false, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
            CloseFuture::completed(Ok(()))
        }
        fn close_future(&self) -> CloseFuture {
            CloseFuture::new()
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    fn session_over(channel: &Arc<FakeChannel>) -> Session<TextProtocol> {
        let as_channel: Arc<dyn Channel> = channel.clone();
        Session::new("text/test", Arc::new(TextProtocol), as_channel)
    }

    #[test]
    fn test_send_success_returns_message() {
        let channel = FakeChannel::new(WriteBehavior::Succeed);
        let session = session_over(&channel);
        let sent = session.send("hello".to_string(), 100).unwrap();
        assert_eq!(sent, "hello");
        assert_eq!(channel.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_zero_timeout_is_illegal_argument() {
        let channel = FakeChannel::new(WriteBehavior::Succeed);
        let session = session_over(&channel);
        assert_eq!(
            session.send("hello".to_string(), 0),
            Err(SessionError::InvalidTimeout(0))
        );

        let detached = Session::detached("detached", Arc::new(TextProtocol));
        assert_eq!(
            detached.send("hello".to_string(), 0),
            Err(SessionError::InvalidTimeout(0))
        );
        assert_eq!(channel.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_without_channel_fails_without_write() {
        let detached = Session::detached("detached", Arc::new(TextProtocol));
        assert!(matches!(
            detached.send("hello".to_string(), 100),
            Err(SessionError::ChannelNotReady { .. })
        ));

        let channel = FakeChannel::new(WriteBehavior::Succeed);
        let session = session_over(&channel);
        session.close();
        assert!(matches!(
            session.send_raw(b"raw", &Metadata::new(), 100),
            Err(SessionError::ChannelNotReady { .. })
        ));
        assert_eq!(channel.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_failure_carries_cause() {
        let channel = FakeChannel::new(WriteBehavior::Fail);
        let session = session_over(&channel);
        match session.send("hello".to_string(), 100) {
            Err(SessionError::SendFailed { session, cause }) => {
                assert_eq!(session, "text/test");
                assert!(matches!(cause, ChannelError::Io { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_send_times_out() {
        let channel = FakeChannel::new(WriteBehavior::Hang);
        let session = session_over(&channel);
        let started = std::time::Instant::now();
        assert_eq!(
            session.send("hello".to_string(), 30),
            Err(SessionError::SendFailed {
                session: "text/test".to_string(),
                cause: ChannelError::WriteTimeout { timeout_ms: 30 },
            })
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_encode_failure() {
        let channel = FakeChannel::new(WriteBehavior::Succeed);
        let session = session_over(&channel);
        assert!(matches!(
            session.send(String::new(), 100),
            Err(SessionError::Encode { .. })
        ));
        assert_eq!(channel.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_closed_and_idempotent_close() {
        let detached = Session::detached("detached", Arc::new(TextProtocol));
        assert!(detached.is_closed());
        assert!(detached.close().is_done());

        let channel = FakeChannel::new(WriteBehavior::Succeed);
        let session = session_over(&channel);
        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
    }

    #[test]
    fn test_write_lock_released_after_panic() {
        let session = Session::detached("detached", Arc::new(TextProtocol));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            session.with_write_lock(|| panic!("initializer failed"));
        }));
        assert!(result.is_err());
        assert_eq!(session.with_write_lock(|| 42), 42);
    }
}
