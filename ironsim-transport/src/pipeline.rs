/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Inbound handler pipeline.
//!
//! Each channel owns a [`Pipeline`]: an optional [`Framer`] followed by an
//! ordered list of named [`ChannelHandler`]s. Frames flow head to tail;
//! exceptions are offered to each handler in order until one handles them.
//! Handler panics are caught and turned into [`ChannelError::Handler`].

use crate::channel::Channel;
use crate::codec::Framer;
use bytes::BytesMut;
use ironsim_core::ChannelError;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the handler a freshly connected channel starts with.
pub const PLACEHOLDER_HANDLER: &str = "placeholder";

/// A stage of the inbound pipeline.
pub trait ChannelHandler: Send + Sync {
    /// Handles an inbound frame.
    ///
    /// Return `Ok(Some(frame))` to pass it on, `Ok(None)` to consume it.
    ///
    /// # Errors
    /// An error is routed through the exception path.
    fn on_frame(
        &self,
        channel: &dyn Channel,
        frame: BytesMut,
    ) -> Result<Option<BytesMut>, ChannelError> {
        let _ = channel;
        Ok(Some(frame))
    }

    /// Offered every pipeline exception. Returns true if handled.
    fn on_exception(&self, channel: &dyn Channel, error: &ChannelError) -> bool {
        let _ = (channel, error);
        false
    }

    /// Called when no inbound bytes arrived within the idle timeout.
    fn on_idle(&self, channel: &dyn Channel) {
        let _ = channel;
    }

    /// Called once after the channel's I/O has stopped.
    fn on_inactive(&self, channel: &dyn Channel) {
        let _ = channel;
    }
}

/// A handler that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ChannelHandler for NoopHandler {}

type NamedHandler = (String, Arc<dyn ChannelHandler>);

/// Ordered list of named handlers behind an optional framer.
#[derive(Default)]
pub struct Pipeline {
    framer: Mutex<Option<Box<dyn Framer>>>,
    handlers: RwLock<Vec<NamedHandler>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the framer. Takes effect when the channel is registered.
    pub fn set_framer(&self, framer: Box<dyn Framer>) {
        *self.framer.lock() = Some(framer);
    }

    /// Removes and returns the framer.
    pub fn take_framer(&self) -> Option<Box<dyn Framer>> {
        self.framer.lock().take()
    }

    /// Appends a handler.
    ///
    /// # Errors
    /// Returns [`ChannelError::DuplicateHandler`] if `name` is taken.
    pub fn add_last(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<(), ChannelError> {
        let name = name.into();
        let mut handlers = self.handlers.write();
        if handlers.iter().any(|(existing, _)| *existing == name) {
            return Err(ChannelError::DuplicateHandler(name));
        }
        handlers.push((name, handler));
        Ok(())
    }

    /// Removes the handler called `name`, returning it.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        let mut handlers = self.handlers.write();
        let index = handlers.iter().position(|(existing, _)| existing == name)?;
        Some(handlers.remove(index).1)
    }

    /// Returns true if a handler called `name` is installed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().iter().any(|(existing, _)| existing == name)
    }

    /// Returns the handler names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn snapshot(&self) -> Vec<NamedHandler> {
        self.handlers.read().clone()
    }

    /// Passes `frame` from head to tail.
    ///
    /// A failing handler stops the frame and its error is routed through
    /// [`Pipeline::fire_exception`].
    pub fn fire_frame(&self, channel: &dyn Channel, frame: BytesMut) {
        let mut current = frame;
        for (name, handler) in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| handler.on_frame(channel, current)))
                .unwrap_or_else(|payload| Err(handler_panic(&name, payload.as_ref())));
            match result {
                Ok(Some(next)) => current = next,
                Ok(None) => return,
                Err(error) => {
                    self.fire_exception(channel, &error);
                    return;
                }
            }
        }
        if !current.is_empty() {
            debug!(
                channel = %channel.id(),
                bytes = current.len(),
                "frame reached pipeline tail unhandled"
            );
        }
    }

    /// Offers `error` to each handler until one handles it.
    pub fn fire_exception(&self, channel: &dyn Channel, error: &ChannelError) {
        for (name, handler) in self.snapshot() {
            match catch_unwind(AssertUnwindSafe(|| handler.on_exception(channel, error))) {
                Ok(true) => return,
                Ok(false) => {}
                Err(_) => warn!(
                    channel = %channel.id(),
                    handler = %name,
                    "handler panicked in exception path"
                ),
            }
        }
        warn!(channel = %channel.id(), error = %error, "unhandled pipeline exception");
    }

    /// Notifies every handler that the channel went idle.
    pub fn fire_idle(&self, channel: &dyn Channel) {
        for (name, handler) in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler.on_idle(channel))).is_err() {
                let error = ChannelError::Handler {
                    handler: name,
                    message: "panicked in idle callback".to_string(),
                };
                self.fire_exception(channel, &error);
            }
        }
    }

    /// Notifies every handler that the channel is inactive.
    pub fn fire_inactive(&self, channel: &dyn Channel) {
        for (name, handler) in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler.on_inactive(channel))).is_err() {
                warn!(
                    channel = %channel.id(),
                    handler = %name,
                    "handler panicked in inactive callback"
                );
            }
        }
    }

    /// Frames everything buffered in `buf` and fires each frame.
    ///
    /// Without a framer the whole buffer is one frame.
    ///
    /// # Errors
    /// Returns the framing error; the buffered bytes are then unusable.
    pub(crate) fn dispatch(
        &self,
        channel: &dyn Channel,
        framer: Option<&mut Box<dyn Framer>>,
        buf: &mut BytesMut,
    ) -> Result<(), ChannelError> {
        match framer {
            Some(framer) => {
                while let Some(frame) = framer.next_frame(buf)? {
                    self.fire_frame(channel, frame);
                }
            }
            None => {
                if !buf.is_empty() {
                    let frame = buf.split();
                    self.fire_frame(channel, frame);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("framer", &self.framer.lock().is_some())
            .field("handlers", &self.names())
            .finish()
    }
}

fn handler_panic(name: &str, payload: &(dyn std::any::Any + Send)) -> ChannelError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string());
    ChannelError::Handler {
        handler: name.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CloseFuture, WriteCompletion};
    use crate::codec::FixFramer;
    use bytes::Bytes;
    use ironsim_core::ChannelId;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct TestChannel {
        pipeline: Pipeline,
    }

    impl Channel for TestChannel {
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
            WriteCompletion::failed(ChannelError::Unsupported("write"))
        }
        fn close(&self) -> CloseFuture {
            CloseFuture::completed(Ok(()))
        }
        fn close_future(&self) -> CloseFuture {
            CloseFuture::completed(Ok(()))
        }
        fn is_open(&self) -> bool {
            true
        }
        fn is_active(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Counting {
        frames: AtomicUsize,
        exceptions: AtomicUsize,
        handles: bool,
    }

    impl ChannelHandler for Counting {
        fn on_frame(
            &self,
            _channel: &dyn Channel,
            frame: BytesMut,
        ) -> Result<Option<BytesMut>, ChannelError> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(Some(frame))
        }

        fn on_exception(&self, _channel: &dyn Channel, _error: &ChannelError) -> bool {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
            self.handles
        }
    }

    struct Failing;

    impl ChannelHandler for Failing {
        fn on_frame(
            &self,
            _channel: &dyn Channel,
            _frame: BytesMut,
        ) -> Result<Option<BytesMut>, ChannelError> {
            panic!("decoder bug");
        }
    }

    #[test]
    fn test_duplicate_and_remove() {
        let pipeline = Pipeline::new();
        pipeline.add_last(PLACEHOLDER_HANDLER, Arc::new(NoopHandler)).unwrap();
        assert_eq!(
            pipeline.add_last(PLACEHOLDER_HANDLER, Arc::new(NoopHandler)),
            Err(ChannelError::DuplicateHandler(PLACEHOLDER_HANDLER.to_string()))
        );

        pipeline.add_last("dispatcher", Arc::new(NoopHandler)).unwrap();
        assert!(pipeline.remove(PLACEHOLDER_HANDLER).is_some());
        assert!(pipeline.remove(PLACEHOLDER_HANDLER).is_none());
        assert_eq!(pipeline.names(), vec!["dispatcher".to_string()]);
    }

    #[test]
    fn test_frame_reaches_every_handler() {
        let channel = TestChannel::default();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        channel.pipeline.add_last("first", first.clone()).unwrap();
        channel.pipeline.add_last("second", second.clone()).unwrap();

        channel
            .pipeline
            .fire_frame(&channel, BytesMut::from(&b"frame"[..]));

        assert_eq!(first.frames.load(Ordering::SeqCst), 1);
        assert_eq!(second.frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_becomes_exception() {
        let channel = TestChannel::default();
        let router = Arc::new(Counting {
            handles: true,
            ..Counting::default()
        });
        let after = Arc::new(Counting::default());
        channel.pipeline.add_last("failing", Arc::new(Failing)).unwrap();
        channel.pipeline.add_last("router", router.clone()).unwrap();
        channel.pipeline.add_last("after", after.clone()).unwrap();

        channel
            .pipeline
            .fire_frame(&channel, BytesMut::from(&b"frame"[..]));

        assert_eq!(router.frames.load(Ordering::SeqCst), 0);
        assert_eq!(router.exceptions.load(Ordering::SeqCst), 1);
        assert_eq!(after.exceptions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_with_framer() {
        let channel = TestChannel::default();
        let counting = Arc::new(Counting::default());
        channel.pipeline.add_last("counting", counting.clone()).unwrap();
        let mut framer: Box<dyn Framer> =
            Box::new(FixFramer::new().with_checksum_validation(false));

        let heartbeat = b"8=FIX.4.4\x019=5\x0135=0\x0110=000\x01";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(heartbeat);
        buf.extend_from_slice(heartbeat);
        buf.extend_from_slice(b"8=FI");
        channel
            .pipeline
            .dispatch(&channel, Some(&mut framer), &mut buf)
            .unwrap();
        assert_eq!(counting.frames.load(Ordering::SeqCst), 2);
        assert_eq!(&buf[..], b"8=FI");

        let mut garbage = BytesMut::from(&b"garbage"[..]);
        assert!(matches!(
            channel.pipeline.dispatch(&channel, Some(&mut framer), &mut garbage),
            Err(ChannelError::Framing(_))
        ));
    }
}
