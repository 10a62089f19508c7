/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! TCP channels.
//!
//! [`TcpChannel`] wraps a connected stream with one writer task and, once
//! registered, one reader task. [`TcpListenerChannel`] accepts connections
//! and hands each new child to a [`ChildInitializer`] before registering it.

use crate::channel::{Channel, ChannelState, CloseFuture, Outbound, WriteCompletion};
use crate::codec::Framer;
use crate::pipeline::Pipeline;
use crate::transport::ChannelOptions;
use bytes::{Bytes, BytesMut};
use ironsim_core::{ChannelError, ChannelId};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Sets up a freshly accepted child before it starts reading.
pub trait ChildInitializer: Send + Sync {
    /// Assembles the child's pipeline.
    ///
    /// # Errors
    /// An error rejects the child; it is closed without being registered.
    fn init_child(&self, child: Arc<dyn Channel>) -> Result<(), ChannelError>;
}

impl<F> ChildInitializer for F
where
    F: Fn(Arc<dyn Channel>) -> Result<(), ChannelError> + Send + Sync,
{
    fn init_child(&self, child: Arc<dyn Channel>) -> Result<(), ChannelError> {
        self(child)
    }
}

/// A connected TCP stream.
pub struct TcpChannel {
    state: ChannelState,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    handle: Handle,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: Mutex<Option<OwnedReadHalf>>,
    idle_timeout: Option<Duration>,
    this: Weak<TcpChannel>,
}

impl TcpChannel {
    /// Wraps `stream`, spawning its writer task on `handle`.
    #[must_use]
    pub fn new(stream: TcpStream, handle: &Handle, options: &ChannelOptions) -> Arc<Self> {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();

        let channel = Arc::new_cyclic(|this| Self {
            state: ChannelState::new(),
            local,
            remote,
            handle: handle.clone(),
            outbound,
            reader: Mutex::new(Some(read_half)),
            idle_timeout: options.idle_timeout,
            this: this.clone(),
        });

        channel.state.tracker.spawn_on(
            write_loop(
                Arc::downgrade(&channel),
                write_half,
                rx,
                channel.state.cancel.clone(),
            ),
            handle,
        );
        handle.spawn(close_watcher(Arc::downgrade(&channel)));
        debug!(channel = %channel.state.id, ?local, ?remote, "tcp channel opened");
        channel
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.state.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn pipeline(&self) -> &Pipeline {
        &self.state.pipeline
    }

    fn register(&self) -> Result<(), ChannelError> {
        if !self.state.is_open() {
            return Err(ChannelError::Closed);
        }
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or(ChannelError::Unsupported("channel already registered"))?;
        let framer = self.state.pipeline.take_framer();
        self.state.tracker.spawn_on(
            read_loop(
                self.this.clone(),
                reader,
                framer,
                self.idle_timeout,
                self.state.cancel.clone(),
            ),
            &self.handle,
        );
        Ok(())
    }

    fn write(&self, payload: Bytes) -> WriteCompletion {
        if !self.state.is_open() {
            return WriteCompletion::failed(ChannelError::Closed);
        }
        let (promise, completion) = WriteCompletion::pair();
        if let Err(mpsc::error::SendError(rejected)) =
            self.outbound.send(Outbound { payload, promise })
        {
            rejected.promise.complete(Err(ChannelError::Closed));
        }
        completion
    }

    fn close(&self) -> CloseFuture {
        if self.state.initiate_close() {
            debug!(channel = %self.state.id, "closing tcp channel");
        }
        self.state.close_future.clone()
    }

    fn close_future(&self) -> CloseFuture {
        self.state.close_future.clone()
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.state.initiate_close();
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.state.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("open", &self.state.is_open())
            .finish()
    }
}

/// Waits for close to be initiated, then stops the I/O tasks and completes
/// the close future.
async fn close_watcher(channel: Weak<TcpChannel>) {
    let (cancel, tracker, close_future) = match channel.upgrade() {
        Some(channel) => (
            channel.state.cancel.clone(),
            channel.state.tracker.clone(),
            channel.state.close_future.clone(),
        ),
        None => return,
    };
    cancel.cancelled().await;
    tracker.close();
    tracker.wait().await;

    let outcome = match channel.upgrade() {
        Some(channel) => {
            channel.state.open.store(false, Ordering::Release);
            channel.reader.lock().take();
            channel.state.active.store(false, Ordering::Release);
            channel.state.pipeline.fire_inactive(channel.as_ref());
            debug!(channel = %channel.state.id, "tcp channel closed");
            channel.state.close_outcome()
        }
        None => Ok(()),
    };
    close_future.complete(outcome);
}

async fn write_loop(
    channel: Weak<TcpChannel>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(Outbound { payload, promise }) = next else {
            break;
        };
        let result = writer.write_all(&payload).await.map_err(ChannelError::from);
        let failed = result.clone().err();
        promise.complete(result);
        if let Some(error) = failed {
            if let Some(channel) = channel.upgrade() {
                warn!(channel = %channel.state.id, error = %error, "write failed");
                channel.state.pipeline.fire_exception(channel.as_ref(), &error);
                channel.close();
            }
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        let error = ChannelError::from(err);
        match channel.upgrade() {
            Some(channel) => {
                debug!(channel = %channel.state.id, error = %error, "shutdown failed");
                channel.state.record_close_error(error);
            }
            None => debug!(error = %error, "shutdown failed after channel was dropped"),
        }
    }
}

async fn read_loop(
    channel: Weak<TcpChannel>,
    mut reader: OwnedReadHalf,
    mut framer: Option<Box<dyn Framer>>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            read = read_with_idle(&mut reader, &mut buf, idle_timeout) => read,
        };
        let Some(strong) = channel.upgrade() else {
            break;
        };
        let pipeline = &strong.state.pipeline;
        match read {
            Ok(Some(0)) => {
                debug!(channel = %strong.state.id, "peer closed connection");
                strong.close();
                break;
            }
            Ok(Some(n)) => {
                trace!(channel = %strong.state.id, bytes = n, "read");
                if let Err(error) = pipeline.dispatch(strong.as_ref(), framer.as_mut(), &mut buf) {
                    pipeline.fire_exception(strong.as_ref(), &error);
                    strong.close();
                    break;
                }
            }
            Ok(None) => pipeline.fire_idle(strong.as_ref()),
            Err(err) => {
                let error = ChannelError::from(err);
                pipeline.fire_exception(strong.as_ref(), &error);
                strong.close();
                break;
            }
        }
    }
}

/// Reads into `buf`. Returns `Ok(None)` if `idle_timeout` elapsed first.
async fn read_with_idle(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    idle_timeout: Option<Duration>,
) -> std::io::Result<Option<usize>> {
    buf.reserve(READ_BUFFER_SIZE);
    match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, reader.read_buf(buf)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => reader.read_buf(buf).await.map(Some),
    }
}

/// A listening TCP socket.
pub struct TcpListenerChannel {
    state: ChannelState,
    local: SocketAddr,
    handle: Handle,
    listener: Mutex<Option<TcpListener>>,
    initializer: Arc<dyn ChildInitializer>,
    options: ChannelOptions,
    this: Weak<TcpListenerChannel>,
}

impl TcpListenerChannel {
    /// Wraps a bound listener. Accepting starts on [`Channel::register`].
    ///
    /// # Errors
    /// Returns an error if the bound address cannot be read.
    pub fn new(
        listener: TcpListener,
        handle: &Handle,
        options: ChannelOptions,
        initializer: Arc<dyn ChildInitializer>,
    ) -> Result<Arc<Self>, ChannelError> {
        let local = listener.local_addr()?;
        let channel = Arc::new_cyclic(|this| Self {
            state: ChannelState::new(),
            local,
            handle: handle.clone(),
            listener: Mutex::new(Some(listener)),
            initializer,
            options,
            this: this.clone(),
        });
        handle.spawn(listener_close_watcher(Arc::downgrade(&channel)));
        debug!(channel = %channel.state.id, %local, "tcp listener bound");
        Ok(channel)
    }
}

impl Channel for TcpListenerChannel {
    fn id(&self) -> ChannelId {
        self.state.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn pipeline(&self) -> &Pipeline {
        &self.state.pipeline
    }

    fn register(&self) -> Result<(), ChannelError> {
        if !self.state.is_open() {
            return Err(ChannelError::Closed);
        }
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(ChannelError::Unsupported("listener already registered"))?;
        self.state.tracker.spawn_on(
            accept_loop(
                self.this.clone(),
                listener,
                Arc::clone(&self.initializer),
                self.options.clone(),
                self.handle.clone(),
                self.state.cancel.clone(),
            ),
            &self.handle,
        );
        Ok(())
    }

    fn write(&self, _payload: Bytes) -> WriteCompletion {
        WriteCompletion::failed(ChannelError::Unsupported("write on a listening channel"))
    }

    fn close(&self) -> CloseFuture {
        if self.state.initiate_close() {
            debug!(channel = %self.state.id, "closing tcp listener");
        }
        self.state.close_future.clone()
    }

    fn close_future(&self) -> CloseFuture {
        self.state.close_future.clone()
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

impl Drop for TcpListenerChannel {
    fn drop(&mut self) {
        self.state.initiate_close();
    }
}

impl fmt::Debug for TcpListenerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListenerChannel")
            .field("id", &self.state.id)
            .field("local", &self.local)
            .field("open", &self.state.is_open())
            .finish()
    }
}

async fn listener_close_watcher(channel: Weak<TcpListenerChannel>) {
    let (cancel, tracker, close_future) = match channel.upgrade() {
        Some(channel) => (
            channel.state.cancel.clone(),
            channel.state.tracker.clone(),
            channel.state.close_future.clone(),
        ),
        None => return,
    };
    cancel.cancelled().await;
    tracker.close();
    tracker.wait().await;

    if let Some(channel) = channel.upgrade() {
        channel.state.open.store(false, Ordering::Release);
        channel.listener.lock().take();
        channel.state.active.store(false, Ordering::Release);
        channel.state.pipeline.fire_inactive(channel.as_ref());
        debug!(channel = %channel.state.id, "tcp listener closed");
    }
    close_future.complete(Ok(()));
}

async fn accept_loop(
    channel: Weak<TcpListenerChannel>,
    listener: TcpListener,
    initializer: Arc<dyn ChildInitializer>,
    options: ChannelOptions,
    handle: Handle,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let child = TcpChannel::new(stream, &handle, &options);
                debug!(child = %child.id(), %peer, "accepted connection");
                let as_channel: Arc<dyn Channel> = child.clone();
                let registered = initializer
                    .init_child(as_channel)
                    .and_then(|()| child.register());
                if let Err(error) = registered {
                    warn!(child = %child.id(), %peer, error = %error, "rejected connection");
                    child.close();
                }
            }
            Err(err) => {
                let error = ChannelError::from(err);
                if let Some(listener_channel) = channel.upgrade() {
                    listener_channel
                        .state
                        .pipeline
                        .fire_exception(listener_channel.as_ref(), &error);
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ChannelHandler;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<Vec<u8>>>,
        idle: AtomicUsize,
        inactive: AtomicUsize,
    }

    impl ChannelHandler for Collect {
        fn on_frame(
            &self,
            _channel: &dyn Channel,
            frame: BytesMut,
        ) -> Result<Option<BytesMut>, ChannelError> {
            self.frames.lock().push(frame.to_vec());
            Ok(None)
        }

        fn on_idle(&self, _channel: &dyn Channel) {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }

        fn on_inactive(&self, _channel: &dyn Channel) {
            self.inactive.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn connected_pair(options: &ChannelOptions) -> (Arc<TcpChannel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpChannel::new(client, &Handle::current(), options), server)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_and_read() {
        let (channel, mut peer) = connected_pair(&ChannelOptions::default()).await;
        let collect = Arc::new(Collect::default());
        channel.pipeline().add_last("collect", collect.clone()).unwrap();
        channel.register().unwrap();

        let completion = channel.write(Bytes::from_static(b"ping"));
        tokio::task::spawn_blocking(move || completion.wait(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        let mut received = [0u8; 4];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"ping");

        peer.write_all(b"pong").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while collect.frames.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(collect.frames.lock()[0], b"pong");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_completes_close_future() {
        let (channel, peer) = connected_pair(&ChannelOptions::default()).await;
        let collect = Arc::new(Collect::default());
        channel.pipeline().add_last("collect", collect.clone()).unwrap();
        channel.register().unwrap();

        drop(peer);
        let outcome = tokio::time::timeout(Duration::from_secs(2), channel.close_future().wait())
            .await
            .unwrap();
        assert_eq!(outcome, Ok(()));
        assert!(!channel.is_open());
        assert!(!channel.is_active());
        assert_eq!(collect.inactive.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_detection() {
        let options = ChannelOptions::default().with_idle_timeout(Duration::from_millis(20));
        let (channel, _peer) = connected_pair(&options).await;
        let collect = Arc::new(Collect::default());
        channel.pipeline().add_last("collect", collect.clone()).unwrap();
        channel.register().unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(collect.idle.load(Ordering::SeqCst) >= 2);
        channel.close().wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_twice_and_write_after_close() {
        let (channel, _peer) = connected_pair(&ChannelOptions::default()).await;
        channel.register().unwrap();
        assert!(channel.register().is_err());

        channel.close().wait().await.unwrap();
        assert_eq!(
            channel.write(Bytes::from_static(b"late")).wait(Duration::from_millis(10)),
            Err(ChannelError::Closed)
        );
        assert_eq!(channel.register(), Err(ChannelError::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_initializes_children() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let initializer: Arc<dyn ChildInitializer> = Arc::new(move |child: Arc<dyn Channel>| {
            counter.fetch_add(1, Ordering::SeqCst);
            child.pipeline().add_last("noop", Arc::new(crate::pipeline::NoopHandler))
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = TcpListenerChannel::new(
            listener,
            &Handle::current(),
            ChannelOptions::default(),
            initializer,
        )
        .unwrap();
        server.register().unwrap();
        let addr = server.local_addr().unwrap();

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while accepted.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.close().wait().await.unwrap();
        assert!(!server.is_active());
    }
}
