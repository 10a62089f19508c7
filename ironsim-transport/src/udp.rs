/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! UDP multicast channel.
//!
//! The socket is built with `socket2` so address/port reuse, TTL and the
//! outbound interface can be set before binding. Each received datagram is
//! appended to the read buffer and framed like a stream read. Writes go to
//! the group address.

use crate::channel::{Channel, ChannelState, CloseFuture, Outbound, WriteCompletion};
use crate::codec::Framer;
use crate::pipeline::Pipeline;
use bytes::{Bytes, BytesMut};
use ironsim_core::{ChannelError, ChannelId};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Options for binding a multicast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastOptions {
    /// Multicast group address.
    pub group: Ipv4Addr,
    /// Group port.
    pub port: u16,
    /// Local interface address; `0.0.0.0` lets the OS pick.
    pub interface: Ipv4Addr,
    /// Multicast TTL.
    pub ttl: u32,
    /// Whether datagrams sent by this host are looped back to it.
    pub loopback: bool,
    /// Read-idle timeout.
    pub idle_timeout: Option<Duration>,
}

impl MulticastOptions {
    /// Creates options for `group:port` on any interface.
    #[must_use]
    pub const fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
            loopback: true,
            idle_timeout: None,
        }
    }

    /// Sets the local interface.
    #[must_use]
    pub const fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    /// Sets the TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the read-idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// A channel that can join multicast groups.
pub trait MulticastChannel: Channel {
    /// Joins `group` on `interface`, restricted to `source` if given.
    ///
    /// # Errors
    /// Returns the socket error if the membership cannot be added.
    fn join_group(
        &self,
        group: Ipv4Addr,
        interface: Ipv4Addr,
        source: Option<Ipv4Addr>,
    ) -> Result<(), ChannelError>;

    /// Returns this channel as a plain [`Channel`].
    fn as_channel(self: Arc<Self>) -> Arc<dyn Channel>;
}

/// Checks that `local_ip` belongs to a local interface.
///
/// `0.0.0.0` is always accepted. Any other address must be bindable.
///
/// # Errors
/// Returns [`ChannelError::UnresolvedInterface`] if no interface owns it.
pub fn resolve_interface(local_ip: Ipv4Addr) -> Result<Ipv4Addr, ChannelError> {
    if local_ip.is_unspecified() {
        return Ok(local_ip);
    }
    match std::net::UdpSocket::bind(SocketAddrV4::new(local_ip, 0)) {
        Ok(_) => Ok(local_ip),
        Err(err) => {
            debug!(%local_ip, error = %err, "local address is not bindable");
            Err(ChannelError::UnresolvedInterface(local_ip))
        }
    }
}

/// A UDP socket bound to a multicast group port.
pub struct UdpChannel {
    state: ChannelState,
    socket: Arc<UdpSocket>,
    local: Option<SocketAddr>,
    target: SocketAddr,
    handle: Handle,
    outbound: mpsc::UnboundedSender<Outbound>,
    registered: Mutex<bool>,
    idle_timeout: Option<Duration>,
    this: Weak<UdpChannel>,
}

impl UdpChannel {
    /// Creates and binds the multicast socket. Must be called inside the
    /// runtime owning `handle`.
    ///
    /// # Errors
    /// Returns the socket error if any option or the bind fails.
    pub fn bind(handle: &Handle, options: &MulticastOptions) -> Result<Arc<Self>, ChannelError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.set_multicast_ttl_v4(options.ttl)?;
        socket.set_multicast_loop_v4(options.loopback)?;
        if !options.interface.is_unspecified() {
            socket.set_multicast_if_v4(&options.interface)?;
        }
        socket.set_nonblocking(true)?;

        // Binding the group address filters out unrelated traffic on unix.
        let bind_ip = if cfg!(unix) {
            options.group
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(bind_ip, options.port)).into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = {
            let _guard = handle.enter();
            UdpSocket::from_std(std_socket)?
        };
        let local = socket.local_addr().ok();
        let (outbound, rx) = mpsc::unbounded_channel();

        let channel = Arc::new_cyclic(|this| Self {
            state: ChannelState::new(),
            socket: Arc::new(socket),
            local,
            target: SocketAddr::V4(SocketAddrV4::new(options.group, options.port)),
            handle: handle.clone(),
            outbound,
            registered: Mutex::new(false),
            idle_timeout: options.idle_timeout,
            this: this.clone(),
        });
        channel.state.tracker.spawn_on(
            send_loop(
                Arc::downgrade(&channel),
                Arc::clone(&channel.socket),
                channel.target,
                rx,
                channel.state.cancel.clone(),
            ),
            handle,
        );
        handle.spawn(close_watcher(Arc::downgrade(&channel)));
        debug!(
            channel = %channel.state.id,
            ?local,
            group = %options.group,
            port = options.port,
            "udp channel bound"
        );
        Ok(channel)
    }
}

impl Channel for UdpChannel {
    fn id(&self) -> ChannelId {
        self.state.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.target)
    }

    fn pipeline(&self) -> &Pipeline {
        &self.state.pipeline
    }

    fn register(&self) -> Result<(), ChannelError> {
        if !self.state.is_open() {
            return Err(ChannelError::Closed);
        }
        let mut registered = self.registered.lock();
        if *registered {
            return Err(ChannelError::Unsupported("channel already registered"));
        }
        *registered = true;
        let framer = self.state.pipeline.take_framer();
        self.state.tracker.spawn_on(
            recv_loop(
                self.this.clone(),
                Arc::clone(&self.socket),
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
            debug!(channel = %self.state.id, "closing udp channel");
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

impl MulticastChannel for UdpChannel {
    fn join_group(
        &self,
        group: Ipv4Addr,
        interface: Ipv4Addr,
        source: Option<Ipv4Addr>,
    ) -> Result<(), ChannelError> {
        match source {
            Some(source) => {
                SockRef::from(self.socket.as_ref()).join_ssm_v4(&source, &group, &interface)?;
                info!(
                    channel = %self.state.id,
                    %group,
                    %interface,
                    %source,
                    "joined source-specific multicast group"
                );
            }
            None => {
                self.socket.join_multicast_v4(group, interface)?;
                info!(channel = %self.state.id, %group, %interface, "joined multicast group");
            }
        }
        Ok(())
    }

    fn as_channel(self: Arc<Self>) -> Arc<dyn Channel> {
        self
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.state.initiate_close();
    }
}

impl fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpChannel")
            .field("id", &self.state.id)
            .field("local", &self.local)
            .field("target", &self.target)
            .field("open", &self.state.is_open())
            .finish()
    }
}

async fn close_watcher(channel: Weak<UdpChannel>) {
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
            channel.state.active.store(false, Ordering::Release);
            channel.state.pipeline.fire_inactive(channel.as_ref());
            debug!(channel = %channel.state.id, "udp channel closed");
            channel.state.close_outcome()
        }
        None => Ok(()),
    };
    close_future.complete(outcome);
}

async fn send_loop(
    channel: Weak<UdpChannel>,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
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
        let result = socket
            .send_to(&payload, target)
            .await
            .map(|_| ())
            .map_err(ChannelError::from);
        if let Err(error) = &result
            && let Some(strong) = channel.upgrade()
        {
            warn!(channel = %strong.state.id, error = %error, "datagram send failed");
        }
        promise.complete(result);
    }
}

async fn recv_loop(
    channel: Weak<UdpChannel>,
    socket: Arc<UdpSocket>,
    mut framer: Option<Box<dyn Framer>>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut datagram = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = recv_with_idle(&socket, &mut datagram, idle_timeout) => received,
        };
        let Some(strong) = channel.upgrade() else {
            break;
        };
        let pipeline = &strong.state.pipeline;
        match received {
            Ok(Some((n, from))) => {
                trace!(channel = %strong.state.id, bytes = n, %from, "datagram received");
                buf.extend_from_slice(&datagram[..n]);
                if let Err(error) = pipeline.dispatch(strong.as_ref(), framer.as_mut(), &mut buf) {
                    // Frame the next datagram from a clean buffer.
                    buf.clear();
                    pipeline.fire_exception(strong.as_ref(), &error);
                }
            }
            Ok(None) => pipeline.fire_idle(strong.as_ref()),
            Err(err) => {
                let error = ChannelError::from(err);
                strong.state.record_close_error(error.clone());
                pipeline.fire_exception(strong.as_ref(), &error);
                strong.close();
                break;
            }
        }
    }
}

async fn recv_with_idle(
    socket: &UdpSocket,
    datagram: &mut [u8],
    idle_timeout: Option<Duration>,
) -> std::io::Result<Option<(usize, SocketAddr)>> {
    match idle_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, socket.recv_from(datagram)).await {
            Ok(received) => received.map(Some),
            Err(_) => Ok(None),
        },
        None => socket.recv_from(datagram).await.map(Some),
    }
}
