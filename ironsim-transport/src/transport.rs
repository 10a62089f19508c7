/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Transport factory.
//!
//! The [`Transport`] trait is the seam between services and sockets: it
//! connects, binds listeners, and binds multicast sockets, returning
//! unregistered channels. [`TokioTransport`] is the socket-backed
//! implementation; tests substitute fakes.

use crate::channel::Channel;
use crate::pipeline::{NoopHandler, PLACEHOLDER_HANDLER};
use crate::tcp::{ChildInitializer, TcpChannel, TcpListenerChannel};
use crate::udp::{MulticastChannel, MulticastOptions, UdpChannel};
use async_trait::async_trait;
use ironsim_core::ChannelError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Per-channel options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Read-idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Connect timeout for outbound channels.
    pub connect_timeout: Option<Duration>,
}

impl ChannelOptions {
    /// Sets the read-idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Creates channels. Must be called from inside the service's runtime.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Opens an outbound TCP connection.
    ///
    /// The returned channel is unregistered and carries a single
    /// [`PLACEHOLDER_HANDLER`] until the pipeline is assembled.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn Channel>, ChannelError>;

    /// Binds a TCP listener. Each accepted child is passed to `initializer`
    /// and then registered.
    async fn bind(
        &self,
        host: &str,
        port: u16,
        options: &ChannelOptions,
        initializer: Arc<dyn ChildInitializer>,
    ) -> Result<Arc<dyn Channel>, ChannelError>;

    /// Binds a UDP socket on a multicast group port.
    async fn bind_multicast(
        &self,
        options: &MulticastOptions,
    ) -> Result<Arc<dyn MulticastChannel>, ChannelError>;
}

/// Socket-backed transport running on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTransport;

impl TokioTransport {
    /// Creates a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TokioTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let address = format!("{host}:{port}");
        debug!(%address, "connecting");
        let stream = match options.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(&address))
                .await
                .map_err(|_| ChannelError::ConnectTimeout {
                    address: address.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })??,
            None => TcpStream::connect(&address).await?,
        };
        let channel = TcpChannel::new(stream, &Handle::current(), options);
        channel
            .pipeline()
            .add_last(PLACEHOLDER_HANDLER, Arc::new(NoopHandler))?;
        info!(%address, channel = %channel.id(), "connected");
        Ok(channel)
    }

    async fn bind(
        &self,
        host: &str,
        port: u16,
        options: &ChannelOptions,
        initializer: Arc<dyn ChildInitializer>,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        let listener = TcpListener::bind((host, port)).await?;
        let channel =
            TcpListenerChannel::new(listener, &Handle::current(), options.clone(), initializer)?;
        info!(local = ?channel.local_addr(), channel = %channel.id(), "listening");
        Ok(channel)
    }

    async fn bind_multicast(
        &self,
        options: &MulticastOptions,
    ) -> Result<Arc<dyn MulticastChannel>, ChannelError> {
        let channel = UdpChannel::bind(&Handle::current(), options)?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TokioTransport::new()
            .connect("127.0.0.1", port, &ChannelOptions::default())
            .await;
        assert!(matches!(result, Err(ChannelError::Io { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_adds_placeholder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = ChannelOptions::default().with_connect_timeout(Duration::from_secs(2));
        let channel = TokioTransport::new()
            .connect("127.0.0.1", port, &options)
            .await
            .unwrap();
        assert_eq!(channel.pipeline().names(), vec![PLACEHOLDER_HANDLER.to_string()]);
        assert!(channel.is_open());
        channel.close().wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_ephemeral_port() {
        let initializer: Arc<dyn ChildInitializer> =
            Arc::new(|_child: Arc<dyn Channel>| -> Result<(), ChannelError> { Ok(()) });
        let channel = TokioTransport::new()
            .bind("127.0.0.1", 0, &ChannelOptions::default(), initializer)
            .await
            .unwrap();
        let local = channel.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        channel.close().wait().await.unwrap();
    }
}
