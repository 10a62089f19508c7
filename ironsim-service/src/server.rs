/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Inbound multi-client server.
//!
//! Every accepted connection gets its own child session, kept in a
//! concurrent registry keyed by channel id. A fault on one child closes only
//! that child and reports `WARNING`; only listener-level failures put the
//! service in `ERROR`.

use crate::lifecycle::{ConnectionStrategy, Service, ServiceCore};
use crate::router::{DEREGISTRATION_HANDLER, EXCEPTION_ROUTER, ExceptionRouter, InactiveHook};
use async_trait::async_trait;
use dashmap::DashMap;
use ironsim_core::{ChannelError, ChannelId, ServerSettings, ServiceError, ServiceStatus};
use ironsim_session::{NamedHandler, Protocol, Session};
use ironsim_transport::{Channel, CloseFuture};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

type Registry<P> = DashMap<ChannelId, Arc<Session<P>>>;

/// A server service.
pub type ServerService<P> = Service<P, TcpServer<P>>;

/// Connection strategy of a multi-client server.
pub struct TcpServer<P: Protocol> {
    registry: Arc<Registry<P>>,
    listener: RwLock<Option<Arc<dyn Channel>>>,
}

impl<P: Protocol> Default for TcpServer<P> {
    fn default() -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            listener: RwLock::new(None),
        }
    }
}

impl<P: Protocol> TcpServer<P> {
    /// Returns the bound listener address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .read()
            .as_ref()
            .and_then(|listener| listener.local_addr())
    }

    /// Returns a snapshot of the open child sessions, oldest first.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Arc<Session<P>>> {
        let mut sessions: Vec<_> = self
            .registry
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Closes the child on `channel`. Returns `None` if no such child.
    pub fn disconnect(&self, channel: ChannelId) -> Option<CloseFuture> {
        let session = self.registry.get(&channel).map(|entry| Arc::clone(entry.value()))?;
        info!(session = %session.name(), "disconnecting client");
        Some(session.close())
    }
}

/// Removes the child from the registry once its channel is inactive.
fn deregistration<P: Protocol>(
    core: &Arc<ServiceCore<P>>,
    registry: &Arc<Registry<P>>,
) -> NamedHandler {
    let core = Arc::downgrade(core);
    let registry = Arc::downgrade(registry);
    let hook = InactiveHook::new(move |channel| {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        if let Some((_, session)) = registry.remove(&channel.id())
            && let Some(core) = core.upgrade()
        {
            core.session_closed(&session);
        }
    });
    (DEREGISTRATION_HANDLER.to_string(), Arc::new(hook))
}

/// Routes a child's exceptions to the per-client fault path.
fn child_router<P: Protocol>(
    core: &Arc<ServiceCore<P>>,
    session: &Arc<Session<P>>,
) -> NamedHandler {
    let core = Arc::downgrade(core);
    let session = Arc::downgrade(session);
    let router = ExceptionRouter::new(move |_channel, error| {
        if let (Some(core), Some(session)) = (core.upgrade(), session.upgrade()) {
            core.on_child_exception(&session, error);
        }
    });
    (EXCEPTION_ROUTER.to_string(), Arc::new(router))
}

#[async_trait]
impl<P: Protocol> ConnectionStrategy<P> for TcpServer<P> {
    type Settings = ServerSettings;

    fn kind(&self) -> &'static str {
        "server"
    }

    async fn connect(
        &self,
        core: &Arc<ServiceCore<P>>,
        settings: &ServerSettings,
    ) -> Result<(), ServiceError> {
        let registry = Arc::clone(&self.registry);
        let weak_core = Arc::downgrade(core);
        let initializer = move |child: Arc<dyn Channel>| -> Result<(), ChannelError> {
            let Some(core) = weak_core.upgrade() else {
                return Err(ChannelError::Closed);
            };
            if core.is_disposing() {
                debug!(channel = %child.id(), "rejecting client while disposing");
                return Err(ChannelError::Closed);
            }
            let id = child.id();
            let session = core.create_session(child);
            registry.insert(id, Arc::clone(&session));
            let tail = vec![deregistration(&core, &registry), child_router(&core, &session)];
            if let Err(err) = core.attach_pipeline(&session, tail) {
                registry.remove(&id);
                return Err(err);
            }
            core.session_opened(&session);
            Ok(())
        };

        let listener = core
            .transport()?
            .bind(
                &settings.host,
                settings.port,
                &core.channel_options(),
                Arc::new(initializer),
            )
            .await?;

        let weak_core = Arc::downgrade(core);
        listener.pipeline().add_last(
            EXCEPTION_ROUTER,
            Arc::new(ExceptionRouter::new(move |_channel, error| {
                if let Some(core) = weak_core.upgrade()
                    && !core.is_disposing()
                {
                    core.change_status(
                        ServiceStatus::Error,
                        "listener failed",
                        Some(error.clone().into()),
                    );
                }
            })),
        )?;

        let weak_core = Arc::downgrade(core);
        listener.close_future().add_listener(move |outcome| {
            if let (Err(err), Some(core)) = (outcome, weak_core.upgrade())
                && !core.is_disposing()
            {
                core.change_status(
                    ServiceStatus::Error,
                    "listener closed with error",
                    Some(err.clone().into()),
                );
            }
        });

        *self.listener.write() = Some(Arc::clone(&listener));
        listener.register()?;
        info!(local = ?listener.local_addr(), "server listening");
        Ok(())
    }

    fn sessions(&self) -> Vec<Arc<Session<P>>> {
        self.registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn close_endpoints(&self) -> Vec<CloseFuture> {
        self.listener
            .read()
            .as_ref()
            .map(|listener| listener.close())
            .into_iter()
            .collect()
    }

    fn release(&self) {
        self.registry.clear();
        self.listener.write().take();
    }
}

impl<P: Protocol> Service<P, TcpServer<P>> {
    /// Creates a server service speaking `protocol`.
    #[must_use]
    pub fn server(protocol: P) -> Self {
        Self::new(protocol, TcpServer::default())
    }

    /// Returns the bound listener address.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.strategy().local_addr()
    }

    /// Returns a snapshot of the open child sessions, oldest first.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Arc<Session<P>>> {
        self.strategy().active_sessions()
    }

    /// Closes one child session.
    pub fn disconnect(&self, channel: ChannelId) -> Option<CloseFuture> {
        self.strategy().disconnect(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::{FixMessage, FixProtocol, tags};
    use crate::lifecycle::Lifecycle;
    use crate::testing::{Collector, context, monitor, saw, wait_until};
    use ironsim_core::{CommonSettings, EventKind, RecordingMonitor, ServiceName, ServiceSettings};
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn started(port: u16) -> (ServerService<FixProtocol>, Arc<RecordingMonitor>, Arc<Collector>) {
        let monitor = monitor();
        let collector = Arc::new(Collector::default());
        let service = ServerService::server(FixProtocol::new("SERVER", "CLIENT"));
        let settings: Arc<dyn ServiceSettings> = Arc::new(
            ServerSettings::new("127.0.0.1", port)
                .with_common(CommonSettings::default().with_heartbeat_interval_ms(0)),
        );
        service.init(
            context(),
            monitor.clone(),
            collector.clone(),
            settings,
            ServiceName::from("server"),
        );
        service.start();
        (service, monitor, collector)
    }

    fn connect(service: &ServerService<FixProtocol>) -> TcpStream {
        let stream = TcpStream::connect(service.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    fn read_until(stream: &mut TcpStream, needle: &[u8]) {
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while !received.windows(needle.len()).any(|w| w == needle) {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before {needle:?} arrived");
            received.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_child_fault_is_isolated() {
        let (service, monitor, collector) = started(0);
        assert_eq!(service.status(), ServiceStatus::Started);

        let mut faulty = connect(&service);
        let mut healthy = connect(&service);
        assert!(wait_until(WAIT, || service.active_sessions().len() == 2));
        let faulty_session = Arc::clone(&service.active_sessions()[0]);

        faulty.write_all(b"definitely not fix\x01").unwrap();
        assert!(wait_until(WAIT, || service.status() == ServiceStatus::Warning));
        assert!(wait_until(WAIT, || service.active_sessions().len() == 1));
        assert!(faulty_session.is_closed());
        assert!(!saw(&monitor, ServiceStatus::Error));
        assert!(monitor
            .events()
            .iter()
            .any(|e| e.kind == EventKind::SessionFault(faulty_session.id())));

        let survivor = Arc::clone(&service.active_sessions()[0]);
        survivor
            .send(FixMessage::new("0").with_field(tags::TEXT, "still-here"), 1_000)
            .unwrap();
        read_until(&mut healthy, b"58=still-here\x01");

        healthy
            .write_all(&FixMessage::new("1").with_field(tags::TEXT, "ping").encode("FIX.4.4"))
            .unwrap();
        assert!(wait_until(WAIT, || collector.received() == 1));

        let _late = connect(&service);
        assert!(wait_until(WAIT, || service.active_sessions().len() == 2));

        let mut eof = [0u8; 1];
        assert_eq!(faulty.read(&mut eof).unwrap_or(0), 0);

        service.dispose();
        assert_eq!(service.status(), ServiceStatus::Disposed);
    }

    #[test]
    fn test_peer_close_deregisters_child() {
        let (service, _monitor, collector) = started(0);
        let peer = connect(&service);
        assert!(wait_until(WAIT, || service.active_sessions().len() == 1));

        peer.shutdown(Shutdown::Both).unwrap();
        assert!(wait_until(WAIT, || collector.closed.load(Ordering::SeqCst) == 1));
        assert!(service.sessions().is_empty());
        assert_eq!(service.status(), ServiceStatus::Started);
        service.dispose();
    }

    #[test]
    fn test_disconnect_closes_one_child() {
        let (service, _monitor, _collector) = started(0);
        let mut first = connect(&service);
        let _second = connect(&service);
        assert!(wait_until(WAIT, || service.active_sessions().len() == 2));

        let target = service.active_sessions()[0].channel().unwrap().id();
        assert!(service.disconnect(target).is_some());
        assert!(wait_until(WAIT, || service.active_sessions().len() == 1));
        let mut eof = [0u8; 1];
        assert_eq!(first.read(&mut eof).unwrap_or(0), 0);
        assert!(service.disconnect(target).is_none());
        assert_eq!(service.status(), ServiceStatus::Started);
        service.dispose();
    }

    #[test]
    fn test_dispose_closes_every_child() {
        let (service, monitor, collector) = started(0);
        let mut peers = [connect(&service), connect(&service)];
        assert!(wait_until(WAIT, || service.active_sessions().len() == 2));
        assert_eq!(collector.opened.load(Ordering::SeqCst), 2);
        let address = service.local_addr().unwrap();

        service.dispose();
        assert_eq!(service.status(), ServiceStatus::Disposed);
        assert!(service.sessions().is_empty());
        assert!(service.local_addr().is_none());
        assert_eq!(collector.closed.load(Ordering::SeqCst), 2);
        for peer in &mut peers {
            let mut eof = [0u8; 1];
            assert_eq!(peer.read(&mut eof).unwrap_or(0), 0);
        }
        assert!(TcpStream::connect(address).is_err());
        assert!(!saw(&monitor, ServiceStatus::Error));
    }

    #[test]
    fn test_port_in_use_sets_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let (service, monitor, _collector) = started(port);

        assert_eq!(service.status(), ServiceStatus::Error);
        assert!(matches!(
            monitor.events().last().unwrap().cause,
            Some(ServiceError::Channel(ChannelError::Io { .. }))
        ));
        service.dispose();
        assert_eq!(service.status(), ServiceStatus::Disposed);
    }
}
