/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! UDP multicast client.
//!
//! The service binds the group port, joins the group (optionally restricted
//! to one source) and owns a single session. A clean close of that session
//! ends the service: it goes straight to `DISPOSED`.

use crate::client::service_router;
use crate::lifecycle::{ConnectionStrategy, Service, ServiceCore};
use async_trait::async_trait;
use ironsim_core::{MulticastSettings, ServiceError, ServiceStatus};
use ironsim_session::{Protocol, Session};
use ironsim_transport::{MulticastOptions, resolve_interface};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// A multicast client service.
pub type MulticastClientService<P> = Service<P, UdpMulticast<P>>;

/// Connection strategy of a multicast client.
pub struct UdpMulticast<P: Protocol> {
    session: RwLock<Option<Arc<Session<P>>>>,
}

impl<P: Protocol> Default for UdpMulticast<P> {
    fn default() -> Self {
        Self {
            session: RwLock::new(None),
        }
    }
}

impl<P: Protocol> UdpMulticast<P> {
    /// Returns the group session, once joined.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session<P>>> {
        self.session.read().clone()
    }
}

#[async_trait]
impl<P: Protocol> ConnectionStrategy<P> for UdpMulticast<P> {
    type Settings = MulticastSettings;

    fn kind(&self) -> &'static str {
        "multicast client"
    }

    async fn connect(
        &self,
        core: &Arc<ServiceCore<P>>,
        settings: &MulticastSettings,
    ) -> Result<(), ServiceError> {
        let interface = resolve_interface(settings.local_ip)?;
        let options = MulticastOptions::new(settings.group, settings.port)
            .with_interface(interface)
            .with_ttl(settings.ttl)
            .with_idle_timeout(core.channel_options().idle_timeout);
        let multicast = core.transport()?.bind_multicast(&options).await?;
        let channel = Arc::clone(&multicast).as_channel();

        let session = core.create_session(Arc::clone(&channel));
        if let Err(err) = core.attach_pipeline(&session, vec![service_router(core, &session)]) {
            session.close();
            return Err(err.into());
        }

        let weak_core = Arc::downgrade(core);
        let weak_session = Arc::downgrade(&session);
        channel.close_future().add_listener(move |outcome| {
            let (Some(core), Some(session)) = (weak_core.upgrade(), weak_session.upgrade()) else {
                return;
            };
            core.session_closed(&session);
            if core.is_disposing() {
                debug!(session = %session.name(), "multicast channel closed while disposing");
                return;
            }
            match outcome {
                Ok(()) if !core.status().is_fault() => {
                    core.change_status(
                        ServiceStatus::Disposed,
                        format!("multicast session {} closed", session.name()),
                        None,
                    );
                }
                Ok(()) => debug!(session = %session.name(), "multicast channel closed after fault"),
                Err(err) => {
                    core.change_status(
                        ServiceStatus::Error,
                        format!("multicast channel {} closed with error", session.name()),
                        Some(err.clone().into()),
                    );
                }
            }
        });
        *self.session.write() = Some(Arc::clone(&session));

        if let Err(err) = multicast.join_group(settings.group, interface, settings.source_ip) {
            channel.pipeline().fire_exception(channel.as_ref(), &err);
            return Err(err.into());
        }

        core.session_opened(&session);
        channel.register()?;
        info!(
            group = %settings.group,
            port = settings.port,
            %interface,
            source = ?settings.source_ip,
            "joined multicast group"
        );
        Ok(())
    }

    fn sessions(&self) -> Vec<Arc<Session<P>>> {
        self.session().into_iter().collect()
    }

    fn release(&self) {
        self.session.write().take();
    }
}

impl<P: Protocol> Service<P, UdpMulticast<P>> {
    /// Creates a multicast client service speaking `protocol`.
    #[must_use]
    pub fn multicast(protocol: P) -> Self {
        Self::new(protocol, UdpMulticast::default())
    }

    /// Returns the group session, once joined.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session<P>>> {
        self.strategy().session()
    }
}
