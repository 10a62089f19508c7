/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Outbound unicast client.
//!
//! The client owns one session over one TCP connection. Any exception on
//! that connection puts the service in `ERROR` and closes the session; there
//! is no reconnection.

use crate::lifecycle::{ConnectionStrategy, Service, ServiceCore};
use crate::router::{EXCEPTION_ROUTER, ExceptionRouter};
use async_trait::async_trait;
use ironsim_core::{ClientSettings, ServiceError, ServiceStatus};
use ironsim_session::{NamedHandler, Protocol, Session};
use ironsim_transport::Channel;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// A client service.
pub type ClientService<P> = Service<P, TcpClient<P>>;

/// Connection strategy of a unicast client.
pub struct TcpClient<P: Protocol> {
    session: RwLock<Option<Arc<Session<P>>>>,
}

impl<P: Protocol> Default for TcpClient<P> {
    fn default() -> Self {
        Self {
            session: RwLock::new(None),
        }
    }
}

impl<P: Protocol> TcpClient<P> {
    /// Returns the main session, once connected.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session<P>>> {
        self.session.read().clone()
    }
}

/// Builds the terminal router sending a session's exceptions to the core.
pub(crate) fn service_router<P: Protocol>(
    core: &Arc<ServiceCore<P>>,
    session: &Arc<Session<P>>,
) -> NamedHandler {
    let core = Arc::downgrade(core);
    let session = Arc::downgrade(session);
    let router = ExceptionRouter::new(move |_channel, error| {
        if let (Some(core), Some(session)) = (core.upgrade(), session.upgrade()) {
            core.on_exception_caught(&session, error);
        }
    });
    (EXCEPTION_ROUTER.to_string(), Arc::new(router))
}

#[async_trait]
impl<P: Protocol> ConnectionStrategy<P> for TcpClient<P> {
    type Settings = ClientSettings;

    fn kind(&self) -> &'static str {
        "client"
    }

    async fn connect(
        &self,
        core: &Arc<ServiceCore<P>>,
        settings: &ClientSettings,
    ) -> Result<(), ServiceError> {
        let options = core
            .channel_options()
            .with_connect_timeout(settings.connect_timeout());
        let channel = core
            .transport()?
            .connect(&settings.host, settings.port, &options)
            .await?;

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
            match outcome {
                Ok(()) => debug!(session = %session.name(), "client channel closed"),
                Err(err) if !core.is_disposing() => {
                    core.change_status(
                        ServiceStatus::Error,
                        format!("client channel {} closed with error", session.name()),
                        Some(err.clone().into()),
                    );
                }
                Err(err) => debug!(
                    session = %session.name(),
                    error = %err,
                    "client channel closed with error while disposing"
                ),
            }
            core.session_closed(&session);
        });

        *self.session.write() = Some(Arc::clone(&session));
        core.session_opened(&session);
        channel.register()?;
        info!(address = %settings.address(), session = %session.name(), "client connected");
        Ok(())
    }

    fn sessions(&self) -> Vec<Arc<Session<P>>> {
        self.session().into_iter().collect()
    }

    fn release(&self) {
        self.session.write().take();
    }
}

impl<P: Protocol> Service<P, TcpClient<P>> {
    /// Creates a client service speaking `protocol`.
    #[must_use]
    pub fn client(protocol: P) -> Self {
        Self::new(protocol, TcpClient::default())
    }

    /// Returns the main session, once connected.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session<P>>> {
        self.strategy().session()
    }
}
