/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! # IronSim
//!
//! Connection and session lifecycle framework for FIX-style test-automation
//! services.
//!
//! A service is one configured endpoint (a TCP client, a UDP multicast
//! client, or a multi-client TCP server) with a uniform lifecycle:
//! `init` → `start` → `dispose`. Progress and faults are reported through a
//! lock-free status and a monitor; lifecycle calls never fail to the caller.
//!
//! ## Features
//!
//! - **Status model**: Monotonic lifecycle with `WARNING`/`ERROR` side states
//! - **Sessions**: Blocking sends with timeouts over async channels
//! - **Heartbeats**: Per-session keep-alives on a separate executor
//! - **Fault isolation**: A failing server client never affects the others
//! - **Bounded shutdown**: `dispose` always completes within its bound
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ironsim::prelude::*;
//! use std::sync::Arc;
//!
//! let server = ServerService::server(FixProtocol::new("SERVER", "CLIENT"));
//! server.init(
//!     ServiceContext::with_defaults()?,
//!     Arc::new(LoggingMonitor),
//!     Arc::new(NoopMessageHandler),
//!     Arc::new(ServerSettings::new("127.0.0.1", 9876)),
//!     ServiceName::from("acceptor"),
//! );
//! server.start();
//! assert_eq!(server.status(), ServiceStatus::Started);
//! server.dispose();
//! ```
//!
//! ## Crate Organization
//!
//! - [`core`]: Status model, errors, settings and the monitor
//! - [`transport`]: Channels, pipelines, framing and the transport factory
//! - [`session`]: Protocol hooks, sessions and heartbeats
//! - [`service`]: Lifecycle core and the client, multicast and server variants

pub mod core {
    //! Status model, errors, settings and the monitor.
    pub use ironsim_core::*;
}

pub mod transport {
    //! Channels, pipelines, framing and the transport factory.
    pub use ironsim_transport::*;
}

pub mod session {
    //! Protocol hooks, sessions and heartbeats.
    pub use ironsim_session::*;
}

pub mod service {
    //! Lifecycle core and the service variants.
    pub use ironsim_service::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types
    pub use ironsim_core::{
        ClientSettings, CommonSettings, EventKind, EventLevel, LoggingMonitor, MulticastSettings,
        RecordingMonitor, ServerSettings, ServiceError, ServiceEvent, ServiceMonitor, ServiceName,
        ServiceSettings, ServiceStatus, SessionError,
    };

    // Session
    pub use ironsim_session::{MessageHandler, NoopMessageHandler, Protocol, Session};

    // Service
    pub use ironsim_service::{
        ClientService, FixMessage, FixProtocol, Lifecycle, MulticastClientService, ServerService,
        ServiceContext,
    };
}
