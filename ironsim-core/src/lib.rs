/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! # IronSim Core
//!
//! Core types, status model, and error definitions for the IronSim
//! connection/session lifecycle framework.
//!
//! This crate provides the building blocks shared by every IronSim crate:
//! - **Error types**: Unified error handling with `thiserror`
//! - **Status model**: `ServiceStatus` and the lock-free `StatusCell`
//! - **Monitor**: The event sink services report status changes to
//! - **Settings**: Client, server and multicast endpoint configuration
//! - **Identifiers**: `ServiceName`, `SessionId`, `ChannelId`

pub mod error;
pub mod monitor;
pub mod settings;
pub mod status;
pub mod types;

pub use error::{
    ChannelError, ConfigError, ProtocolError, Result, ServiceError, SessionError,
};
pub use monitor::{
    EventKind, EventLevel, LoggingMonitor, RecordingMonitor, ServiceEvent, ServiceMonitor,
};
pub use settings::{
    ClientSettings, CommonSettings, MulticastSettings, ServerSettings, ServiceSettings,
    downcast_settings,
};
pub use status::{ServiceStatus, StatusCell};
pub use types::{ChannelId, ServiceName, SessionId};
