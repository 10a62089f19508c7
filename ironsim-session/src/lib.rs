/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! # IronSim Session
//!
//! Session layer of the IronSim connection/session lifecycle framework.
//!
//! This crate provides:
//! - **Protocol hooks**: Framing, encoding, decoding and heartbeat messages
//! - **Session**: Blocking sends with timeouts over a transport channel
//! - **Dispatcher**: Decodes inbound frames for the business handler
//! - **Heartbeats**: Per-session repeating keep-alives on a separate executor

pub mod dispatcher;
pub mod executor;
pub mod heartbeat;
pub mod protocol;
pub mod session;

pub use dispatcher::{DISPATCHER_HANDLER, MessageDispatcher};
pub use executor::{ScheduledTask, TaskBody, TaskExecutor, TokioTaskExecutor};
pub use heartbeat::HeartbeatScheduler;
pub use protocol::{
    Dictionary, MessageHandler, Metadata, NamedHandler, NoopMessageHandler, Protocol,
};
pub use session::Session;
