/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! # IronSim Service
//!
//! Lifecycle-managed endpoints for IronSim.
//!
//! This crate provides:
//! - **Lifecycle core**: `init` → `start` → `dispose` with status reporting
//! - **Client**: One outbound TCP session
//! - **Multicast client**: One UDP multicast group session
//! - **Server**: A listener with isolated child sessions
//! - **FIX protocol**: A tag=value protocol for demos and tests

pub mod client;
pub mod context;
pub mod fix;
pub mod lifecycle;
pub mod multicast;
pub mod router;
pub mod server;

#[cfg(test)]
mod testing;

pub use client::{ClientService, TcpClient};
pub use context::{DictionaryProvider, ServiceContext, StaticDictionaryProvider};
pub use fix::{FixMessage, FixProtocol};
pub use lifecycle::{ConnectionStrategy, Lifecycle, Service, ServiceCore};
pub use multicast::{MulticastClientService, UdpMulticast};
pub use router::{DEREGISTRATION_HANDLER, EXCEPTION_ROUTER, ExceptionRouter, InactiveHook};
pub use server::{ServerService, TcpServer};
