/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! # IronSim Transport
//!
//! Network transport layer for the IronSim session framework.
//!
//! This crate provides:
//! - **Channels**: TCP streams, TCP listeners and UDP multicast sockets
//! - **Pipeline**: Named inbound handlers behind an optional framer
//! - **Codec**: FIX tag=value framing
//! - **Transport**: The factory services use to open channels

pub mod channel;
pub mod codec;
pub mod pipeline;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use channel::{Channel, CloseFuture, CloseOutcome, WriteCompletion, WritePromise};
pub use codec::{CodecError, FixFramer, Framer};
pub use pipeline::{ChannelHandler, NoopHandler, PLACEHOLDER_HANDLER, Pipeline};
pub use tcp::{ChildInitializer, TcpChannel, TcpListenerChannel};
pub use transport::{ChannelOptions, TokioTransport, Transport};
pub use udp::{MulticastChannel, MulticastOptions, UdpChannel, resolve_interface};
