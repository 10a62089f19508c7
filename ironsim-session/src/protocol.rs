/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Protocol and business handler hooks.
//!
//! A [`Protocol`] supplies everything protocol-specific a service needs:
//! framing, encoding, decoding, extra inbound handlers and the heartbeat
//! message. A [`MessageHandler`] is the business logic receiving decoded
//! messages and session events.

use crate::session::Session;
use bytes::Bytes;
use ironsim_core::{ProtocolError, SessionError};
use ironsim_transport::{ChannelHandler, Framer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Free-form metadata accompanying a raw send.
pub type Metadata = HashMap<String, String>;

/// A named inbound handler contributed by a protocol.
pub type NamedHandler = (String, Arc<dyn ChannelHandler>);

/// A resolved message dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    /// Dictionary name, e.g. `FIX44`.
    pub name: String,
    /// BeginString of messages built from this dictionary.
    pub begin_string: String,
}

impl Dictionary {
    /// Creates a dictionary description.
    #[must_use]
    pub fn new(name: impl Into<String>, begin_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            begin_string: begin_string.into(),
        }
    }
}

/// Protocol-specific behavior plugged into a service.
pub trait Protocol: Send + Sync + fmt::Debug + Sized + 'static {
    /// Decoded message type.
    type Message: Send + fmt::Debug + 'static;

    /// Returns the protocol name used in logs and session names.
    fn name(&self) -> &str;

    /// Called once from `init()` with the resolved dictionary.
    ///
    /// # Errors
    /// An error fails `init()`.
    fn initialize(&self, dictionary: Option<&Dictionary>) -> Result<(), ProtocolError> {
        let _ = dictionary;
        Ok(())
    }

    /// Returns a fresh framer for one channel, if the protocol is framed.
    fn framer(&self) -> Option<Box<dyn Framer>> {
        None
    }

    /// Encodes an outbound message.
    ///
    /// # Errors
    /// Returns an error if the message cannot be encoded.
    fn encode(&self, message: &Self::Message) -> Result<Bytes, ProtocolError>;

    /// Decodes one inbound frame.
    ///
    /// # Errors
    /// Returns an error if the frame is not a valid message.
    fn decode(&self, frame: &[u8]) -> Result<Self::Message, ProtocolError>;

    /// Prepares an uninterpreted payload for the wire.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be prepared.
    fn encode_raw(&self, payload: &[u8], metadata: &Metadata) -> Result<Bytes, ProtocolError> {
        let _ = metadata;
        Ok(Bytes::copy_from_slice(payload))
    }

    /// Returns handlers to place ahead of the message dispatcher.
    fn inbound_handlers(&self, session: &Arc<Session<Self>>) -> Vec<NamedHandler> {
        let _ = session;
        Vec::new()
    }

    /// Sends one keep-alive on `session`.
    ///
    /// # Errors
    /// Returns the send error; the heartbeat schedule continues regardless.
    fn send_heartbeat(
        &self,
        session: &Session<Self>,
        timeout_millis: u64,
    ) -> Result<(), SessionError> {
        let _ = (session, timeout_millis);
        Ok(())
    }
}

/// Business logic receiving decoded messages.
pub trait MessageHandler<P: Protocol>: Send + Sync {
    /// Handles one decoded inbound message.
    ///
    /// # Errors
    /// An error is routed through the session's exception path.
    fn on_message(
        &self,
        session: &Arc<Session<P>>,
        message: P::Message,
    ) -> Result<(), ProtocolError>;

    /// Called when a session has been attached and registered.
    fn on_session_opened(&self, session: &Arc<Session<P>>) {
        let _ = session;
    }

    /// Called when a session's channel has become inactive.
    fn on_session_closed(&self, session: &Arc<Session<P>>) {
        let _ = session;
    }

    /// Called when no inbound traffic arrived within the idle timeout.
    fn on_idle(&self, session: &Arc<Session<P>>) {
        let _ = session;
    }
}

/// A handler that accepts and drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMessageHandler;

impl<P: Protocol> MessageHandler<P> for NoopMessageHandler {
    fn on_message(
        &self,
        _session: &Arc<Session<P>>,
        _message: P::Message,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}
