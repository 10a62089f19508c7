/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Pipeline stage that decodes frames and hands them to the business handler.

use crate::protocol::{MessageHandler, Protocol};
use crate::session::Session;
use bytes::BytesMut;
use ironsim_core::ChannelError;
use ironsim_transport::{Channel, ChannelHandler};
use std::sync::{Arc, Weak};

/// Pipeline name of the dispatcher.
pub const DISPATCHER_HANDLER: &str = "dispatcher";

/// Decodes each frame with the session's protocol and calls
/// [`MessageHandler::on_message`]. Decode and handler failures become
/// pipeline exceptions.
pub struct MessageDispatcher<P: Protocol> {
    session: Weak<Session<P>>,
    handler: Arc<dyn MessageHandler<P>>,
}

impl<P: Protocol> MessageDispatcher<P> {
    /// Creates a dispatcher for `session`.
    #[must_use]
    pub fn new(session: &Arc<Session<P>>, handler: Arc<dyn MessageHandler<P>>) -> Self {
        Self {
            session: Arc::downgrade(session),
            handler,
        }
    }
}

impl<P: Protocol> ChannelHandler for MessageDispatcher<P> {
    fn on_frame(
        &self,
        _channel: &dyn Channel,
        frame: BytesMut,
    ) -> Result<Option<BytesMut>, ChannelError> {
        let Some(session) = self.session.upgrade() else {
            return Ok(None);
        };
        let message = session
            .protocol()
            .decode(&frame)
            .map_err(|err| ChannelError::Handler {
                handler: DISPATCHER_HANDLER.to_string(),
                message: err.to_string(),
            })?;
        self.handler
            .on_message(&session, message)
            .map_err(|err| ChannelError::Handler {
                handler: DISPATCHER_HANDLER.to_string(),
                message: err.to_string(),
            })?;
        Ok(None)
    }

    fn on_idle(&self, _channel: &dyn Channel) {
        if let Some(session) = self.session.upgrade() {
            self.handler.on_idle(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ironsim_core::{ChannelId, ProtocolError};
    use ironsim_transport::{CloseFuture, Pipeline, WriteCompletion};
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    #[derive(Debug)]
    struct NumberProtocol;

    impl Protocol for NumberProtocol {
        type Message = u32;

        fn name(&self) -> &str {
            "number"
        }

        fn encode(&self, message: &u32) -> Result<Bytes, ProtocolError> {
            Ok(Bytes::from(message.to_string()))
        }

        fn decode(&self, frame: &[u8]) -> Result<u32, ProtocolError> {
            std::str::from_utf8(frame)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or_else(|| ProtocolError::Decode("not a number".to_string()))
        }
    }

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<u32>>,
    }

    impl MessageHandler<NumberProtocol> for Collect {
        fn on_message(
            &self,
            _session: &Arc<Session<NumberProtocol>>,
            message: u32,
        ) -> Result<(), ProtocolError> {
            if message == 13 {
                return Err(ProtocolError::Rejected("unlucky".to_string()));
            }
            self.messages.lock().push(message);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct NullChannel {
        pipeline: Pipeline,
    }

    impl Channel for NullChannel {
        fn id(&self) -> ChannelId {
            ChannelId::next()
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn pipeline(&self) -> &Pipeline {
            &self.pipeline
        }
        fn register(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        fn write(&self, _payload: Bytes) -> WriteCompletion {
            WriteCompletion::failed(ChannelError::Closed)
        }
        fn close(&self) -> CloseFuture {
            CloseFuture::completed(Ok(()))
        }
        fn close_future(&self) -> CloseFuture {
            CloseFuture::completed(Ok(()))
        }
        fn is_open(&self) -> bool {
            true
        }
        fn is_active(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_dispatch_decoded_messages() {
        let session = Arc::new(Session::detached("numbers", Arc::new(NumberProtocol)));
        let collect = Arc::new(Collect::default());
        let dispatcher = MessageDispatcher::new(&session, collect.clone());
        let channel = NullChannel::default();

        assert_eq!(
            dispatcher.on_frame(&channel, BytesMut::from(&b"42"[..])),
            Ok(None)
        );
        assert_eq!(*collect.messages.lock(), vec![42]);
    }

    #[test]
    fn test_decode_and_handler_failures_become_exceptions() {
        let session = Arc::new(Session::detached("numbers", Arc::new(NumberProtocol)));
        let collect = Arc::new(Collect::default());
        let dispatcher = MessageDispatcher::new(&session, collect.clone());
        let channel = NullChannel::default();

        assert!(matches!(
            dispatcher.on_frame(&channel, BytesMut::from(&b"forty-two"[..])),
            Err(ChannelError::Handler { .. })
        ));
        assert!(matches!(
            dispatcher.on_frame(&channel, BytesMut::from(&b"13"[..])),
            Err(ChannelError::Handler { .. })
        ));
        assert!(collect.messages.lock().is_empty());
    }
}
