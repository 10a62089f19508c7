/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Terminal pipeline handlers installed by services.

use ironsim_core::ChannelError;
use ironsim_transport::{Channel, ChannelHandler};

/// Pipeline name of the exception router.
pub const EXCEPTION_ROUTER: &str = "exception-router";

/// Pipeline name of the server's child deregistration handler.
pub const DEREGISTRATION_HANDLER: &str = "deregistration";

type ExceptionCallback = Box<dyn Fn(&dyn Channel, &ChannelError) + Send + Sync>;
type InactiveCallback = Box<dyn Fn(&dyn Channel) + Send + Sync>;

/// Handles every exception reaching it by calling a service callback.
pub struct ExceptionRouter {
    route: ExceptionCallback,
}

impl ExceptionRouter {
    /// Creates a router calling `route` for each exception.
    pub fn new<F>(route: F) -> Self
    where
        F: Fn(&dyn Channel, &ChannelError) + Send + Sync + 'static,
    {
        Self {
            route: Box::new(route),
        }
    }
}

impl ChannelHandler for ExceptionRouter {
    fn on_exception(&self, channel: &dyn Channel, error: &ChannelError) -> bool {
        (self.route)(channel, error);
        true
    }
}

/// Runs a callback once the channel is inactive.
pub struct InactiveHook {
    hook: InactiveCallback,
}

impl InactiveHook {
    /// Creates a handler calling `hook` when the channel goes inactive.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&dyn Channel) + Send + Sync + 'static,
    {
        Self {
            hook: Box::new(hook),
        }
    }
}

impl ChannelHandler for InactiveHook {
    fn on_inactive(&self, channel: &dyn Channel) {
        (self.hook)(channel);
    }
}
