/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Shared helpers for service tests.

use crate::context::ServiceContext;
use crate::fix::FixMessage;
use ironsim_core::{ProtocolError, RecordingMonitor, ServiceStatus};
use ironsim_session::{MessageHandler, Protocol, Session};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Polls `condition` every 10 ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Context with default collaborators.
pub fn context() -> ServiceContext {
    ServiceContext::with_defaults().unwrap()
}

/// Monitor recording every event.
pub fn monitor() -> Arc<RecordingMonitor> {
    Arc::new(RecordingMonitor::new())
}

/// Returns true if `monitor` saw `status`.
pub fn saw(monitor: &RecordingMonitor, status: ServiceStatus) -> bool {
    monitor.statuses().contains(&status)
}

/// Handler collecting decoded messages and session events.
#[derive(Default)]
pub struct Collector {
    pub messages: Mutex<Vec<FixMessage>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Collector {
    pub fn received(&self) -> usize {
        self.messages.lock().len()
    }
}

impl<P: Protocol<Message = FixMessage>> MessageHandler<P> for Collector {
    fn on_message(
        &self,
        _session: &Arc<Session<P>>,
        message: FixMessage,
    ) -> Result<(), ProtocolError> {
        self.messages.lock().push(message);
        Ok(())
    }

    fn on_session_opened(&self, _session: &Arc<Session<P>>) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_session_closed(&self, _session: &Arc<Session<P>>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
