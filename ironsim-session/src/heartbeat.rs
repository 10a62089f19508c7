/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Per-session heartbeat scheduling.
//!
//! The scheduler keeps at most one repeating task per session in a
//! concurrent map. Each tick calls [`Protocol::send_heartbeat`]; a failed or
//! panicking heartbeat is logged and the schedule carries on.

use crate::executor::{ScheduledTask, TaskBody, TaskExecutor};
use crate::protocol::Protocol;
use crate::session::Session;
use dashmap::DashMap;
use ironsim_core::SessionId;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Starts and stops heartbeat tasks for sessions.
pub struct HeartbeatScheduler {
    executor: Arc<dyn TaskExecutor>,
    tasks: DashMap<SessionId, ScheduledTask>,
    send_timeout_millis: u64,
}

impl HeartbeatScheduler {
    /// Creates a scheduler running tasks on `executor`. Each heartbeat send
    /// waits at most `send_timeout_millis`.
    #[must_use]
    pub fn new(executor: Arc<dyn TaskExecutor>, send_timeout_millis: u64) -> Self {
        Self {
            executor,
            tasks: DashMap::new(),
            send_timeout_millis: send_timeout_millis.max(1),
        }
    }

    /// Starts heartbeats for `session` every `interval`.
    ///
    /// A zero interval is a no-op. Starting twice without stopping is a
    /// programming fault: it is logged and the stale task is cancelled.
    pub fn start<P: Protocol>(&self, session: &Arc<Session<P>>, interval: Duration) {
        if interval.is_zero() {
            debug!(session = %session.name(), "heartbeats disabled");
            return;
        }

        let weak = Arc::downgrade(session);
        let timeout_millis = self.send_timeout_millis;
        let body: TaskBody = Arc::new(move || {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.is_closed() {
                return;
            }
            match catch_unwind(AssertUnwindSafe(|| {
                session.protocol().send_heartbeat(&session, timeout_millis)
            })) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(session = %session.name(), error = %err, "heartbeat failed"),
                Err(_) => warn!(session = %session.name(), "heartbeat panicked"),
            }
        });

        let task = self.executor.schedule_repeating(body, interval, interval);
        if let Some(stale) = self.tasks.insert(session.id(), task) {
            error!(
                session = %session.name(),
                "heartbeats started twice without stopping; cancelling stale task"
            );
            stale.cancel();
        }
        debug!(session = %session.name(), interval_ms = interval.as_millis(), "heartbeats started");
    }

    /// Stops heartbeats for `session`. No-op if none are running.
    pub fn stop(&self, session: SessionId) {
        if let Some((_, task)) = self.tasks.remove(&session) {
            task.cancel();
            debug!(%session, "heartbeats stopped");
        }
    }

    /// Stops every heartbeat task.
    pub fn stop_all(&self) {
        let sessions: Vec<SessionId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for session in sessions {
            self.stop(session);
        }
    }

    /// Returns true if a task is installed for `session`.
    #[must_use]
    pub fn is_running(&self, session: SessionId) -> bool {
        self.tasks.contains_key(&session)
    }

    /// Returns the number of installed tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no task is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl fmt::Debug for HeartbeatScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatScheduler")
            .field("tasks", &self.tasks.len())
            .field("send_timeout_millis", &self.send_timeout_millis)
            .finish()
    }
}
