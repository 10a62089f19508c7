/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Monitor / event sink interface.
//!
//! Services report status changes and lifecycle faults to a
//! [`ServiceMonitor`]. Delivery is fire-and-forget: a panicking monitor is
//! logged and never propagates back into the service.

use crate::error::ServiceError;
use crate::status::ServiceStatus;
use crate::types::{ServiceName, SessionId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{error, info, warn};

/// Severity of a monitor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventLevel {
    /// Informational.
    Info,
    /// Recoverable fault.
    Warning,
    /// Lifecycle-level fault.
    Error,
}

/// What a monitor event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The service status changed.
    StatusChanged(ServiceStatus),
    /// A session was opened.
    SessionOpened(SessionId),
    /// A session was closed.
    SessionClosed(SessionId),
    /// A session's pipeline raised an exception.
    SessionFault(SessionId),
    /// Something went wrong while disposing.
    Disposing,
}

/// A single event delivered to a [`ServiceMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    /// The reporting service.
    pub service: ServiceName,
    /// Event severity.
    pub level: EventLevel,
    /// Event kind.
    pub kind: EventKind,
    /// Human-readable description.
    pub message: String,
    /// The error that caused the event, if any.
    pub cause: Option<ServiceError>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    /// Creates a new event stamped with the current time.
    #[must_use]
    pub fn new(
        service: ServiceName,
        level: EventLevel,
        kind: EventKind,
        message: impl Into<String>,
        cause: Option<ServiceError>,
    ) -> Self {
        Self {
            service,
            level,
            kind,
            message: message.into(),
            cause,
            timestamp: Utc::now(),
        }
    }

    /// Creates a status-change event whose level follows the status.
    #[must_use]
    pub fn status(
        service: ServiceName,
        status: ServiceStatus,
        message: impl Into<String>,
        cause: Option<ServiceError>,
    ) -> Self {
        let level = match status {
            ServiceStatus::Error => EventLevel::Error,
            ServiceStatus::Warning => EventLevel::Warning,
            _ => EventLevel::Info,
        };
        Self::new(service, level, EventKind::StatusChanged(status), message, cause)
    }
}

/// Sink for service events.
pub trait ServiceMonitor: Send + Sync + fmt::Debug {
    /// Called for every event. Must not block.
    fn on_event(&self, event: &ServiceEvent);
}

/// Delivers an event, logging instead of propagating a monitor panic.
pub fn notify(monitor: &dyn ServiceMonitor, event: &ServiceEvent) {
    if catch_unwind(AssertUnwindSafe(|| monitor.on_event(event))).is_err() {
        error!(
            service = %event.service,
            kind = ?event.kind,
            "monitor panicked while handling event"
        );
    }
}

/// Monitor that renders events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMonitor;

impl ServiceMonitor for LoggingMonitor {
    fn on_event(&self, event: &ServiceEvent) {
        let cause = event
            .cause
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match event.level {
            EventLevel::Info => info!(
                service = %event.service,
                kind = ?event.kind,
                "{}",
                event.message
            ),
            EventLevel::Warning => {
                warn!(
                    service = %event.service,
                    kind = ?event.kind,
                    cause = %cause,
                    "{}",
                    event.message
                )
            }
            EventLevel::Error => {
                error!(
                    service = %event.service,
                    kind = ?event.kind,
                    cause = %cause,
                    "{}",
                    event.message
                )
            }
        }
    }
}

/// Monitor that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<ServiceEvent>>,
}

impl RecordingMonitor {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<ServiceEvent> {
        self.events.lock().clone()
    }

    /// Returns the recorded status changes in order.
    #[must_use]
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event.kind {
                EventKind::StatusChanged(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Returns the recorded events of the given level.
    #[must_use]
    pub fn with_level(&self, level: EventLevel) -> Vec<ServiceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == level)
            .cloned()
            .collect()
    }

    /// Removes all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ServiceMonitor for RecordingMonitor {
    fn on_event(&self, event: &ServiceEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PanickingMonitor;

    impl ServiceMonitor for PanickingMonitor {
        fn on_event(&self, _event: &ServiceEvent) {
            panic!("monitor failure");
        }
    }

    #[test]
    fn test_recording_monitor() {
        let monitor = RecordingMonitor::new();
        let name = ServiceName::from("svc");
        notify(
            &monitor,
            &ServiceEvent::status(name.clone(), ServiceStatus::Initializing, "init", None),
        );
        notify(
            &monitor,
            &ServiceEvent::status(name, ServiceStatus::Error, "boom", None),
        );

        assert_eq!(
            monitor.statuses(),
            vec![ServiceStatus::Initializing, ServiceStatus::Error]
        );
        assert_eq!(monitor.with_level(EventLevel::Error).len(), 1);

        monitor.clear();
        assert!(monitor.events().is_empty());
    }

    #[test]
    fn test_notify_swallows_monitor_panic() {
        let event = ServiceEvent::status(
            ServiceName::from("svc"),
            ServiceStatus::Started,
            "started",
            None,
        );
        notify(&PanickingMonitor, &event);
    }

    #[test]
    fn test_status_event_level() {
        let name = ServiceName::from("svc");
        assert_eq!(
            ServiceEvent::status(name.clone(), ServiceStatus::Warning, "", None).level,
            EventLevel::Warning
        );
        assert_eq!(
            ServiceEvent::status(name, ServiceStatus::Started, "", None).level,
            EventLevel::Info
        );
    }
}
