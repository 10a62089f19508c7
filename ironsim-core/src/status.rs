/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Service lifecycle status model.
//!
//! Status moves forward through the lifecycle:
//!
//! ```text
//! CREATED → INITIALIZING → INITIALIZED → STARTING → STARTED → DISPOSING → DISPOSED
//! ```
//!
//! `WARNING` and `ERROR` may be entered from any non-terminal state and may be
//! superseded later without regressing lifecycle progress. `DISPOSED` is
//! absorbing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

/// Lifecycle state of a service.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Constructed, not yet initialized.
    Created = 0,
    /// `init()` in progress.
    Initializing = 1,
    /// Ready to start.
    Initialized = 2,
    /// `start()` in progress.
    Starting = 3,
    /// Connected or listening.
    Started = 4,
    /// A recoverable fault occurred (e.g. one server child failed).
    Warning = 5,
    /// A lifecycle-level fault occurred.
    Error = 6,
    /// `dispose()` in progress.
    Disposing = 7,
    /// Terminal state.
    Disposed = 8,
}

impl ServiceStatus {
    /// Returns true for `WARNING` and `ERROR`.
    #[inline]
    #[must_use]
    pub const fn is_fault(self) -> bool {
        matches!(self, Self::Warning | Self::Error)
    }

    /// Returns true for `DISPOSED`.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disposed)
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Disposing => "DISPOSING",
            Self::Disposed => "DISPOSED",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Initializing,
            2 => Self::Initialized,
            3 => Self::Starting,
            4 => Self::Started,
            5 => Self::Warning,
            6 => Self::Error,
            7 => Self::Disposing,
            _ => Self::Disposed,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free holder for a service's status.
///
/// Packs the visible status together with the lifecycle phase (the last
/// non-fault status) into one atomic word, so a transition is validated and
/// applied with a single compare-and-swap. Readers never block.
#[derive(Debug)]
pub struct StatusCell {
    state: AtomicU16,
}

impl StatusCell {
    /// Creates a cell in the `CREATED` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU16::new(pack(ServiceStatus::Created, ServiceStatus::Created)),
        }
    }

    /// Returns the current status.
    #[inline]
    #[must_use]
    pub fn get(&self) -> ServiceStatus {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Returns the lifecycle phase, ignoring any `WARNING`/`ERROR` overlay.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> ServiceStatus {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    /// Returns true if `next` would currently be accepted.
    #[must_use]
    pub fn can_transition(&self, next: ServiceStatus) -> bool {
        let (status, phase) = unpack(self.state.load(Ordering::Acquire));
        is_legal(status, phase, next)
    }

    /// Atomically moves to `next`.
    ///
    /// # Returns
    /// `Ok(previous)` when applied, `Err(current)` when the transition would
    /// regress the lifecycle or the cell is already `DISPOSED`.
    pub fn transition(&self, next: ServiceStatus) -> Result<ServiceStatus, ServiceStatus> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (status, phase) = unpack(current);
            if !is_legal(status, phase, next) {
                return Err(status);
            }
            let next_phase = if next.is_fault() { phase } else { next };
            match self.state.compare_exchange_weak(
                current,
                pack(next, next_phase),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(status),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

const fn pack(status: ServiceStatus, phase: ServiceStatus) -> u16 {
    ((status as u16) << 8) | phase as u16
}

const fn unpack(value: u16) -> (ServiceStatus, ServiceStatus) {
    (
        ServiceStatus::from_u8((value >> 8) as u8),
        ServiceStatus::from_u8((value & 0xff) as u8),
    )
}

const fn is_legal(status: ServiceStatus, phase: ServiceStatus, next: ServiceStatus) -> bool {
    if status.is_terminal() {
        return false;
    }
    next.is_fault() || next as u8 >= phase as u8
}
