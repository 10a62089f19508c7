/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Scheduled-task executor.
//!
//! Repeating tasks such as heartbeats run here instead of on a service's
//! event loop, so a slow task body cannot stall I/O dispatch. Each tick runs
//! the body on a blocking thread; cancellation is fire-and-forget and a body
//! already running is allowed to finish.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Body of a repeating task.
pub type TaskBody = Arc<dyn Fn() + Send + Sync>;

/// Runs repeating tasks.
pub trait TaskExecutor: Send + Sync + fmt::Debug {
    /// Runs `body` after `initial_delay` and then every `period` until the
    /// returned handle is cancelled.
    fn schedule_repeating(
        &self,
        body: TaskBody,
        initial_delay: Duration,
        period: Duration,
    ) -> ScheduledTask;
}

/// Cancellation handle of a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    /// Creates an uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops future runs. Does not wait for a running body.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the underlying token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Executor backed by a dedicated tokio runtime.
pub struct TokioTaskExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl TokioTaskExecutor {
    /// Creates an executor with one scheduler thread.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be built.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ironsim-scheduler")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }
}

impl TaskExecutor for TokioTaskExecutor {
    fn schedule_repeating(
        &self,
        body: TaskBody,
        initial_delay: Duration,
        period: Duration,
    ) -> ScheduledTask {
        let task = ScheduledTask::new();
        let token = task.token();
        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let body = Arc::clone(&body);
                if let Err(err) = tokio::task::spawn_blocking(move || body()).await
                    && err.is_panic()
                {
                    warn!("scheduled task panicked; schedule continues");
                }
            }
            debug!("scheduled task stopped");
        });
        task
    }
}

impl Drop for TokioTaskExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TokioTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTaskExecutor")
            .field("running", &self.runtime.is_some())
            .finish()
    }
}
