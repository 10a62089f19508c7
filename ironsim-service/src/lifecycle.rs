/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Service lifecycle core.
//!
//! A [`Service`] is a [`ServiceCore`] (status, protocol, collaborators,
//! heartbeats) plus one [`ConnectionStrategy`] (client, multicast client or
//! server). Lifecycle methods never fail to their caller: every outcome is
//! reported through the status and the monitor.
//!
//! ```text
//! CREATED → INITIALIZING → INITIALIZED → STARTING → STARTED → DISPOSING → DISPOSED
//!                 ↘ ERROR         ↘ ERROR      ↘ ERROR / WARNING
//! ```

use crate::context::ServiceContext;
use async_trait::async_trait;
use ironsim_core::monitor::notify;
use ironsim_core::{
    ChannelError, CommonSettings, ConfigError, EventKind, EventLevel, ServiceError, ServiceEvent,
    ServiceMonitor, ServiceName, ServiceSettings, ServiceStatus, StatusCell, downcast_settings,
};
use ironsim_session::{
    DISPATCHER_HANDLER, Dictionary, HeartbeatScheduler, MessageDispatcher, MessageHandler,
    NamedHandler, NoopMessageHandler, Protocol, Session,
};
use ironsim_transport::{Channel, ChannelOptions, CloseFuture, PLACEHOLDER_HANDLER, Transport};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info, warn};

/// Floor for the event-loop shutdown wait once the close waits used up the
/// shutdown bound.
const MIN_RUNTIME_SHUTDOWN: Duration = Duration::from_millis(100);

static NEXT_EVENT_LOOP: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the service event loop owning this thread, or 0.
    static EVENT_LOOP: Cell<u64> = const { Cell::new(0) };
}

/// Lifecycle operations of a service.
pub trait Lifecycle: Send + Sync {
    /// Protocol spoken by the service.
    type Protocol: Protocol;

    /// Validates settings, resolves collaborators and runs the protocol's
    /// initialization hook.
    fn init(
        &self,
        context: ServiceContext,
        monitor: Arc<dyn ServiceMonitor>,
        handler: Arc<dyn MessageHandler<Self::Protocol>>,
        settings: Arc<dyn ServiceSettings>,
        name: ServiceName,
    );

    /// Allocates the event loop and connects, binds or joins.
    ///
    /// Runs from `INITIALIZED`, or again from `ERROR` after a failed start,
    /// in which case whatever the failed attempt allocated is dropped first.
    fn start(&self);

    /// Stops heartbeats, closes sessions and releases the event loop within
    /// the shutdown bound. Idempotent.
    ///
    /// Called from one of the service's own event-loop threads, the blocking
    /// part finishes on a separate thread and this returns while the status
    /// is still `DISPOSING`.
    fn dispose(&self);

    /// Returns the current status.
    fn status(&self) -> ServiceStatus;
}

/// How a service variant acquires its connections.
#[async_trait]
pub trait ConnectionStrategy<P: Protocol>: Send + Sync + 'static {
    /// Settings type the variant expects.
    type Settings: ServiceSettings + Clone;

    /// Short variant name used in logs.
    fn kind(&self) -> &'static str;

    /// Connects, binds or joins. Runs on the service's event loop.
    ///
    /// # Errors
    /// Any error puts the service in `ERROR`.
    async fn connect(
        &self,
        core: &Arc<ServiceCore<P>>,
        settings: &Self::Settings,
    ) -> Result<(), ServiceError>;

    /// Returns every session the variant owns.
    fn sessions(&self) -> Vec<Arc<Session<P>>>;

    /// Closes endpoints that are not sessions, such as a listener.
    fn close_endpoints(&self) -> Vec<CloseFuture> {
        Vec::new()
    }

    /// Drops references to closed sessions and endpoints.
    fn release(&self) {}
}

struct Bindings<P: Protocol> {
    name: ServiceName,
    monitor: Arc<dyn ServiceMonitor>,
    handler: Arc<dyn MessageHandler<P>>,
    context: ServiceContext,
    heartbeats: HeartbeatScheduler,
    common: CommonSettings,
}

/// State and behavior shared by every service variant.
pub struct ServiceCore<P: Protocol> {
    status: StatusCell,
    protocol: Arc<P>,
    disposing: AtomicBool,
    bindings: RwLock<Option<Arc<Bindings<P>>>>,
    dictionary: RwLock<Option<Dictionary>>,
    // Held across a transition and its notification so the monitor sees
    // events in transition order. A monitor may change status from its
    // callback.
    events: ReentrantMutex<()>,
}

impl<P: Protocol> ServiceCore<P> {
    /// Creates a core in the `CREATED` state.
    #[must_use]
    pub fn new(protocol: Arc<P>) -> Self {
        Self {
            status: StatusCell::new(),
            protocol,
            disposing: AtomicBool::new(false),
            bindings: RwLock::new(None),
            dictionary: RwLock::new(None),
            events: ReentrantMutex::new(()),
        }
    }

    /// Returns the current status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    /// Returns the protocol.
    #[must_use]
    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    /// Returns the service name, or `unnamed` before `init()`.
    #[must_use]
    pub fn name(&self) -> ServiceName {
        self.bindings()
            .map_or_else(|| ServiceName::from("unnamed"), |b| b.name.clone())
    }

    /// Returns true once `dispose()` has begun.
    #[must_use]
    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// Returns the dictionary resolved by `init()`.
    #[must_use]
    pub fn dictionary(&self) -> Option<Dictionary> {
        self.dictionary.read().clone()
    }

    fn bindings(&self) -> Option<Arc<Bindings<P>>> {
        self.bindings.read().clone()
    }

    /// Returns the transport from the service context.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidState`] before `init()`.
    pub fn transport(&self) -> Result<Arc<dyn Transport>, ServiceError> {
        self.bindings()
            .map(|b| Arc::clone(b.context.transport()))
            .ok_or(ServiceError::InvalidState {
                expected: ServiceStatus::Initialized,
                current: self.status(),
            })
    }

    /// Returns channel options derived from the settings.
    #[must_use]
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            idle_timeout: self.bindings().and_then(|b| b.common.idle_timeout()),
            connect_timeout: None,
        }
    }

    /// Moves to `next` and notifies the monitor.
    ///
    /// Transitions that would regress the lifecycle, or leave `DISPOSED`,
    /// are ignored. Returns true if the status changed. Concurrent callers
    /// are notified in the order their transitions were applied.
    pub fn change_status(
        &self,
        next: ServiceStatus,
        message: impl Into<String>,
        cause: Option<ServiceError>,
    ) -> bool {
        let message = message.into();
        let name = self.name();
        let _ordered = self.events.lock();
        match self.status.transition(next) {
            Ok(previous) => {
                let cause_text = cause.as_ref().map(ToString::to_string).unwrap_or_default();
                match next {
                    ServiceStatus::Error => {
                        error!(
                            service = %name,
                            from = %previous,
                            to = %next,
                            cause = %cause_text,
                            "{message}"
                        );
                    }
                    ServiceStatus::Warning => {
                        warn!(
                            service = %name,
                            from = %previous,
                            to = %next,
                            cause = %cause_text,
                            "{message}"
                        );
                    }
                    _ => info!(service = %name, from = %previous, to = %next, "{message}"),
                }
                if let Some(bindings) = self.bindings() {
                    notify(
                        bindings.monitor.as_ref(),
                        &ServiceEvent::status(name, next, message, cause),
                    );
                }
                true
            }
            Err(current) => {
                debug!(service = %name, %current, requested = %next, "status transition ignored");
                false
            }
        }
    }

    /// Sends a non-status event to the monitor.
    pub fn emit(
        &self,
        level: EventLevel,
        kind: EventKind,
        message: impl Into<String>,
        cause: Option<ServiceError>,
    ) {
        if let Some(bindings) = self.bindings() {
            let _ordered = self.events.lock();
            notify(
                bindings.monitor.as_ref(),
                &ServiceEvent::new(bindings.name.clone(), level, kind, message, cause),
            );
        }
    }

    /// Creates a session over `channel`, named after the service and peer.
    #[must_use]
    pub fn create_session(&self, channel: Arc<dyn Channel>) -> Arc<Session<P>> {
        let peer = channel
            .remote_addr()
            .or_else(|| channel.local_addr())
            .map_or_else(|| channel.id().to_string(), |addr| addr.to_string());
        let name = format!("{}/{}", self.name(), peer);
        Arc::new(Session::new(name, Arc::clone(&self.protocol), channel))
    }

    /// Assembles the session's pipeline under its write lock: the protocol
    /// framer and handlers, the message dispatcher, then `tail`.
    ///
    /// # Errors
    /// Returns an error if the session has no channel or a handler name is
    /// taken.
    pub fn attach_pipeline(
        &self,
        session: &Arc<Session<P>>,
        tail: Vec<NamedHandler>,
    ) -> Result<(), ChannelError> {
        let channel = Arc::clone(session.channel().ok_or(ChannelError::Closed)?);
        let handler: Arc<dyn MessageHandler<P>> = match self.bindings() {
            Some(bindings) => Arc::clone(&bindings.handler),
            None => Arc::new(NoopMessageHandler),
        };
        session.with_write_lock(|| {
            let pipeline = channel.pipeline();
            pipeline.remove(PLACEHOLDER_HANDLER);
            if let Some(framer) = self.protocol.framer() {
                pipeline.set_framer(framer);
            }
            for (name, inbound) in self.protocol.inbound_handlers(session) {
                pipeline.add_last(name, inbound)?;
            }
            pipeline.add_last(
                DISPATCHER_HANDLER,
                Arc::new(MessageDispatcher::new(session, handler)),
            )?;
            for (name, terminal) in tail {
                pipeline.add_last(name, terminal)?;
            }
            Ok(())
        })
    }

    /// Starts heartbeats and tells the handler and monitor a session opened.
    pub fn session_opened(&self, session: &Arc<Session<P>>) {
        let Some(bindings) = self.bindings() else {
            return;
        };
        bindings
            .heartbeats
            .start(session, bindings.common.heartbeat_interval());
        guarded(&bindings.name, "on_session_opened", || {
            bindings.handler.on_session_opened(session);
        });
        info!(service = %bindings.name, session = %session.name(), "session opened");
        self.emit(
            EventLevel::Info,
            EventKind::SessionOpened(session.id()),
            format!("session {} opened", session.name()),
            None,
        );
    }

    /// Stops heartbeats and tells the handler and monitor a session closed.
    pub fn session_closed(&self, session: &Arc<Session<P>>) {
        let Some(bindings) = self.bindings() else {
            return;
        };
        bindings.heartbeats.stop(session.id());
        guarded(&bindings.name, "on_session_closed", || {
            bindings.handler.on_session_closed(session);
        });
        info!(service = %bindings.name, session = %session.name(), "session closed");
        self.emit(
            EventLevel::Info,
            EventKind::SessionClosed(session.id()),
            format!("session {} closed", session.name()),
            None,
        );
    }

    /// Handles an exception on a service-level session: `ERROR`, then close.
    pub fn on_exception_caught(&self, session: &Session<P>, error: &ChannelError) {
        if !self.is_disposing() {
            self.change_status(
                ServiceStatus::Error,
                format!("exception on session {}", session.name()),
                Some(error.clone().into()),
            );
        } else {
            debug!(session = %session.name(), error = %error, "exception while disposing");
        }
        session.close();
    }

    /// Handles an exception on one server child: `WARNING`, then close
    /// only that child.
    pub fn on_child_exception(&self, session: &Session<P>, error: &ChannelError) {
        if !self.is_disposing() {
            let cause = ServiceError::from(error.clone());
            self.emit(
                EventLevel::Warning,
                EventKind::SessionFault(session.id()),
                format!("closing session {} after exception", session.name()),
                Some(cause.clone()),
            );
            self.change_status(
                ServiceStatus::Warning,
                format!("client session {} failed", session.name()),
                Some(cause),
            );
        }
        session.close();
    }

    fn heartbeats_stop_all(&self) {
        if let Some(bindings) = self.bindings() {
            bindings.heartbeats.stop_all();
        }
    }
}

impl<P: Protocol> fmt::Debug for ServiceCore<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCore")
            .field("name", &self.name())
            .field("status", &self.status())
            .field("protocol", &self.protocol.name())
            .finish()
    }
}

/// A lifecycle-managed endpoint: one core plus one connection strategy.
pub struct Service<P: Protocol, C: ConnectionStrategy<P>> {
    core: Arc<ServiceCore<P>>,
    strategy: Arc<C>,
    settings: RwLock<Option<C::Settings>>,
    runtime: Mutex<Option<Runtime>>,
    event_loop: AtomicU64,
    starting: Mutex<()>,
}

impl<P: Protocol, C: ConnectionStrategy<P>> Service<P, C> {
    /// Creates a service in the `CREATED` state.
    #[must_use]
    pub fn new(protocol: P, strategy: C) -> Self {
        Self {
            core: Arc::new(ServiceCore::new(Arc::new(protocol))),
            strategy: Arc::new(strategy),
            settings: RwLock::new(None),
            runtime: Mutex::new(None),
            event_loop: AtomicU64::new(0),
            starting: Mutex::new(()),
        }
    }

    /// Returns the shared core.
    #[must_use]
    pub fn core(&self) -> &Arc<ServiceCore<P>> {
        &self.core
    }

    /// Returns the connection strategy.
    #[must_use]
    pub fn strategy(&self) -> &C {
        &self.strategy
    }

    /// Returns the service name.
    #[must_use]
    pub fn name(&self) -> ServiceName {
        self.core.name()
    }

    /// Returns the settings accepted by `init()`.
    #[must_use]
    pub fn settings(&self) -> Option<C::Settings> {
        self.settings.read().clone()
    }

    /// Returns every session the service owns.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session<P>>> {
        self.strategy.sessions()
    }

    fn shutdown_timeout(&self) -> Duration {
        self.settings.read().as_ref().map_or_else(
            || CommonSettings::default().shutdown_timeout(),
            |settings| settings.common().shutdown_timeout(),
        )
    }

    /// Returns true if the caller runs on one of this service's event-loop
    /// threads.
    fn on_own_event_loop(&self) -> bool {
        let id = self.event_loop.load(Ordering::Acquire);
        id != 0 && EVENT_LOOP.with(Cell::get) == id
    }

    fn try_init(&self, settings: &dyn ServiceSettings) -> Result<(), ServiceError> {
        let concrete = downcast_settings::<C::Settings>(settings)?;
        let bindings = self.core.bindings().ok_or(ServiceError::InvalidState {
            expected: ServiceStatus::Initializing,
            current: self.core.status(),
        })?;

        let dictionary = match &concrete.common().dictionary {
            Some(name) => Some(
                bindings
                    .context
                    .dictionaries()
                    .resolve(name)
                    .ok_or_else(|| ConfigError::DictionaryNotFound(name.clone()))?,
            ),
            None => None,
        };

        let workspace = bindings.context.workspace();
        if !workspace.is_dir() {
            return Err(ConfigError::Workspace(workspace.display().to_string()).into());
        }

        self.core.protocol.initialize(dictionary.as_ref())?;
        *self.core.dictionary.write() = dictionary;
        *self.settings.write() = Some(concrete);
        Ok(())
    }

    /// Drops whatever a failed `start()` left behind: its sessions, its
    /// endpoints and its event loop.
    fn discard_failed_start(&self) {
        self.core.heartbeats_stop_all();
        for session in self.strategy.sessions() {
            session.close();
        }
        for endpoint in self.strategy.close_endpoints() {
            debug!(
                service = %self.core.name(),
                closed = endpoint.is_done(),
                "closing endpoint of failed start"
            );
        }
        self.strategy.release();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!(service = %self.core.name(), "retrying start");
    }

    fn try_start(&self) -> Result<(), ServiceError> {
        let settings = self.settings().ok_or(ServiceError::InvalidState {
            expected: ServiceStatus::Initialized,
            current: self.core.status(),
        })?;
        let loop_id = NEXT_EVENT_LOOP.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(settings.common().worker_threads.max(1))
            .thread_name(format!("{}-io", self.core.name()))
            .on_thread_start(move || EVENT_LOOP.with(|id| id.set(loop_id)))
            .enable_all()
            .build()
            .map_err(|err| ServiceError::Runtime(err.to_string()))?;
        let handle = runtime.handle().clone();
        *self.runtime.lock() = Some(runtime);
        self.event_loop.store(loop_id, Ordering::Release);

        let core = Arc::clone(&self.core);
        let strategy = Arc::clone(&self.strategy);
        off_runtime(move || {
            handle.block_on(async move { strategy.connect(&core, &settings).await })
        })
    }
}

impl<P: Protocol, C: ConnectionStrategy<P>> Lifecycle for Service<P, C> {
    type Protocol = P;

    fn init(
        &self,
        context: ServiceContext,
        monitor: Arc<dyn ServiceMonitor>,
        handler: Arc<dyn MessageHandler<P>>,
        settings: Arc<dyn ServiceSettings>,
        name: ServiceName,
    ) {
        if !self.core.status.can_transition(ServiceStatus::Initializing) {
            warn!(service = %name, status = %self.core.status(), "init ignored");
            return;
        }
        let heartbeats = HeartbeatScheduler::new(
            Arc::clone(context.executor()),
            settings.common().heartbeat_send_timeout_ms,
        );
        *self.core.bindings.write() = Some(Arc::new(Bindings {
            name,
            monitor,
            handler,
            context,
            heartbeats,
            common: settings.common().clone(),
        }));
        if !self
            .core
            .change_status(ServiceStatus::Initializing, "initializing", None)
        {
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| self.try_init(settings.as_ref())))
            .unwrap_or_else(|payload| Err(ServiceError::from_panic("init", payload.as_ref())));
        match outcome {
            Ok(()) => {
                self.core
                    .change_status(ServiceStatus::Initialized, "initialized", None);
            }
            Err(err) => {
                self.core
                    .change_status(ServiceStatus::Error, "initialization failed", Some(err));
            }
        }
    }

    fn start(&self) {
        let Some(_starting) = self.starting.try_lock() else {
            warn!(service = %self.core.name(), "start ignored: already starting");
            return;
        };
        let current = self.core.status();
        let retry =
            current == ServiceStatus::Error && self.core.status.phase() == ServiceStatus::Starting;
        if !(current == ServiceStatus::Initialized || retry) || self.core.is_disposing() {
            warn!(
                service = %self.core.name(),
                %current,
                "start ignored: service is not initialized"
            );
            return;
        }
        if !self
            .core
            .change_status(ServiceStatus::Starting, "starting", None)
        {
            return;
        }

        let kind = self.strategy.kind();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if retry {
                self.discard_failed_start();
            }
            self.try_start()
        }))
        .unwrap_or_else(|payload| Err(ServiceError::from_panic("start", payload.as_ref())));
        match outcome {
            Ok(()) => {
                if !self.core.is_disposing() {
                    self.core
                        .change_status(ServiceStatus::Started, format!("{kind} started"), None);
                }
            }
            Err(err) => {
                self.core.change_status(
                    ServiceStatus::Error,
                    format!("{kind} failed to start"),
                    Some(err),
                );
            }
        }
    }

    fn dispose(&self) {
        if self.core.disposing.swap(true, Ordering::AcqRel) {
            debug!(service = %self.core.name(), "dispose already called");
            return;
        }
        let started = Instant::now();
        self.core
            .change_status(ServiceStatus::Disposing, "disposing", None);
        self.core.heartbeats_stop_all();

        let mut pending = Vec::new();
        for session in self.strategy.sessions() {
            match catch_unwind(AssertUnwindSafe(|| session.close())) {
                Ok(future) => pending.push((format!("session {}", session.name()), future)),
                Err(payload) => self.core.emit(
                    EventLevel::Error,
                    EventKind::Disposing,
                    format!("failed to close session {}", session.name()),
                    Some(ServiceError::from_panic("session close", payload.as_ref())),
                ),
            }
        }
        match catch_unwind(AssertUnwindSafe(|| self.strategy.close_endpoints())) {
            Ok(futures) => pending.extend(
                futures
                    .into_iter()
                    .map(|future| (format!("{} endpoint", self.strategy.kind()), future)),
            ),
            Err(payload) => self.core.emit(
                EventLevel::Error,
                EventKind::Disposing,
                "failed to close endpoints",
                Some(ServiceError::from_panic("endpoint close", payload.as_ref())),
            ),
        }

        let teardown = Teardown {
            core: Arc::clone(&self.core),
            strategy: Arc::clone(&self.strategy),
            runtime: self.runtime.lock().take(),
            pending,
            started,
            bound: self.shutdown_timeout(),
        };
        if !self.on_own_event_loop() {
            teardown.finish();
            return;
        }

        // The calling thread keeps one of the pending closes from completing
        // until it returns.
        debug!(service = %self.core.name(), "dispose called from the event loop");
        let slot = Arc::new(Mutex::new(Some(teardown)));
        let detached = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-dispose", self.core.name()))
            .spawn(move || {
                let teardown = detached.lock().take();
                if let Some(teardown) = teardown {
                    teardown.finish();
                }
            });
        if let Err(err) = spawned {
            warn!(service = %self.core.name(), error = %err, "cannot spawn dispose thread");
            let teardown = slot.lock().take();
            if let Some(teardown) = teardown {
                teardown.finish();
            }
        }
    }

    fn status(&self) -> ServiceStatus {
        self.core.status()
    }
}

impl<P: Protocol, C: ConnectionStrategy<P>> Drop for Service<P, C> {
    fn drop(&mut self) {
        self.core.heartbeats_stop_all();
        if let Some(runtime) = self.runtime.get_mut().take() {
            debug!(service = %self.core.name(), "releasing event loop of undisposed service");
            runtime.shutdown_background();
        }
    }
}

impl<P: Protocol, C: ConnectionStrategy<P>> fmt::Debug for Service<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("kind", &self.strategy.kind())
            .field("core", &self.core)
            .field("running", &self.runtime.lock().is_some())
            .finish()
    }
}

/// The part of `dispose()` that may block: waiting for closes, stopping the
/// event loop and releasing the strategy.
struct Teardown<P: Protocol, C: ConnectionStrategy<P>> {
    core: Arc<ServiceCore<P>>,
    strategy: Arc<C>,
    runtime: Option<Runtime>,
    pending: Vec<(String, CloseFuture)>,
    started: Instant,
    bound: Duration,
}

impl<P: Protocol, C: ConnectionStrategy<P>> Teardown<P, C> {
    fn finish(self) {
        let Self {
            core,
            strategy,
            runtime,
            pending,
            started,
            bound,
        } = self;
        if let Some(runtime) = runtime {
            dispose_resources(&core, runtime, pending, started + bound, bound);
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| strategy.release())) {
            core.emit(
                EventLevel::Error,
                EventKind::Disposing,
                "failed to release strategy state",
                Some(ServiceError::from_panic("release", payload.as_ref())),
            );
        }
        core.change_status(
            ServiceStatus::Disposed,
            format!("disposed in {} ms", started.elapsed().as_millis()),
            None,
        );
    }
}

/// Waits for `pending` closes and shuts the event loop down, all before
/// `deadline`.
fn dispose_resources<P: Protocol>(
    core: &Arc<ServiceCore<P>>,
    runtime: Runtime,
    pending: Vec<(String, CloseFuture)>,
    deadline: Instant,
    bound: Duration,
) {
    let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    let handle = runtime.handle().clone();
    let waiter = Arc::clone(core);
    off_runtime(move || handle.block_on(wait_closed(&waiter, pending, deadline, bound_ms)));

    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(MIN_RUNTIME_SHUTDOWN);
    let shutdown_started = Instant::now();
    off_runtime(move || runtime.shutdown_timeout(remaining));
    if shutdown_started.elapsed() >= remaining {
        core.change_status(
            ServiceStatus::Error,
            "event loop did not stop in time",
            Some(ServiceError::ShutdownTimeout {
                resource: "event loop".to_string(),
                timeout_ms: bound_ms,
            }),
        );
    }
}

async fn wait_closed<P: Protocol>(
    core: &ServiceCore<P>,
    pending: Vec<(String, CloseFuture)>,
    deadline: Instant,
    bound_ms: u64,
) {
    for (resource, future) in pending {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, future.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => core.emit(
                EventLevel::Error,
                EventKind::Disposing,
                format!("{resource} closed with error"),
                Some(err.into()),
            ),
            Err(_) => {
                core.change_status(
                    ServiceStatus::Error,
                    format!("{resource} did not close in time"),
                    Some(ServiceError::ShutdownTimeout {
                        resource,
                        timeout_ms: bound_ms,
                    }),
                );
            }
        }
    }
}

/// Runs a user callback, logging instead of propagating a panic.
fn guarded(service: &ServiceName, hook: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(service = %service, hook, "handler panicked");
    }
}

/// Runs `f` off any runtime the caller is on, so it may block.
fn off_runtime<T, F>(f: F) -> T
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    if Handle::try_current().is_err() {
        return f();
    }
    std::thread::scope(|scope| match scope.spawn(f).join() {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    })
}
