//! PeerSession: owns one engine instance, its main-loop driver and event queue,
//! and delivers engine events to user callbacks on the host runtime.
//!
//! Locking: the session mutex guards state, derived flags, negotiation phase and
//! callback slots. It is held for field access only, never across an engine call
//! or a user callback, so callbacks may call back into the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{MainLoopDriver, DEFAULT_ITERATE_INTERVAL};
use crate::engine::{DataFrame, EngineConfig, EngineHooks, EngineOpener, PeerEngine};
use crate::error::{EngineOp, Result, SessionError};
use crate::event::{payload_text, DataKind, Event, Negotiation, SdpClassifier, SdpKind, SignalKind};
use crate::queue::{EventQueue, DEFAULT_QUEUE_CAPACITY};
use crate::scheduler::HostScheduler;
use crate::state::{ConnectionState, Role, StateFlags};

/// Largest payload `send` accepts.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65535;

/// How long `close` waits for the driver to notice it was stopped.
pub const DEFAULT_DRIVER_STOP_WAIT: Duration = Duration::from_millis(100);

pub type TextCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub max_message_size: usize,
    pub iterate_interval: Duration,
    pub driver_stop_wait: Duration,
    pub sdp_classifier: SdpClassifier,
    /// Stream used by `send`, `send_text` and `send_raw`.
    pub default_stream_id: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            iterate_interval: DEFAULT_ITERATE_INTERVAL,
            driver_stop_wait: DEFAULT_DRIVER_STOP_WAIT,
            sdp_classifier: SdpClassifier::Negotiation,
            default_stream_id: 0,
        }
    }
}

impl SessionConfig {
    pub fn queue_capacity(mut self, slots: usize) -> Self {
        self.queue_capacity = slots;
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn iterate_interval(mut self, interval: Duration) -> Self {
        self.iterate_interval = interval;
        self
    }

    pub fn driver_stop_wait(mut self, wait: Duration) -> Self {
        self.driver_stop_wait = wait;
        self
    }

    pub fn sdp_classifier(mut self, classifier: SdpClassifier) -> Self {
        self.sdp_classifier = classifier;
        self
    }
}

#[derive(Default, Clone)]
struct Callbacks {
    on_offer: Option<TextCallback>,
    on_answer: Option<TextCallback>,
    on_ice: Option<TextCallback>,
    on_data: Option<DataCallback>,
    on_state: Option<StateCallback>,
    on_error: Option<TextCallback>,
}

struct Inner {
    engine: Option<Arc<dyn PeerEngine>>,
    state: ConnectionState,
    flags: StateFlags,
    negotiation: Negotiation,
    callbacks: Callbacks,
    driver_running: bool,
}

/// State reachable from engine hooks, the driver and scheduled dispatcher runs.
struct Shared {
    id: Uuid,
    role: Role,
    config: SessionConfig,
    queue: EventQueue,
    inner: Mutex<Inner>,
    scheduler: Option<Arc<dyn HostScheduler>>,
    wake_pending: AtomicBool,
    dispatching: AtomicBool,
}

impl Shared {
    fn engine(&self) -> Result<Arc<dyn PeerEngine>> {
        self.inner
            .lock()
            .engine
            .clone()
            .ok_or(SessionError::NotInitialized)
    }

    /// Driver poll: the engine to iterate, or None to stop.
    fn driver_next(&self) -> Option<Arc<dyn PeerEngine>> {
        let inner = self.inner.lock();
        if inner.driver_running {
            inner.engine.clone()
        } else {
            None
        }
    }

    /// Take the engine away from the session. Afterwards every method fails with NotInitialized.
    fn detach_engine(&self) -> Option<Arc<dyn PeerEngine>> {
        let mut inner = self.inner.lock();
        let engine = inner.engine.take()?;
        inner.state = ConnectionState::Closed;
        inner.flags = StateFlags::default();
        inner.driver_running = false;
        Some(engine)
    }

    /// Producer side: never blocks on the host.
    fn enqueue(self: &Arc<Self>, event: Event) {
        if self.queue.push(event) {
            self.wake();
        }
    }

    /// Ask the host to run the dispatcher. Wakes coalesce until the dispatcher starts.
    fn wake(self: &Arc<Self>) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if self.wake_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let wake = WakeTask {
            shared: Arc::downgrade(self),
            ran: false,
        };
        scheduler.schedule(Box::new(move || wake.run()));
    }

    fn apply_state(&self, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.engine.is_none() {
            return false;
        }
        if !inner.state.can_transition_to(state) {
            warn!(from = %inner.state, to = %state, "unexpected state transition");
        }
        inner.state = state;
        inner.flags = StateFlags::from(state);
        true
    }

    fn classify_local_sdp(&self, sdp: &str) -> SdpKind {
        match self.config.sdp_classifier {
            SdpClassifier::DirectionAttributes => SdpClassifier::by_direction(sdp),
            SdpClassifier::Negotiation => self.inner.lock().negotiation.local_kind(self.role),
        }
    }

    /// Consumer side: drain everything queued, in order. Re-entrant calls return 0.
    fn dispatch(self: &Arc<Self>) -> usize {
        if self.dispatching.swap(true, Ordering::Acquire) {
            return 0;
        }
        let processed = {
            let _guard = DispatchGuard(&self.dispatching);
            self.wake_pending.store(false, Ordering::Release);
            let mut processed = 0;
            while let Some(event) = self.queue.pop() {
                self.deliver(event);
                processed += 1;
            }
            processed
        };
        // A wake that raced with the end of the drain was swallowed by the busy check.
        if !self.queue.is_empty() {
            self.wake_pending.store(false, Ordering::Release);
            self.wake();
        }
        processed
    }

    fn deliver(&self, event: Event) {
        debug!(category = ?event.category(), "dispatching event");
        match event {
            Event::SdpOffer(sdp) => {
                if let Some(cb) = self.callbacks().on_offer {
                    cb(sdp);
                }
            }
            Event::SdpAnswer(sdp) => {
                if let Some(cb) = self.callbacks().on_answer {
                    cb(sdp);
                }
            }
            Event::IceCandidate(candidate) => {
                if let Some(cb) = self.callbacks().on_ice {
                    cb(candidate);
                }
            }
            Event::DataReceived { data, .. } => {
                if let Some(cb) = self.callbacks().on_data {
                    cb(data);
                }
            }
            Event::StateChanged(state) => {
                if let Some(cb) = self.callbacks().on_state {
                    cb(state);
                }
            }
            Event::EngineError(message) => match self.callbacks().on_error {
                Some(cb) => cb(message),
                None => warn!(%message, "engine error with no handler"),
            },
        }
    }

    /// Snapshot of the callback slots; released before any callback runs.
    fn callbacks(&self) -> Callbacks {
        self.inner.lock().callbacks.clone()
    }
}

/// A scheduled dispatcher run. If the host discards it unrun, the pending flag is
/// cleared so the next event schedules again.
struct WakeTask {
    shared: Weak<Shared>,
    ran: bool,
}

impl WakeTask {
    fn run(mut self) {
        self.ran = true;
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch();
        }
    }
}

impl Drop for WakeTask {
    fn drop(&mut self) {
        if self.ran {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.wake_pending.store(false, Ordering::Release);
        }
    }
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Context the engine carries into every callback.
struct SessionHooks {
    shared: Weak<Shared>,
}

impl EngineHooks for SessionHooks {
    fn on_message(&self, kind: SignalKind, payload: &[u8]) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if payload.is_empty() {
            return;
        }
        let text = payload_text(payload);
        let event = match kind {
            SignalKind::Sdp => {
                let sdp_kind = shared.classify_local_sdp(&text);
                debug!(?sdp_kind, len = text.len(), "local description ready");
                Event::sdp(sdp_kind, text)
            }
            SignalKind::IceCandidate => Event::IceCandidate(text),
        };
        shared.enqueue(event);
    }

    fn on_state(&self, state: ConnectionState) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!(%state, "state changed");
        if shared.apply_state(state) {
            shared.enqueue(Event::StateChanged(state));
        }
    }

    fn on_data(&self, frame: DataFrame<'_>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if frame.data.is_empty() {
            return;
        }
        debug!(
            len = frame.data.len(),
            stream_id = frame.stream_id,
            kind = ?frame.kind,
            "data received"
        );
        shared.enqueue(Event::DataReceived {
            data: frame.data.to_vec(),
            stream_id: frame.stream_id,
            kind: frame.kind,
        });
    }

    fn on_error(&self, message: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        warn!(%message, "engine reported error");
        shared.enqueue(Event::EngineError(message.to_string()));
    }
}

/// Builder for sessions with a non-default configuration or a host scheduler.
pub struct SessionBuilder {
    role: Role,
    engine_config: EngineConfig,
    config: SessionConfig,
    scheduler: Option<Arc<dyn HostScheduler>>,
}

impl SessionBuilder {
    pub fn engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Without a scheduler the host drains events itself with `process_queue`.
    pub fn scheduler(mut self, scheduler: Arc<dyn HostScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn open(self, opener: &dyn EngineOpener) -> Result<PeerSession> {
        PeerSession::open_with(self, opener)
    }
}

/// One negotiated peer-to-peer data-channel session.
///
/// Dropping a session starts the background close and does not wait for it. Call
/// `close()` then `wait_closed()`, or `close_sync()`, before dropping when teardown
/// must be complete, e.g. before opening a replacement session on the same engine.
pub struct PeerSession {
    shared: Arc<Shared>,
    driver: Mutex<Option<MainLoopDriver>>,
    closer: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    /// Open an engine with default configuration and no host scheduler.
    pub fn new(role: Role, opener: &dyn EngineOpener, engine_config: EngineConfig) -> Result<Self> {
        Self::builder(role).engine_config(engine_config).open(opener)
    }

    pub fn builder(role: Role) -> SessionBuilder {
        SessionBuilder {
            role,
            engine_config: EngineConfig::default(),
            config: SessionConfig::default(),
            scheduler: None,
        }
    }

    fn open_with(builder: SessionBuilder, opener: &dyn EngineOpener) -> Result<Self> {
        let SessionBuilder {
            role,
            engine_config,
            config,
            scheduler,
        } = builder;
        let queue = EventQueue::new(config.queue_capacity)?;
        let interval = config.iterate_interval;
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            role,
            config,
            queue,
            inner: Mutex::new(Inner {
                engine: None,
                state: ConnectionState::Closed,
                flags: StateFlags::default(),
                negotiation: Negotiation::default(),
                callbacks: Callbacks::default(),
                driver_running: false,
            }),
            scheduler,
            wake_pending: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
        });
        let hooks = Arc::new(SessionHooks {
            shared: Arc::downgrade(&shared),
        });
        let engine = opener.open(role, &engine_config, hooks).map_err(|status| {
            error!(%status, "failed to open peer engine");
            SessionError::EngineInitError(status)
        })?;
        {
            let mut inner = shared.inner.lock();
            inner.engine = Some(engine);
            inner.driver_running = true;
        }
        let driver_shared = shared.clone();
        let driver = match MainLoopDriver::spawn(interval, move || driver_shared.driver_next()) {
            Ok(driver) => driver,
            Err(e) => {
                error!(error = %e, "failed to start main-loop driver");
                if let Some(engine) = shared.detach_engine() {
                    engine.close();
                }
                return Err(SessionError::AllocationFailure("main-loop driver"));
            }
        };
        info!(session = %shared.id, %role, "peer session created");
        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
            closer: Mutex::new(None),
        })
    }

    /// Random id tagging this session's log lines.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Connected or later, short of a disconnect or failure.
    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().flags.connected
    }

    pub fn is_data_channel_open(&self) -> bool {
        self.shared.inner.lock().flags.data_channel_open
    }

    /// Events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.shared.queue.dropped()
    }

    /// Events waiting for the dispatcher.
    pub fn queued_events(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn on_offer<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.shared.inner.lock().callbacks.on_offer = Some(Arc::new(callback));
    }

    pub fn on_answer<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.shared.inner.lock().callbacks.on_answer = Some(Arc::new(callback));
    }

    pub fn on_ice<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.shared.inner.lock().callbacks.on_ice = Some(Arc::new(callback));
    }

    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.shared.inner.lock().callbacks.on_data = Some(Arc::new(callback));
    }

    pub fn on_state<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared.inner.lock().callbacks.on_state = Some(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.shared.inner.lock().callbacks.on_error = Some(Arc::new(callback));
    }

    /// Begin a connection attempt. Controlling: the offer arrives via `on_offer`.
    /// Controlled: must precede `set_remote_description` with the remote offer.
    pub fn start_connection(&self) -> Result<()> {
        let engine = self.shared.engine()?;
        self.shared.inner.lock().negotiation = Negotiation::default();
        engine.new_connection().map_err(|status| {
            warn!(%status, "failed to start connection");
            SessionError::EngineRejected {
                op: EngineOp::NewConnection,
                status,
            }
        })?;
        info!(session = %self.shared.id, role = %self.shared.role, "connection started");
        Ok(())
    }

    /// Alias for `start_connection`, for the controlling side.
    pub fn create_offer(&self) -> Result<()> {
        self.start_connection()
    }

    pub fn set_remote_description(&self, sdp: &str) -> Result<()> {
        let engine = self.shared.engine()?;
        let previous = {
            let mut inner = self.shared.inner.lock();
            let previous = inner.negotiation;
            inner.negotiation.remote_applied();
            previous
        };
        if let Err(status) = engine.send_signal(SignalKind::Sdp, sdp.as_bytes()) {
            self.shared.inner.lock().negotiation = previous;
            warn!(%status, "failed to set remote description");
            return Err(SessionError::EngineRejected {
                op: EngineOp::SetRemoteDescription,
                status,
            });
        }
        info!(len = sdp.len(), "remote description set");
        Ok(())
    }

    pub fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let engine = self.shared.engine()?;
        engine
            .send_signal(SignalKind::IceCandidate, candidate.as_bytes())
            .map_err(|status| {
                warn!(%status, "failed to add ICE candidate");
                SessionError::EngineRejected {
                    op: EngineOp::AddIceCandidate,
                    status,
                }
            })?;
        debug!("ICE candidate added");
        Ok(())
    }

    /// Send binary data on the default stream. Requires an open data channel.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.send_kind(DataKind::Binary, data)
    }

    /// Send a text frame on the default stream.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_kind(DataKind::Text, text.as_bytes())
    }

    fn send_kind(&self, kind: DataKind, data: &[u8]) -> Result<()> {
        let engine = {
            let inner = self.shared.inner.lock();
            let engine = inner.engine.clone().ok_or(SessionError::NotInitialized)?;
            if !inner.flags.data_channel_open {
                return Err(SessionError::ChannelNotOpen);
            }
            engine
        };
        let max = self.shared.config.max_message_size;
        if data.len() > max {
            return Err(SessionError::MessageTooLarge {
                len: data.len(),
                max,
            });
        }
        self.forward_data(&engine, kind, data)?;
        debug!(len = data.len(), ?kind, "sent via data channel");
        Ok(())
    }

    /// Hand bytes straight to the engine on the default stream without the open-channel
    /// check. For native code that tracks the channel itself. Empty payloads are ignored.
    pub fn send_raw(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let engine = self.shared.engine()?;
        self.forward_data(&engine, DataKind::Binary, data)
    }

    fn forward_data(&self, engine: &Arc<dyn PeerEngine>, kind: DataKind, data: &[u8]) -> Result<()> {
        let frame = DataFrame {
            kind,
            stream_id: self.shared.config.default_stream_id,
            data,
        };
        engine.send_data(frame).map_err(|status| {
            warn!(%status, len = data.len(), "failed to send data");
            SessionError::EngineRejected {
                op: EngineOp::SendData,
                status,
            }
        })
    }

    /// Drop the negotiated session, keeping the engine for a later `start_connection`.
    /// Best effort and idempotent.
    pub fn disconnect(&self) {
        let engine = self.shared.inner.lock().engine.clone();
        if let Some(engine) = engine {
            info!(session = %self.shared.id, "disconnecting current session");
            if let Err(status) = engine.disconnect() {
                debug!(%status, "engine disconnect returned failure");
            }
        }
    }

    /// Drain queued events into the registered callbacks. Returns how many were processed.
    pub fn process_queue(&self) -> usize {
        self.shared.dispatch()
    }

    fn stop_driver(&self) -> Option<MainLoopDriver> {
        self.shared.inner.lock().driver_running = false;
        let driver = self.driver.lock().take()?;
        if !driver.wait_stopped(self.shared.config.driver_stop_wait) {
            warn!(
                wait = ?self.shared.config.driver_stop_wait,
                "main-loop driver still inside an iteration"
            );
        }
        Some(driver)
    }

    /// Stop the driver and detach the engine; the blocking native close runs on a
    /// one-shot worker. Returns after at most the driver stop wait. Idempotent.
    pub fn close(&self) {
        let driver = self.stop_driver();
        let Some(engine) = self.shared.detach_engine() else {
            return;
        };
        info!(session = %self.shared.id, "closing peer session in background");
        let worker_engine = engine.clone();
        let spawned = thread::Builder::new()
            .name("peerchan-close".into())
            .spawn(move || {
                if let Some(driver) = driver {
                    driver.join();
                }
                worker_engine.close();
                debug!("engine closed");
            });
        match spawned {
            Ok(handle) => *self.closer.lock() = Some(handle),
            Err(e) => {
                error!(error = %e, "failed to start close worker, closing inline");
                engine.close();
            }
        }
    }

    /// Block until a background close started by `close` has finished.
    pub fn wait_closed(&self) {
        let closer = self.closer.lock().take();
        if let Some(handle) = closer {
            if handle.join().is_err() {
                warn!("close worker panicked");
            }
        }
    }

    /// Stop the driver, disconnect and close the engine on this thread. Returns once the
    /// engine has released its resources.
    pub fn close_sync(&self) {
        if let Some(driver) = self.stop_driver() {
            driver.join();
        }
        if let Some(engine) = self.shared.detach_engine() {
            info!(session = %self.shared.id, "closing peer session");
            if let Err(status) = engine.disconnect() {
                debug!(%status, "engine disconnect returned failure");
            }
            engine.close();
        }
        self.wait_closed();
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineStatus;
    use crate::scheduler::host_loop;
    use std::sync::atomic::{AtomicI32, AtomicUsize};
    use std::time::Instant;

    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<&'static str>>,
        sent: Mutex<Vec<(DataKind, u16, Vec<u8>)>>,
        signals: Mutex<Vec<(SignalKind, Vec<u8>)>>,
        fail_signal: AtomicI32,
        fail_disconnect: AtomicBool,
        iterations: AtomicUsize,
        closes: AtomicUsize,
        close_delay: Duration,
        iterate_delay: Duration,
        in_iteration: AtomicBool,
        closed_mid_iteration: AtomicBool,
    }

    impl Scripted {
        fn record(&self, call: &'static str) {
            self.calls.lock().push(call);
        }

        fn called(&self, call: &str) -> bool {
            self.calls.lock().iter().any(|c| *c == call)
        }
    }

    impl PeerEngine for Scripted {
        fn new_connection(&self) -> Result<(), EngineStatus> {
            self.record("new_connection");
            Ok(())
        }

        fn send_signal(&self, kind: SignalKind, payload: &[u8]) -> Result<(), EngineStatus> {
            self.record("send_signal");
            EngineStatus(self.fail_signal.load(Ordering::SeqCst)).into_result()?;
            self.signals.lock().push((kind, payload.to_vec()));
            Ok(())
        }

        fn send_data(&self, frame: DataFrame<'_>) -> Result<(), EngineStatus> {
            self.sent
                .lock()
                .push((frame.kind, frame.stream_id, frame.data.to_vec()));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), EngineStatus> {
            self.record("disconnect");
            if self.fail_disconnect.load(Ordering::SeqCst) {
                Err(EngineStatus(-1))
            } else {
                Ok(())
            }
        }

        fn close(&self) {
            if self.in_iteration.load(Ordering::SeqCst) {
                self.closed_mid_iteration.store(true, Ordering::SeqCst);
            }
            thread::sleep(self.close_delay);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn iterate_once(&self) {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            self.in_iteration.store(true, Ordering::SeqCst);
            thread::sleep(self.iterate_delay);
            self.in_iteration.store(false, Ordering::SeqCst);
        }
    }

    struct ScriptedOpener {
        engine: Arc<Scripted>,
        hooks: Mutex<Option<Arc<dyn EngineHooks>>>,
        fail_open: Option<EngineStatus>,
    }

    impl ScriptedOpener {
        fn new(engine: Scripted) -> Self {
            Self {
                engine: Arc::new(engine),
                hooks: Mutex::new(None),
                fail_open: None,
            }
        }

        fn hooks(&self) -> Arc<dyn EngineHooks> {
            self.hooks.lock().clone().expect("engine opened")
        }
    }

    impl EngineOpener for ScriptedOpener {
        fn open(
            &self,
            _role: Role,
            _config: &EngineConfig,
            hooks: Arc<dyn EngineHooks>,
        ) -> Result<Arc<dyn PeerEngine>, EngineStatus> {
            if let Some(status) = self.fail_open {
                return Err(status);
            }
            *self.hooks.lock() = Some(hooks);
            Ok(self.engine.clone() as Arc<dyn PeerEngine>)
        }
    }

    fn opened(role: Role) -> (PeerSession, ScriptedOpener) {
        let opener = ScriptedOpener::new(Scripted::default());
        let session = PeerSession::new(role, &opener, EngineConfig::default()).unwrap();
        (session, opener)
    }

    fn open_channel(opener: &ScriptedOpener) {
        let hooks = opener.hooks();
        for state in [
            ConnectionState::NewConnection,
            ConnectionState::Pairing,
            ConnectionState::Paired,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::DataChannelConnected,
            ConnectionState::DataChannelOpened,
        ] {
            hooks.on_state(state);
        }
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |value: T| sink.lock().push(value))
    }

    #[test]
    fn open_failure_is_init_error() {
        let mut opener = ScriptedOpener::new(Scripted::default());
        opener.fail_open = Some(EngineStatus(-9));
        let err = PeerSession::new(Role::Controlling, &opener, EngineConfig::default())
            .err()
            .unwrap();
        assert_eq!(err, SessionError::EngineInitError(EngineStatus(-9)));
    }

    #[test]
    fn new_session_is_closed_and_idle() {
        let (session, _opener) = opened(Role::Controlled);
        assert_eq!(session.role(), Role::Controlled);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!session.is_connected());
        assert!(!session.is_data_channel_open());
        assert_eq!(session.process_queue(), 0);
    }

    #[test]
    fn closed_session_reports_not_initialized() {
        let (session, opener) = opened(Role::Controlling);
        session.close_sync();
        assert_eq!(session.start_connection(), Err(SessionError::NotInitialized));
        assert_eq!(session.set_remote_description("v=0"), Err(SessionError::NotInitialized));
        assert_eq!(session.add_ice_candidate("candidate:1"), Err(SessionError::NotInitialized));
        assert_eq!(session.send(b"x"), Err(SessionError::NotInitialized));
        assert_eq!(session.send_raw(b"x"), Err(SessionError::NotInitialized));
        assert!(!session.is_connected());
        session.disconnect();
        assert_eq!(session.process_queue(), 0);

        // Late engine callbacks are ignored once the engine is detached.
        opener.hooks().on_state(ConnectionState::Connected);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(session.queued_events(), 0);
    }

    #[test]
    fn events_delivered_in_order() {
        let (session, opener) = opened(Role::Controlling);
        let (seen, sink) = recorder::<String>();
        session.on_ice(sink);
        let hooks = opener.hooks();
        for i in 0..5 {
            hooks.on_message(SignalKind::IceCandidate, format!("candidate:{i}").as_bytes());
        }
        assert_eq!(session.queued_events(), 5);
        assert_eq!(session.process_queue(), 5);
        let expected: Vec<String> = (0..5).map(|i| format!("candidate:{i}")).collect();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(session.process_queue(), 0);
    }

    #[test]
    fn mixed_categories_keep_engine_order() {
        let (session, opener) = opened(Role::Controlling);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        session.on_offer(move |_| o.lock().push("offer"));
        let o = order.clone();
        session.on_ice(move |_| o.lock().push("ice"));
        let o = order.clone();
        session.on_state(move |_| o.lock().push("state"));
        let o = order.clone();
        session.on_data(move |_| o.lock().push("data"));

        let hooks = opener.hooks();
        hooks.on_state(ConnectionState::NewConnection);
        hooks.on_message(SignalKind::Sdp, b"v=0\r\n");
        hooks.on_message(SignalKind::IceCandidate, b"candidate:1");
        hooks.on_data(DataFrame {
            kind: DataKind::Binary,
            stream_id: 0,
            data: b"early",
        });
        hooks.on_state(ConnectionState::Pairing);
        // No answer callback registered: the event is consumed and discarded.
        session.start_connection().unwrap();
        session.set_remote_description("v=0").unwrap();
        hooks.on_message(SignalKind::Sdp, b"v=0\r\n");

        assert_eq!(session.process_queue(), 6);
        assert_eq!(*order.lock(), vec!["state", "offer", "ice", "data", "state"]);
    }

    #[test]
    fn overflow_drops_and_counts() {
        let (session, opener) = opened(Role::Controlling);
        let (seen, sink) = recorder::<String>();
        session.on_ice(sink);
        let hooks = opener.hooks();
        for i in 0..12 {
            hooks.on_message(SignalKind::IceCandidate, format!("c{i}").as_bytes());
        }
        assert_eq!(session.dropped_events(), 2);
        assert_eq!(session.process_queue(), DEFAULT_QUEUE_CAPACITY);
        assert_eq!(seen.lock().last().map(String::as_str), Some("c9"));

        // The engine keeps running after an overflow.
        hooks.on_message(SignalKind::IceCandidate, b"c12");
        assert_eq!(session.process_queue(), 1);
    }

    #[test]
    fn send_requires_open_channel() {
        let (session, opener) = opened(Role::Controlling);
        let hooks = opener.hooks();
        for state in ConnectionState::ALL {
            hooks.on_state(state);
            let result = session.send(b"ping");
            if state == ConnectionState::DataChannelOpened {
                assert_eq!(result, Ok(()), "state {state}");
            } else {
                assert_eq!(result, Err(SessionError::ChannelNotOpen), "state {state}");
            }
        }
        assert_eq!(opener.engine.sent.lock().len(), 1);
    }

    #[test]
    fn oversized_message_rejected() {
        let (session, opener) = opened(Role::Controlling);
        open_channel(&opener);
        let big = vec![7u8; DEFAULT_MAX_MESSAGE_SIZE + 1];
        assert_eq!(
            session.send(&big),
            Err(SessionError::MessageTooLarge {
                len: DEFAULT_MAX_MESSAGE_SIZE + 1,
                max: DEFAULT_MAX_MESSAGE_SIZE
            })
        );
        assert!(opener.engine.sent.lock().is_empty());
        assert_eq!(session.send(&big[..DEFAULT_MAX_MESSAGE_SIZE]), Ok(()));
    }

    #[test]
    fn text_and_raw_sends() {
        let (session, opener) = opened(Role::Controlling);
        // Raw sends skip the channel check; empty ones are ignored.
        assert_eq!(session.send_raw(b"early"), Ok(()));
        assert_eq!(session.send_raw(b""), Ok(()));
        open_channel(&opener);
        assert_eq!(session.send_text("hi"), Ok(()));
        let sent = opener.engine.sent.lock();
        assert_eq!(
            *sent,
            vec![
                (DataKind::Binary, 0, b"early".to_vec()),
                (DataKind::Text, 0, b"hi".to_vec()),
            ]
        );
    }

    #[test]
    fn flags_follow_engine_state() {
        let (session, opener) = opened(Role::Controlling);
        let (states, sink) = recorder::<ConnectionState>();
        session.on_state(sink);
        open_channel(&opener);
        assert!(session.is_connected());
        assert!(session.is_data_channel_open());
        opener.hooks().on_state(ConnectionState::Disconnected);
        assert!(!session.is_connected());
        assert!(!session.is_data_channel_open());
        assert_eq!(session.process_queue(), 8);
        assert_eq!(states.lock().last(), Some(&ConnectionState::Disconnected));
    }

    #[test]
    fn close_returns_before_engine_finishes() {
        let opener = ScriptedOpener::new(Scripted {
            close_delay: Duration::from_millis(500),
            ..Scripted::default()
        });
        let session = PeerSession::new(Role::Controlling, &opener, EngineConfig::default()).unwrap();
        let started = Instant::now();
        session.close();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(opener.engine.closes.load(Ordering::SeqCst), 0);
        assert_eq!(session.send(b"x"), Err(SessionError::NotInitialized));
        session.wait_closed();
        assert_eq!(opener.engine.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_never_overlaps_a_slow_iteration() {
        let opener = ScriptedOpener::new(Scripted {
            iterate_delay: Duration::from_millis(300),
            ..Scripted::default()
        });
        let session = PeerSession::new(Role::Controlling, &opener, EngineConfig::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !opener.engine.in_iteration.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "driver never iterated");
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        session.close();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(session.add_ice_candidate("candidate:1"), Err(SessionError::NotInitialized));

        session.wait_closed();
        assert_eq!(opener.engine.closes.load(Ordering::SeqCst), 1);
        assert!(!opener.engine.closed_mid_iteration.load(Ordering::SeqCst));
        assert_eq!(opener.engine.iterations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn discarded_wake_is_rescheduled() {
        let scheduled = Arc::new(Mutex::new(Vec::<crate::scheduler::Task>::new()));
        let slot = scheduled.clone();
        let opener = ScriptedOpener::new(Scripted::default());
        let session = PeerSession::builder(Role::Controlled)
            .scheduler(Arc::new(move |task: crate::scheduler::Task| slot.lock().push(task)))
            .open(&opener)
            .unwrap();
        let (seen, sink) = recorder::<String>();
        session.on_ice(sink);
        let hooks = opener.hooks();

        hooks.on_message(SignalKind::IceCandidate, b"c0");
        let discarded: Vec<_> = scheduled.lock().drain(..).collect();
        assert_eq!(discarded.len(), 1);
        drop(discarded);

        for i in 1..4 {
            hooks.on_message(SignalKind::IceCandidate, format!("c{i}").as_bytes());
        }
        let pending: Vec<_> = scheduled.lock().drain(..).collect();
        assert_eq!(pending.len(), 1);
        for task in pending {
            task();
        }
        assert_eq!(*seen.lock(), vec!["c0", "c1", "c2", "c3"]);
        assert_eq!(session.queued_events(), 0);
    }

    #[test]
    fn close_sync_disconnects_then_closes() {
        let opener = ScriptedOpener::new(Scripted {
            close_delay: Duration::from_millis(50),
            ..Scripted::default()
        });
        let session = PeerSession::new(Role::Controlling, &opener, EngineConfig::default()).unwrap();
        session.close_sync();
        assert!(opener.engine.called("disconnect"));
        assert_eq!(opener.engine.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_close_closes_once() {
        let (session, opener) = opened(Role::Controlling);
        session.close();
        session.close();
        session.close_sync();
        drop(session);
        assert_eq!(opener.engine.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn driver_iterates_until_close() {
        let opener = ScriptedOpener::new(Scripted::default());
        let session = PeerSession::builder(Role::Controlling)
            .config(SessionConfig::default().iterate_interval(Duration::from_millis(1)))
            .open(&opener)
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(opener.engine.iterations.load(Ordering::SeqCst) > 0);
        session.close_sync();
        let seen = opener.engine.iterations.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(opener.engine.iterations.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn controlling_side_produces_offer() {
        let (session, opener) = opened(Role::Controlling);
        let (offers, offer_sink) = recorder::<String>();
        let (answers, answer_sink) = recorder::<String>();
        session.on_offer(offer_sink);
        session.on_answer(answer_sink);
        session.start_connection().unwrap();
        assert!(opener.engine.called("new_connection"));
        opener
            .hooks()
            .on_message(SignalKind::Sdp, b"v=0\r\na=sendrecv\r\n\0");
        assert_eq!(session.process_queue(), 1);
        assert_eq!(*offers.lock(), vec!["v=0\r\na=sendrecv\r\n".to_string()]);
        assert!(answers.lock().is_empty());
    }

    #[test]
    fn local_sdp_after_remote_offer_is_answer() {
        for role in [Role::Controlling, Role::Controlled] {
            let (session, opener) = opened(role);
            let (answers, sink) = recorder::<String>();
            session.on_answer(sink);
            session.start_connection().unwrap();
            session.set_remote_description("v=0\r\na=sendrecv\r\n").unwrap();
            opener.hooks().on_message(SignalKind::Sdp, b"v=0\r\na=sendrecv\r\n");
            assert_eq!(session.process_queue(), 1);
            assert_eq!(answers.lock().len(), 1, "role {role}");
        }
    }

    #[test]
    fn controlled_side_labels_answer() {
        let (session, opener) = opened(Role::Controlled);
        let (answers, sink) = recorder::<String>();
        session.on_answer(sink);
        session.start_connection().unwrap();
        opener.hooks().on_message(SignalKind::Sdp, b"v=0\r\n");
        session.process_queue();
        assert_eq!(answers.lock().len(), 1);
    }

    #[test]
    fn direction_classifier_reads_attributes() {
        let opener = ScriptedOpener::new(Scripted::default());
        let session = PeerSession::builder(Role::Controlled)
            .config(SessionConfig::default().sdp_classifier(SdpClassifier::DirectionAttributes))
            .open(&opener)
            .unwrap();
        let (offers, offer_sink) = recorder::<String>();
        let (answers, answer_sink) = recorder::<String>();
        session.on_offer(offer_sink);
        session.on_answer(answer_sink);
        let hooks = opener.hooks();
        hooks.on_message(SignalKind::Sdp, b"v=0\r\na=sendrecv\r\n");
        hooks.on_message(SignalKind::Sdp, b"v=0\r\na=recvonly\r\n");
        session.process_queue();
        assert_eq!(offers.lock().len(), 1);
        assert_eq!(answers.lock().len(), 1);
    }

    #[test]
    fn rejected_remote_description_changes_nothing() {
        let (session, opener) = opened(Role::Controlling);
        let (offers, sink) = recorder::<String>();
        session.on_offer(sink);
        session.start_connection().unwrap();
        opener.engine.fail_signal.store(-5, Ordering::SeqCst);
        assert_eq!(
            session.set_remote_description("garbage"),
            Err(SessionError::EngineRejected {
                op: EngineOp::SetRemoteDescription,
                status: EngineStatus(-5)
            })
        );
        assert_eq!(
            session.add_ice_candidate("candidate:x"),
            Err(SessionError::EngineRejected {
                op: EngineOp::AddIceCandidate,
                status: EngineStatus(-5)
            })
        );
        assert_eq!(session.state(), ConnectionState::Closed);
        // The failed remote description did not count as the remote going first.
        opener.hooks().on_message(SignalKind::Sdp, b"v=0\r\n");
        session.process_queue();
        assert_eq!(offers.lock().len(), 1);
    }

    #[test]
    fn signals_reach_engine() {
        let (session, opener) = opened(Role::Controlled);
        session.set_remote_description("v=0").unwrap();
        session.add_ice_candidate("candidate:1 1 UDP 1 10.0.0.2 5000 typ host").unwrap();
        let signals = opener.engine.signals.lock();
        assert_eq!(signals[0], (SignalKind::Sdp, b"v=0".to_vec()));
        assert_eq!(signals[1].0, SignalKind::IceCandidate);
    }

    #[test]
    fn empty_payloads_ignored() {
        let (session, opener) = opened(Role::Controlling);
        let hooks = opener.hooks();
        hooks.on_message(SignalKind::IceCandidate, b"");
        hooks.on_data(DataFrame {
            kind: DataKind::Binary,
            stream_id: 0,
            data: b"",
        });
        assert_eq!(session.queued_events(), 0);
    }

    #[test]
    fn engine_errors_reach_handler() {
        let (session, opener) = opened(Role::Controlling);
        let (errors, sink) = recorder::<String>();
        session.on_error(sink);
        opener.hooks().on_error("dtls handshake failed");
        session.process_queue();
        assert_eq!(*errors.lock(), vec!["dtls handshake failed".to_string()]);
    }

    #[test]
    fn disconnect_is_best_effort() {
        let (session, opener) = opened(Role::Controlling);
        opener.engine.fail_disconnect.store(true, Ordering::SeqCst);
        session.disconnect();
        session.disconnect();
        assert!(opener.engine.called("disconnect"));
        assert_eq!(session.start_connection(), Ok(()));
    }

    #[test]
    fn callbacks_may_reenter_session() {
        let (session, opener) = opened(Role::Controlling);
        let session = Arc::new(session);
        let nested = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let weak = Arc::downgrade(&session);
            let nested = nested.clone();
            session.on_data(move |data| {
                let Some(session) = weak.upgrade() else { return };
                if data == b"ping" {
                    session.send(b"pong").unwrap();
                    nested.store(session.process_queue(), Ordering::SeqCst);
                }
            });
        }
        open_channel(&opener);
        session.process_queue();
        opener.hooks().on_data(DataFrame {
            kind: DataKind::Binary,
            stream_id: 0,
            data: b"ping",
        });
        assert_eq!(session.process_queue(), 1);
        assert_eq!(nested.load(Ordering::SeqCst), 0);
        assert_eq!(
            *opener.engine.sent.lock(),
            vec![(DataKind::Binary, 0, b"pong".to_vec())]
        );
    }

    #[test]
    fn host_scheduler_wakes_coalesce() {
        let (handle, mut host) = host_loop();
        let opener = ScriptedOpener::new(Scripted::default());
        let session = PeerSession::builder(Role::Controlling)
            .scheduler(Arc::new(handle))
            .open(&opener)
            .unwrap();
        let (seen, sink) = recorder::<String>();
        session.on_ice(sink);
        let hooks = opener.hooks();
        let producer = thread::spawn(move || {
            for i in 0..3 {
                hooks.on_message(SignalKind::IceCandidate, format!("c{i}").as_bytes());
            }
        });
        producer.join().unwrap();
        // Nothing runs until the host takes a turn.
        assert!(seen.lock().is_empty());
        assert_eq!(host.run_pending(), 1);
        assert_eq!(seen.lock().len(), 3);

        opener.hooks().on_message(SignalKind::IceCandidate, b"c3");
        assert_eq!(host.run_pending(), 1);
        assert_eq!(seen.lock().len(), 4);
    }
}
