//! Link session lifecycle.
//!
//! [`LinkSession`] owns the transport and walks
//! `Disconnected -> Connecting -> Connected -> Disconnected`. Every
//! successful connect creates a fresh [`Session`]; a session is never
//! revived after it ends. Components that must stop when the link goes
//! away register a loss hook on the session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::LinkConfig;
use crate::events::{LinkEvent, LinkObserver, LinkState, PacketDirection, TracingObserver};
use crate::ota::{ControlRouter, OtaEngine, OtaError, OtaReport};
use crate::flow::AbortReason;
use crate::protocol::Command;
use crate::settings::SettingsSink;
use crate::status::{ParseOutcome, StatusParser};
use crate::transport::{Channel, LinkLossHandler, LinkTransport, NotifyHandler, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link is already {0}")]
    AlreadyActive(LinkState),

    #[error("Not connected")]
    NotConnected,

    #[error("Required channel {channel} missing: {source}")]
    MissingChannel {
        channel: Channel,
        #[source]
        source: TransportError,
    },

    #[error("Link lost")]
    Disconnected,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Callback run once when a session ends.
pub type LossHook = Arc<dyn Fn() + Send + Sync>;

/// One live connection to the device.
pub struct Session {
    id: u64,
    started: Instant,
    update_channels: bool,
    connected: AtomicBool,
    ended: Mutex<bool>,
    ended_cond: Condvar,
    last_activity: Mutex<Instant>,
    hooks: Mutex<Vec<(u64, LossHook)>>,
    next_hook: AtomicU64,
}

impl Session {
    pub fn new(id: u64, update_channels: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            started: now,
            update_channels,
            connected: AtomicBool::new(true),
            ended: Mutex::new(false),
            ended_cond: Condvar::new(),
            last_activity: Mutex::new(now),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Both OTA channels were bound at connect time.
    pub fn has_update_channels(&self) -> bool {
        self.update_channels
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Sleep for `duration`, returning early with an error if the
    /// session ends.
    pub fn sleep(&self, duration: Duration) -> Result<(), LinkError> {
        let ended = lock(&self.ended);
        let (ended, _) = self
            .ended_cond
            .wait_timeout_while(ended, duration, |ended| !*ended)
            .unwrap_or_else(PoisonError::into_inner);
        if *ended {
            Err(LinkError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Run `hook` when the session ends. Runs it immediately if it
    /// already has. The hook is removed when the guard drops.
    pub fn add_loss_hook(self: &Arc<Self>, hook: LossHook) -> LossHookGuard {
        let id = self.next_hook.fetch_add(1, Ordering::Relaxed);
        let guard = LossHookGuard {
            session: self.clone(),
            id,
        };
        {
            let ended = lock(&self.ended);
            if !*ended {
                lock(&self.hooks).push((id, hook));
                return guard;
            }
        }
        hook();
        guard
    }

    /// Mark the session over, wake sleepers and run loss hooks.
    /// Returns false if it had already ended.
    pub(crate) fn end(&self) -> bool {
        {
            let mut ended = lock(&self.ended);
            if *ended {
                return false;
            }
            *ended = true;
        }
        self.connected.store(false, Ordering::Release);
        self.ended_cond.notify_all();

        let hooks: Vec<LossHook> = lock(&self.hooks).drain(..).map(|(_, h)| h).collect();
        for hook in hooks {
            hook();
        }
        true
    }
}

/// Deregisters a loss hook on drop.
pub struct LossHookGuard {
    session: Arc<Session>,
    id: u64,
}

impl Drop for LossHookGuard {
    fn drop(&mut self) {
        lock(&self.session.hooks).retain(|(id, _)| *id != self.id);
    }
}

/// State reachable from notification handlers.
struct Shared {
    state: Mutex<LinkState>,
    current: Mutex<Option<Arc<Session>>>,
    parser: Mutex<StatusParser>,
    sink: Arc<dyn SettingsSink>,
    observer: Arc<dyn LinkObserver>,
}

impl Shared {
    fn transition(&self, to: LinkState) {
        let from = std::mem::replace(&mut *lock(&self.state), to);
        if from != to {
            self.observer.on_event(&LinkEvent::StateChanged { from, to });
        }
    }

    fn handle_status(&self, data: &[u8]) {
        self.observer.on_event(&LinkEvent::Packet {
            direction: PacketDirection::Rx,
            channel: Channel::Status,
            length: data.len(),
        });
        let outcome = lock(&self.parser).feed(data);
        if let Some(patch) = outcome.patch()
            && !patch.is_empty()
        {
            self.sink.apply(patch);
        }
        if let ParseOutcome::Structured { synced: true, .. } = outcome {
            self.observer.on_event(&LinkEvent::StatusSynced);
        }
    }

    fn handle_gesture(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let name = text.trim();
        self.sink.set_last_gesture(name);
        self.observer.on_event(&LinkEvent::Gesture {
            name: name.to_string(),
        });
    }

    fn handle_link_loss(&self, session: &Session) {
        if !session.end() {
            return;
        }
        let was_current = {
            let mut current = lock(&self.current);
            if current.as_ref().is_some_and(|s| s.id() == session.id()) {
                *current = None;
                true
            } else {
                false
            }
        };
        if was_current {
            warn!(session = session.id(), "Link lost");
            self.transition(LinkState::Disconnected);
            self.observer.on_event(&LinkEvent::Disconnected {
                session_id: session.id(),
                abrupt: true,
            });
        }
    }
}

/// Ends the single running transfer on drop. Clears the router, any
/// unapplied cancel and the busy flag under one lock.
struct UpdateGuard<'a> {
    active: &'a Mutex<Option<Arc<ControlRouter>>>,
    pending: &'a AtomicBool,
    busy: &'a AtomicBool,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        let mut active = lock(self.active);
        *active = None;
        self.pending.store(false, Ordering::Release);
        self.busy.store(false, Ordering::Release);
    }
}

/// Session manager for one device.
pub struct LinkSession<T: LinkTransport> {
    transport: T,
    config: LinkConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    ota_busy: AtomicBool,
    active_update: Mutex<Option<Arc<ControlRouter>>>,
    /// Cancel requested before the running transfer had a router.
    cancel_pending: AtomicBool,
}

impl<T: LinkTransport> LinkSession<T> {
    /// Create a session manager with the default tracing observer.
    pub fn new(transport: T, config: LinkConfig, sink: Arc<dyn SettingsSink>) -> Self {
        Self::with_observer(transport, config, sink, Arc::new(TracingObserver))
    }

    /// Create a session manager with a custom observer.
    pub fn with_observer(
        transport: T,
        config: LinkConfig,
        sink: Arc<dyn SettingsSink>,
        observer: Arc<dyn LinkObserver>,
    ) -> Self {
        Self {
            transport,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Disconnected),
                current: Mutex::new(None),
                parser: Mutex::new(StatusParser::new()),
                sink,
                observer,
            }),
            next_id: AtomicU64::new(0),
            ota_busy: AtomicBool::new(false),
            active_update: Mutex::new(None),
            cancel_pending: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.shared.state)
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.shared.current)
            .as_ref()
            .filter(|s| s.is_connected())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    pub fn settings(&self) -> Arc<dyn SettingsSink> {
        self.shared.sink.clone()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.session().map(|s| s.last_activity())
    }

    fn observed(&self) -> ObservedTransport<'_, T> {
        ObservedTransport {
            inner: &self.transport,
            observer: &self.shared.observer,
        }
    }

    /// Connect to the configured device and request a status sync.
    #[instrument(skip(self), fields(device = %self.config.device_name))]
    pub fn connect(&self) -> Result<Arc<Session>, LinkError> {
        {
            let mut state = lock(&self.shared.state);
            if *state != LinkState::Disconnected {
                return Err(LinkError::AlreadyActive(*state));
            }
            *state = LinkState::Connecting;
        }
        self.shared.observer.on_event(&LinkEvent::StateChanged {
            from: LinkState::Disconnected,
            to: LinkState::Connecting,
        });
        info!("Connecting");

        let session = match self.establish() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.transport.close();
                self.shared.transition(LinkState::Disconnected);
                return Err(e);
            }
        };

        *lock(&self.shared.current) = Some(session.clone());
        self.shared.transition(LinkState::Connected);
        self.shared.observer.on_event(&LinkEvent::Connected {
            session_id: session.id(),
            ota_available: session.has_update_channels(),
        });
        info!(
            session = session.id(),
            ota = session.has_update_channels(),
            "Connected"
        );

        let shared = Arc::downgrade(&self.shared);
        let lost = Arc::downgrade(&session);
        let on_loss: LinkLossHandler = Arc::new(move || {
            if let (Some(shared), Some(session)) = (shared.upgrade(), lost.upgrade()) {
                shared.handle_link_loss(&session);
            }
        });
        self.transport.on_link_loss(on_loss);
        if !self.transport.is_connected() {
            self.shared.handle_link_loss(&session);
            return Err(LinkError::Disconnected);
        }

        match self.initial_sync(&session) {
            Ok(()) => {}
            Err(e) if !session.is_connected() => {
                warn!(error = %e, "Link lost before the initial sync");
                return Err(LinkError::Disconnected);
            }
            Err(e) => warn!(error = %e, "Initial status sync not sent"),
        }
        Ok(session)
    }

    fn establish(&self) -> Result<Arc<Session>, LinkError> {
        self.transport.open(&self.config.device_name)?;
        for channel in Channel::REQUIRED {
            self.transport
                .bind(channel)
                .map_err(|source| LinkError::MissingChannel { channel, source })?;
            debug!(
                channel = %channel,
                service = %channel.service_uuid(),
                characteristic = %channel.characteristic_uuid(),
                "Bound"
            );
        }
        let update_channels = Channel::UPDATE.iter().all(|&channel| {
            match self.transport.bind(channel) {
                Ok(()) => true,
                Err(e) => {
                    info!(channel = %channel, error = %e, "Update channel unavailable");
                    false
                }
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::new(id, update_channels));
        lock(&self.shared.parser).reset();

        self.transport
            .subscribe(Channel::Status, self.dispatch(&session, Shared::handle_status))?;
        self.transport
            .subscribe(Channel::Gesture, self.dispatch(&session, Shared::handle_gesture))?;
        Ok(session)
    }

    fn dispatch(&self, session: &Arc<Session>, route: fn(&Shared, &[u8])) -> NotifyHandler {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let session = Arc::downgrade(session);
        Arc::new(move |data: &[u8]| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let Some(session) = session.upgrade() {
                session.touch();
            }
            route(&shared, data);
        })
    }

    fn initial_sync(&self, session: &Session) -> Result<(), LinkError> {
        session.sleep(self.config.sync_delay())?;
        self.send_on(session, &Command::Sync)
    }

    /// Tear the link down. Safe to call when already disconnected.
    pub fn disconnect(&self) {
        let Some(session) = lock(&self.shared.current).take() else {
            return;
        };
        info!(
            session = session.id(),
            uptime_ms = session.uptime().as_millis() as u64,
            "Disconnecting"
        );
        session.end();
        for channel in [Channel::Status, Channel::Gesture] {
            if let Err(e) = self.transport.unsubscribe(channel) {
                debug!(channel = %channel, error = %e, "Unsubscribe failed");
            }
        }
        self.transport.close();
        self.shared.transition(LinkState::Disconnected);
        self.shared.observer.on_event(&LinkEvent::Disconnected {
            session_id: session.id(),
            abrupt: false,
        });
    }

    fn send_on(&self, session: &Session, command: &Command) -> Result<(), LinkError> {
        if !session.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.observed().write(Channel::Command, &command.to_wire())?;
        session.touch();
        debug!(command = %command, "Command sent");
        Ok(())
    }

    /// Send a typed command.
    pub fn send(&self, command: &Command) -> Result<(), LinkError> {
        if !command.is_valid() {
            return Err(LinkError::InvalidCommand(command.to_string()));
        }
        let session = self.session().ok_or(LinkError::NotConnected)?;
        self.send_on(&session, command)
    }

    /// Send an opaque text command such as `happy` or `blink`.
    pub fn send_command(&self, text: &str) -> Result<(), LinkError> {
        self.send(&Command::Raw(text.to_string()))
    }

    /// Ask for one structured sync record.
    pub fn request_sync(&self) -> Result<(), LinkError> {
        self.send(&Command::Sync)
    }

    /// Query each topic separately, for firmware without the sync record.
    pub fn request_legacy_sync(&self) -> Result<(), LinkError> {
        let session = self.session().ok_or(LinkError::NotConnected)?;
        for command in &Command::LEGACY_SYNC {
            session.sleep(self.config.sync_delay())?;
            self.send_on(&session, command)?;
        }
        Ok(())
    }

    /// Flash `firmware` over the OTA service. Blocks until the device
    /// accepts or rejects the image.
    pub fn update_firmware<F>(&self, firmware: &[u8], mut progress: F) -> Result<OtaReport, OtaError>
    where
        F: FnMut(u8, &str),
    {
        if self
            .ota_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Firmware update already running");
            progress(0, &OtaError::Busy.to_string());
            return Err(OtaError::Busy);
        }
        let _guard = UpdateGuard {
            active: &self.active_update,
            pending: &self.cancel_pending,
            busy: &self.ota_busy,
        };

        let Some(session) = self.session() else {
            progress(0, &OtaError::NotConnected.to_string());
            return Err(OtaError::NotConnected);
        };

        let transport = self.observed();
        let engine = OtaEngine::new(
            &transport,
            session,
            self.shared.sink.as_ref(),
            self.shared.observer.clone(),
            &self.config.ota,
        );
        {
            let mut active = lock(&self.active_update);
            let router = engine.router();
            if self.cancel_pending.swap(false, Ordering::AcqRel) {
                info!("Cancelling firmware update before it starts");
                router.abort(AbortReason::Cancelled);
            }
            *active = Some(router);
        }
        engine.run(firmware, &mut progress)
    }

    /// Abort the running firmware update, if any. A cancel that lands
    /// while the update is still starting is applied once it has a
    /// router.
    pub fn cancel_update(&self) -> bool {
        let active = lock(&self.active_update);
        if let Some(router) = active.as_ref() {
            info!("Cancelling firmware update");
            router.abort(AbortReason::Cancelled);
            return true;
        }
        if self.ota_busy.load(Ordering::Acquire) {
            self.cancel_pending.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn is_updating(&self) -> bool {
        self.ota_busy.load(Ordering::Acquire)
    }
}

impl<T: LinkTransport> Drop for LinkSession<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Transport wrapper that emits packet events.
struct ObservedTransport<'a, T: LinkTransport> {
    inner: &'a T,
    observer: &'a Arc<dyn LinkObserver>,
}

impl<T: LinkTransport> ObservedTransport<'_, T> {
    fn emit(&self, channel: Channel, length: usize) {
        self.observer.on_event(&LinkEvent::Packet {
            direction: PacketDirection::Tx,
            channel,
            length,
        });
    }
}

impl<T: LinkTransport> LinkTransport for ObservedTransport<'_, T> {
    fn open(&self, device_name: &str) -> Result<(), TransportError> {
        self.inner.open(device_name)
    }

    fn bind(&self, channel: Channel) -> Result<(), TransportError> {
        self.inner.bind(channel)
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(channel, data);
        if res.is_ok() {
            self.emit(channel, data.len());
        }
        res
    }

    fn write_without_response(
        &self,
        channel: Channel,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let res = self.inner.write_without_response(channel, data);
        if res.is_ok() {
            self.emit(channel, data.len());
        }
        res
    }

    fn subscribe(&self, channel: Channel, handler: NotifyHandler) -> Result<(), TransportError> {
        self.inner.subscribe(channel, handler)
    }

    fn unsubscribe(&self, channel: Channel) -> Result<(), TransportError> {
        self.inner.unsubscribe(channel)
    }

    fn on_link_loss(&self, handler: LinkLossHandler) {
        self.inner.on_link_loss(handler)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
