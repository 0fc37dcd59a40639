//! Connection state machine and the public [`Connection`] handle.
//!
//! Each transport link gets one driver task. The driver owns the handshake
//! state (crypto session, frame carry buffer, current step) and the
//! recovered-error counter, and is fed by an unbounded channel that carries
//! transport notifications and outbound packets. Write failures from reply
//! tasks reach it over a second channel, so all error counting happens in
//! one place.
//!
//! Link loss is reported by the transport through a synchronous callback
//! tagged with the link id it was registered for; callbacks from older
//! links are ignored.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use protocol::{ApplicationPacket, KeyTable, ProtocolError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::device::Device;
use crate::dispatch::{ApplicationDispatch, Inbound};
use crate::dispatcher::{Delivery, RequestDispatcher};
use crate::error::{ConnectionError, Result};
use crate::handshake::{Credentials, Handshake};
use crate::logging::Dumps;
use crate::reconnect::ReconnectPolicy;
use crate::state::{ConnectionState, Listeners, StateSnapshot, Subscription};
use crate::transport::{DisconnectHandler, NotificationHandler, Transport};

enum Event {
    Notification(Vec<u8>),
    Send {
        packet: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
}

/// Driver task and background work of one link.
struct Attempt {
    cancel: CancellationToken,
    tasks: TaskTracker,
    driver: JoinHandle<()>,
    events: mpsc::UnboundedSender<Event>,
}

impl Attempt {
    fn abort(&self) {
        self.cancel.cancel();
        self.tasks.close();
    }

    async fn shutdown(self) {
        self.abort();
        if let Err(err) = self.driver.await {
            if err.is_panic() {
                error!("connection driver panicked");
            }
        }
        self.tasks.wait().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Supervisor,
}

enum Round {
    Authenticated,
    Lost,
    TimedOut,
}

struct Shared {
    next_link: u64,
    /// Id of the link whose disconnect callback is live.
    link: Option<u64>,
    attempt: Option<Attempt>,
    connection_attempts: u32,
    reconnect: ReconnectPolicy,
    reconnect_enabled: bool,
    /// Armed once the transport connects, cleared by explicit disconnects.
    retry_on_disconnect: bool,
    supervisor: Option<JoinHandle<()>>,
    /// Set when the link drops while a reconnect round is waiting.
    round_lost: bool,
    last_error: Option<ConnectionError>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    device: Arc<dyn Device>,
    credentials: Credentials,
    key_table: KeyTable,
    config: ConnectionConfig,
    dumps: Dumps,
    runtime: OnceLock<Handle>,
    state: watch::Sender<StateSnapshot>,
    state_listeners: Listeners<ConnectionState>,
    disconnect_listeners: Listeners<Option<ConnectionError>>,
    round_signal: Notify,
    /// Held across a state update and its listener fan-out so listeners
    /// observe transitions in the order the watch channel publishes them.
    /// Reentrant so a listener may itself trigger a transition.
    transitions: ReentrantMutex<()>,
    shared: Mutex<Shared>,
}

/// Handle to an encrypted connection with one device.
///
/// Cloning is cheap and every clone controls the same connection. Background
/// tasks keep the connection alive until [`Connection::disconnect`] is called.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection in the `Created` state. Nothing is opened until
    /// [`Connection::connect`].
    ///
    /// Fails with [`ConnectionError::Config`] when `config` does not pass
    /// [`ConnectionConfig::validate`].
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        key_table: KeyTable,
        device: Arc<dyn Device>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (state, _) = watch::channel(StateSnapshot::initial());
        let shared = Shared {
            next_link: 0,
            link: None,
            attempt: None,
            connection_attempts: 0,
            reconnect: ReconnectPolicy::from_config(&config),
            reconnect_enabled: config.reconnect.enabled,
            retry_on_disconnect: false,
            supervisor: None,
            round_lost: false,
            last_error: None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                device,
                credentials,
                key_table,
                dumps: Dumps::from(&config.logging),
                config,
                runtime: OnceLock::new(),
                state,
                state_listeners: Listeners::new(),
                disconnect_listeners: Listeners::new(),
                round_signal: Notify::new(),
                transitions: ReentrantMutex::new(()),
                shared: Mutex::new(shared),
            }),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    /// Whether the transport link is up, authenticated or not.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Most recent error recorded on this connection.
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.shared.lock().last_error.clone()
    }

    /// Account and serial number used to authenticate.
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// Call `handler` on every state transition.
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner
            .state_listeners
            .subscribe(move |state: &ConnectionState| handler(*state))
    }

    /// Call `handler` when the link ends, with the error that ended it.
    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Option<&ConnectionError>) + Send + Sync + 'static,
    {
        self.inner
            .disconnect_listeners
            .subscribe(move |err: &Option<ConnectionError>| handler(err.as_ref()))
    }

    /// Receiver of the latest state and the one before it, for cooperative
    /// waits. Intermediate states may be skipped by a slow receiver; use
    /// [`Connection::on_state_change`] to see every transition.
    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.state.subscribe()
    }

    /// Open the transport and start the handshake.
    ///
    /// Returns once the transport is connected; use
    /// [`Connection::wait_connected`] to wait for authentication. Calling
    /// this while a handshake or reconnect is in progress does nothing.
    pub async fn connect(&self) -> Result<()> {
        let state = self.state();
        let reconnecting = self.inner.shared.lock().supervisor.is_some();
        if state.is_connecting() || reconnecting {
            debug!(state = %state, "connect already in progress");
            return Ok(());
        }

        self.inner.shared.lock().reconnect.reset();
        self.inner.connect_counted(Origin::Caller).await
    }

    /// Close the connection and stop reconnecting. Safe in any state.
    pub async fn disconnect(&self) {
        info!(serial = %self.inner.credentials.serial_number, "disconnecting from device");
        self.inner.shutdown(true).await;
    }

    /// Wait until the connection authenticates.
    ///
    /// On timeout the connection enters `ErrorTimeout`. Any other terminal
    /// state yields [`ConnectionError::FailedToAuthenticate`].
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        match self.wait_terminal(timeout).await {
            Some(state) if state.authenticated() => Ok(()),
            Some(state) => Err(ConnectionError::FailedToAuthenticate(state)),
            None => Err(self.inner.timed_out(timeout)),
        }
    }

    /// Wait for authentication or a terminal error and return the state.
    ///
    /// With `raise_on_error`, a failed outcome returns the recorded error
    /// instead of the state.
    pub async fn wait_until_authenticated_or_error(
        &self,
        timeout: Duration,
        raise_on_error: bool,
    ) -> Result<ConnectionState> {
        let state = match self.wait_terminal(timeout).await {
            Some(state) => state,
            None => {
                let err = self.inner.timed_out(timeout);
                if raise_on_error {
                    return Err(err);
                }
                return Ok(ConnectionState::ErrorTimeout);
            }
        };

        if state.authenticated() || !raise_on_error {
            return Ok(state);
        }
        match self.last_error() {
            Some(err) => Err(err),
            None if state.is_error() => Err(ConnectionError::FailedToAuthenticate(state)),
            None => Ok(state),
        }
    }

    /// Encrypt and send a packet on the authenticated link.
    ///
    /// Write failures are counted as recovered errors, not returned.
    pub async fn send_packet(&self, packet: &ApplicationPacket) -> Result<()> {
        let bytes = packet.to_bytes()?;
        self.send_bytes(bytes).await
    }

    /// Send a configuration change built by the device collaborator.
    pub async fn send_config(&self, fields: &[u8]) -> Result<()> {
        let bytes = self.inner.device.build_config_frame(fields)?;
        self.send_bytes(bytes).await
    }

    /// Allow or forbid reconnecting after the link drops.
    pub fn set_reconnect_enabled(&self, enabled: bool) {
        let mut shared = self.inner.shared.lock();
        shared.reconnect_enabled = enabled;
        if !enabled {
            shared.retry_on_disconnect = false;
        } else if self.inner.transport.is_connected() {
            shared.retry_on_disconnect = true;
        }
    }

    async fn send_bytes(&self, packet: Vec<u8>) -> Result<()> {
        if !self.state().authenticated() {
            return Err(ProtocolError::SessionKeyMissing.into());
        }

        let events = self
            .inner
            .shared
            .lock()
            .attempt
            .as_ref()
            .map(|attempt| attempt.events.clone());
        let Some(events) = events else {
            return Ok(());
        };

        let (done, result) = oneshot::channel();
        if events.send(Event::Send { packet, done }).is_err() {
            return Ok(());
        }
        // A dropped sender means the link went down first.
        result.await.unwrap_or(Ok(()))
    }

    /// Wait for a terminal state. The state before a final `Disconnected` is
    /// reported when it was an error, since the error is what ended the link.
    async fn wait_terminal(&self, timeout: Duration) -> Option<ConnectionState> {
        let mut states = self.inner.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            states
                .wait_for(|snapshot| snapshot.state.is_terminal())
                .await
                .map(|snapshot| *snapshot)
        })
        .await;

        match waited {
            Ok(Ok(snapshot)) => {
                if snapshot.state == ConnectionState::Disconnected && snapshot.previous.is_error() {
                    Some(snapshot.previous)
                } else {
                    Some(snapshot.state)
                }
            }
            // The sender lives as long as the handle, so the channel cannot close.
            Ok(Err(_)) => Some(self.state()),
            Err(_) => None,
        }
    }
}

impl Inner {
    fn current_state(&self) -> ConnectionState {
        self.state.borrow().state
    }

    /// Publish a transition. Must not be called with `shared` locked, since
    /// listeners may call back into the connection.
    fn set_state(&self, state: ConnectionState, error: Option<ConnectionError>) {
        let _transition = self.transitions.lock();
        if let Some(err) = &error {
            self.shared.lock().last_error = Some(err.clone());
        }

        let mut previous = state;
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.state == state {
                return false;
            }
            previous = snapshot.state;
            *snapshot = StateSnapshot {
                state,
                previous: snapshot.state,
            };
            true
        });
        if !changed {
            return;
        }

        debug!(from = %previous, to = %state, "connection state changed");
        self.state_listeners.notify(&state);
        if state.is_error() {
            self.disconnect_listeners.notify(&error);
        }
    }

    fn timed_out(&self, timeout: Duration) -> ConnectionError {
        let err = ConnectionError::Timeout(format!("not authenticated within {:?}", timeout));
        warn!(error = %err, "wait for authentication timed out");
        self.set_state(ConnectionState::ErrorTimeout, Some(err.clone()));
        err
    }

    async fn connect_counted(self: &Arc<Self>, origin: Origin) -> Result<()> {
        let _ = self.runtime.get_or_init(Handle::current);

        let max_attempts = self.config.connect.max_attempts;
        let exceeded = {
            let mut shared = self.shared.lock();
            shared.connection_attempts += 1;
            if shared.connection_attempts > max_attempts {
                shared.connection_attempts = 0;
                Some(shared.last_error.take())
            } else {
                if origin == Origin::Caller {
                    shared.last_error = None;
                }
                None
            }
        };

        if let Some(last_error) = exceeded {
            let err = ConnectionError::MaxConnectionAttempts {
                attempts: max_attempts,
                last_error: last_error.map(Box::new),
            };
            error!(error = %err, "giving up on connecting");
            self.shared.lock().last_error = Some(err.clone());
            self.disconnect_listeners.notify(&Some(err.clone()));
            self.shutdown(origin == Origin::Caller).await;
            return Err(err);
        }

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                if origin == Origin::Caller {
                    self.on_link_down();
                }
                Err(err)
            }
        }
    }

    /// Connect the transport and start the driver for the new link.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        if self.transport.is_connected() {
            warn!("transport is already connected");
            return Ok(());
        }

        let link = {
            let mut shared = self.shared.lock();
            shared.next_link += 1;
            shared.link = Some(shared.next_link);
            shared.next_link
        };
        self.set_state(ConnectionState::EstablishingConnection, None);
        info!(
            device = self.device.name(),
            serial = %self.credentials.serial_number,
            "connecting to device"
        );
        if self.dumps.connection {
            debug!(link, "opening transport link");
        }

        let weak = Arc::downgrade(self);
        let on_disconnect: DisconnectHandler = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_link_lost(link);
            }
        });

        let timeout = self.config.connect_timeout_duration();
        let connected = match tokio::time::timeout(timeout, self.transport.connect(on_disconnect)).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout(format!(
                "transport connect exceeded {:?}",
                timeout
            ))),
        };

        if let Err(err) = connected.and_then(|()| self.start_attempt(link)) {
            error!(error = %err, "failed to connect to device");
            {
                let mut shared = self.shared.lock();
                if shared.link == Some(link) {
                    shared.link = None;
                }
            }
            self.set_state(err.state(), Some(err.clone()));
            if self.transport.is_connected() {
                let _ = self.transport.disconnect().await;
            }
            return Err(err);
        }

        info!("connected to device");
        Ok(())
    }

    fn start_attempt(self: &Arc<Self>, link: u64) -> Result<()> {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (errors, error_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        {
            let mut shared = self.shared.lock();
            if shared.link != Some(link) {
                return Err(ConnectionError::Transport(
                    "link dropped while connecting".to_string(),
                ));
            }
            shared.retry_on_disconnect = shared.reconnect_enabled;
        }
        self.set_state(ConnectionState::Connected, None);

        let driver = Driver {
            inner: Arc::clone(self),
            link,
            handshake: Handshake::new(
                self.credentials.clone(),
                self.key_table.clone(),
                Arc::clone(&self.device),
            )
            .with_dumps(self.dumps),
            dispatcher: RequestDispatcher::new(
                Arc::clone(&self.transport),
                &self.config,
                errors,
                tasks.clone(),
                cancel.clone(),
            ),
            dispatch: ApplicationDispatch::new(Arc::clone(&self.device)),
            step: Step::PublicKey,
            errors: 0,
            events: event_rx,
            notifications: events.clone(),
            error_rx,
            cancel: cancel.clone(),
            closed: false,
        };

        let mut shared = self.shared.lock();
        if shared.link != Some(link) {
            return Err(ConnectionError::Transport(
                "link dropped while connecting".to_string(),
            ));
        }
        let driver = tokio::spawn(driver.run());
        shared.attempt = Some(Attempt {
            cancel,
            tasks,
            driver,
            events,
        });
        Ok(())
    }

    fn on_authenticated(&self) {
        {
            let mut shared = self.shared.lock();
            shared.connection_attempts = 0;
            shared.reconnect.reset();
            shared.last_error = None;
        }
        info!(serial = %self.credentials.serial_number, "authenticated with device");
        self.set_state(ConnectionState::Authenticated, None);
    }

    /// Transport callback. Ignores links that are no longer current.
    fn on_link_lost(self: &Arc<Self>, link: u64) {
        {
            let mut shared = self.shared.lock();
            if shared.link != Some(link) {
                debug!(link, "ignoring disconnect of a stale link");
                return;
            }
            shared.link = None;
        }
        self.on_link_down();
    }

    fn on_link_down(self: &Arc<Self>) {
        enum Next {
            Stop(Option<JoinHandle<()>>),
            Signal,
            Supervise,
        }

        let next = {
            let mut shared = self.shared.lock();
            if let Some(attempt) = shared.attempt.take() {
                attempt.abort();
            }
            if !shared.retry_on_disconnect {
                Next::Stop(shared.supervisor.take())
            } else if shared.supervisor.is_some() {
                shared.round_lost = true;
                Next::Signal
            } else if let Some(runtime) = self.runtime.get() {
                shared.supervisor = Some(runtime.spawn(supervise(Arc::clone(self))));
                Next::Supervise
            } else {
                Next::Stop(None)
            }
        };

        match next {
            Next::Stop(supervisor) => {
                if let Some(task) = supervisor {
                    task.abort();
                }
                let state = self.current_state();
                if !state.is_error()
                    && !matches!(
                        state,
                        ConnectionState::Disconnecting | ConnectionState::Disconnected
                    )
                {
                    warn!(state = %state, "link to device lost");
                    self.disconnect_listeners.notify(&None);
                }
                self.set_state(ConnectionState::Disconnected, None);
            }
            Next::Signal => {
                debug!("link lost during reconnect round");
                self.round_signal.notify_one();
            }
            Next::Supervise => {
                warn!("link to device lost, scheduling reconnect");
                self.set_state(ConnectionState::Reconnecting, None);
            }
        }
    }

    /// Wait until the current reconnect round authenticates, loses its link,
    /// or stalls past the connect timeout.
    async fn await_round(&self) -> Round {
        let mut states = self.state.subscribe();
        let deadline = tokio::time::sleep(self.config.connect_timeout_duration());
        tokio::pin!(deadline);

        loop {
            if self.shared.lock().round_lost {
                return Round::Lost;
            }
            if states.borrow_and_update().state.authenticated() {
                return Round::Authenticated;
            }
            tokio::select! {
                _ = self.round_signal.notified() => {}
                changed = states.changed() => {
                    if changed.is_err() {
                        return Round::Lost;
                    }
                }
                _ = &mut deadline => return Round::TimedOut,
            }
        }
    }

    /// Drop a link whose handshake stalled.
    async fn abandon_link(&self, err: ConnectionError) {
        let attempt = {
            let mut shared = self.shared.lock();
            shared.link = None;
            shared.attempt.take()
        };
        if let Some(attempt) = attempt {
            attempt.shutdown().await;
        }
        warn!(error = %err, "abandoning stalled handshake");
        self.set_state(err.state(), Some(err));
        if self.transport.is_connected() {
            if let Err(err) = self.transport.disconnect().await {
                warn!(error = %err, "transport disconnect failed");
            }
        }
    }

    fn reconnects_exhausted(&self) {
        let err = {
            let mut shared = self.shared.lock();
            shared.retry_on_disconnect = false;
            shared.supervisor = None;
            ConnectionError::MaxReconnectAttempts {
                attempts: shared.reconnect.max_attempts(),
                last_error: shared.last_error.clone().map(Box::new),
            }
        };
        error!(error = %err, "giving up on reconnecting");
        self.set_state(err.state(), Some(err));
    }

    /// Clear the supervisor slot unless the link already dropped again.
    fn finish_round(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.round_lost {
            return false;
        }
        shared.supervisor = None;
        true
    }

    fn finish_supervisor(&self) {
        self.shared.lock().supervisor = None;
    }

    /// Orderly teardown: stop retrying, stop the reconnect task, stop the
    /// driver and its replies, then close the transport.
    async fn shutdown(&self, abort_supervisor: bool) {
        let (supervisor, attempt) = {
            let mut shared = self.shared.lock();
            shared.retry_on_disconnect = false;
            shared.reconnect.reset();
            shared.link = None;
            let supervisor = if abort_supervisor {
                shared.supervisor.take()
            } else {
                None
            };
            (supervisor, shared.attempt.take())
        };

        if let Some(task) = supervisor {
            task.abort();
            let _ = task.await;
        }
        if let Some(attempt) = attempt {
            attempt.shutdown().await;
        }

        if self.current_state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnecting, None);
        }
        if self.transport.is_connected() {
            if let Err(err) = self.transport.disconnect().await {
                warn!(error = %err, "transport disconnect failed");
            }
        }
        self.set_state(ConnectionState::Disconnected, None);
    }
}

/// Bounded reconnect loop, spawned when a link with retry armed drops.
async fn supervise(inner: Arc<Inner>) {
    loop {
        let round = {
            let mut shared = inner.shared.lock();
            shared.round_lost = false;
            shared
                .reconnect
                .next_delay()
                .map(|delay| (delay, shared.reconnect.attempt(), shared.reconnect.max_attempts()))
        };
        let Some((delay, attempt, max_attempts)) = round else {
            inner.reconnects_exhausted();
            return;
        };

        inner.set_state(ConnectionState::Reconnecting, None);
        warn!(attempt, max_attempts, delay_secs = delay.as_secs(), "reconnecting to device");
        tokio::time::sleep(delay).await;

        if !inner.shared.lock().retry_on_disconnect {
            debug!("reconnect cancelled");
            inner.finish_supervisor();
            return;
        }

        match inner.connect_counted(Origin::Supervisor).await {
            Ok(()) => {}
            Err(err @ ConnectionError::MaxConnectionAttempts { .. }) => {
                debug!(error = %err, "reconnect stopped");
                inner.finish_supervisor();
                return;
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconnect attempt failed");
                continue;
            }
        }

        match inner.await_round().await {
            Round::Authenticated => {
                if inner.finish_round() {
                    info!(attempt, "reconnected to device");
                    return;
                }
            }
            Round::Lost => debug!(attempt, "reconnected link dropped before authenticating"),
            Round::TimedOut => {
                let timeout = inner.config.connect_timeout_duration();
                inner
                    .abandon_link(ConnectionError::Timeout(format!(
                        "handshake did not finish within {:?}",
                        timeout
                    )))
                    .await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    PublicKey,
    KeyInfo,
    AuthStatus,
    /// Authentication request sent; every packet goes to the general listener.
    Listening,
}

struct Driver {
    inner: Arc<Inner>,
    link: u64,
    handshake: Handshake,
    dispatcher: RequestDispatcher,
    dispatch: ApplicationDispatch,
    step: Step,
    errors: u32,
    events: mpsc::UnboundedReceiver<Event>,
    notifications: mpsc::UnboundedSender<Event>,
    error_rx: mpsc::UnboundedReceiver<ConnectionError>,
    cancel: CancellationToken,
    closed: bool,
}

impl Driver {
    async fn run(mut self) {
        if let Err(err) = self.begin().await {
            self.fail(err).await;
        }

        while !self.closed {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(err) = self.error_rx.recv() => self.record_error(err).await,
                Some(event) = self.events.recv() => self.on_event(event).await,
                else => break,
            }
        }

        self.dispatcher.shutdown().await;
        debug!(link = self.link, "connection driver stopped");
    }

    async fn begin(&mut self) -> Result<()> {
        self.inner.set_state(ConnectionState::PublicKeyExchange, None);
        let frame = self.handshake.public_key_request()?;
        self.request(frame).await
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Notification(data) => {
                if let Err(err) = self.on_notification(&data).await {
                    self.fail(err).await;
                }
            }
            Event::Send { packet, done } => match self.handshake.seal_bytes(&packet) {
                // Retries run beside the driver so inbound traffic keeps flowing.
                Ok(frame) => self.dispatcher.send_detached(frame, done),
                Err(err) => {
                    let _ = done.send(Err(err));
                }
            },
        }
    }

    async fn on_notification(&mut self, data: &[u8]) -> Result<()> {
        self.inner.dumps.encrypted("rx", data);

        match self.step {
            Step::PublicKey => {
                let Some(payload) = self.next_frame(data).await else {
                    return Ok(());
                };
                self.step_done().await;
                self.inner.set_state(ConnectionState::PublicKeyReceived, None);
                self.handshake.accept_public_key(&payload)?;
                debug!("shared key established");

                self.inner.set_state(ConnectionState::RequestingSessionKey, None);
                self.step = Step::KeyInfo;
                let frame = self.handshake.key_info_request()?;
                self.request(frame).await
            }
            Step::KeyInfo => {
                let Some(payload) = self.next_frame(data).await else {
                    return Ok(());
                };
                self.step_done().await;
                self.inner.set_state(ConnectionState::SessionKeyReceived, None);
                self.handshake.accept_key_info(&payload)?;
                debug!("session key derived");

                self.inner.set_state(ConnectionState::RequestingAuthStatus, None);
                self.step = Step::AuthStatus;
                let frame = self.handshake.auth_status_request()?;
                self.request(frame).await
            }
            Step::AuthStatus => {
                let packets = self.next_packets(data).await;
                if packets.is_empty() {
                    return Ok(());
                }
                self.step_done().await;
                self.inner.set_state(ConnectionState::AuthStatusReceived, None);
                for packet in &packets {
                    self.inner.dumps.packet(packet);
                }

                self.inner.set_state(ConnectionState::Authenticating, None);
                self.step = Step::Listening;
                let frame = self.handshake.authentication_request()?;
                self.request(frame).await
            }
            Step::Listening => {
                for packet in self.next_packets(data).await {
                    self.on_packet(packet).await?;
                    if self.closed {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_packet(&mut self, packet: ApplicationPacket) -> Result<()> {
        self.inner.dumps.packet(&packet);

        match self.dispatch.route(&packet) {
            Inbound::AuthResponse { success: true } => {
                self.errors = 0;
                self.inner.on_authenticated();
            }
            Inbound::AuthResponse { success: false } => {
                return Err(ConnectionError::AuthFailed(format!(
                    "device rejected authentication with status {}",
                    hex::encode(&packet.payload)
                )));
            }
            Inbound::Application(routed) => {
                if let Some(reply) = routed.reply {
                    match self.handshake.seal(&reply) {
                        Ok(frame) => self.dispatcher.reply(frame),
                        Err(err) => self.record_error(err).await,
                    }
                }
                match routed.handled {
                    Ok(true) => {}
                    Ok(false) => debug!(
                        cmd_set = packet.cmd_set,
                        cmd_id = packet.cmd_id,
                        "packet not handled by device"
                    ),
                    Err(err) => {
                        self.record_error(ConnectionError::Device(format!("{:#}", err)))
                            .await
                    }
                }
            }
        }
        Ok(())
    }

    /// Send a handshake request, routing the response to this driver.
    async fn request(&mut self, frame: Vec<u8>) -> Result<()> {
        let handler = self.notification_handler();
        match self.dispatcher.send(&frame, Some(handler)).await {
            Delivery::Failed(err) => Err(err),
            Delivery::Sent | Delivery::Skipped | Delivery::Cancelled => Ok(()),
        }
    }

    fn notification_handler(&self) -> NotificationHandler {
        let events = self.notifications.clone();
        Arc::new(move |data| {
            let _ = events.send(Event::Notification(data));
        })
    }

    async fn step_done(&self) {
        if let Err(err) = self.inner.transport.unsubscribe().await {
            debug!(error = %err, "unsubscribe failed");
        }
    }

    /// First parseable frame of a handshake delivery.
    async fn next_frame(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let mut found = None;
        for frame in self.handshake.feed_frames(data) {
            match frame {
                Ok(payload) if found.is_none() => found = Some(payload),
                Ok(_) => debug!("ignoring extra handshake frame"),
                Err(err) => self.record_error(err.into()).await,
            }
        }
        if self.closed {
            return None;
        }
        found
    }

    async fn next_packets(&mut self, data: &[u8]) -> Vec<ApplicationPacket> {
        let mut packets = Vec::new();
        for packet in self.handshake.decode_packets(data) {
            match packet {
                Ok(packet) => packets.push(packet),
                Err(err) => self.record_error(err.into()).await,
            }
        }
        if self.closed {
            packets.clear();
        }
        packets
    }

    async fn record_error(&mut self, err: ConnectionError) {
        if self.closed {
            return;
        }
        self.errors += 1;
        let threshold = self.inner.config.errors.threshold;
        warn!(count = self.errors, threshold, error = %err, "recovered connection error");

        let last = err.to_string();
        self.inner.shared.lock().last_error = Some(err);
        if self.errors > threshold {
            let err = ConnectionError::TooManyErrors {
                count: self.errors,
                last,
            };
            self.errors = 0;
            error!(error = %err, "closing link");
            self.inner.set_state(err.state(), Some(err));
            self.close_link().await;
        }
    }

    /// End the attempt on a fatal error.
    async fn fail(&mut self, err: ConnectionError) {
        if self.closed {
            return;
        }
        error!(error = %err, state = %err.state(), "connection attempt failed");
        if matches!(err, ConnectionError::AuthFailed(_)) {
            self.inner.shared.lock().retry_on_disconnect = false;
        }
        self.inner.set_state(err.state(), Some(err));
        self.close_link().await;
    }

    async fn close_link(&mut self) {
        self.closed = true;
        if let Err(err) = self.inner.transport.disconnect().await {
            warn!(error = %err, "transport disconnect failed");
        }
        // Transports that stay silent on requested disconnects still end here.
        self.inner.on_link_lost(self.link);
    }
}
