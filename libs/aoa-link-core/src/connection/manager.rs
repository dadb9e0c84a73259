use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    accessory::{AccessoryDescriptor, DeviceIdentity},
    connection::{DeviceEvent, DeviceHandle, UsbBackend},
    negotiation::{
        BulkEndpoints, ControlChannel, DEFAULT_CONTROL_TIMEOUT, NegotiationError,
        NegotiationOutcome, Negotiator, ProtocolVersion,
    },
    transport::{MessageHandler, TransportError, TransportOptions, Transporter},
    util::lock,
};

/// How long a device that accepted `ACCESSORY_START` has to come back.
pub const DEFAULT_REENUMERATION_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

type IdOf<B> = <<B as UsbBackend>::Handle as DeviceHandle>::Id;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("Failed to open device: {0}")]
    Open(BoxedError),
    #[error("Permission to use the device was denied")]
    PermissionDenied,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("No accessory is connected")]
    NotConnected,
    #[error("USB backend error: {0}")]
    Backend(BoxedError),
}

/// Where the manager is, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    AwaitingPermission = 1,
    Negotiating = 2,
    AwaitingReenumeration = 3,
    Connected = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::AwaitingPermission,
            2 => ConnectionState::Negotiating,
            3 => ConnectionState::AwaitingReenumeration,
            4 => ConnectionState::Connected,
            _ => ConnectionState::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Interface claimed on every device.
    pub interface: u8,
    pub control_timeout: Duration,
    pub reenumeration_timeout: Duration,
    pub transport: TransportOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            interface: 0,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            reenumeration_timeout: DEFAULT_REENUMERATION_TIMEOUT,
            transport: TransportOptions::default(),
        }
    }
}

/// What was negotiated with the connected accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub identity: DeviceIdentity,
    pub version: ProtocolVersion,
    pub endpoints: BulkEndpoints,
}

struct Session<B: UsbBackend> {
    id: IdOf<B>,
    info: SessionInfo,
    transporter: Arc<Transporter<B::Channel>>,
    // Declared last so the interface is released after the transport
    _device: B::Device,
}

impl<B: UsbBackend> Session<B> {
    /// False once the reader has stopped, including when it gave up on its
    /// own after repeated read failures.
    fn is_live(&self) -> bool {
        !self.transporter.is_closed() && self.transporter.is_reading()
    }
}

enum State<B: UsbBackend> {
    Idle,
    AwaitingPermission {
        id: IdOf<B>,
    },
    Negotiating {
        id: IdOf<B>,
    },
    AwaitingReenumeration {
        previous: IdOf<B>,
        serial: Option<String>,
        deadline: Instant,
    },
    Connected(Session<B>),
}

impl<B: UsbBackend> State<B> {
    fn phase(&self) -> ConnectionState {
        match self {
            State::Idle => ConnectionState::Idle,
            State::AwaitingPermission { .. } => ConnectionState::AwaitingPermission,
            State::Negotiating { .. } => ConnectionState::Negotiating,
            State::AwaitingReenumeration { .. } => ConnectionState::AwaitingReenumeration,
            State::Connected(_) => ConnectionState::Connected,
        }
    }
}

/// Tracks at most one device from attach to detach.
///
/// Events are handled synchronously on the calling thread, negotiation
/// included, under one lock: an attach or detach can never race with a
/// mode switch in flight. A device that is not yet an accessory is asked
/// to switch and the manager then waits for it to come back with accessory
/// IDs; an accessory device is negotiated with directly and, on success,
/// gets a [`Transporter`] bound to its bulk endpoints.
pub struct ConnectionManager<B: UsbBackend> {
    backend: B,
    negotiator: Negotiator,
    options: ConnectionOptions,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<State<B>>,
    phase: AtomicU8,
}

impl<B: UsbBackend> ConnectionManager<B> {
    pub fn new(
        backend: B,
        descriptor: AccessoryDescriptor,
        options: ConnectionOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            backend,
            negotiator: Negotiator::new(descriptor).with_timeout(options.control_timeout),
            options,
            handler,
            state: Mutex::new(State::Idle),
            phase: AtomicU8::new(ConnectionState::Idle as u8),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current state. Readable while an event is being handled, so it can
    /// show `Negotiating`.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        match &*lock(&self.state) {
            State::Connected(session) => Some(session.info),
            _ => None,
        }
    }

    /// Handle one bus event and return the state it left the manager in.
    /// An error means the attempt it started failed; the manager is back
    /// to `Idle` and ready for the next event.
    pub fn handle_event(
        &self,
        event: DeviceEvent<B::Handle>,
    ) -> Result<ConnectionState, ConnectError> {
        let mut state = lock(&self.state);
        self.expire_reenumeration(&mut state);
        self.drop_stopped_session(&mut state);

        let result = match event {
            DeviceEvent::Attached(handle) => {
                debug!("Device attached: {handle:?}");
                self.on_attached(&mut state, handle)
            }
            DeviceEvent::Detached(id) => {
                debug!("Device detached: {id:?}");
                self.on_detached(&mut state, &id);
                Ok(())
            }
            DeviceEvent::PermissionGranted(handle) => {
                info!("Permission granted for {handle:?}");
                self.on_permission_granted(&mut state, handle)
            }
            DeviceEvent::PermissionDenied(id) => self.on_permission_denied(&mut state, &id),
        };

        let phase = state.phase();
        self.publish(phase);
        result.map(|()| phase)
    }

    /// Drop a re-enumeration wait whose deadline has passed, and a session
    /// whose transport has stopped.
    pub fn poll_timeouts(&self) -> ConnectionState {
        let mut state = lock(&self.state);
        self.expire_reenumeration(&mut state);
        self.drop_stopped_session(&mut state);
        state.phase()
    }

    /// Tear down whatever is in progress and go back to `Idle`.
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        if let State::Connected(session) = std::mem::replace(&mut *state, State::Idle) {
            session.transporter.close();
            self.narrate(&format!("Disconnected from {}", session.info.identity));
        }
        self.publish(ConnectionState::Idle);
    }

    /// Send a message to the connected accessory. The write happens on the
    /// calling thread, outside the manager's lock.
    pub fn send(&self, message: &str) -> Result<(), ConnectError> {
        let transporter = {
            let mut state = lock(&self.state);
            self.drop_stopped_session(&mut state);
            match &*state {
                State::Connected(session) => session.transporter.clone(),
                _ => return Err(ConnectError::NotConnected),
            }
        };
        transporter.send(message)?;
        Ok(())
    }

    fn on_attached(&self, state: &mut State<B>, handle: B::Handle) -> Result<(), ConnectError> {
        match &*state {
            State::Connected(session) => {
                info!(
                    "Ignoring {handle:?}: already connected to {}",
                    session.info.identity
                );
                return Ok(());
            }
            State::AwaitingReenumeration { serial, .. } => {
                if !handle.class().is_accessory() {
                    debug!("Ignoring {handle:?} while waiting for an accessory to attach");
                    return Ok(());
                }
                if let (Some(expected), Some(actual)) = (serial.as_deref(), handle.serial_number())
                {
                    if expected != actual {
                        debug!("Ignoring accessory {handle:?}: serial {actual} != {expected}");
                        return Ok(());
                    }
                }
                info!("Device re-enumerated as an accessory: {handle:?}");
            }
            State::AwaitingPermission { id } if *id != handle.id() => {
                debug!("Ignoring {handle:?} while waiting on permission for {id:?}");
                return Ok(());
            }
            _ => {}
        }

        if !self.backend.has_permission(&handle) {
            self.narrate("Requesting permission to connect the device.");
            if let Err(e) = self.backend.request_permission(&handle) {
                self.transition(state, State::Idle);
                return Err(ConnectError::Backend(Box::new(e)));
            }
            self.transition(state, State::AwaitingPermission { id: handle.id() });
            return Ok(());
        }

        self.connect(state, handle)
    }

    fn on_detached(&self, state: &mut State<B>, id: &IdOf<B>) {
        match std::mem::replace(state, State::Idle) {
            State::Connected(session) if session.id == *id => {
                session.transporter.close();
                self.narrate(&format!("Accessory detached: {}", session.info.identity));
            }
            State::AwaitingPermission { id: waiting } if waiting == *id => {
                debug!("Device detached before permission was granted");
            }
            State::AwaitingReenumeration {
                previous,
                serial,
                deadline,
            } => {
                if previous == *id {
                    debug!("Device left the bus to re-enumerate");
                }
                *state = State::AwaitingReenumeration {
                    previous,
                    serial,
                    deadline,
                };
            }
            other => {
                debug!("Ignoring detach of untracked device {id:?}");
                *state = other;
            }
        }
    }

    fn on_permission_granted(
        &self,
        state: &mut State<B>,
        handle: B::Handle,
    ) -> Result<(), ConnectError> {
        let expected = match &*state {
            State::Idle => true,
            State::AwaitingPermission { id } => *id == handle.id(),
            _ => false,
        };

        if expected {
            self.connect(state, handle)
        } else {
            debug!("Ignoring permission for {handle:?}");
            Ok(())
        }
    }

    fn on_permission_denied(
        &self,
        state: &mut State<B>,
        id: &IdOf<B>,
    ) -> Result<(), ConnectError> {
        if matches!(&*state, State::AwaitingPermission { id: waiting } if waiting == id) {
            self.narrate("Permission to use the device was denied");
            self.transition(state, State::Idle);
            return Err(ConnectError::PermissionDenied);
        }
        Ok(())
    }

    fn connect(&self, state: &mut State<B>, handle: B::Handle) -> Result<(), ConnectError> {
        self.transition(state, State::Negotiating { id: handle.id() });

        match self.negotiate(&handle) {
            Ok(next) => {
                self.transition(state, next);
                Ok(())
            }
            Err(e) => {
                self.narrate(&format!("Connection attempt failed: {e}"));
                self.transition(state, State::Idle);
                Err(e)
            }
        }
    }

    fn negotiate(&self, handle: &B::Handle) -> Result<State<B>, ConnectError> {
        let device = self
            .backend
            .open(handle, self.options.interface)
            .map_err(|e| ConnectError::Open(Box::new(e)))?;

        match self.negotiator.negotiate(&device)? {
            NegotiationOutcome::SwitchRequested {
                version,
                string_failures,
            } => {
                if !string_failures.is_empty() {
                    warn!(
                        "{} identification string(s) were not fully sent",
                        string_failures.len()
                    );
                }
                self.narrate(&format!(
                    "Protocol version {version}, waiting for device to re-enumerate..."
                ));
                Ok(State::AwaitingReenumeration {
                    previous: handle.id(),
                    serial: handle.serial_number().map(str::to_string),
                    deadline: Instant::now() + self.options.reenumeration_timeout,
                })
            }
            NegotiationOutcome::Ready { version, endpoints } => {
                let channel = self
                    .backend
                    .open_channel(&device, endpoints)
                    .map_err(|e| ConnectError::Backend(Box::new(e)))?;
                let transporter =
                    Transporter::spawn(channel, &self.options.transport, self.handler.clone())?;

                let info = SessionInfo {
                    identity: device.identity(),
                    version,
                    endpoints,
                };
                self.narrate(&format!("Connected to {} (protocol {version})", info.identity));

                Ok(State::Connected(Session {
                    id: handle.id(),
                    info,
                    transporter: Arc::new(transporter),
                    _device: device,
                }))
            }
        }
    }

    fn expire_reenumeration(&self, state: &mut State<B>) {
        let expired = matches!(
            &*state,
            State::AwaitingReenumeration { deadline, .. } if Instant::now() >= *deadline
        );
        if expired {
            self.narrate("Device did not come back as an accessory in time");
            self.transition(state, State::Idle);
        }
    }

    fn drop_stopped_session(&self, state: &mut State<B>) {
        let stopped = matches!(&*state, State::Connected(session) if !session.is_live());
        if stopped {
            self.narrate("Transport stopped, dropping the session");
            self.transition(state, State::Idle);
        }
    }

    fn transition(&self, state: &mut State<B>, next: State<B>) {
        let phase = next.phase();
        if let State::Connected(session) = std::mem::replace(state, next) {
            // Never leave a reader running without an owner
            session.transporter.close();
        }
        self.publish(phase);
    }

    fn publish(&self, phase: ConnectionState) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn narrate(&self, line: &str) {
        info!("{line}");
        self.handler.on_log(line);
    }
}
