//! Single-threaded readiness event loop.
//!
//! # One loop iteration (for beginners)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ 1. run due timers             (may queue outbound messages)      │
//! │ 2. poll sockets, wait ≤ 5 ms  (listener + every connection)      │
//! │ 3. for each ready socket:                                        │
//! │      listener   → accept, admission control, register            │
//! │      connection → flush pending output, read until WouldBlock,   │
//! │                   feed Connection::on_data, drop it if closed    │
//! │ 4. drain up to 64 IPC datagrams and dispatch them                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! After every step that can run application code the [`Outbox`] is drained:
//! queued sends become frames on the target sockets, queued closes close
//! them.  The short poll timeout keeps timers and IPC responsive even when
//! no socket is active.
//!
//! `mio` readiness is edge-triggered, so every ready socket is read (and
//! the listener accepted) until the OS reports `WouldBlock`.  A connection
//! is registered for `WRITABLE` only while it has output the kernel did not
//! accept yet.
//!
//! Everything runs on the calling thread; no locks are needed.  A slow
//! application callback stalls every connection for its duration.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;
use tracing::{debug, info, warn};
use wshub_core::ipc::IpcMessage;
use wshub_core::protocol::close::CloseCode;
use wshub_core::protocol::handshake::HandshakePolicy;

use crate::application::admission::{AdmissionControl, RequestRateLimiter};
use crate::application::registry::{
    Application, ApplicationError, ApplicationRegistry, Event, OutboundCommand, Outbox,
    RegistryError,
};
use crate::application::status::{StatusApplication, StatusLevel};
use crate::application::timers::TimerScheduler;
use crate::domain::config::{InvalidConfig, ServerConfig};
use crate::domain::{ClientInfo, ConnectionId};
use crate::infrastructure::connection::{Connection, ConnectionLimits, Dispatch};
use crate::infrastructure::ipc::{IpcChannel, IpcChannelError};

const LISTENER: Token = Token(0);

/// Upper bound on how long one poll waits for socket readiness.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(5);

const EVENTS_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 4096;
const MAX_IPC_PER_ITERATION: usize = 64;

/// Errors that stop the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] InvalidConfig),

    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{host}:{port} resolved to no address")]
    NoAddress { host: String, port: u16 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Ipc(#[from] IpcChannelError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("event loop I/O error: {0}")]
    Io(#[from] io::Error),
}

struct Slot {
    token: Token,
    connection: Connection<TcpStream>,
    interest: Interest,
}

/// State connections and IPC messages are routed through.
struct Routing {
    applications: ApplicationRegistry,
    outbox: Outbox,
    policy: HandshakePolicy,
    rate_limiter: Option<RequestRateLimiter>,
}

impl Routing {
    fn dispatch(&mut self) -> Dispatch<'_> {
        Dispatch {
            applications: &mut self.applications,
            outbox: &mut self.outbox,
            policy: &self.policy,
            rate_limiter: self.rate_limiter.as_mut(),
        }
    }

    fn dispatch_ipc(&mut self, message: IpcMessage) {
        match message {
            IpcMessage::ServerCommand { command, .. } => {
                debug!(%command, "IPC server command has no handler");
            }
            IpcMessage::ApplicationData { application, data } => {
                match self
                    .applications
                    .dispatch(&application, Event::Ipc(&data), &mut self.outbox)
                {
                    Ok(()) => debug!(%application, "IPC message delivered"),
                    Err(ApplicationError::NotRegistered(name)) => {
                        warn!("dropping IPC message for unknown application {name:?}");
                    }
                    Err(e) => warn!(%application, "IPC callback failed: {e}"),
                }
            }
        }
    }
}

/// The WebSocket server: listening socket, connections, applications.
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionId, Slot>,
    tokens: HashMap<Token, ConnectionId>,
    next_serial: usize,
    routing: Routing,
    admission: AdmissionControl,
    limits: ConnectionLimits,
    timers: TimerScheduler,
    ipc: Option<IpcChannel>,
    read_buf: Box<[u8]>,
}

impl Server {
    /// Validates `config`, binds the listening socket and (if enabled) the
    /// IPC socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if the configuration is invalid or a socket
    /// cannot be bound.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let host = config.server.host.clone();
        let port = config.server.port;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|source| ServerError::Resolve {
                host: host.clone(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| ServerError::NoAddress {
                host: host.clone(),
                port,
            })?;

        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let ipc = if config.ipc.enabled {
            Some(IpcChannel::bind(&config.ipc)?)
        } else {
            None
        };

        let limits = &config.limits;
        let admission = AdmissionControl::new(limits.max_clients, limits.max_connections_per_ip);
        let rate_limiter = limits.max_requests_per_minute.map(RequestRateLimiter::new);
        let connection_limits = ConnectionLimits::from(limits);

        info!(%local_addr, "WebSocket server listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            local_addr,
            connections: HashMap::new(),
            tokens: HashMap::new(),
            next_serial: 1,
            routing: Routing {
                applications: ApplicationRegistry::new(),
                outbox: Outbox::new(),
                policy: config.handshake_policy(),
                rate_limiter,
            },
            admission,
            limits: connection_limits,
            timers: TimerScheduler::new(),
            ipc,
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            config,
        })
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    /// Registers an application under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for an empty, reserved or duplicate name.
    pub fn register_application(
        &mut self,
        name: impl Into<String>,
        application: Box<dyn Application>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        self.routing.applications.register(name.clone(), application)?;
        info!(application = %name, "application registered");
        Ok(())
    }

    /// Registers the status application under `"status"` and, unless
    /// `status_refresh_secs` is zero, a timer that re-sends `serverInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if it is already registered.
    pub fn register_status(&mut self, status: StatusApplication) -> Result<(), RegistryError> {
        let limits = &self.config.limits;
        self.routing.applications.register_status(
            status,
            limits.max_clients,
            limits.max_connections_per_ip,
        )?;
        if self.config.status_refresh_secs > 0 {
            self.timers.add(
                Duration::from_secs(self.config.status_refresh_secs),
                |applications, outbox| {
                    if let Some(status) = applications.status_mut() {
                        status.broadcast_server_info(outbox);
                    }
                },
            );
        }
        info!("status application registered");
        Ok(())
    }

    /// Adds a timer fired from the loop every `interval`.
    pub fn add_timer<F>(&mut self, interval: Duration, callback: F)
    where
        F: FnMut(&mut ApplicationRegistry, &mut Outbox) + Send + 'static,
    {
        self.timers.add(interval, callback);
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn applications(&self) -> &ApplicationRegistry {
        &self.routing.applications
    }

    /// Number of tracked connections, including those mid-handshake.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections admitted and not yet released.
    pub fn admitted_count(&self) -> usize {
        self.admission.open_connections()
    }

    /// Path of the IPC socket, when IPC is enabled.
    #[cfg(unix)]
    pub fn ipc_path(&self) -> Option<&Path> {
        self.ipc.as_ref().map(IpcChannel::path)
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    /// Runs the loop until `running` is cleared, then closes every
    /// connection with 1001 (going away).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if polling itself fails.
    pub fn run_until(&mut self, running: &AtomicBool) -> Result<(), ServerError> {
        info!("event loop started");
        while running.load(Ordering::SeqCst) {
            self.run_once()?;
        }
        self.shutdown();
        Ok(())
    }

    /// Runs one loop iteration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if polling fails for a reason other than
    /// an interrupted system call.
    pub fn run_once(&mut self) -> Result<(), ServerError> {
        self.timers
            .run(&mut self.routing.applications, &mut self.routing.outbox);
        self.drain_outbox();
        self.expire_handshakes(Instant::now());

        match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                (event.token(), readable, event.is_writable())
            })
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_pending();
            } else if let Some(&id) = self.tokens.get(&token) {
                if writable {
                    self.flush_connection(id);
                }
                if readable {
                    self.read_connection(id);
                }
                self.settle(id);
            }
            self.drain_outbox();
        }

        self.poll_ipc();
        Ok(())
    }

    /// Closes every connection with 1001 and drops it.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.connections.get_mut(&id) {
                slot.connection
                    .close(CloseCode::GoingAway, &mut self.routing.dispatch());
            }
            self.remove_connection(id);
        }
        self.drain_outbox();
        info!("server stopped");
    }

    // ── Accept ────────────────────────────────────────────────────────────────

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(rejection) = self.admission.try_admit(addr.ip()) {
            warn!(peer = %addr, "connection refused: {rejection}");
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(peer = %addr, "shutdown of refused socket: {e}");
            }
            drop(stream);
            if let Some(status) = self.routing.applications.status_mut() {
                status.status_message(
                    &rejection.status_text(),
                    StatusLevel::Warning,
                    &mut self.routing.outbox,
                );
            }
            return;
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let token = Token(serial);
        let id = ConnectionId::derive(addr, serial as u64);

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!(peer = %addr, "could not register connection: {e}");
            self.admission.release(addr.ip());
            return;
        }

        let connection = Connection::new(ClientInfo::new(id, addr), stream, self.limits);
        self.tokens.insert(token, id);
        self.connections.insert(
            id,
            Slot {
                token,
                connection,
                interest: Interest::READABLE,
            },
        );
        debug!(peer = %addr, %id, "connection accepted");
    }

    // ── Connection I/O ────────────────────────────────────────────────────────

    fn read_connection(&mut self, id: ConnectionId) {
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        let mut ctx = self.routing.dispatch();
        while !slot.connection.is_closed() {
            match slot.connection.transport_mut().read(&mut self.read_buf) {
                Ok(0) => slot.connection.peer_closed(&mut ctx),
                Ok(n) => slot.connection.on_data(&self.read_buf[..n], &mut ctx),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => slot.connection.fail(&e, &mut ctx),
            }
        }
    }

    fn flush_connection(&mut self, id: ConnectionId) {
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = slot.connection.flush() {
            slot.connection.fail(&e, &mut self.routing.dispatch());
        }
    }

    /// Drops a closed connection, or updates its poll interest.
    fn settle(&mut self, id: ConnectionId) {
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        if slot.connection.is_closed() {
            self.remove_connection(id);
            return;
        }

        let wanted = if slot.connection.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if wanted == slot.interest {
            return;
        }
        let reregistered =
            self.poll
                .registry()
                .reregister(slot.connection.transport_mut(), slot.token, wanted);
        match reregistered {
            Ok(()) => slot.interest = wanted,
            Err(e) => {
                slot.connection.fail(&e, &mut self.routing.dispatch());
                self.remove_connection(id);
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        let Some(mut slot) = self.connections.remove(&id) else {
            return;
        };
        self.tokens.remove(&slot.token);
        if let Err(e) = self
            .poll
            .registry()
            .deregister(slot.connection.transport_mut())
        {
            debug!(%id, "deregister: {e}");
        }
        if !slot.connection.is_closed() {
            slot.connection
                .close(CloseCode::GoingAway, &mut self.routing.dispatch());
        }
        self.admission.release(slot.connection.info().ip());
        if let Some(limiter) = self.routing.rate_limiter.as_mut() {
            limiter.forget(id);
        }
        debug!(
            client = %slot.connection.info().key(),
            reason = ?slot.connection.close_reason(),
            "connection removed"
        );
    }

    /// Drops sockets still waiting for their upgrade request past the
    /// deadline, freeing their admission slots.
    fn expire_handshakes(&mut self, now: Instant) {
        let overdue: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.connection.handshake_overdue(now))
            .map(|(&id, _)| id)
            .collect();
        for id in overdue {
            if let Some(slot) = self.connections.get_mut(&id) {
                slot.connection.expire_handshake(&mut self.routing.dispatch());
            }
            self.remove_connection(id);
        }
    }

    /// Executes queued sends and closes in order.
    fn drain_outbox(&mut self) {
        while let Some(command) = self.routing.outbox.pop() {
            let id = command.target();
            let Some(slot) = self.connections.get_mut(&id) else {
                debug!(%id, "dropping command for unknown connection");
                continue;
            };
            match command {
                OutboundCommand::Send { text, .. } => {
                    if !slot.connection.is_open() {
                        continue;
                    }
                    if let Err(e) = slot.connection.send_text(&text) {
                        slot.connection.fail(&e, &mut self.routing.dispatch());
                    }
                }
                OutboundCommand::Close { code, .. } => {
                    slot.connection.close(code, &mut self.routing.dispatch());
                }
            }
            self.settle(id);
        }
    }

    // ── IPC ───────────────────────────────────────────────────────────────────

    fn poll_ipc(&mut self) {
        let Some(ipc) = self.ipc.as_mut() else {
            return;
        };
        for _ in 0..MAX_IPC_PER_ITERATION {
            match ipc.receive() {
                Ok(Some(message)) => self.routing.dispatch_ipc(message),
                Ok(None) => break,
                Err(IpcChannelError::Decode(e)) => warn!("discarding IPC datagram: {e}"),
                Err(e) => {
                    warn!("{e}");
                    break;
                }
            }
        }
        self.drain_outbox();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
