//! Application trait, registry, and the outbox applications reply through.
//!
//! # How applications plug in (for beginners)
//!
//! Every WebSocket URL path names an *application*: `ws://host/echo` binds
//! the connection to whatever was registered under `"echo"`.  The event loop
//! calls the application when a client connects, sends a text message,
//! disconnects, or when a local process sends it an IPC payload.
//!
//! Applications never see sockets.  To reply, they push commands onto the
//! [`Outbox`]; the event loop drains it after every callback and performs the
//! writes.  Commands are executed in the order they were queued, so replies
//! to one client keep their order.
//!
//! ```text
//! Connection ──Event──▶ ApplicationRegistry::dispatch ──▶ Application
//!                                                             │
//!                          event loop ◀── Outbox::send ◀──────┘
//! ```
//!
//! The name `"status"` is reserved for the built-in
//! [`StatusApplication`], which additionally receives server-wide
//! notifications (see [`ApplicationRegistry::status_mut`]).

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use wshub_core::ipc::IpcData;
use wshub_core::protocol::close::CloseCode;

use crate::application::status::StatusApplication;
use crate::domain::{ClientInfo, ConnectionId};

/// Name under which the status application is registered.
pub const STATUS_APPLICATION: &str = "status";

/// Errors an application callback can report.  They are logged by the
/// caller and never close the connection on their own.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// The message is well-formed JSON but not a recognised request.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The message is not valid JSON for the application's schema.
    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),

    /// No application is registered under the requested name.
    #[error("no application registered under {0:?}")]
    NotRegistered(String),

    /// The callback panicked; the panic was caught at the dispatch boundary.
    #[error("application panicked: {0}")]
    Panicked(String),
}

/// Errors returned when registering an application.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("application name must not be empty")]
    EmptyName,

    #[error("application name {0:?} is reserved for the status application")]
    Reserved(String),

    #[error("an application named {0:?} is already registered")]
    Duplicate(String),
}

/// Business logic bound to one URL path.
///
/// Every callback runs synchronously on the event loop thread and blocks all
/// other connections until it returns.
#[cfg_attr(test, mockall::automock)]
pub trait Application: Send {
    /// A client completed the handshake on this application's path.
    fn on_connect(&mut self, client: &ClientInfo, outbox: &mut Outbox)
        -> Result<(), ApplicationError>;

    /// A client bound to this application went away.  Called exactly once
    /// per successful `on_connect`.
    fn on_disconnect(
        &mut self,
        client: &ClientInfo,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError>;

    /// A text frame arrived from a bound client.
    fn on_data(
        &mut self,
        payload: &str,
        client: &ClientInfo,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError>;

    /// A local process sent this application an IPC payload.
    fn on_ipc_data(
        &mut self,
        _data: &IpcData,
        _outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        Ok(())
    }
}

/// One callback invocation, routed by [`ApplicationRegistry::dispatch`].
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Connect(&'a ClientInfo),
    Disconnect(&'a ClientInfo),
    Data(&'a str, &'a ClientInfo),
    Ipc(&'a IpcData),
}

impl Event<'_> {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect(_) => "connect",
            Event::Disconnect(_) => "disconnect",
            Event::Data(..) => "data",
            Event::Ipc(_) => "ipc",
        }
    }
}

// ── Outbox ────────────────────────────────────────────────────────────────────

/// A deferred action on a connection, executed by the event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    /// Send a text frame.
    Send { to: ConnectionId, text: String },
    /// Close the connection with the given status.
    Close { to: ConnectionId, code: CloseCode },
}

impl OutboundCommand {
    pub fn target(&self) -> ConnectionId {
        match self {
            OutboundCommand::Send { to, .. } | OutboundCommand::Close { to, .. } => *to,
        }
    }
}

/// FIFO queue of commands produced by applications and timers.
#[derive(Debug, Default)]
pub struct Outbox {
    commands: VecDeque<OutboundCommand>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a text message for one client.
    pub fn send(&mut self, to: ConnectionId, text: impl Into<String>) {
        self.commands.push_back(OutboundCommand::Send {
            to,
            text: text.into(),
        });
    }

    /// Queues the same text for several clients.
    pub fn broadcast<'a, I>(&mut self, recipients: I, text: &str)
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        for to in recipients {
            self.send(*to, text);
        }
    }

    /// Queues a server-initiated close.
    pub fn close(&mut self, to: ConnectionId, code: CloseCode) {
        self.commands.push_back(OutboundCommand::Close { to, code });
    }

    /// Removes the oldest queued command.
    pub fn pop(&mut self) -> Option<OutboundCommand> {
        self.commands.pop_front()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Removes and returns every queued command in order.
    pub fn drain(&mut self) -> impl Iterator<Item = OutboundCommand> + '_ {
        self.commands.drain(..)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Name → application map owned by the server.
#[derive(Default)]
pub struct ApplicationRegistry {
    applications: HashMap<String, Box<dyn Application>>,
    status: Option<StatusApplication>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `application` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for an empty, reserved, or duplicate name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        application: Box<dyn Application>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if name == STATUS_APPLICATION {
            return Err(RegistryError::Reserved(name));
        }
        if self.applications.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.applications.insert(name, application);
        Ok(())
    }

    /// Registers the status application and hands it the admission limits.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if it is already registered.
    pub fn register_status(
        &mut self,
        mut status: StatusApplication,
        max_clients: usize,
        max_connections_per_ip: usize,
    ) -> Result<(), RegistryError> {
        if self.status.is_some() {
            return Err(RegistryError::Duplicate(STATUS_APPLICATION.to_string()));
        }
        status.set_server_info(max_clients, max_connections_per_ip);
        self.status = Some(status);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        if name == STATUS_APPLICATION {
            return self.status.is_some();
        }
        self.applications.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.applications.len() + usize::from(self.status.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn Application> {
        if name == STATUS_APPLICATION {
            return self
                .status
                .as_mut()
                .map(|status| status as &mut dyn Application);
        }
        match self.applications.get_mut(name) {
            Some(application) => Some(application.as_mut()),
            None => None,
        }
    }

    /// The status application, for server-wide notifications.
    pub fn status_mut(&mut self) -> Option<&mut StatusApplication> {
        self.status.as_mut()
    }

    pub fn status(&self) -> Option<&StatusApplication> {
        self.status.as_ref()
    }

    /// Delivers `event` to the application named `name`.
    ///
    /// A panic inside the callback is caught and reported as
    /// [`ApplicationError::Panicked`], so one faulty application cannot take
    /// down the event loop.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::NotRegistered`] for an unknown name, or
    /// whatever the callback itself returned.
    pub fn dispatch(
        &mut self,
        name: &str,
        event: Event<'_>,
        outbox: &mut Outbox,
    ) -> Result<(), ApplicationError> {
        let application = self
            .get_mut(name)
            .ok_or_else(|| ApplicationError::NotRegistered(name.to_string()))?;

        guarded(|| match event {
            Event::Connect(client) => application.on_connect(client, outbox),
            Event::Disconnect(client) => application.on_disconnect(client, outbox),
            Event::Data(payload, client) => application.on_data(payload, client, outbox),
            Event::Ipc(data) => application.on_ipc_data(data, outbox),
        })
    }
}

/// Runs `f`, converting a panic into [`ApplicationError::Panicked`].
pub fn guarded<F>(f: F) -> Result<(), ApplicationError>
where
    F: FnOnce() -> Result<(), ApplicationError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ApplicationError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn client() -> ClientInfo {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        ClientInfo::new(ConnectionId::derive(addr, 1), addr)
    }

    #[test]
    fn test_register_and_lookup() {
        // Arrange
        let mut registry = ApplicationRegistry::new();

        // Act
        registry
            .register("echo", Box::new(MockApplication::new()))
            .unwrap();

        // Assert
        assert!(registry.contains("echo"));
        assert!(!registry.contains("chat"));
        assert!(registry.get_mut("echo").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_status_name_is_reserved() {
        let mut registry = ApplicationRegistry::new();
        let err = registry
            .register(STATUS_APPLICATION, Box::new(MockApplication::new()))
            .unwrap_err();
        assert_eq!(err, RegistryError::Reserved("status".to_string()));
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut registry = ApplicationRegistry::new();
        registry.register("echo", Box::new(MockApplication::new())).unwrap();
        let err = registry
            .register("echo", Box::new(MockApplication::new()))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("echo".to_string()));
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let mut registry = ApplicationRegistry::new();
        let err = registry
            .register("", Box::new(MockApplication::new()))
            .unwrap_err();
        assert_eq!(err, RegistryError::EmptyName);
    }

    #[test]
    fn test_register_status_makes_status_routable() {
        let mut registry = ApplicationRegistry::new();
        registry
            .register_status(StatusApplication::new(), 30, 5)
            .unwrap();

        assert!(registry.contains(STATUS_APPLICATION));
        assert!(registry.get_mut(STATUS_APPLICATION).is_some());
        assert_eq!(registry.status().unwrap().max_clients(), 30);
    }

    #[test]
    fn test_dispatch_routes_data_to_named_application() {
        // Arrange
        let mut app = MockApplication::new();
        app.expect_on_data()
            .withf(|payload, _, _| payload == "hello")
            .times(1)
            .returning(|_, client, outbox| {
                outbox.send(client.id, "reply");
                Ok(())
            });
        let mut registry = ApplicationRegistry::new();
        registry.register("echo", Box::new(app)).unwrap();
        let mut outbox = Outbox::new();
        let client = client();

        // Act
        registry
            .dispatch("echo", Event::Data("hello", &client), &mut outbox)
            .unwrap();

        // Assert
        assert_eq!(
            outbox.pop(),
            Some(OutboundCommand::Send {
                to: client.id,
                text: "reply".to_string()
            })
        );
    }

    #[test]
    fn test_dispatch_to_unknown_application_is_not_registered() {
        let mut registry = ApplicationRegistry::new();
        let mut outbox = Outbox::new();
        let err = registry
            .dispatch("ghost", Event::Ipc(&IpcData::new()), &mut outbox)
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotRegistered(name) if name == "ghost"));
    }

    /// Panics from every callback.
    struct FaultyApplication;

    impl Application for FaultyApplication {
        fn on_connect(&mut self, _: &ClientInfo, _: &mut Outbox) -> Result<(), ApplicationError> {
            panic!("boom")
        }

        fn on_disconnect(
            &mut self,
            _: &ClientInfo,
            _: &mut Outbox,
        ) -> Result<(), ApplicationError> {
            panic!("boom")
        }

        fn on_data(
            &mut self,
            _: &str,
            _: &ClientInfo,
            _: &mut Outbox,
        ) -> Result<(), ApplicationError> {
            panic!("{}", String::from("owned boom"))
        }
    }

    #[test]
    fn test_dispatch_catches_panics() {
        // Arrange: an application that panics on connect
        let mut registry = ApplicationRegistry::new();
        registry.register("faulty", Box::new(FaultyApplication)).unwrap();
        let mut outbox = Outbox::new();
        let client = client();

        // Act
        let result = registry.dispatch("faulty", Event::Connect(&client), &mut outbox);

        // Assert
        assert!(matches!(result, Err(ApplicationError::Panicked(msg)) if msg == "boom"));
    }

    #[test]
    fn test_dispatch_catches_panics_with_owned_message() {
        let mut registry = ApplicationRegistry::new();
        registry.register("faulty", Box::new(FaultyApplication)).unwrap();
        let client = client();

        let result = registry.dispatch("faulty", Event::Data("x", &client), &mut Outbox::new());

        assert!(matches!(result, Err(ApplicationError::Panicked(msg)) if msg == "owned boom"));
    }

    #[test]
    fn test_application_errors_are_returned() {
        let mut app = MockApplication::new();
        app.expect_on_ipc_data()
            .returning(|_, _| Err(ApplicationError::InvalidMessage("nope".to_string())));
        let mut registry = ApplicationRegistry::new();
        registry.register("echo", Box::new(app)).unwrap();

        let result = registry.dispatch("echo", Event::Ipc(&IpcData::new()), &mut Outbox::new());

        assert!(matches!(result, Err(ApplicationError::InvalidMessage(_))));
    }

    #[test]
    fn test_outbox_preserves_order() {
        let id = client().id;
        let mut outbox = Outbox::new();
        outbox.send(id, "a");
        outbox.close(id, CloseCode::Normal);
        outbox.send(id, "b");

        let commands: Vec<_> = outbox.drain().collect();

        assert_eq!(commands.len(), 3);
        assert!(matches!(&commands[0], OutboundCommand::Send { text, .. } if text == "a"));
        assert!(matches!(&commands[1], OutboundCommand::Close { code: CloseCode::Normal, .. }));
        assert!(matches!(&commands[2], OutboundCommand::Send { text, .. } if text == "b"));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_broadcast_queues_one_send_per_recipient() {
        let a = client().id;
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let b = ConnectionId::derive(addr, 2);
        let mut outbox = Outbox::new();

        outbox.broadcast([a, b].iter(), "hi");

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pop().map(|c| c.target()), Some(a));
        assert_eq!(outbox.pop().map(|c| c.target()), Some(b));
    }
}
