//! Application layer for wshub-server.
//!
//! Everything here is driven by the event loop but performs no I/O itself:
//!
//! - [`registry`]  – the [`Application`] trait, the name → application map
//!   and the [`Outbox`] applications reply through
//! - [`status`]    – the built-in diagnostics feed served at `/status`
//! - [`echo`]      – demo application that broadcasts what it receives
//! - [`admission`] – connection caps and the optional request limiter
//! - [`timers`]    – interval callbacks fired between polls

pub mod admission;
pub mod echo;
pub mod registry;
pub mod status;
pub mod timers;

pub use admission::{AdmissionControl, AdmissionError, RateLimitExceeded, RequestRateLimiter};
pub use echo::{EchoApplication, EchoMessage};
pub use registry::{
    Application, ApplicationError, ApplicationRegistry, Event, OutboundCommand, Outbox,
    RegistryError, STATUS_APPLICATION,
};
pub use status::{StatusApplication, StatusLevel};
pub use timers::TimerScheduler;
