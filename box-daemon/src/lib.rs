#![forbid(unsafe_code)]

//! Box broker daemon internals.
//!
//! The runtime is a three-stage pipeline — network-input, main, network-
//! output — plus two timer-driven background tasks (presence publishing and
//! the NAT coordinator) and the local admin channel. Stages communicate over
//! bounded queues; nothing holds a reference back into the runtime.

pub mod admin;
pub mod broker;
pub mod logging;
pub mod pipeline;
pub mod runtime;

pub use broker::{AdminRequest, Broker, BrokerContext};
pub use pipeline::{Counters, Event, SendQueue};
pub use runtime::{Runtime, RuntimeOptions};
