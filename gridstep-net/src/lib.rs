//! Session and protocol orchestration for the gridstep co-simulation
//! coordinator.
//!
//! The coordinator sits between many distributed simulator clients, one
//! external decision-making controller and one power-flow solver,
//! exchanging fixed big-endian binary records over TCP and advancing a
//! shared discrete clock in lockstep. This crate carries the whole
//! networking stack:
//!
//! - [`msg`]: codecs for the client, control and solver channels
//! - [`socket`]: the per-connection TCP primitive
//! - [`session`]: the per-client state machine
//! - [`registry`]: id allocation and the concurrent session map
//! - [`control`]: the controller link and the per-step decision cycle
//! - [`solver`]: the serialized gateway to the power-flow solver
//! - [`history`]: the append-only connection audit log
//! - [`server`]: the [`Hub`] tying it all together behind three
//!   listeners
//!
//! Construct a [`Hub`] through [`HubSettings`], call
//! [`Hub::start`](server::Hub::start) to bring the listeners up, then
//! [`Hub::run`](server::Hub::run) to drive the simulation loop on the
//! calling thread.
//!
//! [`Hub`]: server/struct.Hub.html
//! [`HubSettings`]: server/struct.HubSettings.html

#[macro_use]
extern crate log;

pub mod control;
pub mod error;
pub mod history;
pub mod msg;
pub mod registry;
pub mod server;
pub mod session;
pub mod socket;
pub mod solver;

pub use error::{Error, Result};
pub use server::{BoundPorts, Hub, HubSettings};
