//! Core types for the gridstep co-simulation coordinator.
//!
//! This library carries the domain vocabulary shared by the networking layer
//! and the binary: scalar wire types, the simulation clock, and the seam to
//! the consumption storage/prediction engine. The coordinator proper, with
//! its sessions, registry and control cycle, lives in `gridstep-net`.
//!
//! The storage/prediction engine is an external collaborator in production
//! deployments. It is consumed here strictly through the
//! [`ConsumptionLedger`] trait; [`MemoryLedger`] is a self-contained
//! implementation of that contract, enough to run the coordinator end to
//! end.
//!
//! [`ConsumptionLedger`]: ledger/trait.ConsumptionLedger.html
//! [`MemoryLedger`]: ledger/struct.MemoryLedger.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub use clock::SystemClock;
pub use ledger::{ConsumptionLedger, MemoryLedger};

pub mod clock;
pub mod ledger;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Protocol version reported to version prompts, major part.
pub const PROTOCOL_VERSION_MAJOR: u16 = 1;
/// Protocol version reported to version prompts, minor part.
pub const PROTOCOL_VERSION_MINOR: u16 = 4;

/// Handle identifying one registered client, unique within a run.
///
/// Ids are issued starting at 1 and never reused; 0 marks a session that has
/// not completed registration.
pub type ClientId = u16;

/// Discrete simulation time, counted in steps since startup.
pub type SimTime = u32;

/// Consumption figure in watts.
pub type Wattage = u32;

/// Voltage (or voltage deviation) figure as reported by the solver.
pub type Voltage = u32;

/// Price figure in the controller's unit of account.
pub type Price = u32;

/// Sender id the coordinator stamps on every outgoing client-channel record.
pub const COORDINATOR_ID: ClientId = 0x0000;

/// Receiver id used for one-shot diagnostic replies that address no
/// registered client.
pub const DIAGNOSTIC_ID: ClientId = 0xFFFF;

/// How a client participates in the decision cycle.
///
/// Synchronous clients submit one figure per step and appear in every
/// decision batch; asynchronous clients stream profiles on their own
/// schedule and are excluded from batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Synchronous,
    Asynchronous,
}

impl ClientKind {
    /// Audit-history tag for a connect event of this kind.
    pub fn history_tag(&self) -> &'static str {
        match self {
            ClientKind::Synchronous => "+S",
            ClientKind::Asynchronous => "+A",
        }
    }
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ClientKind::Synchronous => write!(f, "synchronous"),
            ClientKind::Asynchronous => write!(f, "asynchronous"),
        }
    }
}

/// Grid operating mode, forwarded verbatim to clients and the controller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde_repr::Serialize_repr, serde_repr::Deserialize_repr,
)]
#[repr(u16)]
pub enum SystemMode {
    Normal = 0,
    Regulation = 1,
}

impl Default for SystemMode {
    fn default() -> Self {
        SystemMode::Normal
    }
}
