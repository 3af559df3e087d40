//! The coordinator hub: shared state, the three TCP listeners and
//! per-connection thread spawning.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use gridstep_core::{ConsumptionLedger, MemoryLedger, SystemClock, SystemMode};

use crate::control::ControlCycle;
use crate::error::Result;
use crate::history::HistoryWriter;
use crate::msg::SequencePool;
use crate::registry::Registry;
use crate::session::Session;
use crate::socket::TcpLink;
use crate::solver::SolverGateway;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_CLIENT_PORT: u16 = 26999;
pub const DEFAULT_CONTROL_PORT: u16 = 26997;
pub const DEFAULT_SOLVER_PORT: u16 = 26998;
pub const DEFAULT_HISTORY_PATH: &str = "client-history.txt";
pub const DEFAULT_STEP_SECONDS: u32 = 60;

/// Everything needed to construct a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub bind: String,
    pub client_port: u16,
    pub control_port: u16,
    pub solver_port: u16,
    pub step_seconds: u32,
    pub mode: SystemMode,
    pub history_path: PathBuf,
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            bind: DEFAULT_BIND.to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            solver_port: DEFAULT_SOLVER_PORT,
            step_seconds: DEFAULT_STEP_SECONDS,
            mode: SystemMode::default(),
            history_path: PathBuf::from(DEFAULT_HISTORY_PATH),
        }
    }
}

impl HubSettings {
    /// Builds a hub backed by the in-memory consumption ledger.
    pub fn build(self) -> Arc<Hub> {
        self.build_with_ledger(Arc::new(MemoryLedger::new()))
    }

    /// Builds a hub around an externally supplied consumption ledger.
    pub fn build_with_ledger(self, ledger: Arc<dyn ConsumptionLedger>) -> Arc<Hub> {
        let clock = Arc::new(SystemClock::new(self.step_seconds, self.mode));
        let seqs = Arc::new(SequencePool::new());
        let registry = Arc::new(Registry::new());
        let history = Arc::new(HistoryWriter::open(&self.history_path));
        let solver = Arc::new(SolverGateway::new());
        let control = Arc::new(ControlCycle::new(
            Arc::clone(&clock),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&solver),
        ));
        Arc::new(Hub {
            settings: self,
            clock,
            ledger,
            seqs,
            registry,
            history,
            solver,
            control,
        })
    }
}

/// Addresses the three listeners actually bound to, for callers that
/// asked for ephemeral ports.
#[derive(Debug, Clone, Copy)]
pub struct BoundPorts {
    pub client: SocketAddr,
    pub control: SocketAddr,
    pub solver: SocketAddr,
}

/// The coordinator's shared state, constructed once at startup and handed
/// into every connection handler. There are no global singletons; every
/// component reaches its collaborators through this struct.
pub struct Hub {
    pub settings: HubSettings,
    pub clock: Arc<SystemClock>,
    pub ledger: Arc<dyn ConsumptionLedger>,
    pub seqs: Arc<SequencePool>,
    pub registry: Arc<Registry>,
    pub history: Arc<HistoryWriter>,
    pub solver: Arc<SolverGateway>,
    pub control: Arc<ControlCycle>,
}

impl Hub {
    /// Binds the client, control and solver listeners and spawns their
    /// accept loops. Returns the bound addresses.
    pub fn start(self: &Arc<Self>) -> Result<BoundPorts> {
        let bind = &self.settings.bind;
        let client = TcpListener::bind((bind.as_str(), self.settings.client_port))?;
        let control = TcpListener::bind((bind.as_str(), self.settings.control_port))?;
        let solver = TcpListener::bind((bind.as_str(), self.settings.solver_port))?;
        let ports = BoundPorts {
            client: client.local_addr()?,
            control: control.local_addr()?,
            solver: solver.local_addr()?,
        };
        info!(
            "listening for clients on {}, controller on {}, solver on {}",
            ports.client, ports.control, ports.solver
        );

        let hub = Arc::clone(self);
        thread::spawn(move || hub.accept_clients(client));
        let hub = Arc::clone(self);
        thread::spawn(move || hub.accept_controllers(control));
        let hub = Arc::clone(self);
        thread::spawn(move || hub.accept_solvers(solver));
        Ok(ports)
    }

    /// Runs the simulation loop on the calling thread. An error escaping a
    /// decision step is process-fatal and surfaces here.
    pub fn run(&self) -> Result<()> {
        self.control.run()
    }

    fn accept_clients(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            let link = match stream.map_err(Into::into).and_then(TcpLink::new) {
                Ok(link) => link,
                Err(e) => {
                    warn!("failed accepting client connection: {}", e);
                    continue;
                }
            };
            debug!("accepted client connection from {}", link.peer_addr());
            let session = Session::new(link, Arc::clone(&self));
            thread::spawn(move || session.run());
        }
    }

    fn accept_controllers(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            let link = match stream.map_err(Into::into).and_then(TcpLink::new) {
                Ok(link) => link,
                Err(e) => {
                    warn!("failed accepting controller connection: {}", e);
                    continue;
                }
            };
            self.control.install_controller(Arc::clone(&link));
            let control = Arc::clone(&self.control);
            thread::spawn(move || control.run_reader(link));
        }
    }

    fn accept_solvers(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            let link = match stream.map_err(Into::into).and_then(TcpLink::new) {
                Ok(link) => link,
                Err(e) => {
                    warn!("failed accepting solver connection: {}", e);
                    continue;
                }
            };
            self.solver.install_link(Arc::clone(&link));
            let solver = Arc::clone(&self.solver);
            thread::spawn(move || solver.run_reader(link));
        }
    }
}
