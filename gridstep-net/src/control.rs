//! Control cycle coordinator: the controller link, the decision gate and
//! the per-step decision batch.

use std::sync::{Arc, Condvar, Mutex};

use gridstep_core::{ClientId, ConsumptionLedger, SystemClock, Wattage};

use crate::error::{Error, Result};
use crate::msg::control::{self, ClientDecision, ControlRecord, DecisionBatch};
use crate::registry::Registry;
use crate::socket::TcpLink;
use crate::solver::SolverGateway;

/// One-shot rendezvous signaled by the controller's `DecisionFinished`
/// record and consumed by the simulation loop. Condition variable plus
/// flag; consuming the signal re-arms the gate.
#[derive(Default)]
struct DecisionGate {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl DecisionGate {
    fn open(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut flag = self.flag.lock().unwrap();
        while !*flag {
            flag = self.cond.wait(flag).unwrap();
        }
        *flag = false;
    }
}

/// Owns the connection to the external controller and drives one decision
/// per simulation step.
///
/// At most one controller is connected at a time; a newly accepted
/// connection replaces the previous one. Outbound records block until a
/// controller exists, clone the link handle under the slot lock and send
/// without holding it. A failed send is a controller disconnect: the slot
/// is emptied, nothing crashes, and the next accepted connection picks the
/// cycle back up.
pub struct ControlCycle {
    clock: Arc<SystemClock>,
    ledger: Arc<dyn ConsumptionLedger>,
    registry: Arc<Registry>,
    solver: Arc<SolverGateway>,
    slot: Mutex<Option<Arc<TcpLink>>>,
    slot_cond: Condvar,
    gate: DecisionGate,
}

impl ControlCycle {
    pub fn new(
        clock: Arc<SystemClock>,
        ledger: Arc<dyn ConsumptionLedger>,
        registry: Arc<Registry>,
        solver: Arc<SolverGateway>,
    ) -> Self {
        ControlCycle {
            clock,
            ledger,
            registry,
            solver,
            slot: Mutex::new(None),
            slot_cond: Condvar::new(),
            gate: DecisionGate::default(),
        }
    }

    /// Installs a newly accepted controller connection, replacing and
    /// closing any previous one.
    pub fn install_controller(&self, link: Arc<TcpLink>) {
        let mut slot = self.slot.lock().unwrap();
        if let Some(old) = slot.replace(link) {
            warn!("replacing controller connection to {}", old.peer_addr());
            old.close();
        }
        self.slot_cond.notify_all();
    }

    pub fn has_controller(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    fn drop_controller(&self, link: &Arc<TcpLink>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.as_ref().map(|l| Arc::ptr_eq(l, link)).unwrap_or(false) {
            *slot = None;
        }
        drop(slot);
        link.close();
    }

    /// Blocks until a controller is connected, then clones its handle.
    fn controller_blocking(&self) -> Arc<TcpLink> {
        let mut slot = self.slot.lock().unwrap();
        loop {
            match &*slot {
                Some(link) => return Arc::clone(link),
                None => {
                    debug!("waiting for a controller connection");
                    slot = self.slot_cond.wait(slot).unwrap();
                }
            }
        }
    }

    fn send_to_controller(&self, record: &ControlRecord) {
        let link = self.controller_blocking();
        if let Err(e) = link.send(&control::encode(record)) {
            warn!("send to controller failed: {}; dropping its connection", e);
            self.drop_controller(&link);
        }
    }

    /// Relays one client's price request to the controller.
    pub fn relay_price_request(&self, client: ClientId) {
        debug!("relaying price request of client {}", client);
        self.send_to_controller(&ControlRecord::PriceRequest { client });
    }

    /// Relays one client's negotiated demand to the controller.
    pub fn relay_demand_negotiation(&self, client: ClientId, points: Vec<Wattage>) {
        debug!(
            "relaying demand negotiation of client {} ({} points)",
            client,
            points.len()
        );
        self.send_to_controller(&ControlRecord::DemandNegotiation { client, points });
    }

    /// Reception loop for one controller connection.
    pub fn run_reader(&self, link: Arc<TcpLink>) {
        info!("controller connected from {}", link.peer_addr());
        loop {
            let record = match link.recv_record(control::FRAME_LEN) {
                Ok(record) => record,
                Err(Error::PeerClosed) => {
                    info!("controller disconnected");
                    break;
                }
                Err(e) => {
                    warn!("controller receive failed: {}; dropping its connection", e);
                    break;
                }
            };
            match control::decode(&record) {
                Ok(record) => self.dispatch(record),
                // length framing already consumed the whole record, so an
                // unknown tag costs one record, not the connection
                Err(e) => warn!("dropping bad controller record: {}", e),
            }
        }
        self.drop_controller(&link);
    }

    fn dispatch(&self, record: ControlRecord) {
        match record {
            ControlRecord::DecisionFinished => {
                trace!("controller finished a decision");
                self.gate.open();
            }
            ControlRecord::SetPrice { client, prices } => match self.registry.get(client) {
                Some(entry) => entry.session.send_price_schedule(self.clock.time(), &prices),
                None => warn!("dropping SetPrice: {}", Error::UnknownClientId(client)),
            },
            ControlRecord::SendPriceProposal { client, price } => match self.registry.get(client) {
                Some(entry) => {
                    let now = self.clock.time();
                    entry.session.send_price_proposal(price, now, now + 1);
                }
                None => warn!(
                    "dropping SendPriceProposal: {}",
                    Error::UnknownClientId(client)
                ),
            },
            other => warn!(
                "outbound-only record {:?} arrived from the controller; dropped",
                other.tag()
            ),
        }
    }

    /// Assembles the batched decision message from every registered
    /// synchronous client.
    ///
    /// The set of clients, their names and their pending counts come from
    /// one registry snapshot, so the client count in the batch header
    /// always matches the serialized set. Solver queries run after the
    /// registry lock is released. The ledger's prediction horizon is
    /// stepped through every future offset up to the largest pending count
    /// and restored to the present afterwards.
    pub fn build_batch(&self) -> DecisionBatch {
        let snapshot = self.registry.snapshot_synchronous();
        let time = self.clock.time();
        let pending: Vec<usize> = snapshot
            .iter()
            .map(|(id, _)| self.ledger.pending_count(*id))
            .collect();
        let horizon = pending.iter().copied().max().unwrap_or(0);

        let mut clients: Vec<ClientDecision> = snapshot
            .iter()
            .map(|(id, _)| ClientDecision {
                id: *id,
                points: Vec::new(),
            })
            .collect();
        for offset in 0..horizon {
            self.ledger.set_prediction_time(time + offset as u32);
            for (i, (_, entry)) in snapshot.iter().enumerate() {
                if offset < pending[i] {
                    let (deviation, consumption) =
                        self.solver.voltage_deviation_and_consumption(&entry.name);
                    clients[i].points.push((consumption, deviation));
                }
            }
        }
        self.ledger.set_prediction_time(time);

        DecisionBatch {
            mode: self.clock.mode() as u16,
            time,
            clients,
        }
    }

    /// One simulation step: feed due consumption to the solver, advance
    /// solver and clock, then build and send the decision batch.
    fn step(&self) -> Result<()> {
        for (id, entry) in self.registry.snapshot_synchronous() {
            if let Some(wattage) = self.ledger.take_due(id) {
                self.solver.set_wattage(&entry.name, wattage);
            }
        }
        self.solver.advance_time_step();
        let time = self.clock.advance();

        let batch = self.build_batch();
        debug!(
            "step {}: sending decision batch for {} synchronous clients",
            time,
            batch.clients.len()
        );
        self.send_to_controller(&ControlRecord::MakeDecision(batch));
        Ok(())
    }

    /// The simulation loop, paced by the controller's `DecisionFinished`
    /// records. Runs until an error escapes a step; controller send
    /// failures are absorbed as disconnects and do not escape.
    pub fn run(&self) -> Result<()> {
        info!("waiting for the controller's first finished decision");
        self.gate.wait();
        loop {
            self.step()?;
            self.gate.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testutil::test_hub;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn decision_gate_is_one_shot() {
        let gate = Arc::new(DecisionGate::default());
        gate.open();
        gate.wait();

        // the signal was consumed; a second wait blocks until reopened
        let waiter = Arc::clone(&gate);
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            waiter.wait();
            let _ = tx.send(());
        });
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        gate.open();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn stale_id_records_are_dropped_without_side_effects() {
        let hub = test_hub();
        hub.control.dispatch(ControlRecord::SetPrice {
            client: 42,
            prices: vec![1, 2],
        });
        hub.control.dispatch(ControlRecord::SendPriceProposal {
            client: 42,
            price: 9,
        });
        assert_eq!(hub.registry.counts(), (0, 0));
    }

    #[test]
    fn batch_with_no_clients_is_header_only() {
        let hub = test_hub();
        let batch = hub.control.build_batch();
        assert!(batch.clients.is_empty());
        assert_eq!(batch.time, 0);
    }
}
