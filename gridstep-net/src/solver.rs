//! Gateway to the external power-flow solver.

use std::convert::TryFrom;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};

use byteorder::{BigEndian, ByteOrder};

use gridstep_core::{Voltage, Wattage};

use crate::error::Error;
use crate::msg::solver::{self, ReplyTag, SolverReply, SolverRequest};
use crate::socket::TcpLink;

/// Synchronous request/response client to the power-flow solver.
///
/// One request is in flight at a time: the request-turn lock is held
/// across the whole round trip, so `IsClientPresent`, the value queries,
/// `SetWattage` and `AdvanceTimeStep` never overlap on the wire. Each
/// query installs a one-shot capacity-1 reply channel tagged with the
/// reply kind it expects; the reader thread completes it on a matching
/// reply and drops mismatches, so a deviation query is only ever woken by
/// a deviation reply. When the send fails or the link dies mid-wait, the
/// caller is woken with the last value cached for that topic; such values
/// are unreliable and callers know to treat them as stale.
///
/// Queries block until a solver link exists. A newly accepted solver
/// connection replaces the previous one.
pub struct SolverGateway {
    turn: Mutex<()>,
    slot: Mutex<Slot>,
    slot_cond: Condvar,
    cache: Mutex<Cache>,
}

#[derive(Default)]
struct Slot {
    link: Option<Arc<TcpLink>>,
    pending: Option<Pending>,
}

struct Pending {
    expect: ReplyTag,
    tx: SyncSender<SolverReply>,
}

#[derive(Default)]
struct Cache {
    present: bool,
    wattage: Wattage,
    voltage: Voltage,
    deviation: Voltage,
    deviation_and_consumption: (Voltage, Wattage),
}

impl Default for SolverGateway {
    fn default() -> Self {
        SolverGateway {
            turn: Mutex::new(()),
            slot: Mutex::new(Slot::default()),
            slot_cond: Condvar::new(),
            cache: Mutex::new(Cache::default()),
        }
    }
}

impl SolverGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a newly accepted solver connection, replacing and closing
    /// any previous one. A request waiting on the old link is woken with
    /// its cached value.
    pub fn install_link(&self, link: Arc<TcpLink>) {
        let mut slot = self.slot.lock().unwrap();
        if let Some(old) = slot.link.replace(link) {
            warn!("replacing solver connection to {}", old.peer_addr());
            old.close();
        }
        slot.pending.take();
        self.slot_cond.notify_all();
    }

    pub fn has_link(&self) -> bool {
        self.slot.lock().unwrap().link.is_some()
    }

    /// Whether the solver knows a client by this name.
    pub fn is_client_present(&self, name: &str) -> bool {
        match self.query(SolverRequest::IsClientPresent { name: name.into() }) {
            Some(SolverReply::ClientPresent(present)) => {
                self.cache.lock().unwrap().present = present;
                present
            }
            _ => self.cache.lock().unwrap().present,
        }
    }

    pub fn wattage(&self, name: &str) -> Wattage {
        match self.query(SolverRequest::GetWattage { name: name.into() }) {
            Some(SolverReply::Wattage(wattage)) => {
                self.cache.lock().unwrap().wattage = wattage;
                wattage
            }
            _ => self.cache.lock().unwrap().wattage,
        }
    }

    pub fn voltage(&self, name: &str) -> Voltage {
        match self.query(SolverRequest::GetVoltage { name: name.into() }) {
            Some(SolverReply::Voltage(voltage)) => {
                self.cache.lock().unwrap().voltage = voltage;
                voltage
            }
            _ => self.cache.lock().unwrap().voltage,
        }
    }

    pub fn voltage_deviation(&self, name: &str) -> Voltage {
        match self.query(SolverRequest::GetVoltageDeviation { name: name.into() }) {
            Some(SolverReply::VoltageDeviation(deviation)) => {
                self.cache.lock().unwrap().deviation = deviation;
                deviation
            }
            _ => self.cache.lock().unwrap().deviation,
        }
    }

    /// (voltage deviation, consumption) for the named client at the
    /// ledger's current prediction time.
    pub fn voltage_deviation_and_consumption(&self, name: &str) -> (Voltage, Wattage) {
        match self.query(SolverRequest::GetVoltageDeviationAndConsumption { name: name.into() }) {
            Some(SolverReply::VoltageDeviationAndConsumption {
                deviation,
                consumption,
            }) => {
                self.cache.lock().unwrap().deviation_and_consumption = (deviation, consumption);
                (deviation, consumption)
            }
            _ => self.cache.lock().unwrap().deviation_and_consumption,
        }
    }

    /// Feeds one client's due consumption into the solver. Fire-and-forget.
    pub fn set_wattage(&self, name: &str, wattage: Wattage) {
        self.send_only(SolverRequest::SetWattage {
            name: name.into(),
            wattage,
        });
    }

    /// Advances the solver's own simulation clock. Fire-and-forget.
    pub fn advance_time_step(&self) {
        self.send_only(SolverRequest::AdvanceTimeStep);
    }

    /// One full round trip under the request-turn lock. `None` means the
    /// round trip failed and the caller should fall back to its cache.
    fn query(&self, request: SolverRequest) -> Option<SolverReply> {
        let expect = request.reply_tag()?;
        let _turn = self.turn.lock().unwrap();
        let link = self.link_blocking();
        let (tx, rx) = sync_channel(1);
        {
            let mut slot = self.slot.lock().unwrap();
            slot.pending = Some(Pending { expect, tx });
        }
        if let Err(e) = link.send(&solver::encode_request(&request)) {
            warn!("solver request {:?} failed: {}", request.tag(), e);
            self.drop_link(&link);
            return None;
        }
        match rx.recv() {
            Ok(reply) => Some(reply),
            Err(_) => {
                warn!(
                    "solver link lost while waiting for {:?}; returning stale value",
                    expect
                );
                None
            }
        }
    }

    fn send_only(&self, request: SolverRequest) {
        let _turn = self.turn.lock().unwrap();
        let link = self.link_blocking();
        if let Err(e) = link.send(&solver::encode_request(&request)) {
            warn!("solver request {:?} failed: {}", request.tag(), e);
            self.drop_link(&link);
        }
    }

    /// Blocks until a solver connection exists, then clones its handle.
    fn link_blocking(&self) -> Arc<TcpLink> {
        let mut slot = self.slot.lock().unwrap();
        loop {
            match &slot.link {
                Some(link) => return Arc::clone(link),
                None => {
                    debug!("waiting for a solver connection");
                    slot = self.slot_cond.wait(slot).unwrap();
                }
            }
        }
    }

    fn drop_link(&self, link: &Arc<TcpLink>) {
        let mut slot = self.slot.lock().unwrap();
        if slot
            .link
            .as_ref()
            .map(|l| Arc::ptr_eq(l, link))
            .unwrap_or(false)
        {
            slot.link = None;
            // dropping the sender wakes the blocked caller
            slot.pending.take();
        }
        drop(slot);
        link.close();
    }

    /// Reception loop for one solver connection. Replies are
    /// length-implicit, so an unknown tag desyncs the stream and tears the
    /// link down.
    pub fn run_reader(&self, link: Arc<TcpLink>) {
        info!("solver connected from {}", link.peer_addr());
        loop {
            let mut tag_buf = [0u8; 4];
            match link.recv_exact(&mut tag_buf) {
                Ok(()) => {}
                Err(Error::PeerClosed) => {
                    info!("solver disconnected");
                    break;
                }
                Err(e) => {
                    warn!("solver receive failed: {}", e);
                    break;
                }
            }
            let raw = BigEndian::read_u32(&tag_buf);
            let tag = match ReplyTag::try_from(raw) {
                Ok(tag) => tag,
                Err(_) => {
                    warn!("unknown solver reply tag {}; stream out of sync", raw);
                    break;
                }
            };
            let mut payload = vec![0u8; tag.payload_len()];
            if let Err(e) = link.recv_exact(&mut payload) {
                warn!("solver reply truncated: {}", e);
                break;
            }
            let reply = match solver::decode_reply(tag, &payload) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("bad solver reply: {}", e);
                    continue;
                }
            };

            let mut slot = self.slot.lock().unwrap();
            match &slot.pending {
                Some(pending) if pending.expect == tag => {
                    let pending = slot.pending.take().unwrap();
                    // a full reply channel means the caller already gave up
                    let _ = pending.tx.try_send(reply);
                }
                Some(pending) => {
                    warn!(
                        "solver reply {:?} does not answer the pending {:?} request; dropped",
                        tag, pending.expect
                    );
                }
                None => {
                    warn!("unsolicited solver reply {:?} dropped", tag);
                }
            }
        }
        self.drop_link(&link);
    }
}
