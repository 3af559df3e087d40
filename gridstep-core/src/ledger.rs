//! Seam to the consumption storage and prediction engine.

use std::collections::VecDeque;
use std::sync::Mutex;

use fnv::FnvHashMap;

use crate::{ClientId, SimTime, Wattage};

/// Registration and query contract of the consumption storage/prediction
/// engine.
///
/// The session layer records client-submitted consumption figures here; the
/// control cycle reads pending counts while assembling decision batches and
/// steers the prediction horizon while querying the solver for future
/// steps. Production deployments put their own engine behind this trait and
/// propagate horizon changes to wherever their power-flow inputs live;
/// [`MemoryLedger`] implements the contract in memory.
pub trait ConsumptionLedger: Send + Sync {
    /// Records a timed consumption profile (asynchronous client data).
    fn record_profile(&self, id: ClientId, start: SimTime, resolution: u32, points: &[Wattage]);

    /// Records one figure for the client's next pending step (synchronous
    /// client data).
    fn record_point(&self, id: ClientId, point: Wattage);

    /// Records a batch of per-step figures (synchronous extended data).
    fn record_points(&self, id: ClientId, points: &[Wattage]);

    /// Number of figures recorded for the client and not yet consumed.
    fn pending_count(&self, id: ClientId) -> usize;

    /// Takes the figure due at the current step, if any.
    fn take_due(&self, id: ClientId) -> Option<Wattage>;

    /// Moves the prediction horizon to `time`; solver queries issued after
    /// this call are evaluated against the consumption planned for that
    /// step.
    fn set_prediction_time(&self, time: SimTime);

    /// Drops everything recorded for a client.
    fn forget(&self, id: ClientId);
}

/// In-memory [`ConsumptionLedger`], one pending queue per client.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    queues: FnvHashMap<ClientId, VecDeque<Wattage>>,
    prediction_time: SimTime,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Horizon set by the last `set_prediction_time` call.
    pub fn prediction_time(&self) -> SimTime {
        self.state.lock().unwrap().prediction_time
    }

    /// Figure planned `offset` steps past the front of the client's queue.
    pub fn planned(&self, id: ClientId, offset: usize) -> Option<Wattage> {
        let state = self.state.lock().unwrap();
        state.queues.get(&id).and_then(|q| q.get(offset)).copied()
    }
}

impl ConsumptionLedger for MemoryLedger {
    fn record_profile(&self, id: ClientId, start: SimTime, resolution: u32, points: &[Wattage]) {
        debug!(
            "client {} recorded a profile of {} points from step {} at {}s resolution",
            id,
            points.len(),
            start,
            resolution
        );
        let mut state = self.state.lock().unwrap();
        state.queues.entry(id).or_default().extend(points);
    }

    fn record_point(&self, id: ClientId, point: Wattage) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(id).or_default().push_back(point);
    }

    fn record_points(&self, id: ClientId, points: &[Wattage]) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(id).or_default().extend(points);
    }

    fn pending_count(&self, id: ClientId) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(&id).map(|q| q.len()).unwrap_or(0)
    }

    fn take_due(&self, id: ClientId) -> Option<Wattage> {
        let mut state = self.state.lock().unwrap();
        state.queues.get_mut(&id).and_then(|q| q.pop_front())
    }

    fn set_prediction_time(&self, time: SimTime) {
        let mut state = self.state.lock().unwrap();
        state.prediction_time = time;
    }

    fn forget(&self, id: ClientId) {
        let mut state = self.state.lock().unwrap();
        state.queues.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_consumed_in_submission_order() {
        let ledger = MemoryLedger::new();
        ledger.record_point(3, 100);
        ledger.record_points(3, &[200, 300]);
        assert_eq!(ledger.pending_count(3), 3);
        assert_eq!(ledger.take_due(3), Some(100));
        assert_eq!(ledger.take_due(3), Some(200));
        assert_eq!(ledger.take_due(3), Some(300));
        assert_eq!(ledger.take_due(3), None);
        assert_eq!(ledger.pending_count(3), 0);
    }

    #[test]
    fn profiles_append_to_the_pending_queue() {
        let ledger = MemoryLedger::new();
        ledger.record_profile(7, 10, 60, &[1, 2, 3]);
        assert_eq!(ledger.pending_count(7), 3);
        assert_eq!(ledger.planned(7, 2), Some(3));
    }

    #[test]
    fn forget_clears_the_client() {
        let ledger = MemoryLedger::new();
        ledger.record_point(1, 5);
        ledger.forget(1);
        assert_eq!(ledger.pending_count(1), 0);
        assert_eq!(ledger.take_due(1), None);
    }

    #[test]
    fn unknown_clients_read_as_empty() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.pending_count(9), 0);
        assert_eq!(ledger.take_due(9), None);
        assert_eq!(ledger.planned(9, 0), None);
    }

    #[test]
    fn prediction_time_round_trips() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.prediction_time(), 0);
        ledger.set_prediction_time(42);
        assert_eq!(ledger.prediction_time(), 42);
    }
}
