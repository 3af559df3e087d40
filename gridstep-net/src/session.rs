//! Per-connection client session state machine.

use std::sync::{Arc, Mutex, Weak};

use gridstep_core::{ClientId, ClientKind, Price, SimTime, COORDINATOR_ID, DIAGNOSTIC_ID};

use crate::error::{Error, Result};
use crate::msg::{self, ClientData, ClientMessage, RegisterResult};
use crate::server::Hub;
use crate::socket::TcpLink;

/// Registration lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unregistered,
    Registered,
    Closed,
}

/// One live client connection.
///
/// A session starts unregistered and becomes registered only after the
/// solver confirms the name it claims. Message handling is strictly
/// sequential: the reception loop decodes and dispatches one record at a
/// time, so a session never reacts to two of its own messages
/// concurrently. Teardown can be triggered from several paths (peer
/// disconnect, send failure, a one-shot diagnostic prompt); the
/// registration phase is flipped to `Closed` under the state lock before
/// any cleanup runs, so the audit record, counter decrement and registry
/// removal happen exactly once no matter which path got there first.
pub struct Session {
    // handle to self, upgraded only to hand the registry a shared owner;
    // the session never owns itself
    me: Weak<Session>,
    link: Arc<TcpLink>,
    hub: Arc<Hub>,
    state: Mutex<SessionState>,
}

struct SessionState {
    phase: Phase,
    id: ClientId,
    name: String,
}

impl Session {
    pub fn new(link: Arc<TcpLink>, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new_cyclic(|me| Session {
            me: me.clone(),
            link,
            hub,
            state: Mutex::new(SessionState {
                phase: Phase::Unregistered,
                id: 0,
                name: String::new(),
            }),
        })
    }

    /// Id issued at registration; 0 while unregistered.
    pub fn id(&self) -> ClientId {
        self.state.lock().unwrap().id
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Registered
    }

    /// Reception loop, run on the connection's dedicated thread.
    ///
    /// Well-framed but malformed records are logged and dropped; framing
    /// damage and peer closure end the loop. The loop always leaves
    /// through [`Session::close`].
    pub fn run(&self) {
        loop {
            match self.link.recv_record(msg::MIN_RECORD_LEN) {
                Ok(record) => self.handle_record(&record),
                Err(Error::PeerClosed) => {
                    debug!("client {} closed the connection", self.link.peer_addr());
                    break;
                }
                Err(e) => {
                    warn!(
                        "receive from client {} failed: {}; closing",
                        self.link.peer_addr(),
                        e
                    );
                    break;
                }
            }
            if self.state.lock().unwrap().phase == Phase::Closed {
                break;
            }
        }
        self.close();
    }

    fn handle_record(&self, record: &[u8]) {
        let (header, message) = match msg::decode(record) {
            Ok(decoded) => decoded,
            // one bad message does not cost the connection
            Err(e) => {
                warn!(
                    "dropping bad record from client {}: {}",
                    self.link.peer_addr(),
                    e
                );
                return;
            }
        };
        trace!(
            "client {} sent {:?} (seq {})",
            self.link.peer_addr(),
            header,
            header.sequence
        );

        match message {
            ClientMessage::RegisterRequest { kind, name } => self.handle_register(kind, name),
            ClientMessage::Data(data) => self.handle_data(data),
            ClientMessage::GetPrice => {
                if let Some(id) = self.registered_id() {
                    self.hub.control.relay_price_request(id);
                } else {
                    warn!("price request from an unregistered client dropped");
                }
            }
            ClientMessage::DemandNegotiation { points } => {
                if let Some(id) = self.registered_id() {
                    self.hub.control.relay_demand_negotiation(id, points);
                } else {
                    warn!("demand negotiation from an unregistered client dropped");
                }
            }
            ClientMessage::TimePrompt => {
                let reply = ClientMessage::TimeResponse {
                    time: self.hub.clock.time(),
                };
                let _ = self.send_to_client(DIAGNOSTIC_ID, &reply);
                self.close();
            }
            ClientMessage::VersionPrompt => {
                let reply = ClientMessage::VersionResponse {
                    major: gridstep_core::PROTOCOL_VERSION_MAJOR,
                    minor: gridstep_core::PROTOCOL_VERSION_MINOR,
                };
                let _ = self.send_to_client(DIAGNOSTIC_ID, &reply);
                self.close();
            }
            ClientMessage::RegulationRegister => {
                info!(
                    "client {} requested regulation registration, which is not serviced",
                    self.link.peer_addr()
                );
            }
            // coordinator-to-client records have no business arriving here
            other => {
                warn!(
                    "unexpected {:?} from client {}; dropped",
                    other.tags(),
                    self.link.peer_addr()
                );
            }
        }
    }

    fn handle_register(&self, kind: ClientKind, name: String) {
        if self.state.lock().unwrap().phase != Phase::Unregistered {
            warn!(
                "duplicate registration request from client {} dropped",
                self.link.peer_addr()
            );
            return;
        }

        if !self.hub.solver.is_client_present(&name) {
            info!(
                "rejecting {} registration of {:?}: {}",
                kind,
                name,
                Error::NameNotFound(name.clone())
            );
            let reply = self.register_response(kind, RegisterResult::NameNotFound);
            let _ = self.send_to_client(0, &reply);
            self.close();
            return;
        }

        let me = match self.me.upgrade() {
            Some(me) => me,
            // the last owner is already gone; the session is unwinding
            None => return,
        };
        let id = self.hub.registry.allocate_id();
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Unregistered {
                return;
            }
            state.phase = Phase::Registered;
            state.id = id;
            state.name = name.clone();
        }
        self.hub.registry.register(id, &name, kind, me);
        self.hub.history.connected(kind, &name);

        let reply = self.register_response(kind, RegisterResult::Accepted);
        if self.send_to_client(id, &reply).is_err() {
            self.close();
        }
    }

    fn register_response(&self, kind: ClientKind, result: RegisterResult) -> ClientMessage {
        ClientMessage::RegisterResponse {
            kind,
            result,
            time: self.hub.clock.time(),
            clients: self.hub.registry.len(),
            mode: self.hub.clock.mode() as u16,
            step_seconds: match kind {
                ClientKind::Synchronous => self.hub.clock.step_seconds(),
                ClientKind::Asynchronous => 0,
            },
        }
    }

    fn handle_data(&self, data: ClientData) {
        let id = match self.registered_id() {
            Some(id) => id,
            None => {
                warn!(
                    "data record from unregistered client {} dropped",
                    self.link.peer_addr()
                );
                return;
            }
        };
        match data {
            ClientData::Point(point) => self.hub.ledger.record_point(id, point),
            ClientData::Profile {
                start,
                resolution,
                points,
            } => self.hub.ledger.record_profile(id, start, resolution, &points),
            ClientData::Batch(points) => self.hub.ledger.record_points(id, &points),
        }
    }

    /// Pushes a price schedule to this client. Called by the control cycle
    /// on behalf of the controller; a failed send closes the session.
    pub fn send_price_schedule(&self, begin: SimTime, prices: &[Price]) {
        let message = ClientMessage::PriceSchedule {
            begin,
            prices: prices.to_vec(),
        };
        self.send_or_close(&message);
    }

    /// Pushes a single price proposal to this client.
    pub fn send_price_proposal(&self, price: Price, begin: SimTime, end: SimTime) {
        let message = ClientMessage::PriceProposal { price, begin, end };
        self.send_or_close(&message);
    }

    fn send_or_close(&self, message: &ClientMessage) {
        let id = match self.registered_id() {
            Some(id) => id,
            None => {
                warn!("outbound {:?} to an unregistered session dropped", message.tags());
                return;
            }
        };
        if let Err(e) = self.send_to_client(id, message) {
            warn!("send to client {} failed: {}; closing its session", id, e);
            self.close();
        }
    }

    fn send_to_client(&self, receiver: ClientId, message: &ClientMessage) -> Result<()> {
        let record = msg::encode(message, COORDINATOR_ID, receiver, &self.hub.seqs);
        self.link.send(&record)
    }

    fn registered_id(&self) -> Option<ClientId> {
        let state = self.state.lock().unwrap();
        match state.phase {
            Phase::Registered => Some(state.id),
            _ => None,
        }
    }

    /// Moves the session to its terminal state and closes the connection.
    ///
    /// Safe to call from any path, any number of times; registry removal,
    /// counter decrement and the audit disconnect record run only on the
    /// call that finds the session registered.
    pub fn close(&self) {
        let registered = {
            let mut state = self.state.lock().unwrap();
            let was = state.phase;
            state.phase = Phase::Closed;
            match was {
                Phase::Registered => Some((state.id, state.name.clone())),
                _ => None,
            }
        };
        if let Some((id, name)) = registered {
            self.hub.history.disconnected(&name);
            self.hub.registry.unregister(id);
            self.hub.ledger.forget(id);
        }
        self.link.close();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::server::HubSettings;
    use crate::socket::loopback_pair;

    pub(crate) fn test_hub() -> Arc<Hub> {
        let mut settings = HubSettings::default();
        settings.history_path = std::env::temp_dir().join(format!(
            "gridstep-test-history-{}.txt",
            std::process::id()
        ));
        settings.build()
    }

    /// Session over a real loopback pair; returns the peer's end too.
    pub(crate) fn test_session(hub: &Arc<Hub>) -> (Arc<Session>, Arc<TcpLink>) {
        let (ours, theirs) = loopback_pair();
        (Session::new(ours, Arc::clone(hub)), theirs)
    }

    impl Session {
        /// Session backed by a loopback link and a throwaway hub, for
        /// registry-level tests that only need a live handle.
        pub(crate) fn detached() -> Arc<Session> {
            let hub = test_hub();
            let (session, _theirs) = test_session(&hub);
            session
        }

        /// Puts a session straight into the registered state, bypassing
        /// the solver round trip.
        pub(crate) fn force_register(&self, id: ClientId, name: &str, kind: ClientKind) {
            {
                let mut state = self.state.lock().unwrap();
                state.phase = Phase::Registered;
                state.id = id;
                state.name = name.to_string();
            }
            let me = self.me.upgrade().unwrap();
            self.hub.registry.register(id, name, kind, me);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{test_hub, test_session};
    use super::*;
    use crate::msg::SequencePool;

    #[test]
    fn close_cleans_up_exactly_once() {
        let hub = test_hub();
        let (session, _peer) = test_session(&hub);
        let id = hub.registry.allocate_id();
        session.force_register(id, "house-1", ClientKind::Synchronous);
        assert_eq!(hub.registry.counts(), (1, 0));

        session.close();
        assert_eq!(hub.registry.counts(), (0, 0));
        assert!(hub.registry.get(id).is_none());

        // a second trigger finds the session already closed
        session.close();
        assert_eq!(hub.registry.counts(), (0, 0));
    }

    #[test]
    fn close_before_registration_touches_nothing() {
        let hub = test_hub();
        let (session, _peer) = test_session(&hub);
        session.close();
        assert_eq!(hub.registry.counts(), (0, 0));
        assert!(!session.is_registered());
    }

    #[test]
    fn data_from_an_unregistered_session_is_dropped() {
        let hub = test_hub();
        let (session, _peer) = test_session(&hub);
        session.handle_data(ClientData::Point(100));
        // nothing may land in the ledger under id 0
        assert_eq!(hub.ledger.pending_count(0), 0);
    }

    #[test]
    fn data_from_a_registered_session_reaches_the_ledger() {
        let hub = test_hub();
        let (session, _peer) = test_session(&hub);
        let id = hub.registry.allocate_id();
        session.force_register(id, "house-1", ClientKind::Synchronous);
        session.handle_data(ClientData::Point(100));
        session.handle_data(ClientData::Batch(vec![200, 300]));
        assert_eq!(hub.ledger.pending_count(id), 3);
    }

    #[test]
    fn failed_outbound_send_closes_the_session() {
        let hub = test_hub();
        let (session, peer) = test_session(&hub);
        let id = hub.registry.allocate_id();
        session.force_register(id, "house-1", ClientKind::Synchronous);

        peer.close();
        // exhaust the socket's buffering until the failure surfaces
        for _ in 0..64 {
            session.send_price_schedule(0, &[1, 2, 3]);
            if !session.is_registered() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!session.is_registered());
        assert_eq!(hub.registry.counts(), (0, 0));
    }

    #[test]
    fn diagnostic_prompt_replies_then_closes() {
        let hub = test_hub();
        let (session, peer) = test_session(&hub);
        let seqs = SequencePool::new();
        let prompt = msg::encode(&ClientMessage::TimePrompt, DIAGNOSTIC_ID, 0, &seqs);
        session.handle_record(&prompt);

        let record = peer.recv_record(msg::MIN_RECORD_LEN).unwrap();
        let (header, reply) = msg::decode(&record).unwrap();
        assert_eq!(header.receiver, DIAGNOSTIC_ID);
        assert_eq!(reply, ClientMessage::TimeResponse { time: 0 });
        assert!(!session.is_registered());
        // the link is gone for good
        assert!(matches!(
            peer.recv_record(msg::MIN_RECORD_LEN).unwrap_err(),
            Error::PeerClosed
        ));
    }
}
