//! Message definitions and codecs for the three wire channels.
//!
//! This module covers the client channel; [`control`] and [`solver`] cover
//! the controller and power-flow channels. Every client-channel record is a
//! fixed big-endian layout:
//!
//! ```text
//! [4B total size][2B sender id][2B receiver id][4B sequence number]
//! [2B message type][2B message id][payload...][2B terminator]
//! ```
//!
//! The total size field always equals the exact byte length of the record,
//! header and terminator included. The terminator is a framing sanity check
//! only; the size field is authoritative and a terminator mismatch is
//! logged, not fatal. Variants are classified by the (message type, message
//! id) pair, failing closed: a pair matching nothing decodes to
//! [`Error::UnknownVariant`], never to a guessed shape.
//!
//! Sequence numbers count per (sender, receiver) pair, monotonically from
//! zero, out of a [`SequencePool`] constructed at startup and shared by
//! everything that stamps outgoing records.

pub mod control;
pub mod solver;

use std::convert::TryFrom;
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use fnv::FnvHashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use gridstep_core::{ClientId, ClientKind, Price, SimTime, Wattage};

use crate::error::{Error, Result};

/// Fixed header length: size, sender, receiver, sequence, type, id.
pub const HEADER_LEN: usize = 16;
/// Terminator value closing every client-channel record.
pub const TERMINATOR: u16 = 0xFEED;
/// Smallest well-formed record: bare header plus terminator.
pub const MIN_RECORD_LEN: usize = HEADER_LEN + 2;
/// Upper bound on a declared record size; larger declarations are treated
/// as stream corruption by the reader.
pub const MAX_RECORD_LEN: usize = 1 << 20;

/// Message type of the synchronous client family.
pub const TYPE_SYNC: u16 = 0x0001;
/// Message type of the asynchronous client family.
pub const TYPE_ASYNC: u16 = 0x0002;
/// Message type of the one-shot diagnostic family.
pub const TYPE_SYSTEM: u16 = 0x0003;

const ID_REGISTER_REQUEST: u16 = 0x0001;
const ID_REGISTER_RESPONSE: u16 = 0x0002;
const ID_DATA: u16 = 0x0003;
const ID_SET_PRICE: u16 = 0x0004;
const ID_GET_PRICE: u16 = 0x0005;
const ID_DEMAND_NEGOTIATION: u16 = 0x0006;
const ID_PRICE_PROPOSAL: u16 = 0x0007;
const ID_EXTENDED_DATA: u16 = 0x0008;
const ID_SET_PRICE_REGULATION: u16 = 0x0009;
const ID_REGULATION_REGISTER: u16 = 0x000A;

const ID_TIME_PROMPT: u16 = 0x0001;
const ID_TIME_RESPONSE: u16 = 0x0002;
const ID_VERSION_PROMPT: u16 = 0x0003;
const ID_VERSION_RESPONSE: u16 = 0x0004;

/// Outcome of a registration request, first field of the response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum RegisterResult {
    Accepted = 0,
    NameNotFound = 1,
}

/// Decoded client-channel record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sender: ClientId,
    pub receiver: ClientId,
    pub sequence: u32,
    pub message_type: u16,
    pub message_id: u16,
}

/// Consumption data in one of its three wire shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientData {
    /// One figure for the next step (synchronous clients).
    Point(Wattage),
    /// A timed profile (asynchronous clients).
    Profile {
        start: SimTime,
        resolution: u32,
        points: Vec<Wattage>,
    },
    /// A batch of per-step figures (synchronous extended data).
    Batch(Vec<Wattage>),
}

/// Every message variant exchanged on the client channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    RegisterRequest {
        kind: ClientKind,
        name: String,
    },
    RegisterResponse {
        kind: ClientKind,
        result: RegisterResult,
        time: SimTime,
        clients: u16,
        mode: u16,
        /// Step length in seconds; carried only in synchronous responses,
        /// zero otherwise.
        step_seconds: u32,
    },
    Data(ClientData),
    /// Price schedule pushed to one client, starting at `begin`.
    PriceSchedule {
        begin: SimTime,
        prices: Vec<Price>,
    },
    /// Same, with up/down regulation prices as parallel arrays of the same
    /// length.
    RegulationPriceSchedule {
        begin: SimTime,
        prices: Vec<Price>,
        up: Vec<Price>,
        down: Vec<Price>,
    },
    GetPrice,
    DemandNegotiation {
        points: Vec<Wattage>,
    },
    PriceProposal {
        price: Price,
        begin: SimTime,
        end: SimTime,
    },
    RegulationRegister,
    TimePrompt,
    TimeResponse {
        time: SimTime,
    },
    VersionPrompt,
    VersionResponse {
        major: u16,
        minor: u16,
    },
}

impl ClientMessage {
    /// The (message type, message id) pair identifying this variant on the
    /// wire.
    pub fn tags(&self) -> (u16, u16) {
        match self {
            ClientMessage::RegisterRequest { kind, .. } => {
                (family(*kind), ID_REGISTER_REQUEST)
            }
            ClientMessage::RegisterResponse { kind, .. } => {
                (family(*kind), ID_REGISTER_RESPONSE)
            }
            ClientMessage::Data(ClientData::Point(_)) => (TYPE_SYNC, ID_DATA),
            ClientMessage::Data(ClientData::Profile { .. }) => (TYPE_ASYNC, ID_DATA),
            ClientMessage::Data(ClientData::Batch(_)) => (TYPE_SYNC, ID_EXTENDED_DATA),
            ClientMessage::PriceSchedule { .. } => (TYPE_SYNC, ID_SET_PRICE),
            ClientMessage::RegulationPriceSchedule { .. } => {
                (TYPE_SYNC, ID_SET_PRICE_REGULATION)
            }
            ClientMessage::GetPrice => (TYPE_SYNC, ID_GET_PRICE),
            ClientMessage::DemandNegotiation { .. } => (TYPE_SYNC, ID_DEMAND_NEGOTIATION),
            ClientMessage::PriceProposal { .. } => (TYPE_SYNC, ID_PRICE_PROPOSAL),
            ClientMessage::RegulationRegister => (TYPE_SYNC, ID_REGULATION_REGISTER),
            ClientMessage::TimePrompt => (TYPE_SYSTEM, ID_TIME_PROMPT),
            ClientMessage::TimeResponse { .. } => (TYPE_SYSTEM, ID_TIME_RESPONSE),
            ClientMessage::VersionPrompt => (TYPE_SYSTEM, ID_VERSION_PROMPT),
            ClientMessage::VersionResponse { .. } => (TYPE_SYSTEM, ID_VERSION_RESPONSE),
        }
    }
}

fn family(kind: ClientKind) -> u16 {
    match kind {
        ClientKind::Synchronous => TYPE_SYNC,
        ClientKind::Asynchronous => TYPE_ASYNC,
    }
}

/// Process-wide sequence number table, keyed by (sender, receiver).
///
/// Constructed once at startup and handed to every component that encodes
/// client-channel records.
#[derive(Default)]
pub struct SequencePool {
    counters: Mutex<FnvHashMap<(ClientId, ClientId), u32>>,
}

impl SequencePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number for the pair, starting at 0.
    pub fn next(&self, sender: ClientId, receiver: ClientId) -> u32 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry((sender, receiver)).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        sequence
    }
}

/// Encodes `msg` into a complete record, stamping the next sequence number
/// for the (sender, receiver) pair.
pub fn encode(
    msg: &ClientMessage,
    sender: ClientId,
    receiver: ClientId,
    seqs: &SequencePool,
) -> Vec<u8> {
    let mut payload = Vec::new();
    write_payload(msg, &mut payload);

    let total = HEADER_LEN + payload.len() + 2;
    let (message_type, message_id) = msg.tags();

    let mut buf = Vec::with_capacity(total);
    put_u32(&mut buf, total as u32);
    put_u16(&mut buf, sender);
    put_u16(&mut buf, receiver);
    put_u32(&mut buf, seqs.next(sender, receiver));
    put_u16(&mut buf, message_type);
    put_u16(&mut buf, message_id);
    buf.extend_from_slice(&payload);
    put_u16(&mut buf, TERMINATOR);
    buf
}

fn write_payload(msg: &ClientMessage, buf: &mut Vec<u8>) {
    match msg {
        ClientMessage::RegisterRequest { name, .. } => {
            buf.extend_from_slice(name.as_bytes());
        }
        ClientMessage::RegisterResponse {
            kind,
            result,
            time,
            clients,
            mode,
            step_seconds,
        } => {
            put_u32(buf, u32::from(*result));
            put_u32(buf, *time);
            put_u16(buf, *clients);
            put_u16(buf, *mode);
            if *kind == ClientKind::Synchronous {
                put_u32(buf, *step_seconds);
            }
        }
        ClientMessage::Data(ClientData::Point(point)) => put_u32(buf, *point),
        ClientMessage::Data(ClientData::Profile {
            start,
            resolution,
            points,
        }) => {
            put_u32(buf, *start);
            put_u32(buf, *resolution);
            put_u16(buf, points.len() as u16);
            for point in points {
                put_u32(buf, *point);
            }
        }
        ClientMessage::Data(ClientData::Batch(points)) => {
            put_u16(buf, points.len() as u16);
            for point in points {
                put_u32(buf, *point);
            }
        }
        ClientMessage::PriceSchedule { begin, prices } => {
            put_u32(buf, *begin);
            put_u16(buf, prices.len() as u16);
            for price in prices {
                put_u32(buf, *price);
            }
        }
        ClientMessage::RegulationPriceSchedule {
            begin,
            prices,
            up,
            down,
        } => {
            put_u32(buf, *begin);
            put_u16(buf, prices.len() as u16);
            for price in prices.iter().chain(up).chain(down) {
                put_u32(buf, *price);
            }
        }
        ClientMessage::GetPrice
        | ClientMessage::RegulationRegister
        | ClientMessage::TimePrompt
        | ClientMessage::VersionPrompt => {}
        ClientMessage::DemandNegotiation { points } => {
            put_u16(buf, points.len() as u16);
            for point in points {
                put_u32(buf, *point);
            }
        }
        ClientMessage::PriceProposal { price, begin, end } => {
            put_u32(buf, *price);
            put_u32(buf, *begin);
            put_u32(buf, *end);
        }
        ClientMessage::TimeResponse { time } => put_u32(buf, *time),
        ClientMessage::VersionResponse { major, minor } => {
            put_u16(buf, *major);
            put_u16(buf, *minor);
        }
    }
}

/// Decodes one complete record into its header and message variant.
pub fn decode(buf: &[u8]) -> Result<(Header, ClientMessage)> {
    if buf.len() < MIN_RECORD_LEN {
        return Err(Error::Truncated {
            need: MIN_RECORD_LEN,
            have: buf.len(),
        });
    }
    let declared = BigEndian::read_u32(&buf[0..4]) as usize;
    if declared < MIN_RECORD_LEN {
        return Err(Error::Truncated {
            need: MIN_RECORD_LEN,
            have: declared,
        });
    }
    if buf.len() < declared {
        return Err(Error::Truncated {
            need: declared,
            have: buf.len(),
        });
    }

    let header = Header {
        sender: BigEndian::read_u16(&buf[4..6]),
        receiver: BigEndian::read_u16(&buf[6..8]),
        sequence: BigEndian::read_u32(&buf[8..12]),
        message_type: BigEndian::read_u16(&buf[12..14]),
        message_id: BigEndian::read_u16(&buf[14..16]),
    };

    let terminator = BigEndian::read_u16(&buf[declared - 2..declared]);
    if terminator != TERMINATOR {
        warn!(
            "record from {} carries terminator {:#06x}, expected {:#06x}",
            header.sender, terminator, TERMINATOR
        );
    }

    let payload = &buf[HEADER_LEN..declared - 2];
    let msg = read_payload(&header, payload)?;
    Ok((header, msg))
}

fn read_payload(header: &Header, payload: &[u8]) -> Result<ClientMessage> {
    let mut r = Reader::new(payload);
    let msg = match (header.message_type, header.message_id) {
        (TYPE_SYNC, ID_REGISTER_REQUEST) => ClientMessage::RegisterRequest {
            kind: ClientKind::Synchronous,
            name: String::from_utf8_lossy(payload).into_owned(),
        },
        (TYPE_ASYNC, ID_REGISTER_REQUEST) => ClientMessage::RegisterRequest {
            kind: ClientKind::Asynchronous,
            name: String::from_utf8_lossy(payload).into_owned(),
        },
        (TYPE_SYNC, ID_REGISTER_RESPONSE) | (TYPE_ASYNC, ID_REGISTER_RESPONSE) => {
            let kind = if header.message_type == TYPE_SYNC {
                ClientKind::Synchronous
            } else {
                ClientKind::Asynchronous
            };
            let raw = r.u32()?;
            let result = RegisterResult::try_from(raw).map_err(|_| Error::UnknownVariant {
                message_type: header.message_type,
                message_id: header.message_id,
            })?;
            let time = r.u32()?;
            let clients = r.u16()?;
            let mode = r.u16()?;
            let step_seconds = if kind == ClientKind::Synchronous {
                r.u32()?
            } else {
                0
            };
            ClientMessage::RegisterResponse {
                kind,
                result,
                time,
                clients,
                mode,
                step_seconds,
            }
        }
        (TYPE_SYNC, ID_DATA) => ClientMessage::Data(ClientData::Point(r.u32()?)),
        (TYPE_ASYNC, ID_DATA) => {
            let start = r.u32()?;
            let resolution = r.u32()?;
            let count = r.u16()?;
            ClientMessage::Data(ClientData::Profile {
                start,
                resolution,
                points: r.u32_array(count as usize)?,
            })
        }
        (TYPE_SYNC, ID_EXTENDED_DATA) => {
            let count = r.u16()?;
            ClientMessage::Data(ClientData::Batch(r.u32_array(count as usize)?))
        }
        (TYPE_SYNC, ID_SET_PRICE) => {
            let begin = r.u32()?;
            let count = r.u16()?;
            ClientMessage::PriceSchedule {
                begin,
                prices: r.u32_array(count as usize)?,
            }
        }
        (TYPE_SYNC, ID_SET_PRICE_REGULATION) => {
            let begin = r.u32()?;
            let count = r.u16()? as usize;
            ClientMessage::RegulationPriceSchedule {
                begin,
                prices: r.u32_array(count)?,
                up: r.u32_array(count)?,
                down: r.u32_array(count)?,
            }
        }
        (TYPE_SYNC, ID_GET_PRICE) => ClientMessage::GetPrice,
        (TYPE_SYNC, ID_DEMAND_NEGOTIATION) => {
            let count = r.u16()?;
            ClientMessage::DemandNegotiation {
                points: r.u32_array(count as usize)?,
            }
        }
        (TYPE_SYNC, ID_PRICE_PROPOSAL) => ClientMessage::PriceProposal {
            price: r.u32()?,
            begin: r.u32()?,
            end: r.u32()?,
        },
        (TYPE_SYNC, ID_REGULATION_REGISTER) => ClientMessage::RegulationRegister,
        (TYPE_SYSTEM, ID_TIME_PROMPT) => ClientMessage::TimePrompt,
        (TYPE_SYSTEM, ID_TIME_RESPONSE) => ClientMessage::TimeResponse { time: r.u32()? },
        (TYPE_SYSTEM, ID_VERSION_PROMPT) => ClientMessage::VersionPrompt,
        (TYPE_SYSTEM, ID_VERSION_RESPONSE) => ClientMessage::VersionResponse {
            major: r.u16()?,
            minor: r.u16()?,
        },
        (message_type, message_id) => {
            return Err(Error::UnknownVariant {
                message_type,
                message_id,
            })
        }
    };
    Ok(msg)
}

/// Bounds-checked big-endian reader over a payload slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let slice = self.take(2)?;
        Ok(BigEndian::read_u16(slice))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let slice = self.take(4)?;
        Ok(BigEndian::read_u32(slice))
    }

    pub(crate) fn u32_array(&mut self, count: usize) -> Result<Vec<u32>> {
        // the count field is attacker-controlled; check it against the
        // bytes actually present before allocating
        if count > (self.buf.len() - self.pos) / 4 {
            return Err(Error::Truncated {
                need: self.pos.saturating_add(count.saturating_mul(4)),
                have: self.buf.len(),
            });
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.u32()?);
        }
        Ok(values)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: ClientMessage, sender: ClientId, receiver: ClientId) {
        let seqs = SequencePool::new();
        let buf = encode(&msg, sender, receiver, &seqs);
        assert_eq!(
            BigEndian::read_u32(&buf[0..4]) as usize,
            buf.len(),
            "size field must equal the record length"
        );
        let (header, decoded) = decode(&buf).unwrap();
        assert_eq!(header.sender, sender);
        assert_eq!(header.receiver, receiver);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(
            ClientMessage::RegisterRequest {
                kind: ClientKind::Synchronous,
                name: "feeder-12".into(),
            },
            0xFFFF,
            0,
        );
        round_trip(
            ClientMessage::RegisterRequest {
                kind: ClientKind::Asynchronous,
                name: "pv-array".into(),
            },
            0xFFFF,
            0,
        );
        round_trip(
            ClientMessage::RegisterResponse {
                kind: ClientKind::Synchronous,
                result: RegisterResult::Accepted,
                time: 17,
                clients: 3,
                mode: 0,
                step_seconds: 60,
            },
            0,
            4,
        );
        round_trip(
            ClientMessage::RegisterResponse {
                kind: ClientKind::Asynchronous,
                result: RegisterResult::NameNotFound,
                time: 17,
                clients: 3,
                mode: 1,
                step_seconds: 0,
            },
            0,
            0,
        );
        round_trip(ClientMessage::Data(ClientData::Point(4200)), 5, 0);
        round_trip(
            ClientMessage::Data(ClientData::Profile {
                start: 100,
                resolution: 60,
                points: vec![1, 2, 3],
            }),
            6,
            0,
        );
        round_trip(ClientMessage::Data(ClientData::Batch(vec![7, 8])), 5, 0);
        round_trip(
            ClientMessage::PriceSchedule {
                begin: 9,
                prices: vec![11, 12, 13],
            },
            0,
            5,
        );
        round_trip(
            ClientMessage::RegulationPriceSchedule {
                begin: 9,
                prices: vec![1, 2],
                up: vec![3, 4],
                down: vec![5, 6],
            },
            0,
            5,
        );
        round_trip(ClientMessage::GetPrice, 5, 0);
        round_trip(
            ClientMessage::DemandNegotiation {
                points: vec![100, 200],
            },
            5,
            0,
        );
        round_trip(
            ClientMessage::PriceProposal {
                price: 55,
                begin: 10,
                end: 11,
            },
            0,
            5,
        );
        round_trip(ClientMessage::RegulationRegister, 5, 0);
        round_trip(ClientMessage::TimePrompt, 0xFFFF, 0);
        round_trip(ClientMessage::TimeResponse { time: 12 }, 0, 0xFFFF);
        round_trip(ClientMessage::VersionPrompt, 0xFFFF, 0);
        round_trip(
            ClientMessage::VersionResponse {
                major: 1,
                minor: 4,
            },
            0,
            0xFFFF,
        );
    }

    #[test]
    fn empty_payload_record_is_minimum_length() {
        let seqs = SequencePool::new();
        let buf = encode(&ClientMessage::GetPrice, 5, 0, &seqs);
        assert_eq!(buf.len(), MIN_RECORD_LEN);
    }

    #[test]
    fn sequence_numbers_count_per_pair_from_zero() {
        let seqs = SequencePool::new();
        let first = encode(&ClientMessage::GetPrice, 5, 0, &seqs);
        let second = encode(&ClientMessage::GetPrice, 5, 0, &seqs);
        let other_pair = encode(&ClientMessage::GetPrice, 6, 0, &seqs);
        assert_eq!(decode(&first).unwrap().0.sequence, 0);
        assert_eq!(decode(&second).unwrap().0.sequence, 1);
        assert_eq!(decode(&other_pair).unwrap().0.sequence, 0);
    }

    #[test]
    fn short_buffer_fails_with_truncated() {
        let err = decode(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn declared_size_longer_than_buffer_fails_with_truncated() {
        let seqs = SequencePool::new();
        let buf = encode(
            &ClientMessage::Data(ClientData::Point(1)),
            5,
            0,
            &seqs,
        );
        let err = decode(&buf[..buf.len() - 4]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn count_field_larger_than_payload_fails_with_truncated() {
        let seqs = SequencePool::new();
        let mut buf = encode(
            &ClientMessage::DemandNegotiation { points: vec![1] },
            5,
            0,
            &seqs,
        );
        // claim 9 points while carrying one
        BigEndian::write_u16(&mut buf[HEADER_LEN..HEADER_LEN + 2], 9);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn unknown_tag_pair_fails_closed() {
        let seqs = SequencePool::new();
        let mut buf = encode(&ClientMessage::GetPrice, 5, 0, &seqs);
        BigEndian::write_u16(&mut buf[14..16], 0x00EE);
        let err = decode(&buf).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownVariant {
                message_type: 0x0001,
                message_id: 0x00EE,
            }
        ));
    }

    #[test]
    fn terminator_mismatch_still_decodes() {
        let seqs = SequencePool::new();
        let mut buf = encode(&ClientMessage::TimePrompt, 0xFFFF, 0, &seqs);
        let end = buf.len();
        BigEndian::write_u16(&mut buf[end - 2..], 0xBEEF);
        let (_, msg) = decode(&buf).unwrap();
        assert_eq!(msg, ClientMessage::TimePrompt);
    }
}
