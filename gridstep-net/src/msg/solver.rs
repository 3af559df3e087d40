//! Solver-channel requests and replies.
//!
//! Requests are framed `[4B total length][4B type tag][payload]`; a name
//! payload is raw bytes whose length is implied by the total length.
//! Replies carry no length prefix: `[4B type tag][fixed payload]`, the
//! payload size fixed per tag, so the gateway's reader maps the tag to a
//! byte count before reading on.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use gridstep_core::{Voltage, Wattage};

use crate::error::{Error, Result};
use crate::msg::{put_u32, Reader};

/// Length and tag fields preceding every request payload.
pub const REQUEST_FRAME_LEN: usize = 8;

/// Request type tags. Fire-and-forget operations have no reply tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum RequestTag {
    IsClientPresent = 1,
    GetWattage = 3,
    GetVoltage = 5,
    SetWattage = 7,
    AdvanceTimeStep = 8,
    GetVoltageDeviation = 9,
    GetVoltageDeviationAndConsumption = 11,
}

/// Reply type tags, each paired with the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ReplyTag {
    ClientPresent = 2,
    Wattage = 4,
    Voltage = 6,
    VoltageDeviation = 10,
    VoltageDeviationAndConsumption = 12,
}

impl ReplyTag {
    /// Fixed payload size following the tag on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            ReplyTag::ClientPresent
            | ReplyTag::Wattage
            | ReplyTag::Voltage
            | ReplyTag::VoltageDeviation => 4,
            ReplyTag::VoltageDeviationAndConsumption => 8,
        }
    }
}

/// Every request sent to the solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverRequest {
    IsClientPresent { name: String },
    GetWattage { name: String },
    GetVoltage { name: String },
    SetWattage { name: String, wattage: Wattage },
    AdvanceTimeStep,
    GetVoltageDeviation { name: String },
    GetVoltageDeviationAndConsumption { name: String },
}

impl SolverRequest {
    pub fn tag(&self) -> RequestTag {
        match self {
            SolverRequest::IsClientPresent { .. } => RequestTag::IsClientPresent,
            SolverRequest::GetWattage { .. } => RequestTag::GetWattage,
            SolverRequest::GetVoltage { .. } => RequestTag::GetVoltage,
            SolverRequest::SetWattage { .. } => RequestTag::SetWattage,
            SolverRequest::AdvanceTimeStep => RequestTag::AdvanceTimeStep,
            SolverRequest::GetVoltageDeviation { .. } => RequestTag::GetVoltageDeviation,
            SolverRequest::GetVoltageDeviationAndConsumption { .. } => {
                RequestTag::GetVoltageDeviationAndConsumption
            }
        }
    }

    /// Reply tag this request blocks on, if any.
    pub fn reply_tag(&self) -> Option<ReplyTag> {
        match self.tag() {
            RequestTag::IsClientPresent => Some(ReplyTag::ClientPresent),
            RequestTag::GetWattage => Some(ReplyTag::Wattage),
            RequestTag::GetVoltage => Some(ReplyTag::Voltage),
            RequestTag::GetVoltageDeviation => Some(ReplyTag::VoltageDeviation),
            RequestTag::GetVoltageDeviationAndConsumption => {
                Some(ReplyTag::VoltageDeviationAndConsumption)
            }
            RequestTag::SetWattage | RequestTag::AdvanceTimeStep => None,
        }
    }
}

/// Every reply the solver sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverReply {
    ClientPresent(bool),
    Wattage(Wattage),
    Voltage(Voltage),
    VoltageDeviation(Voltage),
    VoltageDeviationAndConsumption {
        deviation: Voltage,
        consumption: Wattage,
    },
}

impl SolverReply {
    pub fn tag(&self) -> ReplyTag {
        match self {
            SolverReply::ClientPresent(_) => ReplyTag::ClientPresent,
            SolverReply::Wattage(_) => ReplyTag::Wattage,
            SolverReply::Voltage(_) => ReplyTag::Voltage,
            SolverReply::VoltageDeviation(_) => ReplyTag::VoltageDeviation,
            SolverReply::VoltageDeviationAndConsumption { .. } => {
                ReplyTag::VoltageDeviationAndConsumption
            }
        }
    }
}

/// Encodes a request into a complete `[length][tag][payload]` frame.
pub fn encode_request(request: &SolverRequest) -> Vec<u8> {
    let mut payload = Vec::new();
    match request {
        SolverRequest::IsClientPresent { name }
        | SolverRequest::GetWattage { name }
        | SolverRequest::GetVoltage { name }
        | SolverRequest::GetVoltageDeviation { name }
        | SolverRequest::GetVoltageDeviationAndConsumption { name } => {
            payload.extend_from_slice(name.as_bytes());
        }
        SolverRequest::SetWattage { name, wattage } => {
            put_u32(&mut payload, *wattage);
            payload.extend_from_slice(name.as_bytes());
        }
        SolverRequest::AdvanceTimeStep => {}
    }

    let mut buf = Vec::with_capacity(REQUEST_FRAME_LEN + payload.len());
    put_u32(&mut buf, (REQUEST_FRAME_LEN + payload.len()) as u32);
    put_u32(&mut buf, u32::from(request.tag()));
    buf.extend_from_slice(&payload);
    buf
}

/// Decodes one complete request frame (used by scripted solvers in tests).
pub fn decode_request(buf: &[u8]) -> Result<SolverRequest> {
    if buf.len() < REQUEST_FRAME_LEN {
        return Err(Error::Truncated {
            need: REQUEST_FRAME_LEN,
            have: buf.len(),
        });
    }
    let declared = BigEndian::read_u32(&buf[0..4]) as usize;
    if buf.len() < declared || declared < REQUEST_FRAME_LEN {
        return Err(Error::Truncated {
            need: declared.max(REQUEST_FRAME_LEN),
            have: buf.len().min(declared),
        });
    }
    let raw_tag = BigEndian::read_u32(&buf[4..8]);
    let tag = RequestTag::try_from(raw_tag).map_err(|_| Error::UnknownSolverTag(raw_tag))?;

    let mut r = Reader::new(&buf[REQUEST_FRAME_LEN..declared]);
    let request = match tag {
        RequestTag::IsClientPresent => SolverRequest::IsClientPresent {
            name: remaining_name(&r),
        },
        RequestTag::GetWattage => SolverRequest::GetWattage {
            name: remaining_name(&r),
        },
        RequestTag::GetVoltage => SolverRequest::GetVoltage {
            name: remaining_name(&r),
        },
        RequestTag::SetWattage => {
            let wattage = r.u32()?;
            SolverRequest::SetWattage {
                wattage,
                name: remaining_name(&r),
            }
        }
        RequestTag::AdvanceTimeStep => SolverRequest::AdvanceTimeStep,
        RequestTag::GetVoltageDeviation => SolverRequest::GetVoltageDeviation {
            name: remaining_name(&r),
        },
        RequestTag::GetVoltageDeviationAndConsumption => {
            SolverRequest::GetVoltageDeviationAndConsumption {
                name: remaining_name(&r),
            }
        }
    };
    Ok(request)
}

fn remaining_name(r: &Reader) -> String {
    String::from_utf8_lossy(r.remaining()).into_owned()
}

/// Encodes a reply as `[tag][fixed payload]` (used by scripted solvers).
pub fn encode_reply(reply: &SolverReply) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + reply.tag().payload_len());
    put_u32(&mut buf, u32::from(reply.tag()));
    match reply {
        SolverReply::ClientPresent(present) => put_u32(&mut buf, *present as u32),
        SolverReply::Wattage(wattage) => put_u32(&mut buf, *wattage),
        SolverReply::Voltage(voltage) => put_u32(&mut buf, *voltage),
        SolverReply::VoltageDeviation(deviation) => put_u32(&mut buf, *deviation),
        SolverReply::VoltageDeviationAndConsumption {
            deviation,
            consumption,
        } => {
            put_u32(&mut buf, *deviation);
            put_u32(&mut buf, *consumption);
        }
    }
    buf
}

/// Decodes the fixed payload following an already-read reply tag.
pub fn decode_reply(tag: ReplyTag, payload: &[u8]) -> Result<SolverReply> {
    let mut r = Reader::new(payload);
    let reply = match tag {
        ReplyTag::ClientPresent => SolverReply::ClientPresent(r.u32()? == 1),
        ReplyTag::Wattage => SolverReply::Wattage(r.u32()?),
        ReplyTag::Voltage => SolverReply::Voltage(r.u32()?),
        ReplyTag::VoltageDeviation => SolverReply::VoltageDeviation(r.u32()?),
        ReplyTag::VoltageDeviationAndConsumption => SolverReply::VoltageDeviationAndConsumption {
            deviation: r.u32()?,
            consumption: r.u32()?,
        },
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_request(request: SolverRequest) {
        let buf = encode_request(&request);
        assert_eq!(BigEndian::read_u32(&buf[0..4]) as usize, buf.len());
        assert_eq!(decode_request(&buf).unwrap(), request);
    }

    #[test]
    fn round_trips_every_request() {
        round_trip_request(SolverRequest::IsClientPresent {
            name: "feeder-12".into(),
        });
        round_trip_request(SolverRequest::GetWattage {
            name: "feeder-12".into(),
        });
        round_trip_request(SolverRequest::GetVoltage { name: "pv".into() });
        round_trip_request(SolverRequest::SetWattage {
            name: "pv".into(),
            wattage: 4200,
        });
        round_trip_request(SolverRequest::AdvanceTimeStep);
        round_trip_request(SolverRequest::GetVoltageDeviation { name: "pv".into() });
        round_trip_request(SolverRequest::GetVoltageDeviationAndConsumption {
            name: "pv".into(),
        });
    }

    #[test]
    fn round_trips_every_reply() {
        for reply in [
            SolverReply::ClientPresent(true),
            SolverReply::ClientPresent(false),
            SolverReply::Wattage(77),
            SolverReply::Voltage(230),
            SolverReply::VoltageDeviation(3),
            SolverReply::VoltageDeviationAndConsumption {
                deviation: 3,
                consumption: 77,
            },
        ]
        .iter()
        {
            let buf = encode_reply(reply);
            let tag = ReplyTag::try_from(BigEndian::read_u32(&buf[0..4])).unwrap();
            assert_eq!(buf.len(), 4 + tag.payload_len());
            assert_eq!(decode_reply(tag, &buf[4..]).unwrap(), *reply);
        }
    }

    #[test]
    fn every_query_names_its_reply_tag() {
        assert_eq!(
            SolverRequest::IsClientPresent { name: "x".into() }.reply_tag(),
            Some(ReplyTag::ClientPresent)
        );
        assert_eq!(
            SolverRequest::SetWattage {
                name: "x".into(),
                wattage: 0
            }
            .reply_tag(),
            None
        );
        assert_eq!(SolverRequest::AdvanceTimeStep.reply_tag(), None);
    }
}
