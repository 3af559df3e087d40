//! Control-channel records exchanged with the external controller.
//!
//! Framing is uniform in both directions: `[4B total length][4B type
//! tag][payload]`, the length covering the whole record. Inbound records
//! pace and steer the decision cycle; outbound records carry the per-step
//! decision batch and per-client relays.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use gridstep_core::{ClientId, Price, SimTime, Voltage, Wattage};

use crate::error::{Error, Result};
use crate::msg::{put_u16, put_u32, Reader};

/// Length and tag fields preceding every control-channel payload.
pub const FRAME_LEN: usize = 8;

/// Control-channel record type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ControlTag {
    MakeDecision = 1,
    PriceRequest = 2,
    DemandNegotiation = 3,
    DecisionFinished = 4,
    SetPrice = 5,
    SendPriceProposal = 6,
}

/// Per-client section of a decision batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDecision {
    pub id: ClientId,
    /// (consumption, voltage deviation) per future offset, present time
    /// first.
    pub points: Vec<(Wattage, Voltage)>,
}

/// The batched per-step decision message sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionBatch {
    pub mode: u16,
    pub time: SimTime,
    /// Synchronous clients in ascending-id registry order.
    pub clients: Vec<ClientDecision>,
}

/// Every record exchanged on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRecord {
    MakeDecision(DecisionBatch),
    PriceRequest { client: ClientId },
    DemandNegotiation { client: ClientId, points: Vec<Wattage> },
    DecisionFinished,
    SetPrice { client: ClientId, prices: Vec<Price> },
    SendPriceProposal { client: ClientId, price: Price },
}

impl ControlRecord {
    pub fn tag(&self) -> ControlTag {
        match self {
            ControlRecord::MakeDecision(_) => ControlTag::MakeDecision,
            ControlRecord::PriceRequest { .. } => ControlTag::PriceRequest,
            ControlRecord::DemandNegotiation { .. } => ControlTag::DemandNegotiation,
            ControlRecord::DecisionFinished => ControlTag::DecisionFinished,
            ControlRecord::SetPrice { .. } => ControlTag::SetPrice,
            ControlRecord::SendPriceProposal { .. } => ControlTag::SendPriceProposal,
        }
    }
}

/// Encodes a record into a complete `[length][tag][payload]` frame.
pub fn encode(record: &ControlRecord) -> Vec<u8> {
    let mut payload = Vec::new();
    match record {
        ControlRecord::MakeDecision(batch) => {
            put_u16(&mut payload, batch.clients.len() as u16);
            put_u16(&mut payload, batch.mode);
            put_u32(&mut payload, batch.time);
            for client in &batch.clients {
                put_u32(&mut payload, client.points.len() as u32);
                for (consumption, deviation) in &client.points {
                    put_u32(&mut payload, *consumption);
                    put_u32(&mut payload, *deviation);
                }
                // id echoed twice, a layout quirk the controller expects
                put_u16(&mut payload, client.id);
                put_u16(&mut payload, client.id);
            }
        }
        ControlRecord::PriceRequest { client } => put_u16(&mut payload, *client),
        ControlRecord::DemandNegotiation { client, points } => {
            put_u16(&mut payload, *client);
            put_u32(&mut payload, points.len() as u32);
            for point in points {
                put_u32(&mut payload, *point);
            }
        }
        ControlRecord::DecisionFinished => {}
        ControlRecord::SetPrice { client, prices } => {
            put_u16(&mut payload, *client);
            put_u16(&mut payload, *client);
            put_u32(&mut payload, prices.len() as u32);
            for price in prices {
                put_u32(&mut payload, *price);
            }
        }
        ControlRecord::SendPriceProposal { client, price } => {
            put_u16(&mut payload, *client);
            put_u32(&mut payload, *price);
        }
    }

    let mut buf = Vec::with_capacity(FRAME_LEN + payload.len());
    put_u32(&mut buf, (FRAME_LEN + payload.len()) as u32);
    put_u32(&mut buf, u32::from(record.tag()));
    buf.extend_from_slice(&payload);
    buf
}

/// Decodes one complete frame into a record.
pub fn decode(buf: &[u8]) -> Result<ControlRecord> {
    if buf.len() < FRAME_LEN {
        return Err(Error::Truncated {
            need: FRAME_LEN,
            have: buf.len(),
        });
    }
    let declared = BigEndian::read_u32(&buf[0..4]) as usize;
    if buf.len() < declared || declared < FRAME_LEN {
        return Err(Error::Truncated {
            need: declared.max(FRAME_LEN),
            have: buf.len().min(declared),
        });
    }
    let raw_tag = BigEndian::read_u32(&buf[4..8]);
    let tag = ControlTag::try_from(raw_tag).map_err(|_| Error::UnknownControlTag(raw_tag))?;

    let mut r = Reader::new(&buf[FRAME_LEN..declared]);
    let record = match tag {
        ControlTag::MakeDecision => {
            let count = r.u16()?;
            let mode = r.u16()?;
            let time = r.u32()?;
            let mut clients = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let points = r.u32()? as usize;
                // point count is attacker-controlled; bound it by the bytes
                // left before allocating (8 bytes per pair)
                if points > r.remaining().len() / 8 {
                    return Err(Error::Truncated {
                        need: points.saturating_mul(8),
                        have: r.remaining().len(),
                    });
                }
                let mut pairs = Vec::with_capacity(points);
                for _ in 0..points {
                    let consumption = r.u32()?;
                    let deviation = r.u32()?;
                    pairs.push((consumption, deviation));
                }
                let id = r.u16()?;
                let _echo = r.u16()?;
                clients.push(ClientDecision { id, points: pairs });
            }
            ControlRecord::MakeDecision(DecisionBatch {
                mode,
                time,
                clients,
            })
        }
        ControlTag::PriceRequest => ControlRecord::PriceRequest { client: r.u16()? },
        ControlTag::DemandNegotiation => {
            let client = r.u16()?;
            let count = r.u32()?;
            ControlRecord::DemandNegotiation {
                client,
                points: r.u32_array(count as usize)?,
            }
        }
        ControlTag::DecisionFinished => ControlRecord::DecisionFinished,
        ControlTag::SetPrice => {
            let client = r.u16()?;
            let _echo = r.u16()?;
            let count = r.u32()?;
            ControlRecord::SetPrice {
                client,
                prices: r.u32_array(count as usize)?,
            }
        }
        ControlTag::SendPriceProposal => ControlRecord::SendPriceProposal {
            client: r.u16()?,
            price: r.u32()?,
        },
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: ControlRecord) {
        let buf = encode(&record);
        assert_eq!(
            BigEndian::read_u32(&buf[0..4]) as usize,
            buf.len(),
            "length field must equal the frame length"
        );
        assert_eq!(decode(&buf).unwrap(), record);
    }

    #[test]
    fn round_trips_every_record() {
        round_trip(ControlRecord::MakeDecision(DecisionBatch {
            mode: 0,
            time: 42,
            clients: vec![
                ClientDecision {
                    id: 1,
                    points: vec![(100, 5), (110, 6), (120, 7)],
                },
                ClientDecision {
                    id: 2,
                    points: vec![(200, 8)],
                },
            ],
        }));
        round_trip(ControlRecord::PriceRequest { client: 3 });
        round_trip(ControlRecord::DemandNegotiation {
            client: 3,
            points: vec![10, 20, 30],
        });
        round_trip(ControlRecord::DecisionFinished);
        round_trip(ControlRecord::SetPrice {
            client: 7,
            prices: vec![55, 56],
        });
        round_trip(ControlRecord::SendPriceProposal {
            client: 7,
            price: 99,
        });
    }

    #[test]
    fn empty_batch_serializes_header_only() {
        let buf = encode(&ControlRecord::MakeDecision(DecisionBatch {
            mode: 1,
            time: 0,
            clients: vec![],
        }));
        // frame + count + mode + time
        assert_eq!(buf.len(), FRAME_LEN + 2 + 2 + 4);
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let mut buf = encode(&ControlRecord::DecisionFinished);
        BigEndian::write_u32(&mut buf[4..8], 0xAB);
        assert!(matches!(
            decode(&buf).unwrap_err(),
            Error::UnknownControlTag(0xAB)
        ));
    }

    #[test]
    fn huge_claimed_counts_fail_before_allocating() {
        // a well-framed 16-byte record claiming u32::MAX prices must decode
        // to Truncated, not attempt a multi-gigabyte allocation
        let mut buf = encode(&ControlRecord::SetPrice {
            client: 1,
            prices: vec![],
        });
        BigEndian::write_u32(&mut buf[12..16], u32::MAX);
        assert!(matches!(
            decode(&buf).unwrap_err(),
            Error::Truncated { .. }
        ));

        let mut buf = encode(&ControlRecord::DemandNegotiation {
            client: 1,
            points: vec![],
        });
        BigEndian::write_u32(&mut buf[10..14], u32::MAX);
        assert!(matches!(
            decode(&buf).unwrap_err(),
            Error::Truncated { .. }
        ));

        let mut buf = encode(&ControlRecord::MakeDecision(DecisionBatch {
            mode: 0,
            time: 1,
            clients: vec![ClientDecision {
                id: 1,
                points: vec![],
            }],
        }));
        BigEndian::write_u32(&mut buf[16..20], u32::MAX);
        assert!(matches!(
            decode(&buf).unwrap_err(),
            Error::Truncated { .. }
        ));
    }

    #[test]
    fn truncated_payload_fails_with_truncated() {
        let buf = encode(&ControlRecord::SetPrice {
            client: 1,
            prices: vec![5, 6, 7],
        });
        let err = decode(&buf[..buf.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }
}
