use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{common::DecodeError, network::Kind};

/*
    A proposer stamps every message with the step (round) it belongs to.
    Proposals and nacks carry a lattice element: a set of integers ordered by
    inclusion and joined by union. Acks only name the proposal they accept.
    A TLC record carries the value a process decided for a step, and is the
    only message that outlives its step: peers that fall behind use it to
    catch up.
*/

pub type Step = u32;

pub type ProposalNumber = u32;

pub type Value = i32;

pub type ValueSet = BTreeSet<Value>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Proposal(Proposal),
    Ack(Ack),
    Nack(Nack),
    Tlc(Tlc),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub step: Step,
    pub number: ProposalNumber,
    pub value: ValueSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub step: Step,
    pub number: ProposalNumber,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nack {
    pub step: Step,
    pub number: ProposalNumber,
    pub value: ValueSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlc {
    pub step: Step,
    pub value: ValueSet,
}

impl Message {
    pub fn step(&self) -> Step {
        match self {
            Message::Proposal(p) => p.step,
            Message::Ack(a) => a.step,
            Message::Nack(n) => n.step,
            Message::Tlc(t) => t.step,
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Message::Proposal(_) => Kind::Proposal,
            Message::Ack(_) => Kind::Ack,
            Message::Nack(_) => Kind::Nack,
            Message::Tlc(_) => Kind::Tlc,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Proposal(Proposal { step, number, value })
            | Message::Nack(Nack { step, number, value }) => {
                buf.reserve(8 + 4 * value.len());
                buf.put_u32(*step);
                buf.put_u32(*number);
                put_values(&mut buf, value);
            }
            Message::Ack(Ack { step, number }) => {
                buf.put_u32(*step);
                buf.put_u32(*number);
            }
            Message::Tlc(Tlc { step, value }) => {
                buf.reserve(4 + 4 * value.len());
                buf.put_u32(*step);
                put_values(&mut buf, value);
            }
        }
        buf.freeze()
    }

    pub fn decode(kind: Kind, mut buf: Bytes) -> Result<Self, DecodeError> {
        let step = get_u32(&mut buf)?;
        let message = match kind {
            Kind::Proposal => Message::Proposal(Proposal {
                step,
                number: get_u32(&mut buf)?,
                value: get_values(&mut buf)?,
            }),
            Kind::Nack => Message::Nack(Nack {
                step,
                number: get_u32(&mut buf)?,
                value: get_values(&mut buf)?,
            }),
            Kind::Ack => {
                let number = get_u32(&mut buf)?;
                if buf.has_remaining() {
                    return Err(DecodeError::TrailingBytes(buf.remaining()));
                }
                Message::Ack(Ack { step, number })
            }
            Kind::Tlc => Message::Tlc(Tlc {
                step,
                value: get_values(&mut buf)?,
            }),
            Kind::Generic => return Err(DecodeError::UnknownKind(kind.as_u8())),
        };
        Ok(message)
    }
}

fn put_values(buf: &mut BytesMut, values: &ValueSet) {
    for value in values {
        buf.put_i32(*value);
    }
}

fn get_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::EndOfBuffer);
    }
    Ok(buf.get_u32())
}

fn get_values(buf: &mut Bytes) -> Result<ValueSet, DecodeError> {
    if buf.remaining() % 4 != 0 {
        return Err(DecodeError::TrailingBytes(buf.remaining() % 4));
    }
    let mut values = ValueSet::new();
    while buf.has_remaining() {
        values.insert(buf.get_i32());
    }
    Ok(values)
}
