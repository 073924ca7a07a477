use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::{common::DecodeError, consensus::ProcessId};

/// Length of the fixed header: id, source, kind, destination, ack flag.
pub const HEADER_LEN: usize = 8;

pub type MessageId = u32;

/// `(source, id)` identifies an envelope. Ids are scoped per source.
pub type EnvelopeKey = (ProcessId, MessageId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Proposal,
    Ack,
    Nack,
    Tlc,
    Generic,
}

impl Kind {
    pub fn as_u8(self) -> u8 {
        match self {
            Kind::Proposal => 0,
            Kind::Ack => 1,
            Kind::Nack => 2,
            Kind::Tlc => 3,
            Kind::Generic => 4,
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Kind::Proposal),
            1 => Ok(Kind::Ack),
            2 => Ok(Kind::Nack),
            3 => Ok(Kind::Tlc),
            4 => Ok(Kind::Generic),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// A link-level message together with its retransmission bookkeeping.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: MessageId,
    pub source: ProcessId,
    pub kind: Kind,
    pub destination: ProcessId,
    pub payload: Bytes,
    pub is_ack: bool,
    pub retransmits: u32,
    pub next_retry_at: Instant,
}

impl Envelope {
    pub fn new(
        id: MessageId,
        source: ProcessId,
        kind: Kind,
        destination: ProcessId,
        payload: Bytes,
    ) -> Self {
        Envelope {
            id,
            source,
            kind,
            destination,
            payload,
            is_ack: false,
            retransmits: 0,
            next_retry_at: Instant::now(),
        }
    }

    pub fn key(&self) -> EnvelopeKey {
        (self.source, self.id)
    }

    /// The acknowledgement keeps the identity and framing of the acknowledged envelope and
    /// carries no payload. It travels back to `source`.
    pub fn to_ack(&self) -> Self {
        Envelope {
            payload: Bytes::new(),
            is_ack: true,
            retransmits: 0,
            next_retry_at: Instant::now(),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.id);
        buf.put_u8(self.source);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.destination);
        buf.put_u8(self.is_ack as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.remaining() < HEADER_LEN {
            return Err(DecodeError::EndOfBuffer);
        }
        let id = buf.get_u32();
        let source = buf.get_u8();
        let kind = Kind::try_from(buf.get_u8())?;
        let destination = buf.get_u8();
        let is_ack = match buf.get_u8() {
            0 => false,
            1 => true,
            other => return Err(DecodeError::InvalidFlag(other)),
        };

        Ok(Envelope {
            id,
            source,
            kind,
            destination,
            payload: buf,
            is_ack,
            retransmits: 0,
            next_retry_at: Instant::now(),
        })
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Envelope {}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Envelope {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}
