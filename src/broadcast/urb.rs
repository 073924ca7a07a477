use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace, warn};

use crate::{
    common::{DecodeError, Error},
    consensus::ProcessId,
    network::{Deliver, Envelope, Kind, PerfectLink},
};

pub type Sequence = u32;

/// Upcall of a broadcast layer.
pub trait BroadcastDeliver: Send + Sync + 'static {
    fn deliver(&self, seq: Sequence, origin: ProcessId, relayer: ProcessId, data: Bytes);
}

#[derive(Default)]
struct State {
    /// Distinct relayers seen per `(origin, seq)`.
    acks: HashMap<(ProcessId, Sequence), usize>,
    delivered: HashSet<(ProcessId, Sequence)>,
}

/// Uniform reliable broadcast by majority relaying.
///
/// The first time a process sees a message originated elsewhere it relays it
/// to everyone. A message is delivered once more than half of the processes
/// relayed it, so whatever one correct process delivers has already reached a
/// majority and will reach every correct process.
pub struct UniformReliableBroadcast<D: BroadcastDeliver> {
    link: Arc<PerfectLink>,
    upper: Arc<D>,
    state: Mutex<State>,
}

impl<D: BroadcastDeliver> UniformReliableBroadcast<D> {
    pub fn new(link: Arc<PerfectLink>, upper: Arc<D>) -> Self {
        UniformReliableBroadcast {
            link,
            upper,
            state: Mutex::new(State::default()),
        }
    }

    pub fn broadcast(&self, seq: Sequence, data: Bytes) -> Result<(), Error> {
        self.link
            .send_all(Kind::Generic, encode(self.link.id(), seq, &data))
    }
}

impl<D: BroadcastDeliver> Deliver for UniformReliableBroadcast<D> {
    fn deliver(&self, envelope: Envelope) {
        let relayer = envelope.source;
        let (origin, seq, data) = match decode(envelope.payload.clone()) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(?err, relayer, "dropping malformed broadcast");
                return;
            }
        };

        let (relay, deliver) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let count = state.acks.entry((origin, seq)).or_default();
            *count += 1;
            let count = *count;
            let relay = count == 1 && origin != self.link.id();
            let deliver = self.link.peers().is_quorum(count) && state.delivered.insert((origin, seq));
            (relay, deliver)
        };

        if relay {
            trace!(origin, seq, "relaying");
            if let Err(err) = self.link.send_all(Kind::Generic, envelope.payload) {
                error!(?err, origin, seq, "relay failed");
            }
        }
        if deliver {
            self.upper.deliver(seq, origin, relayer, data);
        }
    }
}

fn encode(origin: ProcessId, seq: Sequence, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(origin);
    buf.put_u32(seq);
    buf.put_slice(data);
    buf.freeze()
}

fn decode(mut buf: Bytes) -> Result<(ProcessId, Sequence, Bytes), DecodeError> {
    if buf.remaining() < 5 {
        return Err(DecodeError::EndOfBuffer);
    }
    let origin = buf.get_u8();
    let seq = buf.get_u32();
    Ok((origin, seq, buf))
}
