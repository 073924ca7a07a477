use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use tracing::{error, trace};

use super::urb::{BroadcastDeliver, Sequence, UniformReliableBroadcast};
use crate::{
    common::{sink, Error, SharedSink},
    consensus::ProcessId,
    network::PerfectLink,
};

/// Per-origin gap filling buffer.
struct Pending {
    next: Sequence,
    buffered: BTreeSet<Sequence>,
}

impl Default for Pending {
    fn default() -> Self {
        Pending {
            next: 1,
            buffered: BTreeSet::new(),
        }
    }
}

impl Pending {
    /// Buffers `seq` and returns every sequence number that became releasable, in order.
    fn arrive(&mut self, seq: Sequence) -> Vec<Sequence> {
        if seq < self.next {
            return Vec::new();
        }
        self.buffered.insert(seq);
        let mut released = Vec::new();
        while self.buffered.remove(&self.next) {
            released.push(self.next);
            self.next += 1;
        }
        released
    }
}

/// Releases uniform-reliable deliveries in per-origin sequence order.
pub struct FifoOrder {
    pending: Mutex<HashMap<ProcessId, Pending>>,
    sink: SharedSink,
}

impl FifoOrder {
    pub fn new(sink: SharedSink) -> Self {
        FifoOrder {
            pending: Mutex::new(HashMap::new()),
            sink,
        }
    }
}

impl BroadcastDeliver for FifoOrder {
    fn deliver(&self, seq: Sequence, origin: ProcessId, relayer: ProcessId, _data: Bytes) {
        // Held across the writes: releases for one origin never interleave.
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let released = pending.entry(origin).or_default().arrive(seq);
        if released.is_empty() {
            trace!(origin, seq, relayer, "buffered out of order");
        }
        for seq in released {
            if let Err(err) = sink::record(&self.sink, &format!("d {origin} {seq}")) {
                error!(?err, origin, seq, "failed to record delivery");
            }
        }
    }
}

/// FIFO broadcast: uniform reliable broadcast plus per-origin ordering.
pub struct FifoBroadcast {
    urb: Arc<UniformReliableBroadcast<FifoOrder>>,
    next_seq: AtomicU32,
    sink: SharedSink,
}

impl FifoBroadcast {
    pub fn new(link: Arc<PerfectLink>, sink: SharedSink) -> Self {
        let order = Arc::new(FifoOrder::new(sink.clone()));
        FifoBroadcast {
            urb: Arc::new(UniformReliableBroadcast::new(link, order)),
            next_seq: AtomicU32::new(1),
            sink,
        }
    }

    /// The layer the perfect link delivers into.
    pub fn urb(&self) -> Arc<UniformReliableBroadcast<FifoOrder>> {
        self.urb.clone()
    }

    /// Broadcasts `data` under the next sequence number and records `b <seq>`
    /// once the link accepted it. The sink stays locked in between, so our own
    /// `d` record for `seq` can never precede the `b` record.
    pub fn broadcast(&self, data: Bytes) -> Result<Sequence, Error> {
        let mut sink = sink::lock(&self.sink)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.urb.broadcast(seq, data)?;
        sink.record(&format!("b {seq}"))?;
        Ok(seq)
    }
}
