use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::join_all;
use rand::Rng;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, error, trace, warn};

use super::{
    envelope::{Envelope, EnvelopeKey, Kind, MessageId},
    Transport,
};
use crate::{
    common::{Error, LinkConfig},
    consensus::{Peers, ProcessId},
};

/// Upcall invoked exactly once per distinct `(source, id)` received.
pub trait Deliver: Send + Sync + 'static {
    fn deliver(&self, envelope: Envelope);
}

enum Outbound {
    Datagram(SocketAddr, Bytes),
    Stop,
}

enum LaneItem {
    Envelope(Envelope),
    Stop,
}

#[derive(Default)]
struct Outstanding {
    in_flight: BTreeMap<EnvelopeKey, Envelope>,
    backlog: VecDeque<Envelope>,
}

/// Perfect point-to-point link over an unreliable [Transport].
///
/// Every envelope sent is kept in the outstanding set of its destination and
/// retransmitted with exponential backoff until the destination acknowledges
/// it. Receivers acknowledge every copy they see but deliver each `(source, id)`
/// only once.
pub struct PerfectLink {
    id: ProcessId,
    peers: Peers,
    cfg: LinkConfig,
    next_id: AtomicU32,
    outstanding: HashMap<ProcessId, Mutex<Outstanding>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Owns the worker-side ends of the link until [LinkRunner::start] spawns them.
pub struct LinkRunner<T: Transport> {
    link: Arc<PerfectLink>,
    transport: Arc<T>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

pub struct LinkHandles {
    handles: Vec<JoinHandle<()>>,
}

impl PerfectLink {
    pub fn new<T: Transport>(
        id: ProcessId,
        peers: Peers,
        cfg: LinkConfig,
        transport: Arc<T>,
    ) -> (Arc<Self>, LinkRunner<T>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let outstanding = peers
            .ids()
            .map(|id| (id, Mutex::new(Outstanding::default())))
            .collect();

        let link = Arc::new(PerfectLink {
            id,
            peers,
            cfg,
            next_id: AtomicU32::new(1),
            outstanding,
            outbound: outbound_tx,
            stopped: AtomicBool::new(false),
            shutdown,
        });
        let runner = LinkRunner {
            link: link.clone(),
            transport,
            outbound: outbound_rx,
        };
        (link, runner)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Sends `payload` to `destination`. The first attempt goes out immediately;
    /// later attempts are made by the retransmitter until acknowledged.
    pub fn send(
        &self,
        destination: ProcessId,
        kind: Kind,
        payload: Bytes,
    ) -> Result<MessageId, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send_envelope(Envelope::new(id, self.id, kind, destination, payload))?;
        Ok(id)
    }

    /// Sends the same payload to every process, including this one.
    pub fn send_all(&self, kind: Kind, payload: Bytes) -> Result<(), Error> {
        for destination in self.peers.ids() {
            self.send(destination, kind, payload.clone())?;
        }
        Ok(())
    }

    pub fn send_envelope(&self, mut envelope: Envelope) -> Result<(), Error> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let address = self.peers.address(envelope.destination)?;
        let mut outstanding = self.outstanding(envelope.destination)?;

        if outstanding.in_flight.len() >= self.cfg.window {
            trace!(destination = envelope.destination, id = envelope.id, "window full, queueing");
            outstanding.backlog.push_back(envelope);
            return Ok(());
        }

        envelope.next_retry_at = Instant::now() + self.retry_delay(0);
        let datagram = envelope.encode();
        outstanding.in_flight.insert(envelope.key(), envelope);
        drop(outstanding);

        self.transmit(address, datagram);
        Ok(())
    }

    /// Number of unacknowledged envelopes for `destination`, backlog included.
    pub fn pending(&self, destination: ProcessId) -> usize {
        self.outstanding(destination)
            .map(|o| o.in_flight.len() + o.backlog.len())
            .unwrap_or(0)
    }

    /// Stops accepting sends and signals every worker to exit.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(id = self.id, "stopping link");
        self.shutdown.send_replace(true);
        let _ = self.outbound.send(Outbound::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn outstanding(
        &self,
        destination: ProcessId,
    ) -> Result<MutexGuard<'_, Outstanding>, Error> {
        let outstanding = self
            .outstanding
            .get(&destination)
            .ok_or(Error::UnknownProcess(destination))?;
        Ok(outstanding.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn transmit(&self, address: SocketAddr, datagram: Bytes) {
        if self.outbound.send(Outbound::Datagram(address, datagram)).is_err() {
            debug!("sender worker gone, dropping datagram");
        }
    }

    /// `jitter + base * 2^retransmits`, with the exponential term capped.
    fn retry_delay(&self, retransmits: u32) -> Duration {
        let factor = 1u32.checked_shl(retransmits).unwrap_or(u32::MAX);
        let backoff = self
            .cfg
            .backoff_base
            .checked_mul(factor)
            .map_or(self.cfg.max_backoff, |d| d.min(self.cfg.max_backoff));
        let jitter_ms = self.cfg.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }

    fn acknowledge(&self, ack: &Envelope) {
        let Ok(address) = self.peers.address(ack.destination) else {
            warn!(destination = ack.destination, "ack from unknown process");
            return;
        };
        let Ok(mut outstanding) = self.outstanding(ack.destination) else {
            return;
        };
        if outstanding.in_flight.remove(&ack.key()).is_none() {
            trace!(destination = ack.destination, id = ack.id, "duplicate ack");
            return;
        }

        // Promote backlog into the freed slots.
        let mut promoted = Vec::new();
        while outstanding.in_flight.len() < self.cfg.window {
            let Some(mut envelope) = outstanding.backlog.pop_front() else {
                break;
            };
            envelope.next_retry_at = Instant::now() + self.retry_delay(0);
            promoted.push(envelope.encode());
            outstanding.in_flight.insert(envelope.key(), envelope);
        }
        drop(outstanding);

        for datagram in promoted {
            self.transmit(address, datagram);
        }
    }

    fn handle<H: Deliver>(
        &self,
        envelope: Envelope,
        delivered: &mut HashMap<ProcessId, HashSet<MessageId>>,
        handler: &H,
    ) {
        if envelope.is_ack {
            if envelope.source != self.id {
                warn!(source = envelope.source, "ack for a message we did not send");
                return;
            }
            self.acknowledge(&envelope);
            return;
        }

        if envelope.destination != self.id {
            warn!(destination = envelope.destination, "misrouted envelope");
            return;
        }
        let Ok(address) = self.peers.address(envelope.source) else {
            warn!(source = envelope.source, "envelope from unknown process");
            return;
        };

        if !self.is_stopped() {
            self.transmit(address, envelope.to_ack().encode());
        }

        if !delivered.entry(envelope.source).or_default().insert(envelope.id) {
            trace!(source = envelope.source, id = envelope.id, "duplicate");
            return;
        }
        handler.deliver(envelope);
    }

    fn retransmit(&self) {
        let now = Instant::now();
        for (destination, outstanding) in &self.outstanding {
            let Ok(address) = self.peers.address(*destination) else {
                continue;
            };
            let mut due = Vec::new();
            {
                let mut outstanding = outstanding.lock().unwrap_or_else(|e| e.into_inner());
                for envelope in outstanding.in_flight.values_mut() {
                    if envelope.next_retry_at > now {
                        continue;
                    }
                    envelope.retransmits += 1;
                    envelope.next_retry_at = now + self.retry_delay(envelope.retransmits);
                    due.push(envelope.encode());
                }
            }
            if !due.is_empty() {
                trace!(destination, count = due.len(), "retransmitting");
            }
            for datagram in due {
                self.transmit(address, datagram);
            }
        }
    }
}

impl<T: Transport> LinkRunner<T> {
    /// Spawns the sender, receiver, retransmitter and delivery lanes.
    pub fn start<H: Deliver>(self, handler: Arc<H>) -> LinkHandles {
        let LinkRunner {
            link,
            transport,
            outbound,
        } = self;
        let mut handles = Vec::new();

        handles.push(tokio::spawn(send_loop(transport.clone(), outbound)));

        let lanes = link.cfg.lanes.max(1);
        let mut lane_senders = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::unbounded_channel();
            lane_senders.push(tx);
            handles.push(tokio::spawn(lane_loop(lane, link.clone(), handler.clone(), rx)));
        }

        handles.push(tokio::spawn(receive_loop(
            link.clone(),
            transport,
            lane_senders,
            link.shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(retransmit_loop(
            link.clone(),
            link.shutdown.subscribe(),
        )));

        LinkHandles { handles }
    }
}

impl LinkHandles {
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(err) = result {
                error!(?err, "link worker failed");
            }
        }
    }
}

async fn send_loop<T: Transport>(transport: Arc<T>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound::Datagram(address, datagram)) = outbound.recv().await {
        if let Err(err) = transport.send(address, datagram).await {
            // The retransmitter will try again.
            warn!(?err, %address, "send failed");
        }
    }
    debug!("sender stopped");
}

async fn receive_loop<T: Transport>(
    link: Arc<PerfectLink>,
    transport: Arc<T>,
    lanes: Vec<mpsc::UnboundedSender<LaneItem>>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow_and_update() {
        tokio::select! {
            _ = shutdown.changed() => continue,
            received = transport.recv() => {
                let datagram = match received {
                    Ok(datagram) => datagram,
                    Err(err) => {
                        error!(?err, id = link.id, "receive failed, no further messages will be processed");
                        break;
                    }
                };
                let envelope = match Envelope::decode(datagram) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(?err, "dropping malformed datagram");
                        continue;
                    }
                };
                let lane = envelope.source as usize % lanes.len();
                let _ = lanes[lane].send(LaneItem::Envelope(envelope));
            }
        }
    }
    for lane in &lanes {
        let _ = lane.send(LaneItem::Stop);
    }
    debug!("receiver stopped");
}

async fn lane_loop<H: Deliver>(
    lane: usize,
    link: Arc<PerfectLink>,
    handler: Arc<H>,
    mut rx: mpsc::UnboundedReceiver<LaneItem>,
) {
    // Each source maps to exactly one lane, so its table is only touched here.
    let mut delivered = HashMap::new();
    while let Some(LaneItem::Envelope(envelope)) = rx.recv().await {
        link.handle(envelope, &mut delivered, handler.as_ref());
    }
    debug!(lane, "lane stopped");
}

async fn retransmit_loop(link: Arc<PerfectLink>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(link.cfg.retransmit_tick);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    while !*shutdown.borrow_and_update() {
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ticker.tick() => link.retransmit(),
        }
    }
    debug!("retransmitter stopped");
}
