//! In-memory datagram network with configurable loss, duplication and reordering.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::trace;

use super::Transport;
use crate::{
    common::{Error, LinkConfig},
    consensus::{Peers, Process, ProcessId},
};

/// Link settings tuned for tests: short ticks and backoff.
pub fn fast_link_config() -> LinkConfig {
    LinkConfig {
        lanes: 2,
        retransmit_tick: Duration::from_millis(10),
        backoff_base: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        jitter: Duration::from_millis(5),
        window: 1024,
    }
}

struct Endpoint {
    inbox: mpsc::UnboundedSender<Bytes>,
    reachable: bool,
}

pub struct SimulatedNetwork {
    peers: Peers,
    /// Probability of a datagram being delivered at all (in range [0,1]).
    success_rate: f64,
    /// Probability of a delivered datagram arriving twice.
    duplicate_rate: f64,
    /// Upper bound on the delivery delay; random delays reorder datagrams.
    max_latency: Duration,
    rng: Mutex<StdRng>,
    endpoints: Mutex<HashMap<SocketAddr, Endpoint>>,
}

pub struct SimulatedTransport {
    network: Arc<SimulatedNetwork>,
    address: SocketAddr,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl SimulatedNetwork {
    pub fn new(processes: u8, success_rate: f64, duplicate_rate: f64, seed: u64) -> Arc<Self> {
        let members = (1..=processes)
            .map(|id| Process {
                id,
                address: SocketAddr::from(([10, 0, 0, id], 4000)),
            })
            .collect();
        Arc::new(SimulatedNetwork {
            peers: Peers::new(members),
            success_rate,
            duplicate_rate,
            max_latency: Duration::from_millis(3),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    pub fn peers(&self) -> Peers {
        self.peers.clone()
    }

    pub fn register(self: &Arc<Self>, id: ProcessId) -> SimulatedTransport {
        let address = self.peers.address(id).expect("unknown process");
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().unwrap().insert(
            address,
            Endpoint {
                inbox: tx,
                reachable: true,
            },
        );
        SimulatedTransport {
            network: self.clone(),
            address,
            inbox: AsyncMutex::new(rx),
        }
    }

    /// An unreachable process neither sends nor receives anything, which is
    /// how tests model a crash or a partition.
    pub fn set_reachable(&self, id: ProcessId, reachable: bool) {
        let address = self.peers.address(id).expect("unknown process");
        if let Some(endpoint) = self.endpoints.lock().unwrap().get_mut(&address) {
            endpoint.reachable = reachable;
        }
    }

    /// Hands a raw datagram to `id` as if it had arrived from the wire.
    pub fn inject(&self, id: ProcessId, datagram: Bytes) {
        let address = self.peers.address(id).expect("unknown process");
        if let Some(endpoint) = self.endpoints.lock().unwrap().get(&address) {
            let _ = endpoint.inbox.send(datagram);
        }
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, datagram: Bytes) {
        let inbox = {
            let endpoints = self.endpoints.lock().unwrap();
            let sender_up = endpoints.get(&from).map_or(false, |e| e.reachable);
            match endpoints.get(&to) {
                Some(endpoint) if sender_up && endpoint.reachable => endpoint.inbox.clone(),
                _ => {
                    trace!(%from, %to, "dropping datagram: unreachable");
                    return;
                }
            }
        };

        let copies = {
            let mut rng = self.rng.lock().unwrap();
            if !rng.gen_bool(self.success_rate) {
                0
            } else if rng.gen_bool(self.duplicate_rate) {
                2
            } else {
                1
            }
        };
        for _ in 0..copies {
            let delay = {
                let mut rng = self.rng.lock().unwrap();
                rng.gen_range(Duration::ZERO..=self.max_latency)
            };
            let inbox = inbox.clone();
            let datagram = datagram.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = inbox.send(datagram);
            });
        }
    }
}

impl Transport for SimulatedTransport {
    async fn send(&self, to: SocketAddr, datagram: Bytes) -> Result<(), Error> {
        self.network.route(self.address, to, datagram);
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, Error> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(Error::Stopped)
    }
}
