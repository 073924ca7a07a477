use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{LinkHandles, PerfectLink, Transport};
use crate::{
    broadcast::FifoBroadcast,
    common::{sink, Error, LinkConfig, SharedSink},
    consensus::{AgreementProcessor, Mailbox, Peers, ProcessId, ValueSet},
};

enum Role {
    Agreement {
        mailbox: Mailbox,
        proposer: JoinHandle<()>,
    },
    Broadcast {
        fifo: Arc<FifoBroadcast>,
    },
}

/// One running process: a perfect link plus the layer on top of it.
pub struct Node {
    pub id: ProcessId,
    pub link: Arc<PerfectLink>,
    link_handles: LinkHandles,
    role: Role,
    sink: SharedSink,
}

impl Node {
    /// Starts lattice agreement and proposes the first round.
    pub fn start_agreement<T: Transport>(
        id: ProcessId,
        peers: Peers,
        cfg: LinkConfig,
        transport: Arc<T>,
        proposals: Vec<ValueSet>,
        sink: SharedSink,
    ) -> Self {
        let (link, runner) = PerfectLink::new(id, peers, cfg, transport);
        let (processor, mailbox) = AgreementProcessor::new(link.clone(), proposals, sink.clone());
        let link_handles = runner.start(Arc::new(mailbox.clone()));
        let proposer = tokio::spawn(processor.run());
        mailbox.propose(0);
        info!(id, "agreement node started");

        Node {
            id,
            link,
            link_handles,
            role: Role::Agreement { mailbox, proposer },
            sink,
        }
    }

    /// Starts the FIFO broadcast stack. Messages are sent through [Node::broadcaster].
    pub fn start_broadcast<T: Transport>(
        id: ProcessId,
        peers: Peers,
        cfg: LinkConfig,
        transport: Arc<T>,
        sink: SharedSink,
    ) -> Self {
        let (link, runner) = PerfectLink::new(id, peers, cfg, transport);
        let fifo = Arc::new(FifoBroadcast::new(link.clone(), sink.clone()));
        let link_handles = runner.start(fifo.urb());
        info!(id, "broadcast node started");

        Node {
            id,
            link,
            link_handles,
            role: Role::Broadcast { fifo },
            sink,
        }
    }

    pub fn broadcaster(&self) -> Option<&Arc<FifoBroadcast>> {
        match &self.role {
            Role::Broadcast { fifo } => Some(fifo),
            Role::Agreement { .. } => None,
        }
    }

    /// Stops sending, closes the transport, unblocks and joins every worker,
    /// then flushes the sink. No worker writes to the sink after this returns.
    pub async fn shutdown(self) -> Result<(), Error> {
        info!(id = self.id, "shutting down");
        self.link.stop();
        let proposer = match self.role {
            Role::Agreement { mailbox, proposer } => {
                mailbox.stop();
                Some(proposer)
            }
            Role::Broadcast { .. } => None,
        };

        self.link_handles.join().await;
        let unacked: usize = self.link.peers().ids().map(|peer| self.link.pending(peer)).sum();
        if unacked > 0 {
            info!(unacked, "envelopes left unacknowledged");
        }
        if let Some(proposer) = proposer {
            if let Err(err) = proposer.await {
                error!(?err, "proposer failed");
            }
        }
        sink::flush(&self.sink)
    }
}
