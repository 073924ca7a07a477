use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

use super::{
    message::{Ack, Message, Nack, Proposal, Step, Tlc, ValueSet},
    peers::ProcessId,
    store::TlcStore,
};
use crate::{
    common::{sink, Error, SharedSink},
    network::{Deliver, Envelope, PerfectLink},
};

/*
    Lattice agreement, one step at a time, synchronised by threshold logical
    clocks. A step is closed once a strict majority of processes has published
    a TLC record for it; only then does the processor move to the next step.
    Messages tagged with an older step never touch the current round, they only
    tell us the sender is behind.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Stage {
    #[default]
    Idle,
    Proposing,
    Decided,
}

/// Mutable state of the current step.
#[derive(Default, Debug)]
pub struct RoundState {
    pub stage: Stage,
    pub proposed: ValueSet,
    pub accepted: ValueSet,
    pub number: u32,
    pub acks: usize,
    pub nacks: usize,
}

pub enum Work {
    Propose(Step),
    Deliver { source: ProcessId, message: Message },
    Stop,
}

/// Handle to the processor's work queue. Link lanes deliver through it.
#[derive(Clone)]
pub struct Mailbox {
    tx: UnboundedSender<Work>,
}

impl Mailbox {
    pub fn propose(&self, step: Step) {
        let _ = self.tx.send(Work::Propose(step));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Work::Stop);
    }
}

impl Deliver for Mailbox {
    fn deliver(&self, envelope: Envelope) {
        let source = envelope.source;
        match Message::decode(envelope.kind, envelope.payload) {
            Ok(message) => {
                let _ = self.tx.send(Work::Deliver { source, message });
            }
            Err(err) => warn!(?err, source, "dropping malformed agreement message"),
        }
    }
}

/// Sole owner of the round state. Proposals, merges and step changes all
/// happen on this worker, in queue order.
pub struct AgreementProcessor {
    pub id: ProcessId,
    pub link: Arc<PerfectLink>,
    pub proposals: Vec<ValueSet>,
    pub current_step: Step,
    pub round: RoundState,
    pub store: TlcStore,
    /// Proposals for steps we have not reached yet.
    pub parked: BTreeMap<Step, Vec<(ProcessId, Proposal)>>,
    /// Peers we already sent a catch-up record to, by step.
    pub caught_up: HashSet<(ProcessId, Step)>,
    pub sink: SharedSink,
    pub work_rx: UnboundedReceiver<Work>,
    pub work_tx: UnboundedSender<Work>,
}

impl AgreementProcessor {
    pub fn new(link: Arc<PerfectLink>, proposals: Vec<ValueSet>, sink: SharedSink) -> (Self, Mailbox) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let mailbox = Mailbox {
            tx: work_tx.clone(),
        };
        let processor = AgreementProcessor {
            id: link.id(),
            link,
            proposals,
            current_step: 0,
            round: RoundState::default(),
            store: TlcStore::new(),
            parked: BTreeMap::new(),
            caught_up: HashSet::new(),
            sink,
            work_rx,
            work_tx,
        };
        (processor, mailbox)
    }

    pub async fn run(mut self) {
        debug!(id = self.id, rounds = self.proposals.len(), "running agreement processor");
        while let Some(work) = self.work_rx.recv().await {
            let result = match work {
                Work::Propose(step) => self.handle_propose(step),
                Work::Deliver { source, message } => self.handle_message(source, message),
                Work::Stop => break,
            };
            match result {
                Ok(()) => {}
                Err(Error::Stopped) => break,
                Err(err) => error!(?err, step = self.current_step, "agreement step failed"),
            }
        }
        debug!(id = self.id, step = self.current_step, "agreement processor stopped");
    }

    fn rounds(&self) -> Step {
        self.proposals.len() as Step
    }

    pub fn handle_propose(&mut self, step: Step) -> Result<(), Error> {
        if step != self.current_step || step >= self.rounds() {
            trace!(step, current = self.current_step, "skipping stale proposal request");
            return Ok(());
        }
        if self.round.stage == Stage::Decided {
            return Ok(());
        }

        self.round
            .proposed
            .extend(self.proposals[step as usize].iter().copied());
        self.round.stage = Stage::Proposing;
        self.round.number += 1;
        self.round.acks = 0;
        self.round.nacks = 0;
        debug!(step, number = self.round.number, "proposing");
        self.broadcast_proposal()
    }

    pub fn handle_message(&mut self, source: ProcessId, message: Message) -> Result<(), Error> {
        let step = message.step();
        if step < self.current_step {
            return self.catch_up(source, step);
        }
        if step >= self.rounds() {
            trace!(source, step, "message beyond the last round");
            return Ok(());
        }
        if step > self.current_step {
            match message {
                Message::Proposal(proposal) => {
                    self.parked.entry(step).or_default().push((source, proposal));
                }
                Message::Tlc(tlc) => {
                    self.store.add_record(tlc.step, source, tlc.value);
                }
                Message::Ack(_) | Message::Nack(_) => {
                    trace!(source, step, "reply for a step we never proposed in");
                }
            }
            return Ok(());
        }

        match message {
            Message::Proposal(proposal) => self.handle_proposal(source, proposal),
            Message::Ack(ack) => self.handle_ack(ack),
            Message::Nack(nack) => self.handle_nack(nack),
            Message::Tlc(tlc) => self.handle_tlc(source, tlc),
        }
    }

    fn handle_proposal(&mut self, source: ProcessId, proposal: Proposal) -> Result<(), Error> {
        let reply = if proposal.value.is_superset(&self.round.accepted) {
            self.round.accepted = proposal.value;
            Message::Ack(Ack {
                step: proposal.step,
                number: proposal.number,
            })
        } else {
            self.round.accepted.extend(proposal.value);
            Message::Nack(Nack {
                step: proposal.step,
                number: proposal.number,
                value: self.round.accepted.clone(),
            })
        };
        self.link.send(source, reply.kind(), reply.encode())?;
        Ok(())
    }

    fn handle_ack(&mut self, ack: Ack) -> Result<(), Error> {
        if ack.number != self.round.number || self.round.stage != Stage::Proposing {
            return Ok(());
        }
        self.round.acks += 1;
        if self.link.peers().is_quorum(self.round.acks) {
            let value = self.round.proposed.clone();
            self.decide(value)?;
            return self.advance();
        }
        self.retry_if_refused()
    }

    fn handle_nack(&mut self, nack: Nack) -> Result<(), Error> {
        if nack.number != self.round.number || self.round.stage != Stage::Proposing {
            return Ok(());
        }
        self.round.proposed.extend(nack.value);
        self.round.nacks += 1;
        self.retry_if_refused()
    }

    /// Once a majority answered and at least one refused, propose again with
    /// everything merged so far.
    fn retry_if_refused(&mut self) -> Result<(), Error> {
        if self.round.nacks == 0 || !self.link.peers().is_quorum(self.round.acks + self.round.nacks) {
            return Ok(());
        }
        self.round.number += 1;
        self.round.acks = 0;
        self.round.nacks = 0;
        debug!(step = self.current_step, number = self.round.number, "retrying with merged value");
        self.broadcast_proposal()
    }

    fn handle_tlc(&mut self, source: ProcessId, tlc: Tlc) -> Result<(), Error> {
        if !self.store.add_record(tlc.step, source, tlc.value) {
            trace!(source, step = tlc.step, "duplicate tlc record");
        }
        self.advance()
    }

    /// Sends our own record for a closed step to a peer that is still on it.
    fn catch_up(&mut self, peer: ProcessId, step: Step) -> Result<(), Error> {
        if peer == self.id || self.caught_up.contains(&(peer, step)) {
            return Ok(());
        }
        let Some(value) = self.store.get(step, self.id) else {
            return Ok(());
        };
        let record = Message::Tlc(Tlc {
            step,
            value: value.clone(),
        });
        debug!(peer, step, "sending catch-up record");
        self.link.send(peer, record.kind(), record.encode())?;
        self.caught_up.insert((peer, step));
        Ok(())
    }

    fn broadcast_proposal(&mut self) -> Result<(), Error> {
        let proposal = Message::Proposal(Proposal {
            step: self.current_step,
            number: self.round.number,
            value: self.round.proposed.clone(),
        });
        self.link.send_all(proposal.kind(), proposal.encode())
    }

    /// Outputs `value` for the current step and publishes our TLC record.
    fn decide(&mut self, value: ValueSet) -> Result<(), Error> {
        let step = self.current_step;
        let line = value
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        sink::record(&self.sink, &line)?;
        info!(step, size = value.len(), "decided");

        self.round.stage = Stage::Decided;
        let record = Message::Tlc(Tlc {
            step,
            value: value.clone(),
        });
        self.store.add_record(step, self.id, value);

        let payload = record.encode();
        for peer in self.link.peers().ids().filter(|peer| *peer != self.id) {
            self.link.send(peer, record.kind(), payload.clone())?;
        }
        Ok(())
    }

    /// Closes every step for which a majority of TLC records is held.
    fn advance(&mut self) -> Result<(), Error> {
        while self.current_step < self.rounds()
            && self.link.peers().is_quorum(self.store.count(self.current_step))
        {
            let step = self.current_step;
            if self.round.stage != Stage::Decided {
                let mut value = self.round.proposed.clone();
                value.extend(self.store.join(step));
                self.decide(value)?;
            }

            self.store.prune(step, self.id);
            self.current_step += 1;
            self.round = RoundState::default();
            debug!(step = self.current_step, "entering step");

            if self.current_step < self.rounds() {
                let _ = self.work_tx.send(Work::Propose(self.current_step));
            }
            if let Some(parked) = self.parked.remove(&self.current_step) {
                for (source, proposal) in parked {
                    self.handle_proposal(source, proposal)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        common::sink::{shared, MemorySink},
        network::{
            simulated::{fast_link_config, SimulatedNetwork},
            Kind,
        },
    };

    fn set(values: &[i32]) -> ValueSet {
        values.iter().copied().collect()
    }

    /// A processor whose link is never started; sends only fill the outstanding sets.
    fn processor(n: u8, proposals: Vec<ValueSet>) -> (AgreementProcessor, MemorySink) {
        let network = SimulatedNetwork::new(n, 1.0, 0.0, 1);
        let transport = Arc::new(network.register(1));
        let (link, _runner) = PerfectLink::new(1, network.peers(), fast_link_config(), transport);
        let memory = MemorySink::default();
        let (processor, _mailbox) = AgreementProcessor::new(link, proposals, shared(memory.clone()));
        (processor, memory)
    }

    #[test]
    fn test_propose_sends_to_everyone() {
        let (mut p, _) = processor(3, vec![set(&[1, 2])]);
        p.handle_propose(0).unwrap();
        assert_eq!(p.round.stage, Stage::Proposing);
        assert_eq!(p.round.number, 1);
        assert_eq!(p.round.proposed, set(&[1, 2]));
        for peer in 1..=3 {
            assert_eq!(p.link.pending(peer), 1);
        }
    }

    #[test]
    fn test_accept_superset_and_merge_otherwise() {
        let (mut p, _) = processor(3, vec![set(&[1])]);
        let proposal = |value: &[i32]| {
            Message::Proposal(Proposal {
                step: 0,
                number: 1,
                value: set(value),
            })
        };

        p.handle_message(2, proposal(&[1, 2])).unwrap();
        assert_eq!(p.round.accepted, set(&[1, 2]));

        p.handle_message(3, proposal(&[3])).unwrap();
        assert_eq!(p.round.accepted, set(&[1, 2, 3]));
        assert_eq!(p.link.pending(2), 1);
        assert_eq!(p.link.pending(3), 1);
    }

    #[test]
    fn test_ack_quorum_decides_and_nack_retries() {
        let (mut p, memory) = processor(4, vec![set(&[1]), set(&[9])]);
        p.handle_propose(0).unwrap();

        p.handle_message(2, Message::Nack(Nack { step: 0, number: 1, value: set(&[5]) }))
            .unwrap();
        p.handle_message(3, Message::Ack(Ack { step: 0, number: 1 })).unwrap();
        assert_eq!(p.round.number, 1);
        p.handle_message(4, Message::Ack(Ack { step: 0, number: 1 })).unwrap();

        // One nack and two acks reach the quorum of three: retry with the merged set.
        assert_eq!(p.round.number, 2);
        assert_eq!(p.round.proposed, set(&[1, 5]));
        assert_eq!((p.round.acks, p.round.nacks), (0, 0));

        // Replies to the superseded proposal are ignored.
        p.handle_message(2, Message::Ack(Ack { step: 0, number: 1 })).unwrap();
        assert_eq!(p.round.acks, 0);

        for peer in 1..=3 {
            p.handle_message(peer, Message::Ack(Ack { step: 0, number: 2 })).unwrap();
        }
        assert_eq!(p.round.stage, Stage::Decided);
        assert_eq!(memory.lines(), vec!["1 5".to_string()]);
        assert_eq!(p.store.get(0, 1), Some(&set(&[1, 5])));
        // Still on step 0 until a majority of TLC records exists.
        assert_eq!(p.current_step, 0);
    }

    #[test]
    fn test_tlc_majority_closes_step() {
        let (mut p, memory) = processor(3, vec![set(&[1]), set(&[2])]);
        p.handle_propose(0).unwrap();
        p.handle_message(2, Message::Tlc(Tlc { step: 0, value: set(&[1, 7]) })).unwrap();
        assert_eq!(p.current_step, 0);
        p.handle_message(3, Message::Tlc(Tlc { step: 0, value: set(&[1, 8]) })).unwrap();

        assert_eq!(p.current_step, 1);
        assert_eq!(memory.lines(), vec!["1 7 8".to_string()]);
        assert_eq!(p.round.stage, Stage::Idle);
        // Only our own record survives the step.
        assert_eq!(p.store.count(0), 1);
        assert!(p.store.get(0, 1).is_some());
        assert!(matches!(p.work_rx.try_recv(), Ok(Work::Propose(1))));
    }

    #[test]
    fn test_stale_messages_do_not_touch_current_round() {
        let (mut p, _) = processor(3, vec![set(&[1]), set(&[2])]);
        p.handle_propose(0).unwrap();
        p.handle_message(2, Message::Tlc(Tlc { step: 0, value: set(&[1]) })).unwrap();
        p.handle_message(3, Message::Tlc(Tlc { step: 0, value: set(&[1]) })).unwrap();
        assert_eq!(p.current_step, 1);
        p.handle_propose(1).unwrap();

        let proposed = p.round.proposed.clone();
        let number = p.round.number;
        let pending_to_2 = p.link.pending(2);

        p.handle_message(2, Message::Proposal(Proposal { step: 0, number: 1, value: set(&[40]) }))
            .unwrap();
        p.handle_message(2, Message::Ack(Ack { step: 0, number })).unwrap();
        p.handle_message(3, Message::Nack(Nack { step: 0, number, value: set(&[41]) }))
            .unwrap();

        assert_eq!(p.round.proposed, proposed);
        assert!(p.round.accepted.is_empty());
        assert_eq!((p.round.acks, p.round.nacks), (0, 0));
        assert_eq!(p.round.stage, Stage::Proposing);

        // The stale proposal earned peer 2 exactly one catch-up record.
        assert_eq!(p.link.pending(2), pending_to_2 + 1);
        p.handle_message(2, Message::Proposal(Proposal { step: 0, number: 2, value: set(&[40]) }))
            .unwrap();
        assert_eq!(p.link.pending(2), pending_to_2 + 1);
    }

    #[test]
    fn test_future_proposal_is_parked_until_its_step() {
        let (mut p, _) = processor(3, vec![set(&[1]), set(&[2])]);
        p.handle_message(2, Message::Proposal(Proposal { step: 1, number: 1, value: set(&[6]) }))
            .unwrap();
        assert!(p.round.accepted.is_empty());
        assert_eq!(p.parked.len(), 1);

        p.handle_message(2, Message::Tlc(Tlc { step: 0, value: set(&[1]) })).unwrap();
        p.handle_message(3, Message::Tlc(Tlc { step: 0, value: set(&[1]) })).unwrap();
        assert_eq!(p.current_step, 1);
        assert_eq!(p.round.accepted, set(&[6]));
        assert!(p.parked.is_empty());
    }

    #[test]
    fn test_stored_future_records_close_several_steps() {
        let (mut p, memory) = processor(3, vec![set(&[1]), set(&[2]), set(&[3])]);
        p.handle_message(2, Message::Tlc(Tlc { step: 1, value: set(&[2]) })).unwrap();
        p.handle_message(3, Message::Tlc(Tlc { step: 1, value: set(&[2, 4]) })).unwrap();
        assert_eq!(p.current_step, 0);

        p.handle_message(2, Message::Tlc(Tlc { step: 0, value: set(&[1]) })).unwrap();
        p.handle_message(3, Message::Tlc(Tlc { step: 0, value: set(&[1]) })).unwrap();
        assert_eq!(p.current_step, 2);
        assert_eq!(memory.lines(), vec!["1".to_string(), "2 4".to_string()]);
    }

    #[test]
    fn test_late_process_decides_from_records_alone() {
        let (mut p, memory) = processor(4, vec![set(&[1]), set(&[11]), set(&[21])]);
        p.handle_propose(0).unwrap();
        assert_eq!(p.link.pending(2), 1);

        // The rest of the cluster finished every round while we were away.
        for step in (0..3).rev() {
            for peer in 2..=4 {
                let value = set(&[step as i32 * 10 + peer as i32]);
                p.handle_message(peer, Message::Tlc(Tlc { step, value })).unwrap();
            }
        }

        assert_eq!(p.current_step, 3);
        assert_eq!(
            memory.lines(),
            vec!["1 2 3 4".to_string(), "12 13 14".to_string(), "22 23 24".to_string()]
        );
        // No ack was ever counted and no proposal was retried: each peer holds
        // the one proposal for step 0 plus our record for each step.
        assert_eq!(p.round.number, 0);
        for peer in 2..=4 {
            assert_eq!(p.link.pending(peer), 4);
        }

        // Proposals queued for the closed steps are skipped.
        while let Ok(Work::Propose(step)) = p.work_rx.try_recv() {
            p.handle_propose(step).unwrap();
        }
        for peer in 2..=4 {
            assert_eq!(p.link.pending(peer), 4);
        }
        assert_eq!(memory.lines().len(), 3);
    }

    #[tokio::test]
    async fn test_mailbox_drops_malformed_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mailbox = Mailbox { tx };
        mailbox.deliver(Envelope::new(1, 2, Kind::Ack, 1, Bytes::from_static(&[0, 1])));
        mailbox.deliver(Envelope::new(
            2,
            2,
            Kind::Ack,
            1,
            Message::Ack(Ack { step: 0, number: 1 }).encode(),
        ));
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(
            received,
            Some(Work::Deliver { source: 2, message: Message::Ack(Ack { step: 0, number: 1 }) })
        ));
        assert!(rx.try_recv().is_err());
    }
}
