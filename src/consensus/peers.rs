use std::net::SocketAddr;

use crate::common::Error;

pub type ProcessId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pub id: ProcessId,
    pub address: SocketAddr,
}

/// The fixed set of participating processes, indexed by id (1..=N).
#[derive(Debug, Clone)]
pub struct Peers {
    pub members: Vec<Process>,
}

impl Peers {
    pub fn new(mut members: Vec<Process>) -> Self {
        members.sort_by_key(|p| p.id);
        Peers { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, id: ProcessId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.members.iter().find(|p| p.id == id)
    }

    pub fn address(&self, id: ProcessId) -> Result<SocketAddr, Error> {
        self.get(id)
            .map(|p| p.address)
            .ok_or(Error::UnknownProcess(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.members.iter().map(|p| p.id)
    }

    /// Strict majority: more than N/2 processes.
    pub fn is_quorum(&self, count: usize) -> bool {
        count > self.members.len() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: u8) -> Peers {
        Peers::new(
            (1..=n)
                .rev()
                .map(|id| Process {
                    id,
                    address: SocketAddr::from(([127, 0, 0, 1], 11000 + id as u16)),
                })
                .collect(),
        )
    }

    #[test]
    fn test_quorum() {
        let four = peers(4);
        assert!(!four.is_quorum(2));
        assert!(four.is_quorum(3));

        let five = peers(5);
        assert!(!five.is_quorum(2));
        assert!(five.is_quorum(3));
    }

    #[test]
    fn test_lookup() {
        let peers = peers(3);
        assert_eq!(peers.ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(peers.address(2).unwrap().port(), 11002);
        assert!(matches!(peers.address(9), Err(Error::UnknownProcess(9))));
    }
}
