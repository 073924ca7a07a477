use std::{collections::BTreeSet, net::SocketAddr, path::Path, time::Duration};

use super::error::Error;
use crate::consensus::{Process, ProcessId, Value};

/// Tuning knobs for the perfect link.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Number of delivery lanes. Envelopes are sharded across lanes by source.
    pub lanes: usize,

    /// Period of the retransmission scan.
    pub retransmit_tick: Duration,

    /// Base delay of the exponential backoff.
    pub backoff_base: Duration,

    /// Upper bound on the exponential term of the backoff.
    pub max_backoff: Duration,

    /// Upper bound on the random delay added to every reschedule.
    pub jitter: Duration,

    /// Maximum number of unacknowledged envelopes in flight per destination.
    /// Anything beyond this waits in a backlog until an ack frees a slot.
    pub window: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            lanes: 4,
            retransmit_tick: Duration::from_millis(200),
            backoff_base: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            jitter: Duration::from_millis(100),
            window: 1024,
        }
    }
}

/// Input of the lattice agreement: one proposal set per round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgreementConfig {
    pub rounds: usize,
    pub max_values_per_round: usize,
    pub max_distinct_values: usize,
    pub proposals: Vec<BTreeSet<Value>>,
}

/// Reads the process directory. Each non-empty line is `id ip port`.
pub fn parse_hosts(input: &str) -> Result<Vec<Process>, Error> {
    let mut processes = Vec::new();
    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let [id, ip, port] = tokens[..] else {
            return Err(Error::config(line_no, "expected `id ip port`"));
        };
        let id: ProcessId = id
            .parse()
            .map_err(|_| Error::config(line_no, format!("bad process id `{id}`")))?;
        if id == 0 {
            return Err(Error::config(line_no, "process ids start at 1"));
        }
        let address: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| Error::config(line_no, format!("bad address `{ip}:{port}`")))?;
        processes.push(Process { id, address });
    }

    if processes.is_empty() {
        return Err(Error::config(1, "no hosts"));
    }
    processes.sort_by_key(|p| p.id);
    for (expected, process) in (1usize..).zip(processes.iter()) {
        if process.id as usize != expected {
            return Err(Error::config(
                expected,
                format!("process ids must be dense, missing {expected}"),
            ));
        }
    }
    Ok(processes)
}

/// Reads `p vs ds` followed by `p` lines of proposal values.
pub fn parse_agreement(input: &str) -> Result<AgreementConfig, Error> {
    let mut lines = input.lines();
    let header = lines.next().ok_or_else(|| Error::config(1, "empty config"))?;
    let header = parse_numbers::<usize>(header, 1)?;
    let [rounds, max_values_per_round, max_distinct_values] = header[..] else {
        return Err(Error::config(1, "expected `p vs ds`"));
    };

    let mut proposals = Vec::with_capacity(rounds);
    for round in 0..rounds {
        let line_no = round + 2;
        let line = lines
            .next()
            .ok_or_else(|| Error::config(line_no, format!("missing proposal for round {round}")))?;
        let values = parse_numbers::<Value>(line, line_no)?;
        proposals.push(values.into_iter().collect());
    }

    Ok(AgreementConfig {
        rounds,
        max_values_per_round,
        max_distinct_values,
        proposals,
    })
}

/// Reads the number of messages to broadcast in FIFO mode.
pub fn parse_broadcast(input: &str) -> Result<u32, Error> {
    let line = input.lines().next().ok_or_else(|| Error::config(1, "empty config"))?;
    let numbers = parse_numbers::<u32>(line, 1)?;
    match numbers[..] {
        [m] => Ok(m),
        _ => Err(Error::config(1, "expected message count")),
    }
}

pub fn read_file(path: &Path) -> Result<String, Error> {
    Ok(std::fs::read_to_string(path)?)
}

fn parse_numbers<T: std::str::FromStr>(line: &str, line_no: usize) -> Result<Vec<T>, Error> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse()
                .map_err(|_| Error::config(line_no, format!("not an integer: `{token}`")))
        })
        .collect()
}
