/*
    Lattice agreement over threshold logical clocks, on top of a layered
    broadcast stack.

    Datagrams are turned into a perfect point-to-point link by acknowledging,
    retransmitting and deduplicating every envelope. On top of the link sit two
    independent stacks: uniform reliable broadcast with FIFO ordering, and a
    round-based lattice agreement in which processes propose sets of integers,
    merge what they are refused, and decide a set that is comparable with
    every other decision of the same round. A round closes once a majority of
    processes has published its decision as a TLC record; a process that falls
    behind catches up from those records instead of replaying the round.

    Run one process per host in the hosts file and stop it with SIGINT or
    SIGTERM. Every decided round (or every broadcast and delivery) is written
    to the output file, one line each.
*/

mod broadcast;
mod common;
mod consensus;
mod network;

use std::{future::Future, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::{value_parser, Arg, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, Level};

use common::{config, sink, Error, FileSink, LinkConfig};
use consensus::{Peers, ProcessId};
use network::{Node, UdpTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Agreement,
    Fifo,
}

struct Args {
    id: ProcessId,
    hosts: PathBuf,
    output: PathBuf,
    config: PathBuf,
    mode: Mode,
    link: LinkConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("tlc-lattice")
        .about("lattice agreement and FIFO broadcast over UDP")
        .arg(
            Arg::new("id")
                .long("id")
                .required(true)
                .value_parser(value_parser!(u8).range(1..)),
        )
        .arg(
            Arg::new("hosts")
                .long("hosts")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .default_value("agreement")
                .value_parser(["agreement", "fifo"]),
        )
        .arg(
            Arg::new("lanes")
                .long("lanes")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("tick-ms")
                .long("tick-ms")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level)),
        )
        .get_matches();

    let level = *matches.get_one::<Level>("log-level").expect("has default");
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut link = LinkConfig::default();
    if let Some(lanes) = matches.get_one::<usize>("lanes") {
        link.lanes = *lanes;
    }
    if let Some(tick) = matches.get_one::<u64>("tick-ms") {
        link.retransmit_tick = Duration::from_millis(*tick);
    }
    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("fifo") => Mode::Fifo,
        _ => Mode::Agreement,
    };
    let args = Args {
        id: *matches.get_one::<u8>("id").expect("required"),
        hosts: matches.get_one::<PathBuf>("hosts").expect("required").clone(),
        output: matches.get_one::<PathBuf>("output").expect("required").clone(),
        config: matches.get_one::<PathBuf>("config").expect("required").clone(),
        mode,
        link,
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    // Everything that can be wrong with the inputs fails here, before any socket is opened.
    let peers = Peers::new(config::parse_hosts(&config::read_file(&args.hosts)?)?);
    if !peers.is_member(args.id) {
        return Err(Error::UnknownProcess(args.id));
    }
    let input = config::read_file(&args.config)?;
    let agreement = match args.mode {
        Mode::Agreement => Some(config::parse_agreement(&input)?),
        Mode::Fifo => None,
    };
    let messages = match args.mode {
        Mode::Fifo => config::parse_broadcast(&input)?,
        Mode::Agreement => 0,
    };
    info!(id = args.id, processes = peers.len(), mode = ?args.mode, "starting");
    let stop = termination()?;

    let sink = sink::shared(FileSink::create(&args.output)?);
    let transport = Arc::new(UdpTransport::bind(peers.address(args.id)?).await?);
    info!(address = %transport.local_addr()?, "listening");

    let node = match agreement {
        Some(agreement) => {
            info!(
                rounds = agreement.rounds,
                max_values_per_round = agreement.max_values_per_round,
                max_distinct_values = agreement.max_distinct_values,
                "proposing"
            );
            Node::start_agreement(args.id, peers, args.link, transport, agreement.proposals, sink)
        }
        None => {
            let node = Node::start_broadcast(args.id, peers, args.link, transport, sink);
            if let Some(fifo) = node.broadcaster() {
                for _ in 0..messages {
                    fifo.broadcast(Bytes::new())?;
                }
                info!(messages, "broadcast all messages");
            }
            node
        }
    };

    stop.await;
    info!("immediately stopping network packet processing");
    node.shutdown().await
}

/// Installs SIGINT and SIGTERM listeners. The returned future resolves on the first of either.
fn termination() -> Result<impl Future<Output = ()>, Error> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    })
}
