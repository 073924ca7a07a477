pub mod envelope;
pub mod link;
pub mod node;
pub mod udp;

#[cfg(test)]
pub mod simulated;

pub use envelope::*;
pub use link::*;
pub use node::*;
pub use udp::*;

use std::{future::Future, net::SocketAddr};

use bytes::Bytes;

use crate::common::Error;

/*
    The transport is an unreliable datagram service: a datagram handed to
    `send` may be lost, duplicated or reordered, and `recv` yields whatever
    arrives at the local address. Everything above the perfect link assumes
    none of that happens.
*/
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: SocketAddr, datagram: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    fn recv(&self) -> impl Future<Output = Result<Bytes, Error>> + Send;
}
