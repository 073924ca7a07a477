use std::net::SocketAddr;

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::Mutex};
use tracing::info;

use super::Transport;
use crate::common::Error;

/// Large enough for any datagram a peer may send.
pub const BUFFER_SIZE: usize = 65000;

pub struct UdpTransport {
    socket: UdpSocket,
    /// Receive scratch space. Only the bytes of each datagram are copied out.
    buffer: Mutex<Vec<u8>>,
}

impl UdpTransport {
    pub async fn bind(address: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(address).await?;
        info!(%address, "bound udp socket");
        Ok(UdpTransport {
            socket,
            buffer: Mutex::new(vec![0u8; BUFFER_SIZE]),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, datagram: Bytes) -> Result<(), Error> {
        self.socket.send_to(&datagram, to).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, Error> {
        let mut buf = self.buffer.lock().await;
        let (len, _) = self.socket.recv_from(&mut buf[..]).await?;
        Ok(Bytes::copy_from_slice(&buf[..len]))
    }
}
