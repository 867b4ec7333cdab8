//! The datagram sink a session writes to.
//!
//! The core is oblivious to what carries the datagrams; anything that
//! can push a packet toward one peer works. Sends are non-blocking: a
//! full socket buffer drops the datagram and retransmission recovers
//! it, which is the flow-control posture of the protocol itself.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// A packet-oriented sink bound to one peer.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, data: &[u8]) -> io::Result<()>;
}

/// Writes through a connected UDP socket (the dialing side).
pub struct ConnectedUdp {
    socket: Arc<UdpSocket>,
}

impl ConnectedUdp {
    pub fn new(socket: Arc<UdpSocket>) -> ConnectedUdp {
        ConnectedUdp { socket }
    }
}

impl Transport for ConnectedUdp {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        match self.socket.try_send(data) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("udp send buffer full, dropping datagram");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Writes through a shared listening socket toward one peer (the
/// serving side).
pub struct SharedUdp {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl SharedUdp {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> SharedUdp {
        SharedUdp { socket, peer }
    }
}

impl Transport for SharedUdp {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        match self.socket.try_send_to(data, self.peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("udp send buffer full, dropping datagram to {}", self.peer);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Hands datagrams to a channel instead of a socket. Tests read the
/// session's wire traffic from the receiving end.
pub struct ChannelTransport(pub mpsc::UnboundedSender<Vec<u8>>);

impl Transport for ChannelTransport {
    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.0
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connected_udp_delivers() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();

        ConnectedUdp::new(a).send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn shared_udp_delivers_to_the_peer() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        SharedUdp::new(a, b.local_addr().unwrap()).send(b"pong").unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn channel_transport_errors_when_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let t = ChannelTransport(tx);
        t.send(b"ok").unwrap();
        drop(rx);
        assert!(t.send(b"nope").is_err());
    }
}
