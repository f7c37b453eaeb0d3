use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::packet::Packet;
use crate::{MqttError, Result};

/// A bidirectional stream of decoded packets.
///
/// `recv` is polled inside `tokio::select!` and must be cancel safe.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Next packet from the peer, `None` once the peer closed the stream.
    async fn recv(&mut self) -> Result<Option<Packet>>;

    async fn send(&mut self, packet: Packet) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    #[inline]
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Broker side of an in-memory transport.
pub struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<Packet>,
    tx: Option<mpsc::UnboundedSender<Packet>>,
    remote_addr: Option<SocketAddr>,
}

/// Client side of an in-memory transport.
pub struct ChannelPeer {
    tx: Option<mpsc::UnboundedSender<Packet>>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (to_broker_tx, to_broker_rx) = mpsc::unbounded_channel();
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport { rx: to_broker_rx, tx: Some(to_peer_tx), remote_addr: None },
            ChannelPeer { tx: Some(to_broker_tx), rx: to_peer_rx },
        )
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    #[inline]
    async fn recv(&mut self) -> Result<Option<Packet>> {
        Ok(self.rx.recv().await)
    }

    #[inline]
    async fn send(&mut self, packet: Packet) -> Result<()> {
        match self.tx.as_ref() {
            Some(tx) => tx.send(packet).map_err(|_| MqttError::TransportClosed.into()),
            None => Err(MqttError::TransportClosed.into()),
        }
    }

    #[inline]
    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        self.rx.close();
        Ok(())
    }

    #[inline]
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl ChannelPeer {
    pub fn send<P: Into<Packet>>(&self, packet: P) -> Result<()> {
        match self.tx.as_ref() {
            Some(tx) => tx.send(packet.into()).map_err(|_| MqttError::TransportClosed.into()),
            None => Err(MqttError::TransportClosed.into()),
        }
    }

    /// Next packet from the broker, `None` once the broker closed the connection.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Drop the sending half, the broker observes a transport close.
    pub fn close(&mut self) {
        self.tx.take();
    }
}
