#![allow(dead_code)]

use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mqttd::hook::EventListener;
use mqttd::packet::{Connect, ConnectAck, ConnectAckReason, Packet, SubscribeReturnCode};
use mqttd::types::TopicFilter;
use mqttd::{Broker, ChannelPeer, ChannelTransport, ClientInfo, Error, Publish, QoS, Reason};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn pid(id: u16) -> NonZeroU16 {
    NonZeroU16::new(id).unwrap()
}

pub async fn recv(peer: &mut ChannelPeer) -> Packet {
    match tokio::time::timeout(WAIT, peer.recv()).await {
        Ok(Some(p)) => p,
        Ok(None) => panic!("connection closed"),
        Err(_) => panic!("no packet within {:?}", WAIT),
    }
}

pub async fn recv_publish(peer: &mut ChannelPeer) -> Publish {
    match recv(peer).await {
        Packet::Publish(p) => p,
        p => panic!("expected PUBLISH, got {:?}", p),
    }
}

/// True when the broker closed the connection without sending anything else.
pub async fn closed(peer: &mut ChannelPeer) -> bool {
    matches!(tokio::time::timeout(WAIT, peer.recv()).await, Ok(None))
}

pub async fn silent(peer: &mut ChannelPeer) {
    if let Ok(Some(p)) = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await {
        panic!("unexpected packet {:?}", p);
    }
}

pub async fn connect_with(broker: &Broker, connect: Connect) -> (ChannelPeer, ConnectAck) {
    let (transport, mut peer) = ChannelTransport::pair();
    broker.connect(transport);
    peer.send(connect).unwrap();
    match recv(&mut peer).await {
        Packet::ConnectAck(ack) => (peer, ack),
        p => panic!("expected CONNACK, got {:?}", p),
    }
}

pub async fn connect(broker: &Broker, client_id: &str) -> ChannelPeer {
    let (peer, ack) = connect_with(broker, Connect::new(client_id)).await;
    assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted);
    peer
}

pub async fn subscribe(peer: &mut ChannelPeer, packet_id: u16, filters: &[(&str, QoS)]) -> Vec<SubscribeReturnCode> {
    let topic_filters = filters.iter().map(|(tf, qos)| (TopicFilter::from(*tf), *qos)).collect();
    peer.send(Packet::Subscribe { packet_id: pid(packet_id), topic_filters }).unwrap();
    match recv(peer).await {
        Packet::SubscribeAck { packet_id: id, status } => {
            assert_eq!(id, pid(packet_id));
            status
        }
        p => panic!("expected SUBACK, got {:?}", p),
    }
}

/// PINGREQ round trip, every packet sent before it has been handled once this returns.
pub async fn sync(peer: &mut ChannelPeer) -> Vec<Packet> {
    peer.send(Packet::PingRequest).unwrap();
    let mut others = Vec::new();
    loop {
        match recv(peer).await {
            Packet::PingResponse => return others,
            p => others.push(p),
        }
    }
}

pub fn publish(topic: &str, payload: &'static str, qos: QoS, packet_id: u16) -> Publish {
    Publish::new(topic, payload, qos).packet_id(packet_id)
}

/// Wait until `f` holds, polling.
pub async fn eventually<F: Fn() -> bool>(f: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached within {:?}", WAIT);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Event listener keeping a readable trace of everything it saw.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn has(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl EventListener for Recorder {
    async fn on_ready(&self) {
        self.push("ready".into());
    }

    async fn on_closed(&self) {
        self.push("closed".into());
    }

    async fn on_client_connected(&self, client: &ClientInfo) {
        self.push(format!("connected:{}", client.client_id));
    }

    async fn on_client_disconnected(&self, client: &ClientInfo, reason: &Reason) {
        self.push(format!("disconnected:{}:{}", client.client_id, reason));
    }

    async fn on_client_error(&self, client: &ClientInfo, _err: &Error) {
        self.push(format!("error:{}", client.client_id));
    }

    async fn on_published(&self, publish: &Publish, _from: Option<&ClientInfo>) {
        self.push(format!("published:{}", publish.topic));
    }

    async fn on_delivered(&self, client: &ClientInfo, publish: &Publish) {
        self.push(format!("delivered:{}:{}", client.client_id, publish.topic));
    }

    async fn on_subscribed(&self, client: &ClientInfo, topic_filter: &TopicFilter, qos: QoS) {
        self.push(format!("subscribed:{}:{}:{}", client.client_id, topic_filter, qos.value()));
    }

    async fn on_unsubscribed(&self, client: &ClientInfo, topic_filter: &TopicFilter) {
        self.push(format!("unsubscribed:{}:{}", client.client_id, topic_filter));
    }

    async fn on_pingreq(&self, client: &ClientInfo) {
        self.push(format!("pingreq:{}", client.client_id));
    }
}
