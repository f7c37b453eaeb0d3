use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub use mqttd_utils::{Timestamp, TimestampMillis};

use crate::MqttError;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type Password = Bytes;
pub type PacketId = u16;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type ConnId = u64;
pub type IsOnline = bool;
pub type SessionPresent = bool;

pub type Tx = mpsc::UnboundedSender<Message>;
pub type Rx = mpsc::UnboundedReceiver<Message>;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Protocol(pub u8);

impl Protocol {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Protocol(MQTT_LEVEL_31) => "MQIsdp",
            Protocol(_) => "MQTT",
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_supported(self) -> bool {
        matches!(self.0, MQTT_LEVEL_31 | MQTT_LEVEL_311)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol(MQTT_LEVEL_311)
    }
}

/// Quality of Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery, acknowledged by PUBACK
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        if self.value() < qos.value() {
            *self
        } else {
            qos
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::InvalidProtocol),
        }
    }
}

impl From<QoS> for u8 {
    fn from(v: QoS) -> Self {
        v.value()
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Publish {
    /// this might be re-delivery of an earlier attempt to send the Packet.
    pub dup: bool,
    pub retain: bool,
    /// the level of assurance for delivery of an Application Message.
    pub qos: QoS,
    /// the information channel to which payload data is published.
    pub topic: TopicName,
    /// only present in PUBLISH Packets where the QoS level is 1 or 2.
    pub packet_id: Option<NonZeroU16>,
    /// the Application Message that is being published.
    pub payload: Bytes,
    pub create_time: TimestampMillis,
}

impl Publish {
    #[inline]
    pub fn new<T, P>(topic: T, payload: P, qos: QoS) -> Self
    where
        TopicName: From<T>,
        Bytes: From<P>,
    {
        Self {
            dup: false,
            retain: false,
            qos,
            topic: TopicName::from(topic),
            packet_id: None,
            payload: Bytes::from(payload),
            create_time: mqttd_utils::timestamp_millis(),
        }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = NonZeroU16::new(packet_id);
        self
    }

    #[inline]
    pub fn is_sys(&self) -> bool {
        self.topic.starts_with('$')
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publish")
            .field("packet_id", &self.packet_id)
            .field("topic", &self.topic)
            .field("dup", &self.dup)
            .field("retain", &self.retain)
            .field("qos", &self.qos)
            .field("payload", &self.payload.len())
            .field("create_time", &self.create_time)
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
/// Connection Will
pub struct LastWill {
    /// the QoS level to be used when publishing the Will Message.
    pub qos: QoS,
    /// the Will Message is to be Retained when it is published.
    pub retain: bool,
    /// the Will Topic
    pub topic: TopicName,
    /// the Will payload
    pub message: Bytes,
}

impl From<&LastWill> for Publish {
    fn from(lw: &LastWill) -> Self {
        Publish::new(lw.topic.clone(), lw.message.clone(), lw.qos).retain(lw.retain)
    }
}

/// What hooks and listeners learn about a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub remote_addr: Option<SocketAddr>,
    pub protocol: Protocol,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub connected_at: TimestampMillis,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr {
            Some(addr) => write!(f, "{}@{}", self.client_id, addr),
            None => write!(f, "{}@-", self.client_id),
        }
    }
}

/// Target of a routed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscriber {
    Client(ClientId),
    Local(u64),
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Client(id) => write!(f, "client:{}", id),
            Subscriber::Local(id) => write!(f, "local:{}", id),
        }
    }
}

/// Result of `Authorizer::authorize_publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAuth {
    /// Forward, optionally with a replacement payload.
    Allow(Option<Bytes>),
    /// Acknowledge but do not forward.
    Ignore,
    /// Do not acknowledge, disconnect the publisher.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    DisconnectRequest,
    KeepaliveTimeout,
    RemoteClose,
    NewConnectionRequest,
    InflightWindowFull,
    PublishRefused,
    ProtocolError(ByteString),
    ServerClosed,
}

impl Reason {
    #[inline]
    pub fn is_disconnect_request(&self) -> bool {
        matches!(self, Reason::DisconnectRequest)
    }

    #[inline]
    pub fn is_kicked(&self) -> bool {
        matches!(self, Reason::NewConnectionRequest)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::DisconnectRequest => f.write_str("disconnect request"),
            Reason::KeepaliveTimeout => f.write_str("keepalive timeout"),
            Reason::RemoteClose => f.write_str("close"),
            Reason::NewConnectionRequest => f.write_str("new connection request"),
            Reason::InflightWindowFull => f.write_str("inflight window full"),
            Reason::PublishRefused => f.write_str("publish refused"),
            Reason::ProtocolError(_) => f.write_str("protocol error"),
            Reason::ServerClosed => f.write_str("server closed"),
        }
    }
}

/// Messages sent to a connection task.
#[derive(Debug)]
pub enum Message {
    Forward(Publish),
    Kick(Reason, oneshot::Sender<()>),
}

pub type ClientInfoRef = Arc<ClientInfo>;
