//! Decoded MQTT v3.1 / v3.1.1 control packets.
//!
//! Byte level encoding is left to whatever sits behind a [`Transport`](crate::transport::Transport),
//! the broker only ever sees these values.

use std::num::NonZeroU16;

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, LastWill, Password, Protocol, Publish, QoS, TopicFilter, UserName};

/// Connect Return Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConnectAckReason {
    /// Connection accepted
    ConnectionAccepted = 0,
    /// Connection Refused, unacceptable protocol version
    UnacceptableProtocolVersion = 1,
    /// Connection Refused, identifier rejected
    IdentifierRejected = 2,
    /// Connection Refused, Server unavailable
    ServiceUnavailable = 3,
    /// Connection Refused, bad user name or password
    BadUserNameOrPassword = 4,
    /// Connection Refused, not authorized
    NotAuthorized = 5,
}

impl From<ConnectAckReason> for u8 {
    fn from(v: ConnectAckReason) -> Self {
        v as u8
    }
}

impl ConnectAckReason {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => {
                "Connection Refused, unacceptable protocol version"
            }
            ConnectAckReason::IdentifierRejected => "Connection Refused, identifier rejected",
            ConnectAckReason::ServiceUnavailable => "Connection Refused, Server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "Connection Refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "Connection Refused, not authorized",
        }
    }
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
/// Connect packet content
pub struct Connect {
    /// mqtt protocol version
    pub protocol: Protocol,
    /// the handling of the Session state.
    pub clean_session: bool,
    /// a time interval measured in seconds.
    pub keep_alive: u16,
    /// Will Message be stored on the Server and associated with the Network Connection.
    pub last_will: Option<LastWill>,
    /// identifies the Client to the Server.
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub password: Option<Password>,
}

impl Connect {
    pub fn new<T>(client_id: T) -> Self
    where
        ClientId: From<T>,
    {
        Self { client_id: client_id.into(), clean_session: true, ..Default::default() }
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, keep_alive: u16) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn last_will(mut self, last_will: LastWill) -> Self {
        self.last_will = Some(last_will);
        self
    }

    pub fn credentials<U, P>(mut self, username: U, password: P) -> Self
    where
        UserName: From<U>,
        Password: From<P>,
    {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
/// ConnectAck message
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    /// whether the Server already holds Session state for this Client.
    pub session_present: bool,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
/// Subscribe Return Code
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos.value(),
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// MQTT Control Packets
pub enum Packet {
    /// Client request to connect to Server
    Connect(Box<Connect>),

    /// Connect acknowledgment
    ConnectAck(ConnectAck),

    /// Publish message
    Publish(Publish),

    /// Publish acknowledgment
    PublishAck { packet_id: NonZeroU16 },
    /// Publish received (assured delivery part 1)
    PublishReceived { packet_id: NonZeroU16 },
    /// Publish release (assured delivery part 2)
    PublishRelease { packet_id: NonZeroU16 },
    /// Publish complete (assured delivery part 3)
    PublishComplete { packet_id: NonZeroU16 },

    /// Client subscribe request
    Subscribe { packet_id: NonZeroU16, topic_filters: Vec<(TopicFilter, QoS)> },
    /// Subscribe acknowledgment, one status per requested filter in request order
    SubscribeAck { packet_id: NonZeroU16, status: Vec<SubscribeReturnCode> },

    /// Unsubscribe request
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<TopicFilter> },
    /// Unsubscribe acknowledgment
    UnsubscribeAck { packet_id: NonZeroU16 },

    /// PING request
    PingRequest,
    /// PING response
    PingResponse,
    /// Client is disconnecting
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnectAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PublishAck { .. } => "PUBACK",
            Packet::PublishReceived { .. } => "PUBREC",
            Packet::PublishRelease { .. } => "PUBREL",
            Packet::PublishComplete { .. } => "PUBCOMP",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubscribeAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubscribeAck { .. } => "UNSUBACK",
            Packet::PingRequest => "PINGREQ",
            Packet::PingResponse => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}
