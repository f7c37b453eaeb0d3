#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqttError {
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("too many connections, limit is {0}")]
    TooManyConnections(usize),
    #[error("persistence unavailable, {0}")]
    PersistenceUnavailable(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("invalid topic, {0}")]
    InvalidTopic(String),
    #[error("no packet_id available")]
    PacketIdExhausted,
    #[error("in-flight window full, {0} messages unacknowledged")]
    InflightWindowFull(usize),
    #[error("broker is closed")]
    BrokerClosed,
}

impl From<crate::topic::TopicError> for MqttError {
    fn from(e: crate::topic::TopicError) -> Self {
        MqttError::InvalidTopic(e.to_string())
    }
}
