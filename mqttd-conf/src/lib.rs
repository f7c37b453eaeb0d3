#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::de::{self, Deserializer};
use serde::Deserialize;

use mqttd_utils::deserialize_duration;

pub use self::logging::{Level, Log, To};

pub mod logger;
pub mod logging;

pub type Result<T> = anyhow::Result<T>;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: Mqtt,
    #[serde(default)]
    pub persistence: Persistence,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Settings {
    /// Load settings from `/etc/mqttd/mqttd.toml`, `./mqttd.toml`, the optional `cfg_name`
    /// file and `MQTTD__*` environment variables, later sources overriding earlier ones.
    pub fn new(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/mqttd/mqttd").required(false))
            .add_source(File::with_name("mqttd").required(false));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("mqttd").separator("__").try_parsing(true),
        );

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("node.id is {:?}", self.node.id);
        log::info!("mqtt.max_inflight_messages is {}", self.mqtt.max_inflight_messages);
        log::info!("mqtt.on_qos2_publish is {:?}", self.mqtt.on_qos2_publish);
        log::info!("persistence is {:?}", self.persistence);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct Node {
    //Broker id used in $SYS topics, generated when empty.
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Mqtt::host_default")]
    pub host: String,
    #[serde(default = "Mqtt::port_default")]
    pub port: u16,
    //Connections allowed at the same time, further CONNECTs are refused.
    #[serde(default = "Mqtt::max_connections_default")]
    pub max_connections: usize,
    //Time allowed between transport accept and the CONNECT packet.
    #[serde(default = "Mqtt::connect_timeout_default", deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(default = "Mqtt::max_clientid_len_default")]
    pub max_clientid_len: usize,
    //Keepalive grace factor, the connection is closed after keepalive * backoff.
    #[serde(default = "Mqtt::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    #[serde(default = "Mqtt::max_inflight_messages_default")]
    pub max_inflight_messages: usize,
    #[serde(default = "Mqtt::bool_true")]
    pub publish_new_client: bool,
    #[serde(default = "Mqtt::bool_true")]
    pub publish_client_disconnect: bool,
    #[serde(default = "Mqtt::bool_true")]
    pub publish_subscriptions: bool,
    #[serde(default)]
    pub stats: bool,
    #[serde(default = "Mqtt::stats_interval_default", deserialize_with = "deserialize_duration")]
    pub stats_interval: Duration,
    #[serde(default)]
    pub on_qos2_publish: OnQoS2Publish,
}

impl Default for Mqtt {
    #[inline]
    fn default() -> Self {
        Self {
            host: Self::host_default(),
            port: Self::port_default(),
            max_connections: Self::max_connections_default(),
            connect_timeout: Self::connect_timeout_default(),
            max_clientid_len: Self::max_clientid_len_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            max_inflight_messages: Self::max_inflight_messages_default(),
            publish_new_client: true,
            publish_client_disconnect: true,
            publish_subscriptions: true,
            stats: false,
            stats_interval: Self::stats_interval_default(),
            on_qos2_publish: OnQoS2Publish::default(),
        }
    }
}

impl Mqtt {
    fn host_default() -> String {
        "0.0.0.0".into()
    }
    fn port_default() -> u16 {
        1883
    }
    fn max_connections_default() -> usize {
        10_000_000
    }
    fn connect_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn max_clientid_len_default() -> usize {
        65535
    }
    fn keepalive_backoff_default() -> f32 {
        1.5
    }
    fn max_inflight_messages_default() -> usize {
        1024
    }
    fn stats_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn bool_true() -> bool {
        true
    }
}

/// What to do with a QoS 2 PUBLISH coming from a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnQoS2Publish {
    /// Forward it, but never acknowledge.
    #[default]
    Ignore,
    /// Forward it as QoS 1 and answer with PUBACK.
    DropToQoS1,
    /// Close the connection without forwarding.
    Disconnect,
}

impl<'de> Deserialize<'de> for OnQoS2Publish {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        match v.to_ascii_lowercase().replace('_', "").as_str() {
            "ignore" => Ok(OnQoS2Publish::Ignore),
            "droptoqos1" => Ok(OnQoS2Publish::DropToQoS1),
            "disconnect" => Ok(OnQoS2Publish::Disconnect),
            _ => Err(de::Error::unknown_variant(&v, &["ignore", "drop_to_qos1", "disconnect"])),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistenceKind {
    #[default]
    Memory,
    Redis,
    Mongo,
}

impl<'de> Deserialize<'de> for PersistenceKind {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        match v.to_ascii_lowercase().as_str() {
            "memory" => Ok(PersistenceKind::Memory),
            "redis" => Ok(PersistenceKind::Redis),
            "mongo" | "mongodb" => Ok(PersistenceKind::Mongo),
            _ => Err(de::Error::unknown_variant(&v, &["memory", "redis", "mongo"])),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Persistence {
    #[serde(default)]
    pub kind: PersistenceKind,
    //Connection url of an external backend.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "Persistence::ttl_default", deserialize_with = "deserialize_duration")]
    pub subscriptions_ttl: Duration,
    #[serde(default = "Persistence::ttl_default", deserialize_with = "deserialize_duration")]
    pub packets_ttl: Duration,
}

impl Default for Persistence {
    #[inline]
    fn default() -> Self {
        Self {
            kind: PersistenceKind::default(),
            url: None,
            subscriptions_ttl: Self::ttl_default(),
            packets_ttl: Self::ttl_default(),
        }
    }
}

impl Persistence {
    fn ttl_default() -> Duration {
        Duration::from_secs(60 * 60)
    }
}
