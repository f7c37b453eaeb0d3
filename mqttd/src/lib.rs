//! # Overall Example
//! ```rust,no_run
//!
//! use mqttd::packet::{Connect, Packet};
//! use mqttd::{Broker, ChannelTransport, Result, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!
//!    let broker = Broker::builder().settings(Settings::new(Some("mqttd.toml"))?).build().await?;
//!
//!    let (transport, mut peer) = ChannelTransport::pair();
//!    broker.connect(transport);
//!    peer.send(Connect::new("client-1"))?;
//!    if let Some(Packet::ConnectAck(ack)) = peer.recv().await {
//!        println!("{:?}", ack);
//!    }
//!
//!    broker.close().await?;
//!    Ok(())
//! }
//!
//! ```

#![deny(unsafe_code)] // Enforce memory safety across the entire crate

/// Core Broker Components
pub mod broker; // Broker, builder and dispatcher
mod connection; // Per client connection task
pub mod hook; // Authentication, authorization and event handlers
pub mod keepalive; // Keepalive deadlines
pub mod stats; // Runtime statistics tracking
mod sys; // $SYS notifications

/// Session State
pub mod inflight; // In-flight message tracking
pub mod persistence; // Session and retained message storage backends
pub mod retain; // Retained message handling
pub mod session; // Client session handling

/// Topic Handling
pub mod router; // Message routing core
pub mod topic; // Topic parsing and validation
pub mod trie; // Topic trie structure

/// Protocol Support
pub mod error; // Broker error types
pub mod packet; // Decoded MQTT v3.1/v3.1.1 packets
pub mod transport; // Packet transport abstraction
pub mod types; // Common data types

/// Re-exports
pub use broker::{Broker, BrokerBuilder, LocalHandler, LocalSubscription};
pub use error::MqttError;
pub use mqttd_conf::Settings;
pub use mqttd_utils as utils; // Common utilities
pub use transport::{ChannelPeer, ChannelTransport, Transport};
pub use types::{ClientInfo, LastWill, Publish, PublishAuth, QoS, Reason};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T>;
