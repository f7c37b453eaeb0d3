use std::sync::Arc;

use async_trait::async_trait;

use mqttd_conf::{Persistence as PersistenceSettings, PersistenceKind};

use crate::types::{ClientId, Publish, QoS, TopicFilter};
use crate::{MqttError, Result};

pub mod memory;

pub use memory::MemoryPersistence;

pub type SubscriptionList = Vec<(TopicFilter, QoS)>;

/// Storage of session state and retained messages that outlives a connection.
#[async_trait]
pub trait Persistence: Sync + Send {
    /// Save the subscriptions of a client, QoS 0 grants and clean sessions are not kept.
    async fn store_subscriptions(
        &self,
        client_id: &ClientId,
        clean_session: bool,
        subscriptions: &[(TopicFilter, QoS)],
    ) -> Result<()>;

    /// `None` when nothing is stored for the client.
    async fn lookup_subscriptions(&self, client_id: &ClientId) -> Result<Option<SubscriptionList>>;

    async fn store_offline_packet(&self, client_id: &ClientId, publish: Publish) -> Result<()>;

    /// Take every queued packet of the client in enqueue order, removing them.
    async fn stream_offline_packets(&self, client_id: &ClientId) -> Result<Vec<Publish>>;

    /// Save a retained message, an empty payload removes it.
    async fn store_retained(&self, publish: &Publish) -> Result<()>;

    /// Every stored retained message, `$` topics included.
    async fn load_retained(&self) -> Result<Vec<Publish>>;

    /// Forget subscriptions and queued packets of the client.
    async fn clean(&self, client_id: &ClientId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Build the backend selected by `persistence.kind`.
pub fn create(cfg: &PersistenceSettings) -> Result<Arc<dyn Persistence>> {
    match cfg.kind {
        PersistenceKind::Memory => Ok(Arc::new(MemoryPersistence::new(cfg.subscriptions_ttl, cfg.packets_ttl))),
        kind @ (PersistenceKind::Redis | PersistenceKind::Mongo) => {
            Err(MqttError::PersistenceUnavailable(format!(
                "{:?} backend is not built in, url: {:?}",
                kind, cfg.url
            ))
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_backends() {
        let mut cfg = PersistenceSettings::default();
        assert!(create(&cfg).is_ok());

        cfg.kind = PersistenceKind::Redis;
        cfg.url = Some("redis://127.0.0.1:6379".into());
        let err = create(&cfg).err().unwrap();
        assert!(matches!(err.downcast_ref::<MqttError>(), Some(MqttError::PersistenceUnavailable(_))));

        cfg.kind = PersistenceKind::Mongo;
        assert!(create(&cfg).is_err());
    }
}
