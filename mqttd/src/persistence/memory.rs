use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Persistence, SubscriptionList};
use crate::retain::RetainStore;
use crate::types::{ClientId, DashMap, Publish, QoS, TopicFilter};
use crate::Result;

#[derive(Debug, Clone)]
pub struct TimedValue<V>(V, Option<Instant>);

impl<V> TimedValue<V> {
    #[inline]
    pub fn new(v: V, timeout: Option<Duration>) -> Self {
        TimedValue(v, timeout.map(|t| Instant::now() + t))
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.0
    }

    #[inline]
    pub fn into_value(self) -> V {
        self.0
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.1.map(|e| Instant::now() >= e).unwrap_or(false)
    }
}

/// In-process backend, nothing survives a restart.
pub struct MemoryPersistence {
    subscriptions_ttl: Duration,
    packets_ttl: Duration,
    subscriptions: DashMap<ClientId, TimedValue<SubscriptionList>>,
    packets: DashMap<ClientId, VecDeque<TimedValue<Publish>>>,
    retaineds: RetainStore,
}

impl MemoryPersistence {
    pub fn new(subscriptions_ttl: Duration, packets_ttl: Duration) -> Self {
        Self {
            subscriptions_ttl,
            packets_ttl,
            subscriptions: DashMap::default(),
            packets: DashMap::default(),
            retaineds: RetainStore::new(),
        }
    }

    #[inline]
    fn ttl(d: Duration) -> Option<Duration> {
        if d.is_zero() {
            None
        } else {
            Some(d)
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn store_subscriptions(
        &self,
        client_id: &ClientId,
        clean_session: bool,
        subscriptions: &[(TopicFilter, QoS)],
    ) -> Result<()> {
        if clean_session {
            return Ok(());
        }
        let subs = subscriptions
            .iter()
            .filter(|(_, qos)| *qos > QoS::AtMostOnce)
            .cloned()
            .collect::<SubscriptionList>();
        log::debug!("{:?} store_subscriptions: {:?}", client_id, subs);
        self.subscriptions
            .insert(client_id.clone(), TimedValue::new(subs, Self::ttl(self.subscriptions_ttl)));
        Ok(())
    }

    async fn lookup_subscriptions(&self, client_id: &ClientId) -> Result<Option<SubscriptionList>> {
        let expired = match self.subscriptions.get(client_id) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value().value().clone())),
            Some(_) => true,
        };
        if expired {
            self.subscriptions.remove(client_id);
        }
        Ok(None)
    }

    async fn store_offline_packet(&self, client_id: &ClientId, publish: Publish) -> Result<()> {
        log::debug!("{:?} store_offline_packet: {:?}", client_id, publish);
        self.packets
            .entry(client_id.clone())
            .or_default()
            .push_back(TimedValue::new(publish, Self::ttl(self.packets_ttl)));
        Ok(())
    }

    async fn stream_offline_packets(&self, client_id: &ClientId) -> Result<Vec<Publish>> {
        let packets: Vec<Publish> = self
            .packets
            .remove(client_id)
            .map(|(_, packets)| {
                packets.into_iter().filter(|tv| !tv.is_expired()).map(|tv| tv.into_value()).collect()
            })
            .unwrap_or_default();
        Ok(packets)
    }

    async fn store_retained(&self, publish: &Publish) -> Result<()> {
        self.retaineds.set(&publish.topic, publish.payload.clone(), publish.qos)
    }

    async fn load_retained(&self) -> Result<Vec<Publish>> {
        Ok(self.retaineds.all())
    }

    async fn clean(&self, client_id: &ClientId) -> Result<()> {
        self.subscriptions.remove(client_id);
        self.packets.remove(client_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        log::debug!(
            "memory persistence closed, sessions: {}, offline queues: {}",
            self.subscriptions.len(),
            self.packets.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistence() -> MemoryPersistence {
        MemoryPersistence::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn subscriptions() {
        let p = persistence();
        let cid = ClientId::from("c1");
        assert_eq!(p.lookup_subscriptions(&cid).await.unwrap(), None);

        let subs = vec![(TopicFilter::from("a/b"), QoS::AtLeastOnce), (TopicFilter::from("x"), QoS::AtMostOnce)];
        p.store_subscriptions(&cid, true, &subs).await.unwrap();
        assert_eq!(p.lookup_subscriptions(&cid).await.unwrap(), None);

        p.store_subscriptions(&cid, false, &subs).await.unwrap();
        assert_eq!(
            p.lookup_subscriptions(&cid).await.unwrap(),
            Some(vec![(TopicFilter::from("a/b"), QoS::AtLeastOnce)])
        );

        p.clean(&cid).await.unwrap();
        assert_eq!(p.lookup_subscriptions(&cid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_packets_in_order() {
        let p = persistence();
        let cid = ClientId::from("c1");
        for i in 1..=3u16 {
            p.store_offline_packet(&cid, Publish::new("t", format!("m{}", i), QoS::AtLeastOnce).packet_id(i))
                .await
                .unwrap();
        }

        let packets = p.stream_offline_packets(&cid).await.unwrap();
        let payloads = packets.iter().map(|p| p.payload.clone()).collect::<Vec<_>>();
        assert_eq!(payloads, vec![bytes::Bytes::from("m1"), bytes::Bytes::from("m2"), bytes::Bytes::from("m3")]);
        assert!(p.stream_offline_packets(&cid).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry() {
        let p = MemoryPersistence::new(Duration::from_secs(10), Duration::from_secs(5));
        let cid = ClientId::from("c1");
        p.store_subscriptions(&cid, false, &[(TopicFilter::from("a"), QoS::AtLeastOnce)]).await.unwrap();
        p.store_offline_packet(&cid, Publish::new("a", "old", QoS::AtLeastOnce)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        p.store_offline_packet(&cid, Publish::new("a", "new", QoS::AtLeastOnce)).await.unwrap();
        assert!(p.lookup_subscriptions(&cid).await.unwrap().is_some());
        let packets = p.stream_offline_packets(&cid).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, bytes::Bytes::from("new"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(p.lookup_subscriptions(&cid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retained() {
        let p = persistence();
        p.store_retained(&Publish::new("a/b", "x", QoS::AtLeastOnce).retain(true)).await.unwrap();
        p.store_retained(&Publish::new("a/c", "y", QoS::AtMostOnce).retain(true)).await.unwrap();
        p.store_retained(&Publish::new("$SYS/n1/version", "1", QoS::AtMostOnce).retain(true)).await.unwrap();
        assert_eq!(p.load_retained().await.unwrap().len(), 3);

        p.store_retained(&Publish::new("a/b", "", QoS::AtMostOnce).retain(true)).await.unwrap();
        let mut rest = p.load_retained().await.unwrap().into_iter().map(|p| p.topic.to_string()).collect::<Vec<_>>();
        rest.sort();
        assert_eq!(rest, vec!["$SYS/n1/version".to_string(), "a/c".to_string()]);
    }

    #[tokio::test]
    async fn resumed_subscriptions() {
        let p = MemoryPersistence::new(Duration::ZERO, Duration::ZERO);
        let cid = ClientId::from("c1");
        p.store_subscriptions(&cid, false, &[(TopicFilter::from("a/#"), QoS::ExactlyOnce)]).await.unwrap();
        let subs: SubscriptionList = p.lookup_subscriptions(&cid).await.unwrap().unwrap();
        assert_eq!(subs, vec![(TopicFilter::from("a/#"), QoS::ExactlyOnce)]);
    }
}
