//! Client sessions
//!
//! The [`SessionStore`] keeps one entry per known client id: its subscriptions, whether the
//! session is clean, and the handle of the connection currently serving it. State that must
//! outlive a process is written through the configured [`Persistence`].
//!
//! The outbound in-flight window is not shared, it lives in the [`Session`] owned by the
//! connection task.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::inflight::{OutInflight, OutInflightMessage};
use crate::persistence::{Persistence, SubscriptionList};
use crate::router::Router;
use crate::types::{
    ClientId, ClientInfoRef, ConnId, DashMap, HashMap, PacketId, Publish, QoS, SessionPresent, Subscriber,
    TopicFilter, Tx,
};
use crate::Result;

/// Per connection view of a session.
pub struct Session {
    pub client_id: ClientId,
    pub clean_session: bool,
    inflight: OutInflight,
}

impl Session {
    #[inline]
    pub fn new(client_id: ClientId, clean_session: bool, max_inflight: usize) -> Self {
        Self { client_id, clean_session, inflight: OutInflight::new(max_inflight) }
    }

    /// Assign a packet id to an outbound QoS 1 message, fails when the window is full.
    #[inline]
    pub fn track_inflight(&mut self, publish: Publish) -> Result<Publish> {
        self.inflight.track(publish)
    }

    #[inline]
    pub fn acknowledge_inflight(&mut self, packet_id: PacketId) -> Option<OutInflightMessage> {
        self.inflight.acknowledge(packet_id)
    }

    #[inline]
    pub fn inflight(&mut self) -> &mut OutInflight {
        &mut self.inflight
    }
}

/// Where messages for a client go right now.
pub enum Route {
    Online(ClientInfoRef, Tx),
    Offline(Option<ClientInfoRef>),
    Unknown,
}

struct Entry {
    clean_session: bool,
    subscriptions: HashMap<TopicFilter, QoS>,
    online: Option<(ConnId, Tx)>,
    info: Option<ClientInfoRef>,
}

impl Entry {
    fn new(clean_session: bool) -> Self {
        Self { clean_session, subscriptions: HashMap::default(), online: None, info: None }
    }

    fn subscription_list(&self) -> SubscriptionList {
        self.subscriptions.iter().map(|(tf, qos)| (tf.clone(), *qos)).collect()
    }
}

pub struct SessionStore {
    entries: DashMap<ClientId, Entry>,
    lockers: DashMap<ClientId, Arc<Mutex<()>>>,
    router: Arc<Router>,
    persistence: Arc<dyn Persistence>,
}

impl SessionStore {
    pub fn new(router: Arc<Router>, persistence: Arc<dyn Persistence>) -> Self {
        Self { entries: DashMap::default(), lockers: DashMap::default(), router, persistence }
    }

    /// Async lock serializing CONNECTs that carry the same client id.
    #[inline]
    pub fn locker(&self, client_id: &ClientId) -> Arc<Mutex<()>> {
        self.lockers.entry(client_id.clone()).or_default().value().clone()
    }

    /// Prepare the session of a connecting client.
    ///
    /// A clean session drops whatever was known about the client. Otherwise subscriptions
    /// kept in memory and in persistence are merged and routed again.
    pub async fn create_or_resume(
        &self,
        client_id: &ClientId,
        clean_session: bool,
        max_inflight: usize,
    ) -> Result<(Session, SessionPresent)> {
        if clean_session {
            if let Some((_, prior)) = self.entries.remove(client_id) {
                self.unroute(client_id, prior.subscriptions.keys());
            }
            self.persistence.clean(client_id).await?;
            self.entries.insert(client_id.clone(), Entry::new(true));
            return Ok((Session::new(client_id.clone(), true, max_inflight), false));
        }

        //the entry stays in place across the lookup, so messages routed meanwhile are queued
        //offline and redelivered once the client is registered
        let (mut session_present, stale) = {
            let mut fresh = false;
            let mut entry = self.entries.entry(client_id.clone()).or_insert_with(|| {
                fresh = true;
                Entry::new(false)
            });
            if entry.clean_session {
                entry.clean_session = false;
                entry.info = None;
                (false, std::mem::take(&mut entry.subscriptions))
            } else {
                (!fresh, HashMap::default())
            }
        };
        self.unroute(client_id, stale.keys());

        let stored = match self.persistence.lookup_subscriptions(client_id).await {
            Ok(stored) => stored,
            Err(e) => {
                if !session_present {
                    self.entries
                        .remove_if(client_id, |_, entry| entry.online.is_none() && entry.subscriptions.is_empty());
                }
                return Err(e);
            }
        };

        let subs = {
            let mut entry = self.entries.entry(client_id.clone()).or_insert_with(|| Entry::new(false));
            if let Some(stored) = stored {
                session_present = true;
                for (tf, qos) in stored {
                    entry.subscriptions.entry(tf).or_insert(qos);
                }
            }
            entry.subscription_list()
        };
        for (tf, qos) in subs.iter() {
            if let Err(e) = self.router.subscribe(tf, Subscriber::Client(client_id.clone()), *qos) {
                log::warn!("{:?} restore subscription {:?} error, {:?}", client_id, tf, e);
            }
        }
        log::debug!(
            "{:?} resume session, session_present: {}, subscriptions: {}",
            client_id,
            session_present,
            subs.len()
        );
        Ok((Session::new(client_id.clone(), false, max_inflight), session_present))
    }

    /// Bind the session to the connection `conn_id`.
    #[inline]
    pub fn register(&self, info: ClientInfoRef, conn_id: ConnId, tx: Tx) {
        let mut entry = self.entries.entry(info.client_id.clone()).or_insert_with(|| Entry::new(info.clean_session));
        entry.online = Some((conn_id, tx));
        entry.info = Some(info);
    }

    /// Detach the connection `conn_id`, a clean session is forgotten.
    ///
    /// Returns false when another connection already took the session over.
    pub async fn unregister(&self, client_id: &ClientId, conn_id: ConnId) -> Result<bool> {
        let (clean_session, subs) = {
            let mut entry = match self.entries.get_mut(client_id) {
                Some(entry) => entry,
                None => return Ok(false),
            };
            if !matches!(entry.online, Some((id, _)) if id == conn_id) {
                return Ok(false);
            }
            entry.online = None;
            (entry.clean_session, entry.subscription_list())
        };

        if clean_session {
            if let Some((_, prior)) = self.entries.remove(client_id) {
                self.unroute(client_id, prior.subscriptions.keys());
            }
            if let Some(locker) = self.lockers.get(client_id).map(|l| l.value().clone()) {
                //only the map and this clone hold it
                if Arc::strong_count(&locker) <= 2 {
                    self.lockers.remove(client_id);
                }
            }
        } else {
            self.persistence.store_subscriptions(client_id, false, &subs).await?;
        }
        Ok(true)
    }

    /// Add or replace one subscription, routing it and persisting a non-clean session.
    pub async fn persist_subscription(&self, client_id: &ClientId, topic_filter: &TopicFilter, qos: QoS) -> Result<Option<QoS>> {
        let prev = self.router.subscribe(topic_filter, Subscriber::Client(client_id.clone()), qos)?;
        let persist = match self.entries.get_mut(client_id) {
            Some(mut entry) => {
                entry.subscriptions.insert(topic_filter.clone(), qos);
                (!entry.clean_session).then(|| entry.subscription_list())
            }
            None => None,
        };
        if let Some(subs) = persist {
            self.persistence.store_subscriptions(client_id, false, &subs).await?;
        }
        Ok(prev)
    }

    /// Returns false when the client was not subscribed to `topic_filter`.
    pub async fn remove_subscription(&self, client_id: &ClientId, topic_filter: &TopicFilter) -> Result<bool> {
        let removed = self.router.unsubscribe(topic_filter, &Subscriber::Client(client_id.clone()))?;
        let persist = match self.entries.get_mut(client_id) {
            Some(mut entry) => {
                entry.subscriptions.remove(topic_filter);
                (!entry.clean_session && removed).then(|| entry.subscription_list())
            }
            None => None,
        };
        if let Some(subs) = persist {
            self.persistence.store_subscriptions(client_id, false, &subs).await?;
        }
        Ok(removed)
    }

    #[inline]
    pub fn subscriptions(&self, client_id: &ClientId) -> SubscriptionList {
        self.entries.get(client_id).map(|e| e.subscription_list()).unwrap_or_default()
    }

    /// Queue a message for an offline client, QoS 0 messages are dropped.
    #[inline]
    pub async fn enqueue_offline(&self, client_id: &ClientId, publish: Publish) -> Result<()> {
        if publish.qos == QoS::AtMostOnce {
            log::debug!("{:?} drop offline QoS 0 message, topic: {:?}", client_id, publish.topic);
            return Ok(());
        }
        self.persistence.store_offline_packet(client_id, publish).await
    }

    /// Take every queued message of the client in enqueue order.
    #[inline]
    pub async fn drain_offline(&self, client_id: &ClientId) -> Result<Vec<Publish>> {
        self.persistence.stream_offline_packets(client_id).await
    }

    #[inline]
    pub fn route(&self, client_id: &ClientId) -> Route {
        match self.entries.get(client_id) {
            Some(entry) => match (&entry.online, &entry.info) {
                (Some((_, tx)), Some(info)) => Route::Online(info.clone(), tx.clone()),
                _ if entry.clean_session => Route::Unknown,
                _ => Route::Offline(entry.info.clone()),
            },
            None => Route::Unknown,
        }
    }

    /// Senders of every connected client.
    #[inline]
    pub fn online(&self) -> Vec<(ClientId, Tx)> {
        self.entries
            .iter()
            .filter_map(|e| e.online.as_ref().map(|(_, tx)| (e.key().clone(), tx.clone())))
            .collect()
    }

    #[inline]
    pub fn online_tx(&self, client_id: &ClientId) -> Option<Tx> {
        self.entries.get(client_id).and_then(|e| e.online.as_ref().map(|(_, tx)| tx.clone()))
    }

    /// Number of known sessions, online or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unroute<'a>(&self, client_id: &ClientId, topic_filters: impl Iterator<Item = &'a TopicFilter>) {
        let subscriber = Subscriber::Client(client_id.clone());
        for tf in topic_filters {
            if let Err(e) = self.router.unsubscribe(tf, &subscriber) {
                log::warn!("{:?} unsubscribe {:?} error, {:?}", client_id, tf, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::types::{ClientInfo, Protocol};

    fn store() -> (SessionStore, Arc<Router>) {
        let router = Arc::new(Router::new());
        let persistence = Arc::new(MemoryPersistence::new(Duration::ZERO, Duration::ZERO));
        (SessionStore::new(router.clone(), persistence), router)
    }

    fn info(id: &str, clean_session: bool) -> ClientInfoRef {
        Arc::new(ClientInfo {
            client_id: id.into(),
            username: None,
            remote_addr: None,
            protocol: Protocol::default(),
            clean_session,
            keep_alive: 0,
            connected_at: 0,
        })
    }

    #[tokio::test]
    async fn resume_non_clean_session() {
        let (sessions, router) = store();
        let cid = ClientId::from("c1");

        let (_s, present) = sessions.create_or_resume(&cid, false, 8).await.unwrap();
        assert!(!present);
        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.register(info("c1", false), 1, tx);
        sessions.persist_subscription(&cid, &"a/b".into(), QoS::AtLeastOnce).await.unwrap();
        assert!(sessions.online_tx(&cid).is_some());

        assert!(!sessions.unregister(&cid, 2).await.unwrap());
        assert!(sessions.unregister(&cid, 1).await.unwrap());
        assert!(matches!(sessions.route(&cid), Route::Offline(Some(_))));
        assert_eq!(router.match_subscribers("a/b").unwrap().len(), 1);

        sessions.enqueue_offline(&cid, Publish::new("a/b", "1", QoS::AtLeastOnce)).await.unwrap();
        sessions.enqueue_offline(&cid, Publish::new("a/b", "0", QoS::AtMostOnce)).await.unwrap();
        sessions.enqueue_offline(&cid, Publish::new("a/b", "2", QoS::AtLeastOnce)).await.unwrap();

        let (_s, present) = sessions.create_or_resume(&cid, false, 8).await.unwrap();
        assert!(present);
        assert_eq!(sessions.subscriptions(&cid), vec![(TopicFilter::from("a/b"), QoS::AtLeastOnce)]);
        let offline = sessions.drain_offline(&cid).await.unwrap();
        let payloads = offline.iter().map(|p| p.payload.clone()).collect::<Vec<_>>();
        assert_eq!(payloads, vec![bytes::Bytes::from("1"), bytes::Bytes::from("2")]);
        assert!(sessions.drain_offline(&cid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clean_session_discards_state() {
        let (sessions, router) = store();
        let cid = ClientId::from("c1");
        sessions.create_or_resume(&cid, false, 8).await.unwrap();
        sessions.persist_subscription(&cid, &"a/+".into(), QoS::AtLeastOnce).await.unwrap();
        sessions.enqueue_offline(&cid, Publish::new("a/b", "1", QoS::AtLeastOnce)).await.unwrap();

        let (session, present) = sessions.create_or_resume(&cid, true, 8).await.unwrap();
        assert!(!present);
        assert!(session.clean_session);
        assert!(router.match_subscribers("a/b").unwrap().is_empty());
        assert!(sessions.drain_offline(&cid).await.unwrap().is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        sessions.register(info("c1", true), 7, tx);
        sessions.persist_subscription(&cid, &"x".into(), QoS::AtMostOnce).await.unwrap();
        assert!(sessions.unregister(&cid, 7).await.unwrap());
        assert!(matches!(sessions.route(&cid), Route::Unknown));
        assert!(router.match_subscribers("x").unwrap().is_empty());
        assert!(sessions.is_empty());

        let (_s, present) = sessions.create_or_resume(&cid, false, 8).await.unwrap();
        assert!(!present);
    }

    #[tokio::test]
    async fn inflight_window() {
        let mut session = Session::new("c1".into(), false, 1);
        let p = session.track_inflight(Publish::new("t", "1", QoS::AtLeastOnce)).unwrap();
        assert!(session.track_inflight(Publish::new("t", "2", QoS::AtLeastOnce)).is_err());
        let id = p.packet_id.map(|id| id.get()).unwrap();
        assert!(session.acknowledge_inflight(id).is_some());
        assert!(session.acknowledge_inflight(id).is_none());
        assert!(session.inflight().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe() {
        let (sessions, router) = store();
        let cid = ClientId::from("c1");
        sessions.create_or_resume(&cid, false, 8).await.unwrap();
        assert_eq!(sessions.persist_subscription(&cid, &"a".into(), QoS::AtLeastOnce).await.unwrap(), None);
        assert_eq!(
            sessions.persist_subscription(&cid, &"a".into(), QoS::AtMostOnce).await.unwrap(),
            Some(QoS::AtLeastOnce)
        );
        assert!(sessions.remove_subscription(&cid, &"a".into()).await.unwrap());
        assert!(!sessions.remove_subscription(&cid, &"a".into()).await.unwrap());
        assert!(router.match_subscribers("a").unwrap().is_empty());
        assert!(sessions.subscriptions(&cid).is_empty());
    }
}
