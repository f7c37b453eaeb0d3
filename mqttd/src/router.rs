//! Topic routing and subscription matching
//!
//! Filters live in a [`TopicTree`] guarded by a `parking_lot::RwLock`, while the subscribers
//! of each filter live in a `DashMap` keyed by the filter text. Every mutation of either
//! structure happens under the tree's write lock, so a concurrent `match_subscribers` sees
//! a subscription either completely or not at all.
//!
//! A topic is routed to each subscriber once, at the highest QoS granted by any of that
//! subscriber's matching filters.

use std::str::FromStr;

use parking_lot::RwLock;
use serde_json::json;

use mqttd_utils::Counter;

use crate::topic::Topic;
use crate::trie::{TopicTree, VecToTopic};
use crate::types::{DashMap, HashMap, QoS, Subscriber, TopicFilter};
use crate::Result;

pub type RelationsMap = DashMap<TopicFilter, HashMap<Subscriber, QoS>>;

pub struct Router {
    topics: RwLock<TopicTree<()>>,
    topics_count: Counter,
    relations: RelationsMap,
    relations_count: Counter,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    #[inline]
    pub fn new() -> Router {
        Self {
            topics: RwLock::new(TopicTree::default()),
            topics_count: Counter::new(),
            relations: DashMap::default(),
            relations_count: Counter::new(),
        }
    }

    /// Add or replace the grant of `subscriber` on `topic_filter`, returns the previous QoS.
    #[inline]
    pub fn subscribe(&self, topic_filter: &str, subscriber: Subscriber, qos: QoS) -> Result<Option<QoS>> {
        log::debug!("{} subscribe, topic_filter: {:?}, qos: {:?}", subscriber, topic_filter, qos);
        let topic = Topic::from_str(topic_filter)?;
        let mut topics = self.topics.write();
        topics.insert(&topic, ());
        let old = self
            .relations
            .entry(TopicFilter::from(topic_filter))
            .or_insert_with(|| {
                self.topics_count.inc();
                HashMap::default()
            })
            .insert(subscriber, qos);
        if old.is_none() {
            self.relations_count.inc();
        }
        Ok(old)
    }

    #[inline]
    pub fn unsubscribe(&self, topic_filter: &str, subscriber: &Subscriber) -> Result<bool> {
        log::debug!("{} unsubscribe, topic_filter: {:?}", subscriber, topic_filter);
        let topic = Topic::from_str(topic_filter)?;
        let mut topics = self.topics.write();
        let res = if let Some(mut rels) = self.relations.get_mut(topic_filter) {
            let removed = rels.value_mut().remove(subscriber).is_some();
            if removed {
                self.relations_count.dec();
            }
            Some((rels.is_empty(), removed))
        } else {
            None
        };

        let removed = match res {
            Some((is_empty, removed)) => {
                if is_empty {
                    if self.relations.remove(topic_filter).is_some() {
                        self.topics_count.dec();
                    }
                    topics.remove(&topic, &());
                }
                removed
            }
            None => false,
        };
        Ok(removed)
    }

    /// Subscribers whose filters match `topic`, one entry per subscriber.
    #[inline]
    pub fn match_subscribers(&self, topic: &str) -> Result<Vec<(Subscriber, QoS)>> {
        let topic = Topic::parse_name(topic)?;
        let mut collector: HashMap<Subscriber, QoS> = HashMap::default();
        let topics = self.topics.read();
        for topic_filter in topics.matches(&topic).keys() {
            let topic_filter = topic_filter.to_topic_filter();
            if let Some(rels) = self.relations.get(&topic_filter) {
                for (subscriber, qos) in rels.iter() {
                    collector
                        .entry(subscriber.clone())
                        .and_modify(|q| {
                            if *qos > *q {
                                *q = *qos
                            }
                        })
                        .or_insert(*qos);
                }
            }
        }
        drop(topics);
        Ok(collector.into_iter().collect())
    }

    /// Number of distinct filters
    #[inline]
    pub fn topics(&self) -> Counter {
        self.topics_count.clone()
    }

    /// Number of (filter, subscriber) relations
    #[inline]
    pub fn routes(&self) -> Counter {
        self.relations_count.clone()
    }

    #[inline]
    pub fn list_relations(&self, top: usize) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        for entry in self.relations.iter().take(top) {
            let subs = entry
                .value()
                .iter()
                .map(|(s, qos)| json!({"subscriber": s.to_string(), "qos": qos.value()}))
                .collect::<Vec<_>>();
            out.push(json!({"topic_filter": entry.key().to_string(), "subscribers": subs}));
        }
        out
    }
}
