//! Retained message storage
//!
//! Concrete topic names are stored in a trie keyed by topic level, and looked up with a
//! subscription filter:
//!
//! ```text
//! Root
//! ├── iot
//! │   └── b
//! │       ├── x (value=1)
//! │       ├── y (value=2)
//! │       └── z (value=3)
//! └── x
//!     └── y
//!         └── z (value=4)
//! ```
//!
//! At most one message is kept per exact topic, a retained publish with an empty payload
//! removes it.

use bytes::Bytes;
use parking_lot::RwLock;

use mqttd_utils::Counter;

use crate::topic::{Level, Topic};
use crate::types::{HashMap, Publish, QoS, TopicName};
use crate::Result;

pub type RetainTree<V> = Node<V>;

pub struct RetainStore {
    messages: RwLock<RetainTree<Publish>>,
    retaineds: Counter,
}

impl Default for RetainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainStore {
    #[inline]
    pub fn new() -> RetainStore {
        Self { messages: RwLock::new(RetainTree::default()), retaineds: Counter::new() }
    }

    /// Store `payload` as the retained message of `topic`, an empty payload clears it.
    #[inline]
    pub fn set(&self, topic: &TopicName, payload: Bytes, qos: QoS) -> Result<()> {
        if payload.is_empty() {
            self.clear(topic)?;
            return Ok(());
        }
        let t = Topic::parse_name(topic)?;
        let publish = Publish::new(topic.clone(), payload, qos).retain(true);
        let old = self.messages.write().insert(&t, publish);
        if old.is_none() {
            self.retaineds.inc();
        }
        Ok(())
    }

    #[inline]
    pub fn clear(&self, topic: &TopicName) -> Result<bool> {
        let t = Topic::parse_name(topic)?;
        let old = self.messages.write().remove(&t);
        if old.is_some() {
            self.retaineds.dec();
        }
        Ok(old.is_some())
    }

    /// Retained messages whose topic matches `topic_filter`.
    #[inline]
    pub fn matches(&self, topic_filter: &str) -> Result<Vec<Publish>> {
        let filter: Topic = topic_filter.parse()?;
        let retains = self.messages.read().matches(&filter).into_iter().map(|(_, p)| p).collect();
        Ok(retains)
    }

    /// Every retained message, `$` topics included.
    #[inline]
    pub fn all(&self) -> Vec<Publish> {
        let mut out = Vec::new();
        self.messages.read().values(&mut out);
        out
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.retaineds.count()
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.retaineds.max()
    }
}

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: std::fmt::Debug + Clone,
{
    /// Returns the value previously stored under `topic`.
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        let mut path = topic.levels().clone();
        path.reverse();
        self._insert(path, value)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, value: V) -> Option<V> {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.value.replace(value)
        }
    }

    #[inline]
    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        self._remove(topic.levels().as_ref())
    }

    #[inline]
    fn _remove(&mut self, path: &[Level]) -> Option<V> {
        if path.is_empty() {
            self.value.take()
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..]);
                if x.value.is_none() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                None
            }
        }
    }

    /// Walk the whole tree without wildcard rules applied.
    #[inline]
    pub fn values(&self, out: &mut Vec<V>) {
        if let Some(v) = self.value.as_ref() {
            out.push(v.clone());
        }
        for node in self.branches.values() {
            node.values(out);
        }
    }

    #[inline]
    pub fn matches(&self, topic_filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        self._matches(topic_filter.levels(), Vec::new(), &mut out);
        out
    }

    #[inline]
    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut Vec<(Topic, V)>) {
        let add_to_out = |levels: Vec<Level>, v: V, out: &mut Vec<(Topic, V)>| {
            out.push((Topic::from(levels), v));
        };

        if path.is_empty() {
            if let Some(v) = self.value.as_ref() {
                add_to_out(sub_path, v.clone(), out);
            }
            return;
        }

        match path[0] {
            Level::SingleWildcard => {
                for (k, v) in self.branches.iter() {
                    if sub_path.is_empty() && k.is_metadata() {
                        //'$' topics never match a filter starting with a wildcard
                        continue;
                    }
                    let mut sub_path = sub_path.clone();
                    sub_path.push(k.clone());

                    if path.len() > 1 && path[1] == Level::MultiWildcard {
                        //'#' also matches its parent level
                        if let Some(v) = v.value.as_ref() {
                            add_to_out(sub_path.clone(), v.clone(), out);
                        }
                    }
                    v._matches(&path[1..], sub_path, out);
                }
            }
            Level::MultiWildcard => {
                for (k, v) in self.branches.iter() {
                    if sub_path.is_empty() && k.is_metadata() {
                        continue;
                    }
                    let mut sub_path = sub_path.clone();
                    sub_path.push(k.clone());

                    if let Some(val) = v.value.as_ref() {
                        add_to_out(sub_path.clone(), val.clone(), out);
                    }
                    if !v.branches.is_empty() {
                        v._matches(path, sub_path, out);
                    }
                }
            }
            _ => {
                if let Some(r) = self.branches.get(&path[0]) {
                    sub_path.push(path[0].clone());

                    if path.len() > 1 && path[1] == Level::MultiWildcard {
                        if let Some(v) = r.value.as_ref() {
                            add_to_out(sub_path.clone(), v.clone(), out);
                        }
                    }
                    r._matches(&path[1..], sub_path, out);
                }
            }
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
    }
}
