use std::fmt;
use std::hash::Hash;

use crate::topic::{Level, Topic};
use crate::types::{HashMap, HashSet, TopicFilter};

pub type TopicTree<V> = Node<V>;

/// Trie of topic filters, matched against concrete topic names.
pub struct Node<V> {
    values: HashSet<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { values: HashSet::default(), branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Hash + Eq + Clone + fmt::Debug,
{
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, value: V) -> bool {
        let mut path = topic_filter.levels().clone();
        path.reverse();
        self._insert(path, value)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, value: V) -> bool {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.values.insert(value)
        }
    }

    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, value: &V) -> bool {
        self._remove(topic_filter.levels().as_ref(), value)
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], value: &V) -> bool {
        if path.is_empty() {
            self.values.remove(value)
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..], value);
                if x.values.is_empty() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                false
            }
        }
    }

    /// Filters matching `topic`, with the values stored under each.
    #[inline]
    pub fn matches(&self, topic: &Topic) -> HashMap<Topic, Vec<V>> {
        let mut out = HashMap::default();
        self._matches(topic.levels(), Vec::new(), &mut out);
        out
    }

    #[inline]
    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut HashMap<Topic, Vec<V>>) {
        let add_to_out = |levels: Vec<Level>, v_set: &HashSet<V>, out: &mut HashMap<Topic, Vec<V>>| {
            if !v_set.is_empty() {
                out.entry(Topic::from(levels)).or_default().extend(v_set.iter().cloned());
            }
        };

        if path.is_empty() {
            //'#' also matches its parent level
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                let mut sub_path = sub_path.clone();
                sub_path.push(Level::MultiWildcard);
                add_to_out(sub_path, &n.values, out);
            }
            add_to_out(sub_path, &self.values, out);
        } else {
            //Topic names starting with '$' never match filters starting with a wildcard
            let skip_wildcards = sub_path.is_empty() && path[0].is_metadata();
            if !skip_wildcards {
                if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(Level::MultiWildcard);
                    add_to_out(sub_path, &n.values, out);
                }

                if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                    let mut sub_path = sub_path.clone();
                    sub_path.push(Level::SingleWildcard);
                    n._matches(&path[1..], sub_path, out);
                }
            }

            if let Some(n) = self.branches.get(&path[0]) {
                sub_path.push(path[0].clone());
                n._matches(&path[1..], sub_path, out);
            }
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.values.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }
}

impl<V> fmt::Debug for Node<V>
where
    V: Hash + Eq + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}

pub trait VecToTopic {
    fn to_topic_filter(&self) -> TopicFilter;
}

impl VecToTopic for Topic {
    #[inline]
    fn to_topic_filter(&self) -> TopicFilter {
        TopicFilter::from(self.to_string())
    }
}
