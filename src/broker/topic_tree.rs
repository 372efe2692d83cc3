//! Subscription tree keyed by topic levels
//!
//! Each filter is stored along its path of levels, wildcards included, so a
//! publish only visits the branches that can match: the literal child, the
//! `+` child and the `#` child at every level.

use crate::session::queue::OutboundQueue;
use crate::QoS;
use std::collections::HashMap;

/// One client's subscription stored at a filter node
#[derive(Debug, Clone)]
pub struct TreeSubscriber {
    pub qos: QoS,
    pub queue: OutboundQueue,
}

/// A subscription found by [`TopicTree::matches`]
#[derive(Debug, Clone)]
pub struct SubscriptionMatch {
    pub client_id: String,
    pub filter: String,
    pub qos: QoS,
    pub queue: OutboundQueue,
}

#[derive(Debug, Default)]
struct TreeNode {
    /// Full filter ending at this node, set while it has subscribers
    filter: Option<String>,
    /// Subscribers keyed by client id, so re-subscribing replaces
    subscribers: HashMap<String, TreeSubscriber>,
    children: HashMap<String, TreeNode>,
}

impl TreeNode {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.children.is_empty()
    }

    fn collect(&self, out: &mut Vec<SubscriptionMatch>) {
        let Some(filter) = &self.filter else {
            return;
        };
        out.extend(
            self.subscribers
                .iter()
                .map(|(client_id, subscriber)| SubscriptionMatch {
                    client_id: client_id.clone(),
                    filter: filter.clone(),
                    qos: subscriber.qos,
                    queue: subscriber.queue.clone(),
                }),
        );
    }

    fn collect_matches(&self, levels: &[&str], depth: usize, out: &mut Vec<SubscriptionMatch>) {
        // Wildcards at the first level never match `$` topics
        let wildcards_allowed = !(depth == 0 && levels.first().is_some_and(|l| l.starts_with('$')));

        // "a/#" matches "a" itself as well as everything below it
        if wildcards_allowed {
            if let Some(multi) = self.children.get("#") {
                multi.collect(out);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            self.collect(out);
            return;
        };

        if let Some(child) = self.children.get(*level) {
            child.collect_matches(rest, depth + 1, out);
        }
        if wildcards_allowed {
            if let Some(single) = self.children.get("+") {
                single.collect_matches(rest, depth + 1, out);
            }
        }
    }

    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        match levels.split_first() {
            None => {
                let removed = self.subscribers.remove(client_id).is_some();
                if self.subscribers.is_empty() {
                    self.filter = None;
                }
                removed
            }
            Some((level, rest)) => {
                let Some(child) = self.children.get_mut(*level) else {
                    return false;
                };
                let removed = child.remove(rest, client_id);
                if child.is_empty() {
                    self.children.remove(*level);
                }
                removed
            }
        }
    }

    fn remove_client(&mut self, client_id: &str, removed: &mut Vec<String>) {
        if self.subscribers.remove(client_id).is_some() {
            if let Some(filter) = &self.filter {
                removed.push(filter.clone());
            }
            if self.subscribers.is_empty() {
                self.filter = None;
            }
        }
        self.children.retain(|_, child| {
            child.remove_client(client_id, removed);
            !child.is_empty()
        });
    }

    fn count(&self) -> usize {
        self.subscribers.len() + self.children.values().map(TreeNode::count).sum::<usize>()
    }
}

/// Topic filter tree
#[derive(Debug, Default)]
pub struct TopicTree {
    root: TreeNode,
}

impl TopicTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces `client_id`'s subscription to `filter`
    ///
    /// Returns `true` when the subscription did not exist before.
    pub fn insert(&mut self, client_id: &str, filter: &str, subscriber: TreeSubscriber) -> bool {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.filter = Some(filter.to_string());
        node.subscribers
            .insert(client_id.to_string(), subscriber)
            .is_none()
    }

    /// The subscription `client_id` holds on exactly `filter`
    #[must_use]
    pub fn get(&self, client_id: &str, filter: &str) -> Option<&TreeSubscriber> {
        let mut node = &self.root;
        for level in filter.split('/') {
            node = node.children.get(level)?;
        }
        node.subscribers.get(client_id)
    }

    /// Removes `client_id`'s subscription to `filter`
    pub fn remove(&mut self, client_id: &str, filter: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.remove(&levels, client_id)
    }

    /// Removes every subscription held by `client_id`, returning their filters
    pub fn remove_client(&mut self, client_id: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.root.remove_client(client_id, &mut removed);
        removed
    }

    /// All subscriptions whose filter matches `topic`
    ///
    /// A client with several overlapping filters appears once per filter.
    #[must_use]
    pub fn matches(&self, topic: &str) -> Vec<SubscriptionMatch> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        self.root.collect_matches(&levels, 0, &mut out);
        out
    }

    /// Number of (client, filter) subscriptions stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.root.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
