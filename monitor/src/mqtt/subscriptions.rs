use notifs_shared::{InboundMessage, TopicFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// `subscribe` 返回的订阅句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// 回调在管理器任务上执行，不能阻塞
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct TopicEntry {
    filter: TopicFilter,
    callbacks: Vec<(SubscriptionId, MessageCallback)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub topic: String,
    /// 最后一个回调被移除，需要物理退订
    pub topic_emptied: bool,
}

// 主题字符串 -> 有序回调列表；每个主题在每条连接上只有一个物理订阅
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, TopicEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 主题首次登记时返回 true
    pub fn add(&mut self, filter: TopicFilter, id: SubscriptionId, callback: MessageCallback) -> bool {
        let key = filter.as_str().to_string();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.callbacks.push((id, callback));
                false
            }
            None => {
                self.entries.insert(
                    key,
                    TopicEntry {
                        filter,
                        callbacks: vec![(id, callback)],
                    },
                );
                true
            }
        }
    }

    /// 移除主题下的全部回调，返回被移除的句柄
    pub fn remove_topic(&mut self, topic: &str) -> Vec<SubscriptionId> {
        self.entries
            .remove(topic)
            .map(|entry| entry.callbacks.into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Removal> {
        let (topic, entry) = self
            .entries
            .iter_mut()
            .find(|(_, entry)| entry.callbacks.iter().any(|(existing, _)| *existing == id))?;

        entry.callbacks.retain(|(existing, _)| *existing != id);
        let removal = Removal {
            topic: topic.clone(),
            topic_emptied: entry.callbacks.is_empty(),
        };

        if removal.topic_emptied {
            self.entries.remove(&removal.topic);
        }
        Some(removal)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn callback_count(&self, topic: &str) -> usize {
        self.entries.get(topic).map_or(0, |entry| entry.callbacks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 所有模式匹配该主题的回调，按主题再按登记顺序
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a MessageCallback> + 'a {
        self.entries
            .values()
            .filter(move |entry| entry.filter.matches(topic))
            .flat_map(|entry| entry.callbacks.iter().map(|(_, callback)| callback))
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(topic, entry)| (topic, entry.callbacks.len())),
            )
            .finish()
    }
}
