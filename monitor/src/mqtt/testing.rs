//! 测试用的内存连接工厂，代替真实网络

use async_trait::async_trait;
use notifs_shared::{BrokerConfig, BrokerRole, ConnectError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::link::{BrokerLink, Connector, LinkError, LinkEventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Reject,
    /// 永不返回，交给连接超时处理
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, Vec<u8>),
    Close,
}

pub type CallLog = Arc<Mutex<Vec<LinkCall>>>;

pub struct ScriptedLink {
    calls: CallLog,
}

impl ScriptedLink {
    pub fn new(calls: CallLog) -> Self {
        Self { calls }
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BrokerLink for ScriptedLink {
    fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.record(LinkCall::Subscribe(topic.to_string()));
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.record(LinkCall::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.record(LinkCall::Publish(topic.to_string(), payload));
        Ok(())
    }

    fn close(&self) {
        self.record(LinkCall::Close);
    }
}

#[derive(Default)]
struct Inner {
    defaults: HashMap<BrokerRole, Outcome>,
    scripted: HashMap<BrokerRole, VecDeque<Outcome>>,
    attempts: HashMap<BrokerRole, usize>,
    sinks: HashMap<BrokerRole, LinkEventSink>,
    links: HashMap<BrokerRole, Vec<CallLog>>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未单独排队时使用的结果（默认 Accept）
    pub fn set_default(&self, role: BrokerRole, outcome: Outcome) {
        self.inner.lock().unwrap().defaults.insert(role, outcome);
    }

    pub fn push(&self, role: BrokerRole, outcome: Outcome) {
        self.inner
            .lock()
            .unwrap()
            .scripted
            .entry(role)
            .or_default()
            .push_back(outcome);
    }

    pub fn attempts(&self, role: BrokerRole) -> usize {
        self.inner.lock().unwrap().attempts.get(&role).copied().unwrap_or(0)
    }

    pub fn links_opened(&self, role: BrokerRole) -> usize {
        self.inner.lock().unwrap().links.get(&role).map_or(0, Vec::len)
    }

    /// 最近一条连接上的调用记录
    pub fn calls(&self, role: BrokerRole) -> Vec<LinkCall> {
        self.inner
            .lock()
            .unwrap()
            .links
            .get(&role)
            .and_then(|links| links.last())
            .map(|log| log.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn subscribe_count(&self, role: BrokerRole, topic: &str) -> usize {
        self.calls(role)
            .iter()
            .filter(|call| matches!(call, LinkCall::Subscribe(t) if t == topic))
            .count()
    }

    pub fn publishes(&self, role: BrokerRole) -> Vec<(String, Vec<u8>)> {
        self.calls(role)
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::Publish(topic, payload) => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    /// 模拟 broker 推送一条消息
    pub fn deliver(&self, role: BrokerRole, topic: &str, payload: &[u8]) {
        let sink = self.inner.lock().unwrap().sinks.get(&role).cloned();
        if let Some(sink) = sink {
            sink.message(topic, payload.to_vec());
        }
    }

    /// 模拟连接意外断开
    pub fn drop_link(&self, role: BrokerRole) {
        let sink = self.inner.lock().unwrap().sinks.get(&role).cloned();
        if let Some(sink) = sink {
            sink.closed("connection reset by peer");
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        role: BrokerRole,
        _config: &BrokerConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn BrokerLink>, ConnectError> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            *inner.attempts.entry(role).or_default() += 1;
            let default = inner.defaults.get(&role).copied().unwrap_or(Outcome::Accept);
            inner
                .scripted
                .get_mut(&role)
                .and_then(VecDeque::pop_front)
                .unwrap_or(default)
        };

        match outcome {
            Outcome::Accept => {
                let calls = CallLog::default();
                let mut inner = self.inner.lock().unwrap();
                inner.sinks.insert(role, events);
                inner.links.entry(role).or_default().push(calls.clone());
                Ok(Box::new(ScriptedLink::new(calls)))
            }
            Outcome::Reject => Err(ConnectError::Handshake {
                role,
                reason: "connection refused".to_string(),
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }
}
