use notifs_shared::{
    encode_payload, validate_publish_topic, BrokerConfig, BrokerRole, ConnectError,
    ConnectionState, ConnectionStatus, InboundMessage, MqttError, RetryConfig, TopicFilter,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::BrokerConnection;
use super::link::{BrokerLink, Connector, LinkEvent, LinkEventSink};
use super::retry::RetryStep;
use super::subscriptions::{MessageCallback, SubscriptionId, SubscriptionRegistry};

const EVENT_CAPACITY: usize = 64;

// 管理器对外广播的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    StatusChanged(ConnectionStatus),
    /// 连接尝试失败或连接意外断开，附带原因
    ConnectionError { role: BrokerRole, reason: String },
    /// 没有可用连接，消息被丢弃
    PublishSkipped { topic: String },
    /// 一轮重试耗尽且两端均不可用；连接成功前只发一次
    BrokersUnreachable,
}

type ConnectReply = oneshot::Sender<Result<BrokerRole, ConnectError>>;

// 管理器任务的消息队列
pub(crate) enum ManagerMessage {
    Connect {
        reply: ConnectReply,
    },
    Subscribe {
        filter: TopicFilter,
        id: SubscriptionId,
        callback: MessageCallback,
    },
    Unsubscribe {
        topic: String,
    },
    RemoveSubscription {
        id: SubscriptionId,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Link {
        role: BrokerRole,
        epoch: u64,
        event: LinkEvent,
    },
    AttemptFinished {
        role: BrokerRole,
        epoch: u64,
        outcome: Result<Box<dyn BrokerLink>, ConnectError>,
    },
    RetryDue {
        role: BrokerRole,
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownCause {
    Dropped,
    AttemptFailed,
}

/// 双 broker 连接管理器的调用端句柄，可自由克隆
#[derive(Clone)]
pub struct MqttManagerHandle {
    tx: mpsc::UnboundedSender<ManagerMessage>,
    next_id: Arc<AtomicU64>,
    status_rx: watch::Receiver<ConnectionStatus>,
    events_tx: broadcast::Sender<ManagerEvent>,
}

impl MqttManagerHandle {
    /// 先连本地，失败再连云端
    pub async fn connect(&self) -> Result<BrokerRole, ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMessage::Connect { reply })
            .map_err(|_| ConnectError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectError::ManagerStopped)?
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<SubscriptionId, MqttError>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let filter = TopicFilter::new(topic)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(ManagerMessage::Subscribe {
            filter,
            id,
            callback: Arc::new(callback),
        })?;
        Ok(id)
    }

    /// 移除主题下的全部回调
    pub fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.send(ManagerMessage::Unsubscribe {
            topic: topic.to_string(),
        })
    }

    /// 只移除一个回调；主题的最后一个回调移除时才物理退订
    pub fn remove_subscription(&self, id: SubscriptionId) -> Result<(), MqttError> {
        self.send(ManagerMessage::RemoveSubscription { id })
    }

    /// 序列化为 JSON 后经所有已连接的 broker 发送
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, message: &T) -> Result<(), MqttError> {
        validate_publish_topic(topic)?;
        let payload = encode_payload(message)?;
        self.send(ManagerMessage::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().is_connected()
    }

    pub fn connection_type(&self) -> Option<BrokerRole> {
        self.status_rx.borrow().connection_type()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// 处理完之前所有排队消息后的状态
    pub async fn status(&self) -> Result<ConnectionStatus, MqttError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerMessage::Status { reply })?;
        rx.await.map_err(|_| MqttError::ManagerStopped)
    }

    pub fn events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events_tx.subscribe()
    }

    /// 断开两条连接并取消所有重试，直到再次调用 connect
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerMessage::Disconnect { reply })?;
        rx.await.map_err(|_| MqttError::ManagerStopped)
    }

    pub async fn shutdown(&self) -> Result<(), MqttError> {
        let (reply, rx) = oneshot::channel();
        self.send(ManagerMessage::Shutdown { reply })?;
        rx.await.map_err(|_| MqttError::ManagerStopped)
    }

    fn send(&self, message: ManagerMessage) -> Result<(), MqttError> {
        self.tx.send(message).map_err(|_| MqttError::ManagerStopped)
    }
}

/// 双 broker 连接管理器
///
/// 单个任务独占两条连接、订阅登记表和重试状态；调用方命令、连接事件、
/// 握手结果与重试定时器都经同一个队列顺序处理。
pub struct DualBrokerManager {
    local: BrokerConnection,
    cloud: BrokerConnection,
    registry: SubscriptionRegistry,
    connector: Arc<dyn Connector>,
    tx: mpsc::WeakUnboundedSender<ManagerMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<ManagerEvent>,
    pending_connect: Vec<ConnectReply>,
    connect_phase: Option<BrokerRole>,
    unreachable_alerted: bool,
    stopped: bool,
}

impl DualBrokerManager {
    pub fn spawn(
        local: BrokerConfig,
        cloud: BrokerConfig,
        retry: RetryConfig,
        connector: Arc<dyn Connector>,
    ) -> (MqttManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Self {
            local: BrokerConnection::new(BrokerRole::Local, local, retry),
            cloud: BrokerConnection::new(BrokerRole::Cloud, cloud, retry),
            registry: SubscriptionRegistry::new(),
            connector,
            tx: tx.downgrade(),
            status_tx,
            events_tx: events_tx.clone(),
            pending_connect: Vec::new(),
            connect_phase: None,
            unreachable_alerted: false,
            stopped: true,
        };

        let handle = MqttManagerHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            status_rx,
            events_tx,
        };

        (handle, tokio::spawn(manager.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerMessage>) {
        info!("MQTT manager started");

        while let Some(message) = rx.recv().await {
            if !self.handle(message) {
                break;
            }
        }

        self.teardown();
        info!("MQTT manager stopped");
    }

    // 返回 false 时停止任务
    fn handle(&mut self, message: ManagerMessage) -> bool {
        match message {
            ManagerMessage::Connect { reply } => self.on_connect(reply),
            ManagerMessage::Subscribe { filter, id, callback } => {
                let topic = filter.as_str().to_string();
                if self.registry.add(filter, id, callback) {
                    for role in BrokerRole::ALL {
                        self.connection_mut(role).subscribe(&topic);
                    }
                }
                debug!("Registered {} on topic {}", id, topic);
            }
            ManagerMessage::Unsubscribe { topic } => {
                let removed = self.registry.remove_topic(&topic);
                for role in BrokerRole::ALL {
                    self.connection_mut(role).unsubscribe(&topic);
                }
                debug!("Removed {} callback(s) from topic {}", removed.len(), topic);
            }
            ManagerMessage::RemoveSubscription { id } => {
                if let Some(removal) = self.registry.remove(id) {
                    if removal.topic_emptied {
                        for role in BrokerRole::ALL {
                            self.connection_mut(role).unsubscribe(&removal.topic);
                        }
                    }
                    debug!("Removed {} from topic {}", id, removal.topic);
                }
            }
            ManagerMessage::Publish { topic, payload } => self.on_publish(topic, payload),
            ManagerMessage::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ManagerMessage::Disconnect { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
            ManagerMessage::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
                return false;
            }
            ManagerMessage::Link { role, epoch, event } => self.on_link_event(role, epoch, event),
            ManagerMessage::AttemptFinished { role, epoch, outcome } => {
                self.on_attempt_finished(role, epoch, outcome)
            }
            ManagerMessage::RetryDue { role, generation } => {
                if self.connection_mut(role).take_due_timer(generation) && !self.stopped {
                    info!("Retrying connection to {} broker", role);
                    self.start_attempt(role);
                }
            }
        }
        true
    }

    fn on_connect(&mut self, reply: ConnectReply) {
        self.stopped = false;

        if let Some(role) = self.status().connection_type() {
            let _ = reply.send(Ok(role));
            return;
        }

        self.pending_connect.push(reply);
        if self.connect_phase.is_none() {
            self.enter_phase(BrokerRole::Local);
        }
    }

    // 对指定角色发起（或等待已在进行的）连接尝试
    fn enter_phase(&mut self, role: BrokerRole) {
        self.connect_phase = Some(role);
        if self.start_attempt(role) {
            return;
        }

        match self.connection(role).state() {
            // 已有尝试在进行，等待其结果
            ConnectionState::Connecting => {}
            ConnectionState::Connected => self.resolve_connect(Ok(role)),
            ConnectionState::Disconnected => self.advance_phase(role),
        }
    }

    // 当前阶段失败：本地失败转云端，云端失败则整体失败
    fn advance_phase(&mut self, failed: BrokerRole) {
        match failed {
            BrokerRole::Local => self.enter_phase(BrokerRole::Cloud),
            BrokerRole::Cloud => {
                error!("Unable to connect to either MQTT broker");
                self.resolve_connect(Err(ConnectError::AllBrokersUnreachable));
            }
        }
    }

    fn resolve_connect(&mut self, result: Result<BrokerRole, ConnectError>) {
        self.connect_phase = None;
        for reply in self.pending_connect.drain(..) {
            let _ = reply.send(result.clone());
        }
    }

    fn start_attempt(&mut self, role: BrokerRole) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        let connection = self.connection_mut(role);
        let Some(epoch) = connection.begin_connect() else {
            return false;
        };

        let config = connection.config().clone();
        let connector = self.connector.clone();
        let sink = LinkEventSink::new(role, epoch, tx.clone());
        info!("Connecting to {} broker at {}", role, config.endpoint());

        tokio::spawn(async move {
            let timeout = config.connect_timeout();
            let outcome = match tokio::time::timeout(timeout, connector.open(role, &config, sink)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout { role, timeout }),
            };
            let _ = tx.send(ManagerMessage::AttemptFinished { role, epoch, outcome });
        });

        self.publish_status();
        true
    }

    fn on_attempt_finished(
        &mut self,
        role: BrokerRole,
        epoch: u64,
        outcome: Result<Box<dyn BrokerLink>, ConnectError>,
    ) {
        match outcome {
            Ok(link) => {
                let topics: Vec<String> = self.registry.topics().map(str::to_string).collect();
                let connection = self.connection_mut(role);
                if !connection.complete_connect(epoch, link, topics.iter().map(String::as_str)) {
                    return;
                }

                self.unreachable_alerted = false;
                self.publish_status();
                if !self.pending_connect.is_empty() {
                    self.resolve_connect(Ok(role));
                }
            }
            Err(error) => {
                if !self.connection_mut(role).fail_connect(epoch, &error) {
                    return;
                }

                self.publish_status();
                self.report_error(role);
                if self.connect_phase == Some(role) {
                    self.advance_phase(role);
                }
                self.on_connection_down(role, DownCause::AttemptFailed);
            }
        }
    }

    fn on_link_event(&mut self, role: BrokerRole, epoch: u64, event: LinkEvent) {
        match event {
            LinkEvent::Message { topic, payload } => {
                if !self.connection(role).accepts(epoch) {
                    return;
                }

                let message = InboundMessage::new(topic, &payload, role);
                let mut delivered = 0usize;
                for callback in self.registry.matching(&message.topic) {
                    callback(&message);
                    delivered += 1;
                }
                debug!(
                    "Dispatched message on {} from {} broker to {} callback(s)",
                    message.topic, role, delivered
                );
            }
            LinkEvent::Closed { reason } => {
                if self.connection_mut(role).handle_closed(epoch, &reason) {
                    self.publish_status();
                    self.report_error(role);
                    self.on_connection_down(role, DownCause::Dropped);
                }
            }
        }
    }

    // 重连策略
    fn on_connection_down(&mut self, role: BrokerRole, cause: DownCause) {
        if self.stopped {
            return;
        }

        let other_connected = self.connection(role.other()).is_connected();
        if cause == DownCause::Dropped && !other_connected {
            info!("Reconnecting to {} broker immediately", role);
            self.start_attempt(role);
            return;
        }

        match self.connection_mut(role).next_retry_step() {
            RetryStep::Retry { attempt, delay } => {
                info!("Retrying {} broker in {:?} (attempt {})", role, delay, attempt);
                self.arm_retry(role, delay);
            }
            RetryStep::Exhausted { pause } => {
                if !self.status().is_connected() && !self.unreachable_alerted {
                    error!("Could not establish a connection with any MQTT broker");
                    self.unreachable_alerted = true;
                    self.emit(ManagerEvent::BrokersUnreachable);
                }
                warn!("Retries to {} broker exhausted, pausing for {:?}", role, pause);
                self.arm_retry(role, pause);
            }
        }
    }

    fn arm_retry(&mut self, role: BrokerRole, delay: std::time::Duration) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let cancel = CancellationToken::new();
        let generation = self.connection_mut(role).arm_retry_timer(cancel.clone());

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(ManagerMessage::RetryDue { role, generation });
                }
            }
        });
    }

    fn on_publish(&mut self, topic: String, payload: Vec<u8>) {
        let live: Vec<BrokerRole> = BrokerRole::ALL
            .into_iter()
            .filter(|role| self.connection(*role).is_connected())
            .collect();

        if live.is_empty() {
            warn!("No live MQTT connection, dropping message for {}", topic);
            self.emit(ManagerEvent::PublishSkipped { topic });
            return;
        }

        for role in live {
            self.connection(role).publish(&topic, payload.clone());
        }
    }

    // 断开两条连接、取消重试与等待中的 connect
    fn teardown(&mut self) {
        self.stopped = true;
        if let Some(role) = self.connect_phase {
            self.resolve_connect(Err(ConnectError::Cancelled { role }));
        }
        for role in BrokerRole::ALL {
            self.connection_mut(role).disconnect();
        }
        self.publish_status();
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::new(self.local.state(), self.cloud.state())
    }

    fn publish_status(&self) {
        let status = self.status();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        if changed {
            debug!("MQTT connection status: local={:?} cloud={:?}", status.local, status.cloud);
            self.emit(ManagerEvent::StatusChanged(status));
        }
    }

    fn report_error(&self, role: BrokerRole) {
        if let Some(reason) = self.connection(role).last_error() {
            self.emit(ManagerEvent::ConnectionError {
                role,
                reason: reason.to_string(),
            });
        }
    }

    fn emit(&self, event: ManagerEvent) {
        // 没有订阅者时忽略
        let _ = self.events_tx.send(event);
    }

    fn connection(&self, role: BrokerRole) -> &BrokerConnection {
        match role {
            BrokerRole::Local => &self.local,
            BrokerRole::Cloud => &self.cloud,
        }
    }

    fn connection_mut(&mut self, role: BrokerRole) -> &mut BrokerConnection {
        match role {
            BrokerRole::Local => &mut self.local,
            BrokerRole::Cloud => &mut self.cloud,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{LinkCall, Outcome, ScriptedConnector};
    use notifs_shared::MessagePayload;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;

    fn spawn_manager(connector: &ScriptedConnector) -> (MqttManagerHandle, JoinHandle<()>) {
        DualBrokerManager::spawn(
            BrokerConfig::local_default(),
            BrokerConfig::cloud_default(),
            RetryConfig::default(),
            Arc::new(connector.clone()),
        )
    }

    // 让已就绪的任务跑完，不触发秒级定时器
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn collector() -> (
        Arc<Mutex<Vec<InboundMessage>>>,
        impl Fn(&InboundMessage) + Send + Sync + 'static,
    ) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        (received, move |message: &InboundMessage| {
            sink.lock().unwrap().push(message.clone())
        })
    }

    // 先让本地失败一次，连上云端，再等本地重试成功
    async fn connect_both(connector: &ScriptedConnector, manager: &MqttManagerHandle) {
        connector.push(BrokerRole::Local, Outcome::Reject);
        assert_eq!(manager.connect().await, Ok(BrokerRole::Cloud));
        tokio::time::sleep(Duration::from_secs(4)).await;

        let status = manager.status().await.unwrap();
        assert_eq!(status.local, ConnectionState::Connected);
        assert_eq!(status.cloud, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_prefers_local() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);

        assert!(!manager.is_connected());
        assert_eq!(manager.connect().await, Ok(BrokerRole::Local));
        assert!(manager.is_connected());
        assert_eq!(manager.connection_type(), Some(BrokerRole::Local));
        assert_eq!(connector.attempts(BrokerRole::Cloud), 0);

        // 已连接时再次 connect 直接返回
        assert_eq!(manager.connect().await, Ok(BrokerRole::Local));
        assert_eq!(connector.attempts(BrokerRole::Local), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_falls_back_to_cloud() {
        let connector = ScriptedConnector::new();
        connector.set_default(BrokerRole::Local, Outcome::Reject);
        let (manager, _task) = spawn_manager(&connector);

        assert_eq!(manager.connect().await, Ok(BrokerRole::Cloud));

        let status = manager.connection_status();
        assert_eq!(status.local, ConnectionState::Disconnected);
        assert_eq!(status.cloud, ConnectionState::Connected);
        assert_eq!(status.connection_type(), Some(BrokerRole::Cloud));
        assert_eq!(connector.attempts(BrokerRole::Local), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_are_reported() {
        let connector = ScriptedConnector::new();
        connector.push(BrokerRole::Local, Outcome::Reject);
        let (manager, _task) = spawn_manager(&connector);
        let mut events = manager.events();

        assert_eq!(manager.connect().await, Ok(BrokerRole::Cloud));
        connector.drop_link(BrokerRole::Cloud);
        settle().await;

        let mut errors = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::ConnectionError { role, reason } = event {
                errors.push((role, reason));
            }
        }
        assert_eq!(
            errors,
            vec![
                (
                    BrokerRole::Local,
                    "local broker handshake failed: connection refused".to_string(),
                ),
                (BrokerRole::Cloud, "connection reset by peer".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_when_both_unreachable() {
        let connector = ScriptedConnector::new();
        connector.set_default(BrokerRole::Local, Outcome::Reject);
        connector.set_default(BrokerRole::Cloud, Outcome::Reject);
        let (manager, _task) = spawn_manager(&connector);

        assert_eq!(manager.connect().await, Err(ConnectError::AllBrokersUnreachable));
        assert!(!manager.is_connected());
        assert_eq!(manager.connection_type(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_falls_back() {
        let connector = ScriptedConnector::new();
        connector.set_default(BrokerRole::Local, Outcome::Hang);
        let (manager, _task) = spawn_manager(&connector);

        let started = tokio::time::Instant::now();
        assert_eq!(manager.connect().await, Ok(BrokerRole::Cloud));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_physical_subscription_per_topic() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);

        // 连接前登记的主题在连接后统一订阅
        manager.subscribe("result/dev1", |_: &InboundMessage| {}).unwrap();
        manager.connect().await.unwrap();

        for _ in 0..3 {
            manager.subscribe("alert/dev1", |_: &InboundMessage| {}).unwrap();
        }
        manager.status().await.unwrap();

        assert_eq!(connector.subscribe_count(BrokerRole::Local, "alert/dev1"), 1);
        assert_eq!(connector.subscribe_count(BrokerRole::Local, "result/dev1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_physical_subscription_per_link_when_both_live() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        connect_both(&connector, &manager).await;

        let (received, callback) = collector();
        manager.subscribe("alert/dev1", callback).unwrap();
        manager.subscribe("alert/dev1", |_: &InboundMessage| {}).unwrap();
        manager.subscribe("alert/#", |_: &InboundMessage| {}).unwrap();
        manager.status().await.unwrap();

        for role in BrokerRole::ALL {
            assert_eq!(connector.subscribe_count(role, "alert/dev1"), 1, "{}", role);
            assert_eq!(connector.subscribe_count(role, "alert/#"), 1, "{}", role);
        }

        connector.deliver(BrokerRole::Cloud, "alert/dev1", br#"{"message":"door open"}"#);
        manager.status().await.unwrap();

        let messages = received.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].source, BrokerRole::Cloud);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_fans_out_to_matching_patterns() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        manager.connect().await.unwrap();

        let (exact, exact_cb) = collector();
        let (alerts, alerts_cb) = collector();
        let (everything, everything_cb) = collector();
        let (results, results_cb) = collector();
        manager.subscribe("alert/dev1", exact_cb).unwrap();
        manager.subscribe("alert/#", alerts_cb).unwrap();
        manager.subscribe("#", everything_cb).unwrap();
        manager.subscribe("result/+", results_cb).unwrap();
        manager.status().await.unwrap();

        connector.deliver(BrokerRole::Local, "alert/dev1", b"not json");
        manager.status().await.unwrap();

        assert_eq!(exact.lock().unwrap().len(), 1);
        assert_eq!(alerts.lock().unwrap().len(), 1);
        assert_eq!(everything.lock().unwrap().len(), 1);
        assert!(results.lock().unwrap().is_empty());

        let message = exact.lock().unwrap()[0].clone();
        assert_eq!(message.topic, "alert/dev1");
        assert_eq!(message.source, BrokerRole::Local);
        match message.payload {
            MessagePayload::Info(info) => {
                assert_eq!(info.kind, "info");
                assert_eq!(info.title, "Nuevo mensaje");
                assert_eq!(info.body, "not json");
            }
            other => panic!("expected info payload, got {:?}", other),
        }

        connector.deliver(BrokerRole::Local, "result/dev1", br#"{"faces": 1}"#);
        manager.status().await.unwrap();
        let result = results.lock().unwrap()[0].clone();
        assert_eq!(result.payload, MessagePayload::Structured(json!({"faces": 1})));
        assert_eq!(everything.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_removes_only_that_topic() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        manager.connect().await.unwrap();

        let (alerts, alerts_cb) = collector();
        let (alerts_again, alerts_again_cb) = collector();
        let (results, results_cb) = collector();
        manager.subscribe("alert/dev1", alerts_cb).unwrap();
        manager.subscribe("alert/dev1", alerts_again_cb).unwrap();
        manager.subscribe("result/dev1", results_cb).unwrap();

        manager.unsubscribe("alert/dev1").unwrap();
        connector.deliver(BrokerRole::Local, "alert/dev1", b"{}");
        connector.deliver(BrokerRole::Local, "result/dev1", b"{}");
        manager.status().await.unwrap();

        assert!(alerts.lock().unwrap().is_empty());
        assert!(alerts_again.lock().unwrap().is_empty());
        assert_eq!(results.lock().unwrap().len(), 1);

        let calls = connector.calls(BrokerRole::Local);
        assert!(calls.contains(&LinkCall::Unsubscribe("alert/dev1".to_string())));
        assert!(!calls.contains(&LinkCall::Unsubscribe("result/dev1".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_subscription_keeps_other_callbacks() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        manager.connect().await.unwrap();

        let (first, first_cb) = collector();
        let (second, second_cb) = collector();
        let first_id = manager.subscribe("alert/dev1", first_cb).unwrap();
        let second_id = manager.subscribe("alert/dev1", second_cb).unwrap();
        assert_ne!(first_id, second_id);

        manager.remove_subscription(first_id).unwrap();
        connector.deliver(BrokerRole::Local, "alert/dev1", b"{}");
        manager.status().await.unwrap();

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
        let unsubscribe = LinkCall::Unsubscribe("alert/dev1".to_string());
        assert!(!connector.calls(BrokerRole::Local).contains(&unsubscribe));

        manager.remove_subscription(second_id).unwrap();
        manager.status().await.unwrap();
        assert!(connector.calls(BrokerRole::Local).contains(&unsubscribe));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_reconnects_and_resubscribes() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        manager.connect().await.unwrap();
        manager.subscribe("alert/dev1", |_: &InboundMessage| {}).unwrap();
        manager.subscribe("state/telemetry/#", |_: &InboundMessage| {}).unwrap();
        manager.status().await.unwrap();

        connector.drop_link(BrokerRole::Local);
        settle().await;

        // 另一端未连接，立即重连
        assert_eq!(connector.links_opened(BrokerRole::Local), 2);
        assert!(manager.is_connected());
        let calls = connector.calls(BrokerRole::Local);
        assert!(calls.contains(&LinkCall::Subscribe("alert/dev1".to_string())));
        assert!(calls.contains(&LinkCall::Subscribe("state/telemetry/#".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_with_other_side_up_retries_on_timer() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        connect_both(&connector, &manager).await;
        assert_eq!(manager.connection_type(), Some(BrokerRole::Local));

        connector.drop_link(BrokerRole::Local);
        settle().await;
        assert_eq!(manager.connection_status().local, ConnectionState::Disconnected);
        assert_eq!(manager.connection_type(), Some(BrokerRole::Cloud));
        assert_eq!(connector.links_opened(BrokerRole::Local), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(connector.links_opened(BrokerRole::Local), 2);
        assert_eq!(manager.connection_type(), Some(BrokerRole::Local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_without_connection_is_skipped_once() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        let mut events = manager.events();

        manager
            .publish("command/dev1/light", &json!({"value": "on"}))
            .unwrap();
        manager.status().await.unwrap();

        assert_eq!(
            events.try_recv(),
            Ok(ManagerEvent::PublishSkipped {
                topic: "command/dev1/light".to_string(),
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_goes_through_every_live_link() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);
        connect_both(&connector, &manager).await;

        manager
            .publish("command/dev1/fan", &json!({"value": true}))
            .unwrap();
        manager.status().await.unwrap();

        let expected = vec![("command/dev1/fan".to_string(), br#"{"value":true}"#.to_vec())];
        assert_eq!(connector.publishes(BrokerRole::Local), expected);
        assert_eq!(connector.publishes(BrokerRole::Cloud), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_topics_are_rejected() {
        let connector = ScriptedConnector::new();
        let (manager, _task) = spawn_manager(&connector);

        assert!(matches!(
            manager.subscribe("alert/#/dev1", |_: &InboundMessage| {}),
            Err(MqttError::InvalidTopic(_))
        ));
        assert!(matches!(
            manager.publish("command/+/light", &json!({"value": 1})),
            Err(MqttError::InvalidTopic(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_alert_once_until_success() {
        let connector = ScriptedConnector::new();
        connector.set_default(BrokerRole::Local, Outcome::Reject);
        connector.set_default(BrokerRole::Cloud, Outcome::Reject);
        let (manager, _task) = spawn_manager(&connector);

        let alerts = Arc::new(AtomicUsize::new(0));
        let counter = alerts.clone();
        let mut events = manager.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ManagerEvent::BrokersUnreachable) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        assert_eq!(manager.connect().await, Err(ConnectError::AllBrokersUnreachable));

        // 两轮重试之后仍然只告警一次，且暂停后继续重试
        tokio::time::sleep(Duration::from_secs(70)).await;
        settle().await;
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
        assert!(connector.attempts(BrokerRole::Local) > 6);

        // 连接成功后重新允许告警
        connector.set_default(BrokerRole::Local, Outcome::Accept);
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(manager.connection_type(), Some(BrokerRole::Local));

        connector.set_default(BrokerRole::Local, Outcome::Reject);
        connector.drop_link(BrokerRole::Local);
        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert!(!manager.is_connected());
        assert_eq!(alerts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_retries() {
        let connector = ScriptedConnector::new();
        connector.set_default(BrokerRole::Local, Outcome::Reject);
        connector.set_default(BrokerRole::Cloud, Outcome::Reject);
        let (manager, _task) = spawn_manager(&connector);

        assert!(manager.connect().await.is_err());
        manager.disconnect().await.unwrap();
        let local_attempts = connector.attempts(BrokerRole::Local);
        let cloud_attempts = connector.attempts(BrokerRole::Cloud);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(BrokerRole::Local), local_attempts);
        assert_eq!(connector.attempts(BrokerRole::Cloud), cloud_attempts);

        // 重新 connect 后恢复
        connector.set_default(BrokerRole::Local, Outcome::Accept);
        assert_eq!(manager.connect().await, Ok(BrokerRole::Local));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connect() {
        let connector = ScriptedConnector::new();
        connector.set_default(BrokerRole::Local, Outcome::Hang);
        let (manager, _task) = spawn_manager(&connector);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        settle().await;
        assert_eq!(manager.connection_status().local, ConnectionState::Connecting);

        manager.disconnect().await.unwrap();
        assert_eq!(
            pending.await.unwrap(),
            Err(ConnectError::Cancelled {
                role: BrokerRole::Local,
            })
        );

        // 超时后的迟到结果被丢弃
        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = manager.status().await.unwrap();
        assert_eq!(status, ConnectionStatus::default());
        assert_eq!(connector.attempts(BrokerRole::Cloud), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_watch_and_shutdown() {
        let connector = ScriptedConnector::new();
        let (manager, task) = spawn_manager(&connector);
        let mut status_rx = manager.watch_status();

        manager.connect().await.unwrap();
        status_rx.changed().await.unwrap();
        assert!(status_rx.borrow_and_update().is_connected());

        manager.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(connector.calls(BrokerRole::Local).contains(&LinkCall::Close));
        assert_eq!(manager.connect().await, Err(ConnectError::ManagerStopped));
        assert!(matches!(
            manager.unsubscribe("alert/dev1"),
            Err(MqttError::ManagerStopped)
        ));
    }
}
