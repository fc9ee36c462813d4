use async_trait::async_trait;
use notifs_shared::{generate_client_id, BrokerConfig, BrokerRole, ConnectError, TransportKind};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::ManagerMessage;

// 请求队列容量
const REQUEST_CAPACITY: usize = 100;
// 主动断开时等待 DISCONNECT 发出的时间
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT link rejected the request: {0}")]
    Rejected(String),
}

// 物理连接上发生的事件
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message { topic: String, payload: Vec<u8> },
    Closed { reason: String },
}

/// 一条已完成握手的物理连接
///
/// 所有请求都走非阻塞路径，调用方是管理器任务本身。
pub trait BrokerLink: Send {
    fn subscribe(&self, topic: &str) -> Result<(), LinkError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;

    /// 主动关闭；关闭后不再上报 Closed 事件
    fn close(&self);
}

/// 建立物理连接的工厂，握手成功（CONNACK 接受）后返回
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        role: BrokerRole,
        config: &BrokerConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn BrokerLink>, ConnectError>;
}

/// 连接事件回传通道，带有发起连接时的 epoch
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    role: BrokerRole,
    epoch: u64,
    tx: mpsc::UnboundedSender<ManagerMessage>,
}

impl LinkEventSink {
    pub(crate) fn new(role: BrokerRole, epoch: u64, tx: mpsc::UnboundedSender<ManagerMessage>) -> Self {
        Self { role, epoch, tx }
    }

    pub fn role(&self) -> BrokerRole {
        self.role
    }

    pub fn message(&self, topic: impl Into<String>, payload: Vec<u8>) -> bool {
        self.emit(LinkEvent::Message {
            topic: topic.into(),
            payload,
        })
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.emit(LinkEvent::Closed { reason: reason.into() })
    }

    // 管理器已停止时返回 false
    fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(ManagerMessage::Link {
                role: self.role,
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// 基于 rumqttc 的连接工厂
#[derive(Debug, Clone, Default)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
        let client_id = generate_client_id(&config.client_id_prefix);

        // WebSocket 传输时 host 需要是完整 URL
        let host = config.websocket_url().unwrap_or_else(|| config.host.clone());
        let mut mqtt_options = MqttOptions::new(client_id, host, config.port);

        // 设置认证信息
        if let Some(credentials) = &config.credentials {
            mqtt_options.set_credentials(&credentials.username, &credentials.password);
        }

        // 设置保持连接
        mqtt_options.set_keep_alive(config.keep_alive());
        mqtt_options.set_clean_session(true);

        let transport = match config.transport {
            TransportKind::Tcp => Transport::Tcp,
            TransportKind::Tls => Transport::tls_with_default_config(),
            TransportKind::Ws => Transport::Ws,
            TransportKind::Wss => Transport::wss_with_default_config(),
        };
        mqtt_options.set_transport(transport);

        mqtt_options
    }
}

#[async_trait]
impl Connector for RumqttConnector {
    async fn open(
        &self,
        role: BrokerRole,
        config: &BrokerConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn BrokerLink>, ConnectError> {
        let (client, mut event_loop) = AsyncClient::new(Self::mqtt_options(config), REQUEST_CAPACITY);

        // 等待 CONNACK；超时由调用方控制
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => {
                    if connack.code != ConnectReturnCode::Success {
                        return Err(ConnectError::Handshake {
                            role,
                            reason: format!("{:?}", connack.code),
                        });
                    }
                    info!("MQTT connection established with {} broker: {:?}", role, connack);
                    break;
                }
                Ok(other) => {
                    debug!("Event before CONNACK from {} broker: {:?}", role, other);
                }
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(ConnectError::Handshake {
                        role,
                        reason: format!("connection refused: {:?}", code),
                    });
                }
                Err(e) => {
                    return Err(ConnectError::Handshake {
                        role,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let cancel = CancellationToken::new();
        tokio::spawn(run_event_loop(event_loop, events, cancel.clone()));

        Ok(Box::new(RumqttLink { client, cancel }))
    }
}

// 运行事件循环，直到连接断开或被主动关闭
async fn run_event_loop(mut event_loop: EventLoop, events: LinkEventSink, cancel: CancellationToken) {
    let role = events.role();
    debug!("Starting MQTT event loop for {} broker", role);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush_disconnect(&mut event_loop, role).await;
                return;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!("Received MQTT message on topic: {} ({})", publish.topic, role);
                    if !events.message(publish.topic, publish.payload.to_vec()) {
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    warn!("{} broker initiated disconnect", role);
                    events.closed("broker initiated disconnect");
                    return;
                }
                Ok(Event::Incoming(Incoming::SubAck(suback))) => {
                    debug!("Subscription acknowledged by {} broker: {:?}", role, suback);
                }
                Ok(_) => {}
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!("MQTT connection error on {} broker: {}", role, e);
                        events.closed(e.to_string());
                    }
                    return;
                }
            }
        }
    }
}

// 把已入队的 DISCONNECT 发出去
async fn flush_disconnect(event_loop: &mut EventLoop, role: BrokerRole) {
    let drained = tokio::time::timeout(CLOSE_GRACE, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("{} broker link closed without flushing DISCONNECT", role);
    }
}

struct RumqttLink {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl BrokerLink for RumqttLink {
    fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client.try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Failed to queue MQTT disconnect: {}", e);
        }
        self.cancel.cancel();
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
