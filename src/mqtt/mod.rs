use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use crate::config::MqttConfig;
use crate::service::ItemSink;

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: String,
}

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    pub topic: String,
    pub sender: Sender<IncomingMessage>,
}

pub enum Transmission {
    Subscribe(SubscribeData),
    Publish(PublishData),
}

/// Does an MQTT topic filter (with + and #) match a topic
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for f in filter.split('/') {
        match f {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            level => {
                if topic_levels.next() != Some(level) {
                    return false;
                }
            }
        }
    }

    return topic_levels.next().is_none();
}

pub struct Callbacks {
    calls: HashMap<String, Vec<Sender<IncomingMessage>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: Sender<IncomingMessage>) {
        let v = self.calls.entry(topic.clone()).or_default();
        /* Receivers of bridges that are gone are dropped here */
        v.retain(|s| !s.is_closed());
        debug!("Adding callback {} to topic {topic}", v.len());
        v.push(callback);
    }

    pub fn send(&mut self, message: &IncomingMessage) -> usize {
        let mut delivered = 0;
        for (filter, v) in self.calls.iter_mut() {
            if !topic_matches(filter, &message.topic) {
                continue;
            }

            v.retain(|s| !s.is_closed());
            for call in v.iter() {
                match call.try_send(message.clone()) {
                    Ok(_) => delivered += 1,
                    Err(e) => warn!("Dropping message on {}: {e}", message.topic),
                }
            }
        }

        if delivered == 0 {
            debug!("Nobody wants {}", message.topic);
        }
        return delivered;
    }

    pub fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        return Callbacks::new();
    }
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    /* Item updates come in bursts (a whole meter at once) and must not be lost */
    sink_tx: UnboundedSender<Transmission>,
    sink_rx: UnboundedReceiver<Transmission>,
    client: AsyncClient,
    callbacks: Arc<RwLock<Callbacks>>,
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx, mrx) = mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let callbacks = Arc::new(RwLock::new(Callbacks::new()));

        let reconnect_c = client.clone();
        let loop_callbacks = callbacks.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        debug!("Received {} -> {payload:?}", p.topic);
                        let message = IncomingMessage { topic: p.topic, payload };
                        loop_callbacks.write().await.send(&message);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");
                        let topics = loop_callbacks.read().await.get_topics();
                        for topic in topics {
                            /* Move the resubscription to it's own task */
                            let c = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = c.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {topic} failed: {e}");
                                }
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        return (MqttManager { rx: mrx, sink_tx, sink_rx, client, callbacks }, mtx);
    }

    /// A sink publishing meter items below `root` through this connection
    pub fn sink(&self, root: String) -> MqttSink {
        return MqttSink::new(self.sink_tx.clone(), root);
    }

    pub async fn start_thread(&mut self) {
        loop {
            let t = tokio::select! {
                t = self.rx.recv() => t,
                t = self.sink_rx.recv() => t,
            };

            match t {
                Some(t) => self.transmit(t).await,
                None => break,
            }
        }

        info!("All senders gone, MQTT thread exits");
    }

    async fn transmit(&mut self, t: Transmission) {
        match t {
            Transmission::Publish(publish_data) => {
                let qos = match publish_data.qos {
                    1 => QoS::AtLeastOnce,
                    2 => QoS::ExactlyOnce,
                    _ => QoS::AtMostOnce,
                };
                match self.client.publish(publish_data.topic, qos, publish_data.retain, publish_data.payload).await {
                    Err(e) => { error!("Error publishing: {}", e); }
                    Ok(_) => { debug!("Published successfully"); }
                }
            }
            Transmission::Subscribe(subscribe_data) => {
                let topic = subscribe_data.topic;
                self.callbacks.write().await.insert(topic.clone(), subscribe_data.sender);
                match self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                    Ok(_) => info!("Registered callback {topic}"),
                    Err(e) => error!("Subscribing {topic} failed: {e}"),
                }
            }
        }
    }
}

pub async fn subscribe(sender: &Sender<Transmission>, topic: String, callback: Sender<IncomingMessage>) {
    let _ = sender.send(Transmission::Subscribe(SubscribeData { topic, sender: callback })).await;
}

pub async fn publish(sender: &Sender<Transmission>, topic: String, payload: String, retain: bool) {
    let _ = sender.send(Transmission::Publish(PublishData { topic, payload, qos: 1, retain })).await;
}

pub fn notify_topic(root: &str, service: &str, path: &str) -> String {
    return format!("{root}/N/{service}{path}");
}

pub fn write_filter(root: &str, item: &str) -> String {
    return format!("{root}/W/+/{item}");
}

/// Split a write topic into service and item path, the payload may be
/// `{"value": v}` or the bare value
pub fn parse_write(root: &str, message: &IncomingMessage) -> Option<(String, String, Value)> {
    let rest = message.topic.strip_prefix(root)?.strip_prefix("/W/")?;
    let (service, path) = rest.split_once('/')?;
    if service.is_empty() || path.is_empty() {
        return None;
    }

    let doc = serde_json::from_str::<Value>(&message.payload).ok()?;
    let value = match doc {
        Value::Object(mut m) => m.remove("value")?,
        other => other,
    };

    return Some((service.to_string(), format!("/{path}"), value));
}

/// Publishes meter items the way Venus' dbus-mqtt does, retained `{"value": v}`.
/// The queue is unbounded, a burst of a whole schema is never cut short.
pub struct MqttSink {
    sender: UnboundedSender<Transmission>,
    root: String,
}

impl MqttSink {
    pub fn new(sender: UnboundedSender<Transmission>, root: String) -> Self {
        return MqttSink { sender, root };
    }

    fn send(&self, topic: String, payload: String) {
        let t = Transmission::Publish(PublishData { topic, payload, qos: 1, retain: true });
        if self.sender.send(t).is_err() {
            warn!("MQTT connection is gone, item update lost");
        }
    }
}

impl ItemSink for MqttSink {
    fn item_changed(&self, service: &str, path: &str, value: &Value, text: &str) {
        let payload = json!({"value": value, "text": text}).to_string();
        self.send(notify_topic(&self.root, service, path), payload);
    }

    fn service_removed(&self, service: &str, paths: &[String]) {
        /* An empty retained message removes the topic from the broker */
        for path in paths {
            self.send(notify_topic(&self.root, service, path), "".to_string());
        }
    }
}
