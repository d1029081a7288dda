use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use crate::bridge::{Bridge, BridgeContext, BridgeEvent};
use crate::config::{Config, ShellyDeviceConfig};
use crate::mqtt::{self, parse_write, write_filter, IncomingMessage, Transmission};
use crate::service::ItemSink;
use crate::settings::{LocalSettings, SettingsNegotiator};

pub mod rpc;

use rpc::ShellyRpc;

const WRITABLE_ITEMS: [&str; 3] = ["Role", "DeviceType", "Position"];
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Runs one bridge per configured Shelly and builds a new one whenever a bridge
/// destroys itself
pub struct ShellyManager {
    sender: Sender<Transmission>,
    sink: Arc<dyn ItemSink>,
    settings: LocalSettings,
    config: Config,
    threads: Vec<JoinHandle<()>>,
}

impl ShellyManager {
    pub fn new(sender: Sender<Transmission>, sink: Arc<dyn ItemSink>, settings: LocalSettings, config: Config) -> Self {
        return ShellyManager {
            sender,
            sink,
            settings,
            config,
            threads: Vec::new(),
        };
    }

    pub async fn start_thread(&mut self) {
        let context = BridgeContext {
            process_name: env!("CARGO_PKG_NAME").to_string(),
            process_version: env!("CARGO_PKG_VERSION").to_string(),
            connection: format!("MQTT {}:{}", self.config.mqtt.host, self.config.mqtt.port),
        };

        let mut device_count = 0;
        for device in self.config.devices.iter() {
            if !device.enabled {
                info!("Shelly {} is disabled", device.name);
                continue;
            }

            device_count += 1;
            let supervisor = DeviceSupervisor {
                device: device.clone(),
                context: context.clone(),
                sender: self.sender.clone(),
                sink: self.sink.clone(),
                settings: self.settings.clone(),
                root: self.config.mqtt.topic_root.clone(),
                client_name: self.config.mqtt.client_name.clone(),
                settings_timeout: Duration::from_secs(self.config.settings.timeout),
                retry_interval: Duration::from_secs(self.config.retry_interval),
            };
            self.threads.push(tokio::spawn(async move {
                supervisor.run().await;
            }));
        }

        info!("All {device_count} Shelly devices started, handling settings edits");
        self.handle_settings_edits().await;

        for thread in self.threads.iter() {
            thread.abort();
        }
        self.threads.clear();
    }

    /// Out of band edits of the settings, `{"path": .., "value": ..}`
    async fn handle_settings_edits(&self) {
        let (tx, mut rx) = mpsc::channel(10);
        let topic = format!("{}/settings/set", self.config.mqtt.topic_root);
        mqtt::subscribe(&self.sender, topic, tx).await;

        while let Some(message) = rx.recv().await {
            let doc = match serde_json::from_str::<Value>(&message.payload) {
                Ok(d) => d,
                Err(_) => {
                    warn!("Malformed settings edit {}", message.payload);
                    continue;
                }
            };

            match (doc.get("path").and_then(|p| p.as_str()), doc.get("value")) {
                (Some(path), Some(value)) => {
                    if self.settings.set_value(path, value.clone()) {
                        info!("Setting {path} changed to {value}");
                    }
                }
                _ => warn!("Settings edit needs path and value: {}", message.payload),
            }
        }
    }
}

struct DeviceSupervisor {
    device: ShellyDeviceConfig,
    context: BridgeContext,
    sender: Sender<Transmission>,
    sink: Arc<dyn ItemSink>,
    settings: LocalSettings,
    root: String,
    client_name: String,
    settings_timeout: Duration,
    retry_interval: Duration,
}

impl DeviceSupervisor {
    async fn run(&self) {
        let log_prefix = format!("[{}]", self.device.name);
        loop {
            let (tx, mut rx) = mpsc::channel(100);
            let mut rpc = ShellyRpc::new(self.device.prefix.clone(), &self.client_name, self.sender.clone());

            mqtt::subscribe(&self.sender, rpc.reply_topic(), tx.clone()).await;
            mqtt::subscribe(&self.sender, rpc.events_topic(), tx.clone()).await;
            for item in WRITABLE_ITEMS {
                mqtt::subscribe(&self.sender, write_filter(&self.root, item), tx.clone()).await;
            }
            drop(tx);

            let handshake = match rpc.get_device_info(&mut rx).await {
                Some(h) => h,
                None => {
                    warn!("{log_prefix} Device did not answer, retrying in {:?}", self.retry_interval);
                    sleep(self.retry_interval).await;
                    continue;
                }
            };

            let negotiator = SettingsNegotiator::new(self.settings.clone(), self.settings_timeout);
            let mut bridge = Bridge::new(self.context.clone(), negotiator, self.sink.clone());
            if let Err(e) = bridge.start(&handshake).await {
                warn!("{log_prefix} Start failed: {e}, retrying in {:?}", self.retry_interval);
                sleep(self.retry_interval).await;
                continue;
            }

            let mac = bridge.identity().map(|id| id.mac.clone()).unwrap_or_default();
            let (etx, mut erx) = mpsc::channel(100);
            let forwarder = tokio::spawn(forward(rx, etx, self.root.clone(), rpc.events_topic(), mac));

            bridge.run(&mut erx).await;
            forwarder.abort();

            info!("{log_prefix} Bridge destroyed, starting over");
            sleep(RESTART_DELAY).await;
        }
    }
}

/// Turn MQTT messages into bridge events, writes for other devices are dropped
async fn forward(mut rx: Receiver<IncomingMessage>, tx: Sender<BridgeEvent>, root: String, events_topic: String, mac: String) {
    let own = format!(".shelly_{mac}");
    while let Some(message) = rx.recv().await {
        let event = match to_event(&message, &root, &events_topic, &own) {
            Some(e) => e,
            None => continue,
        };

        if tx.send(event).await.is_err() {
            return;
        }
    }
}

fn to_event(message: &IncomingMessage, root: &str, events_topic: &str, own: &str) -> Option<BridgeEvent> {
    if message.topic == events_topic {
        match serde_json::from_str::<Value>(&message.payload) {
            Ok(v) => return Some(BridgeEvent::Notification(v)),
            Err(_) => {
                debug!("Malformed notification {}", message.payload);
                return None;
            }
        }
    }

    let (service, path, value) = parse_write(root, message)?;
    if !service.contains(own) {
        return None;
    }

    return Some(BridgeEvent::Write { service, path, value });
}
