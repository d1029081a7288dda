/*
    Shelly Gen2 RPC over MQTT.

    Requests go to <prefix>/rpc with a "src" naming where the answer should go,
    the device replies on <src>/rpc. Status notifications arrive on
    <prefix>/events/rpc.
*/

use std::time::Duration;
use log::{debug, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{timeout_at, Instant};
use crate::mqtt::{self, IncomingMessage, Transmission};

pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShellyRpc {
    prefix: String,
    src: String,
    sender: Sender<Transmission>,
    next_id: u64,
}

impl ShellyRpc {
    pub fn new(prefix: String, client_name: &str, sender: Sender<Transmission>) -> Self {
        let src = format!("{client_name}-{}", uuid::Uuid::new_v4().simple());
        return ShellyRpc { prefix, src, sender, next_id: 1 };
    }

    pub fn events_topic(&self) -> String {
        return format!("{}/events/rpc", self.prefix);
    }

    pub fn reply_topic(&self) -> String {
        return format!("{}/rpc", self.src);
    }

    pub fn request(&mut self, method: &str) -> (u64, String) {
        let id = self.next_id;
        self.next_id += 1;
        let payload = json!({"id": id, "src": self.src, "method": method}).to_string();
        return (id, payload);
    }

    /// Ask the device who it is. The whole reply is returned, the identity is
    /// below "result".
    pub async fn get_device_info(&mut self, replies: &mut Receiver<IncomingMessage>) -> Option<Value> {
        let (id, payload) = self.request("Shelly.GetDeviceInfo");
        mqtt::publish(&self.sender, format!("{}/rpc", self.prefix), payload, false).await;

        let reply_topic = self.reply_topic();
        let deadline = Instant::now() + RPC_TIMEOUT;
        loop {
            let message = match timeout_at(deadline, replies.recv()).await {
                Ok(Some(m)) => m,
                Ok(None) => return None,
                Err(_) => {
                    warn!("[{}] No answer to Shelly.GetDeviceInfo", self.prefix);
                    return None;
                }
            };

            if message.topic != reply_topic {
                continue;
            }

            match matching_reply(&message.payload, id) {
                Some(v) => return Some(v),
                None => debug!("[{}] Ignoring reply {}", self.prefix, message.payload),
            }
        }
    }
}

fn matching_reply(payload: &str, id: u64) -> Option<Value> {
    let doc = serde_json::from_str::<Value>(payload).ok()?;
    if doc.get("id").and_then(|v| v.as_u64()) != Some(id) {
        return None;
    }
    return Some(doc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_topics_and_request() {
        let (tx, _rx) = mpsc::channel(1);
        let mut rpc = ShellyRpc::new("shellypro3em-aabbcc".to_string(), "s2v", tx);
        assert_eq!(rpc.events_topic(), "shellypro3em-aabbcc/events/rpc");
        assert!(rpc.reply_topic().starts_with("s2v-"));

        let (id, payload) = rpc.request("Shelly.GetDeviceInfo");
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(id, 1);
        assert_eq!(v["method"], "Shelly.GetDeviceInfo");
        assert_eq!(rpc.request("x").0, 2);
    }

    #[test]
    fn test_matching_reply() {
        assert!(matching_reply(r#"{"id": 3, "result": {"mac": "aa"}}"#, 3).is_some());
        assert!(matching_reply(r#"{"id": 2, "result": {}}"#, 3).is_none());
        assert!(matching_reply("garbage", 3).is_none());
    }

    #[tokio::test]
    async fn test_get_device_info() {
        let (tx, mut out) = mpsc::channel(10);
        let (replies_tx, mut replies) = mpsc::channel(10);
        let mut rpc = ShellyRpc::new("dev".to_string(), "s2v", tx);
        let reply_topic = rpc.reply_topic();

        replies_tx.send(IncomingMessage { topic: "dev/events/rpc".to_string(), payload: "{}".to_string() }).await.unwrap();
        replies_tx.send(IncomingMessage {
            topic: reply_topic,
            payload: r#"{"id": 1, "result": {"mac": "AABBCC", "fw_id": "1.0"}}"#.to_string(),
        }).await.unwrap();

        let info = rpc.get_device_info(&mut replies).await.unwrap();
        assert_eq!(info["result"]["mac"], "AABBCC");

        match out.recv().await.unwrap() {
            Transmission::Publish(p) => assert_eq!(p.topic, "dev/rpc"),
            _ => panic!("expected the request"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_device_info_times_out() {
        let (tx, _out) = mpsc::channel(10);
        let (_replies_tx, mut replies) = mpsc::channel(10);
        let mut rpc = ShellyRpc::new("dev".to_string(), "s2v", tx);
        assert!(rpc.get_device_info(&mut replies).await.is_none());
    }
}
