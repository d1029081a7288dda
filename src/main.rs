use shelly2venus::{Config, LocalSettings, MqttManager, ShellyManager};
use tokio::task::JoinHandle;
use std::sync::Arc;
use std::time::Duration;
use log::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("S2V_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let settings = LocalSettings::open(config.settings_file());
    settings.set_online(true);

    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    let sink = Arc::new(mqtt.sink(config.mqtt.topic_root.clone()));

    let mut threads: Vec<JoinHandle<()>> = Vec::new();
    threads.push(tokio::spawn(async move {
        mqtt.start_thread().await;
    }));

    let mut shelly = ShellyManager::new(tx, sink, settings, config);
    threads.push(tokio::spawn(async move {
        shelly.start_thread().await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        if threads.iter().any(|t| t.is_finished()) {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
}
