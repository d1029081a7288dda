/*
    The bridge between one Shelly device and the bus.

    A bridge runs through handshake, settings negotiation and publishing once.
    Any change of role, instance or device type destroys it; the owner is
    expected to build a fresh one. A destroyed bridge never touches the bus again.
*/

pub mod telemetry;

use std::sync::Arc;
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use crate::models::{DeviceIdentity, DeviceKind};
pub use crate::models::{PRIMARY_SUFFIX, SUB_METER_SUFFIXES};
use crate::service::schema::{build_meter, service_name, MeterParams};
use crate::service::{ItemSink, Service, WriteHandler};
use crate::settings::{NegotiatedSettings, SettingsChange, SettingsNegotiator};

/// Process wide facts every published meter carries
#[derive(Debug, Clone)]
pub struct BridgeContext {
    pub process_name: String,
    pub process_version: String,
    pub connection: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    AwaitingHandshake,
    AwaitingSettings,
    Publishing,
    Active,
    Destroyed,
}

#[derive(Debug, Error, PartialEq)]
pub enum StartError {
    #[error("handshake result is missing {0}")]
    MissingIdentity(&'static str),
    #[error("settings authority did not show up in time")]
    SettingsUnavailable,
    #[error("bridge was already started")]
    AlreadyStarted,
}

/// Input for a running bridge, delivered in arrival order
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Notification(Value),
    Write { service: String, path: String, value: Value },
}

/// One published meter with the settings it was built from
pub struct PublishedDevice {
    pub service: Service,
    pub settings: NegotiatedSettings,
    pub suffix: u8,
}

/// Sub meters for the pm devices, created together on the first pm telemetry
pub enum SubMeters {
    Uninitialized,
    Active(Box<[PublishedDevice; 3]>),
}

pub struct Bridge {
    context: BridgeContext,
    negotiator: SettingsNegotiator,
    changes: broadcast::Receiver<SettingsChange>,
    sink: Arc<dyn ItemSink>,
    identity: Option<DeviceIdentity>,
    state: BridgeState,
    primary: Option<PublishedDevice>,
    sub_meters: SubMeters,
}

enum Step {
    Event(Option<BridgeEvent>),
    Change(Result<SettingsChange, broadcast::error::RecvError>),
}

impl Bridge {
    pub fn new(context: BridgeContext, negotiator: SettingsNegotiator, sink: Arc<dyn ItemSink>) -> Self {
        /* Subscribe right away so nothing that happens during startup is lost */
        let changes = negotiator.subscribe();
        return Bridge {
            context,
            negotiator,
            changes,
            sink,
            identity: None,
            state: BridgeState::Idle,
            primary: None,
            sub_meters: SubMeters::Uninitialized,
        };
    }

    pub fn state(&self) -> BridgeState {
        return self.state;
    }

    pub fn is_destroyed(&self) -> bool {
        return self.state == BridgeState::Destroyed;
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        return self.identity.as_ref();
    }

    pub fn primary(&self) -> Option<&PublishedDevice> {
        return self.primary.as_ref();
    }

    pub fn sub_meters(&self) -> Option<&[PublishedDevice; 3]> {
        match &self.sub_meters {
            SubMeters::Active(d) => Some(d.as_ref()),
            SubMeters::Uninitialized => None,
        }
    }

    /// Names of all services currently on the bus
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.primary.iter().map(|d| d.service.name().to_string()).collect();
        if let Some(subs) = self.sub_meters() {
            names.extend(subs.iter().map(|d| d.service.name().to_string()));
        }
        return names;
    }

    fn log_prefix(&self) -> String {
        match &self.identity {
            Some(id) => format!("[{}]", id.mac),
            None => "[unknown]".to_string(),
        }
    }

    fn meter_params(&self, identity: &DeviceIdentity, settings: &NegotiatedSettings, suffix: u8, kind: DeviceKind, device_instance: u32) -> MeterParams {
        let ri = settings.role_instance;
        return MeterParams {
            service_name: service_name(ri.role, &identity.mac, suffix),
            process_name: self.context.process_name.clone(),
            process_version: self.context.process_version.clone(),
            connection: self.context.connection.clone(),
            device_instance,
            product_name: format!("Shelly energy meter + {suffix}"),
            firmware: identity.firmware.clone(),
            role: ri.role,
            kind,
            position: settings.position,
        };
    }

    /// Run the startup from a handshake result up to a published primary meter
    pub async fn start(&mut self, handshake: &Value) -> Result<(), StartError> {
        if self.state != BridgeState::Idle {
            return Err(StartError::AlreadyStarted);
        }

        self.state = BridgeState::AwaitingHandshake;
        let identity = match DeviceIdentity::from_handshake(handshake) {
            Ok(id) => id,
            Err(key) => {
                warn!("Handshake without {key}, not starting");
                self.destroy();
                return Err(StartError::MissingIdentity(key));
            }
        };
        self.identity = Some(identity.clone());
        let log_prefix = self.log_prefix();

        self.state = BridgeState::AwaitingSettings;
        info!("{log_prefix} Waiting for localsettings");
        let settings = match self.negotiator.resolve(&identity, PRIMARY_SUFFIX).await {
            Some(s) => s,
            None => {
                error!("{log_prefix} Failed to connect to localsettings");
                self.destroy();
                return Err(StartError::SettingsUnavailable);
            }
        };
        info!("{log_prefix} Connected to localsettings");

        self.state = BridgeState::Publishing;
        let params = self.meter_params(&identity, &settings, PRIMARY_SUFFIX, settings.kind, settings.role_instance.instance);
        let service = build_meter(&params, self.sink.clone());
        info!("{log_prefix} Published {}", service.name());

        self.primary = Some(PublishedDevice { service, settings, suffix: PRIMARY_SUFFIX });
        self.state = BridgeState::Active;
        return Ok(());
    }

    /// Tear everything down. Calling it again does nothing.
    pub fn destroy(&mut self) {
        if self.state == BridgeState::Destroyed {
            return;
        }

        debug!("{} Destroying bridge in state {:?}", self.log_prefix(), self.state);
        if let Some(mut primary) = self.primary.take() {
            primary.service.unpublish();
        }

        if let SubMeters::Active(mut devices) = std::mem::replace(&mut self.sub_meters, SubMeters::Uninitialized) {
            for d in devices.iter_mut() {
                d.service.unpublish();
            }
        }

        self.state = BridgeState::Destroyed;
    }

    /// Negotiate one sub meter. On failure the bridge is destroyed and None returned.
    async fn negotiate_sub_meter(&mut self, identity: &DeviceIdentity, suffix: u8) -> Option<(u8, NegotiatedSettings, u32)> {
        let log_prefix = self.log_prefix();
        let settings = match self.negotiator.resolve(identity, suffix).await {
            Some(s) => s,
            None => {
                error!("{log_prefix} Settings for sub meter {suffix} unavailable, giving up");
                self.destroy();
                return None;
            }
        };

        /* Sub meter n shows up as instance + n */
        match settings.role_instance.instance.checked_add(suffix as u32) {
            Some(instance) => return Some((suffix, settings, instance)),
            None => {
                error!("{log_prefix} Instance {} of sub meter {suffix} is out of range, giving up", settings.role_instance.instance);
                self.destroy();
                return None;
            }
        }
    }

    /// Negotiate and publish all three sub meters, or destroy the bridge
    async fn setup_sub_meters(&mut self) {
        let identity = match &self.identity {
            Some(id) => id.clone(),
            None => return,
        };
        let kind = match &self.primary {
            Some(p) => p.settings.kind,
            None => return,
        };

        let [s2, s3, s4] = SUB_METER_SUFFIXES;
        let m2 = match self.negotiate_sub_meter(&identity, s2).await {
            Some(m) => m,
            None => return,
        };
        let m3 = match self.negotiate_sub_meter(&identity, s3).await {
            Some(m) => m,
            None => return,
        };
        let m4 = match self.negotiate_sub_meter(&identity, s4).await {
            Some(m) => m,
            None => return,
        };

        /* Something may have torn us down while we were waiting */
        if self.state != BridgeState::Active {
            return;
        }

        let log_prefix = self.log_prefix();
        let devices = [m2, m3, m4].map(|(suffix, settings, instance)| {
            let params = self.meter_params(&identity, &settings, suffix, kind, instance);
            let service = build_meter(&params, self.sink.clone());
            info!("{log_prefix} Published {}", service.name());
            PublishedDevice { service, settings, suffix }
        });
        self.sub_meters = SubMeters::Active(Box::new(devices));
    }

    /// Feed one notification from the device. Anything but NotifyStatus is ignored.
    pub async fn update(&mut self, data: &Value) {
        if self.state != BridgeState::Active {
            return;
        }

        if data.get("method").and_then(|m| m.as_str()) != Some("NotifyStatus") {
            return;
        }

        let params = match data.get("params") {
            Some(p) => p,
            None => return,
        };

        let kind = match &self.primary {
            Some(p) => p.settings.kind,
            None => return,
        };

        match kind {
            DeviceKind::Em => {
                if let Some(primary) = self.primary.as_mut() {
                    telemetry::apply_em(&mut primary.service, params);
                }
            }
            DeviceKind::Pm => {
                if let SubMeters::Uninitialized = self.sub_meters {
                    self.setup_sub_meters().await;
                }

                if self.state != BridgeState::Active {
                    return;
                }

                if let SubMeters::Active(devices) = &mut self.sub_meters {
                    for (i, d) in devices.iter_mut().enumerate() {
                        telemetry::apply_pm_channel(&mut d.service, i + 1, params);
                    }
                }
            }
        }
    }

    fn device_mut(&mut self, service: &str) -> Option<&mut PublishedDevice> {
        if let Some(p) = self.primary.as_mut() {
            if p.service.name() == service {
                return Some(p);
            }
        }

        match &mut self.sub_meters {
            SubMeters::Active(devices) => devices.iter_mut().find(|d| d.service.name() == service),
            SubMeters::Uninitialized => None,
        }
    }

    /// A write from the bus. Returns whether it was accepted, a refused write
    /// gets the old value published again.
    pub fn write(&mut self, service: &str, path: &str, value: &Value) -> bool {
        if self.state != BridgeState::Active {
            return false;
        }

        let log_prefix = self.log_prefix();
        let (handler, prefix) = {
            let device = match self.device_mut(service) {
                Some(d) => d,
                None => {
                    debug!("{log_prefix} Write for unknown service {service}");
                    return false;
                }
            };

            let item = match device.service.item(path) {
                Some(i) => i,
                None => {
                    debug!("{log_prefix} Write for unknown item {service}{path}");
                    return false;
                }
            };

            let handler = match item.handler {
                Some(h) if item.accepts(value) => h,
                _ => {
                    info!("{log_prefix} Refusing write of {value} to {service}{path}");
                    device.service.republish(path);
                    return false;
                }
            };

            (handler, device.settings.prefix.clone())
        };

        let accepted = match handler {
            WriteHandler::Role => self.role_changed(&prefix, value),
            WriteHandler::DeviceType => self.device_type_changed(value),
            WriteHandler::Position => self.position_changed(service, &prefix, value),
        };

        if !accepted {
            info!("{log_prefix} Refusing write of {value} to {service}{path}");
            if let Some(d) = self.device_mut(service) {
                d.service.republish(path);
            }
        }

        return accepted;
    }

    fn role_changed(&mut self, prefix: &str, value: &Value) -> bool {
        let role = match value.as_str() {
            Some(r) => r,
            None => return false,
        };

        if !self.negotiator.set_role_instance(prefix, role) {
            return false;
        }

        info!("{} Role of {prefix} changed to {role}, restarting", self.log_prefix());
        self.destroy();
        return true;
    }

    fn device_type_changed(&mut self, value: &Value) -> bool {
        let kind = match value.as_str() {
            Some(k) => k,
            None => return false,
        };

        /* The device type describes the physical device, it lives with the primary meter */
        let prefix = match &self.primary {
            Some(p) => p.settings.prefix.clone(),
            None => return false,
        };

        if !self.negotiator.set_device_kind(&prefix, kind) {
            return false;
        }

        info!("{} Device type changed to {kind}, restarting", self.log_prefix());
        self.destroy();
        return true;
    }

    fn position_changed(&mut self, service: &str, prefix: &str, value: &Value) -> bool {
        let position = match value.as_i64() {
            Some(p) => p,
            None => return false,
        };

        if !self.negotiator.set_position(prefix, position) {
            return false;
        }

        if let Some(d) = self.device_mut(service) {
            d.settings.position = position;
            d.service.set("/Position", position);
        }
        return true;
    }

    /// Settings changed behind our back
    pub fn settings_changed(&mut self, change: &SettingsChange) {
        if self.negotiator.is_topology_change(change) {
            info!("{} {} changed to {}, restarting", self.log_prefix(), change.path, change.value);
            self.destroy();
        }
    }

    fn handle_event(&mut self, event: BridgeEvent) -> Option<Value> {
        match event {
            BridgeEvent::Notification(v) => return Some(v),
            BridgeEvent::Write { service, path, value } => {
                self.write(&service, &path, &value);
                return None;
            }
        }
    }

    /// Process events until the bridge is destroyed
    pub async fn run(&mut self, events: &mut mpsc::Receiver<BridgeEvent>) {
        while self.state == BridgeState::Active {
            let step = tokio::select! {
                event = events.recv() => Step::Event(event),
                change = self.changes.recv() => Step::Change(change),
            };

            match step {
                Step::Event(None) => {
                    info!("{} Device connection gone", self.log_prefix());
                    self.destroy();
                }
                Step::Event(Some(event)) => {
                    if let Some(notification) = self.handle_event(event) {
                        self.update(&notification).await;
                    }
                }
                Step::Change(Ok(change)) => self.settings_changed(&change),
                Step::Change(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("{} Missed {n} settings changes, restarting to be safe", self.log_prefix());
                    self.destroy();
                }
                Step::Change(Err(broadcast::error::RecvError::Closed)) => {
                    error!("{} Settings authority went away", self.log_prefix());
                    self.destroy();
                }
            }
        }
    }
}
