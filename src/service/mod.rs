/*
    A service is the tree of items one meter exposes on the bus.

    Items are kept locally and every change is pushed to an ItemSink, which is
    the MQTT connection in production and a recorder in the tests.
*/

pub mod schema;
pub mod units;

use std::collections::BTreeMap;
use std::sync::Arc;
use log::debug;
use serde_json::Value;

/// Render a numeric item value for display
pub type Formatter = fn(f64) -> String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Integer,
    Double,
    Text,
    TextArray,
}

/// The writable items are known up front, each maps to one handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHandler {
    Role,
    DeviceType,
    Position,
}

#[derive(Clone)]
pub struct Item {
    pub path: String,
    pub kind: ItemKind,
    pub value: Value,
    pub handler: Option<WriteHandler>,
    pub text: Option<Formatter>,
}

impl Item {
    pub fn new(path: &str, kind: ItemKind, value: Value) -> Self {
        return Item {
            path: path.to_string(),
            kind,
            value,
            handler: None,
            text: None,
        };
    }

    pub fn integer(path: &str, value: i64) -> Self {
        return Item::new(path, ItemKind::Integer, Value::from(value));
    }

    pub fn double(path: &str) -> Self {
        return Item::new(path, ItemKind::Double, Value::Null);
    }

    pub fn text(path: &str, value: &str) -> Self {
        return Item::new(path, ItemKind::Text, Value::from(value));
    }

    pub fn text_array(path: &str, values: &[&str]) -> Self {
        return Item::new(path, ItemKind::TextArray, Value::from(values.to_vec()));
    }

    pub fn with_text(mut self, formatter: Formatter) -> Self {
        self.text = Some(formatter);
        return self;
    }

    pub fn writeable(mut self, handler: WriteHandler) -> Self {
        self.handler = Some(handler);
        return self;
    }

    pub fn display(&self) -> String {
        match &self.value {
            Value::Null => "".to_string(),
            Value::String(s) => s.clone(),
            Value::Number(n) => match (self.text, n.as_f64()) {
                (Some(f), Some(v)) => f(v),
                _ => n.to_string(),
            },
            other => other.to_string(),
        }
    }

    /// Check that a value fits the item kind, null is fine for numeric items
    pub fn accepts(&self, value: &Value) -> bool {
        match self.kind {
            ItemKind::Integer => value.is_null() || value.is_i64() || value.is_u64(),
            ItemKind::Double => value.is_null() || value.is_number(),
            ItemKind::Text => value.is_string(),
            ItemKind::TextArray => value
                .as_array()
                .map(|a| a.iter().all(|v| v.is_string()))
                .unwrap_or(false),
        }
    }
}

/// Receiver of published item changes
pub trait ItemSink: Send + Sync {
    fn item_changed(&self, service: &str, path: &str, value: &Value, text: &str);
    fn service_removed(&self, service: &str, paths: &[String]);
}

pub struct Service {
    name: String,
    items: BTreeMap<String, Item>,
    sink: Arc<dyn ItemSink>,
    published: bool,
}

impl Service {
    pub fn new(name: String, sink: Arc<dyn ItemSink>) -> Self {
        return Service {
            name,
            items: BTreeMap::new(),
            sink,
            published: true,
        };
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn add_item(&mut self, item: Item) {
        if !self.published {
            return;
        }

        self.sink.item_changed(&self.name, &item.path, &item.value, &item.display());
        self.items.insert(item.path.clone(), item);
    }

    pub fn item(&self, path: &str) -> Option<&Item> {
        return self.items.get(path);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        return self.items.get(path).map(|i| &i.value);
    }

    pub fn handler_for(&self, path: &str) -> Option<WriteHandler> {
        return self.items.get(path).and_then(|i| i.handler);
    }

    pub fn paths(&self) -> Vec<String> {
        return self.items.keys().cloned().collect();
    }

    /// Update an item and publish the change. Writes to unknown paths or to an
    /// unpublished service are dropped and reported as false.
    pub fn set<V: Into<Value>>(&mut self, path: &str, value: V) -> bool {
        if !self.published {
            debug!("{} is unpublished, dropping {path}", self.name);
            return false;
        }

        let item = match self.items.get_mut(path) {
            Some(i) => i,
            None => {
                debug!("{} has no item {path}", self.name);
                return false;
            }
        };

        let value = value.into();
        if item.value == value {
            return true;
        }

        item.value = value;
        self.sink.item_changed(&self.name, path, &item.value, &item.display());
        return true;
    }

    /// Publish the current value again, used to show a rejected write was not applied
    pub fn republish(&self, path: &str) {
        if !self.published {
            return;
        }

        if let Some(item) = self.items.get(path) {
            self.sink.item_changed(&self.name, path, &item.value, &item.display());
        }
    }

    pub fn unpublish(&mut self) {
        if !self.published {
            return;
        }

        self.published = false;
        self.sink.service_removed(&self.name, &self.paths());
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.unpublish();
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkEvent {
        Changed(String, String, Value),
        Removed(String),
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<SinkEvent>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            return Arc::new(RecordingSink::default());
        }

        pub fn take(&self) -> Vec<SinkEvent> {
            return std::mem::take(&mut *self.events.lock().unwrap());
        }

        pub fn removed(&self) -> Vec<String> {
            return self.events.lock().unwrap().iter().filter_map(|e| match e {
                SinkEvent::Removed(s) => Some(s.clone()),
                _ => None,
            }).collect();
        }
    }

    impl ItemSink for RecordingSink {
        fn item_changed(&self, service: &str, path: &str, value: &Value, _text: &str) {
            self.events.lock().unwrap().push(SinkEvent::Changed(service.to_string(), path.to_string(), value.clone()));
        }

        fn service_removed(&self, service: &str, _paths: &[String]) {
            self.events.lock().unwrap().push(SinkEvent::Removed(service.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::*;
    use serde_json::json;

    #[test]
    fn test_set_publishes_changes_only() {
        let sink = RecordingSink::new();
        let mut s = Service::new("com.victronenergy.grid.test".to_string(), sink.clone());
        s.add_item(Item::double("/Ac/Power").with_text(units::watt));
        sink.take();

        assert!(s.set("/Ac/Power", 12.4));
        assert!(s.set("/Ac/Power", 12.4));
        assert_eq!(sink.take().len(), 1);
        assert_eq!(s.item("/Ac/Power").unwrap().display(), "12W");
        assert!(!s.set("/Ac/Nothing", 1));
    }

    #[test]
    fn test_unpublished_service_drops_writes() {
        let sink = RecordingSink::new();
        let mut s = Service::new("svc".to_string(), sink.clone());
        s.add_item(Item::integer("/Connected", 1));
        s.unpublish();
        s.unpublish();
        assert_eq!(sink.removed(), vec!["svc".to_string()]);

        sink.take();
        assert!(!s.set("/Connected", 0));
        s.add_item(Item::integer("/Other", 1));
        s.republish("/Connected");
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_accepts_by_kind() {
        let i = Item::integer("/Position", 0);
        assert!(i.accepts(&json!(2)));
        assert!(!i.accepts(&json!(1.5)));
        assert!(!i.accepts(&json!("1")));

        let t = Item::text("/Role", "grid");
        assert!(t.accepts(&json!("acload")));
        assert!(!t.accepts(&json!(3)));

        let a = Item::text_array("/AllowedRoles", &["grid"]);
        assert!(a.accepts(&json!(["grid", "genset"])));
        assert!(!a.accepts(&json!([1])));
    }

    #[test]
    fn test_drop_unpublishes() {
        let sink = RecordingSink::new();
        {
            let _s = Service::new("svc".to_string(), sink.clone());
        }
        assert_eq!(sink.removed(), vec!["svc".to_string()]);
    }
}
