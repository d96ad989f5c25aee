//! Request-scoped key/value bag.
//!
//! A [`Context`] is created once per unit of work (HTTP/1.1 request, HTTP/2
//! session, WebSocket upgrade) and passed explicitly through matchers, hooks,
//! handlers, relays and error handlers. Clones share the same storage.
//!
//! HTTP/2 stream contexts are derived with [`Context::child`]: the child starts
//! with a copy of the session fields, and writes to the child are not visible
//! to the session.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous one.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    /// Store any serializable value. Values that fail to serialize are stored as `null`.
    pub fn insert_as<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Option<Value> {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.values.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Read a value back into a typed form.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Shallow copy of the current fields into an independent context.
    pub fn child(&self) -> Context {
        let values = DashMap::with_capacity(self.values.len());
        for entry in self.values.iter() {
            values.insert(entry.key().clone(), entry.value().clone());
        }
        Context {
            values: Arc::new(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let ctx = Context::new();
        let other = ctx.clone();
        other.insert("user", "alice");
        assert_eq!(ctx.get("user"), Some(Value::from("alice")));
    }

    #[test]
    fn child_sees_parent_fields_but_not_vice_versa() {
        let session = Context::new();
        session.insert("session", 1);

        let stream = session.child();
        stream.insert("stream", 2);

        assert_eq!(stream.get_as::<u32>("session"), Some(1));
        assert!(!session.contains("stream"));
    }

    #[test]
    fn typed_round_trip() {
        let ctx = Context::new();
        ctx.insert_as("ids", &vec![1u8, 2, 3]);
        assert_eq!(ctx.get_as::<Vec<u8>>("ids"), Some(vec![1, 2, 3]));
        assert_eq!(ctx.get_as::<String>("ids"), None);
        assert!(ctx.remove("ids").is_some());
        assert!(ctx.is_empty());
    }
}
