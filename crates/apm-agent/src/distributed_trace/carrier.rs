//! Carrier traits for moving a trace payload across a transport.
//!
//! A carrier is whatever the transport uses for metadata: HTTP headers,
//! message properties, a JSON envelope. Keys are case-insensitive; the
//! implementations here store them lowercased.

use std::collections::HashMap;

use serde_json::Value;

/// Header carrying the encoded payload.
pub const PAYLOAD_HEADER: &str = "newrelic";

/// Writes key-value metadata into a carrier.
pub trait Injector {
    /// Sets `key` (stored lowercased) to `value`.
    fn set(&mut self, key: &str, value: String);
}

/// Reads key-value metadata from a carrier.
pub trait Extractor {
    /// Case-insensitive lookup of `key`.
    fn get(&self, key: &str) -> Option<&str>;

    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = HashMap::get(self, key) {
            return Some(value.as_str());
        }
        let lowered = key.to_lowercase();
        HashMap::get(self, &lowered)
            .or_else(|| {
                self.iter()
                    .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        HashMap::keys(self).map(String::as_str).collect()
    }
}

/// Only `Value::Object` carries metadata; other values are ignored.
impl Injector for Value {
    fn set(&mut self, key: &str, value: String) {
        if let Value::Object(map) = self {
            map.insert(key.to_lowercase(), Value::String(value));
        }
    }
}

impl Extractor for Value {
    fn get(&self, key: &str) -> Option<&str> {
        let Value::Object(map) = self else {
            return None;
        };
        map.get(&key.to_lowercase())
            .or_else(|| {
                map.iter()
                    .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        match self {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}
