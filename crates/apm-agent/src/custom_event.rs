//! Custom events recorded through the API.
//!
//! Events are queued until collected with [`CustomEventBuffer::get_batch`].
//! The queue is bounded; once full, new events are dropped and counted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::transaction::{AttributeValue, MAX_ATTRIBUTES, MAX_ATTRIBUTE_KEY_BYTES};

/// Events kept between collections.
pub const MAX_CUSTOM_EVENTS: usize = 10_000;

/// Longest event type accepted, in bytes.
pub const MAX_EVENT_TYPE_BYTES: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustomEventError {
    #[error("event type is empty")]
    EmptyType,
    #[error("event type is {0} bytes long")]
    TypeTooLong(usize),
    #[error("event type {0:?} contains characters other than letters, digits, spaces, '_' or ':'")]
    InvalidType(String),
    #[error("event has {0} attributes")]
    TooManyAttributes(usize),
    #[error("attribute key is {0} bytes long")]
    InvalidAttributeKey(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp_ms: u64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl CustomEvent {
    pub fn new(
        event_type: &str,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> Result<Self, CustomEventError> {
        validate_type(event_type)?;
        if attributes.len() > MAX_ATTRIBUTES {
            return Err(CustomEventError::TooManyAttributes(attributes.len()));
        }
        if let Some(key) = attributes
            .keys()
            .find(|key| key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_BYTES)
        {
            return Err(CustomEventError::InvalidAttributeKey(key.len()));
        }
        Ok(Self {
            event_type: event_type.to_string(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            attributes,
        })
    }
}

fn validate_type(event_type: &str) -> Result<(), CustomEventError> {
    if event_type.is_empty() {
        return Err(CustomEventError::EmptyType);
    }
    if event_type.len() > MAX_EVENT_TYPE_BYTES {
        return Err(CustomEventError::TypeTooLong(event_type.len()));
    }
    let valid = event_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | ':'));
    if !valid {
        return Err(CustomEventError::InvalidType(event_type.to_string()));
    }
    Ok(())
}

pub struct CustomEventBuffer {
    queue: Mutex<Vec<CustomEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for CustomEventBuffer {
    fn default() -> Self {
        Self::new(MAX_CUSTOM_EVENTS)
    }
}

impl CustomEventBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::with_capacity(capacity.min(128))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues an event. Returns `false` when the buffer is full.
    pub fn add(&self, event: CustomEvent) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping custom event {}: {} events already buffered",
                event.event_type, self.capacity
            );
            return false;
        }
        queue.push(event);
        true
    }

    /// Takes every buffered event, oldest first.
    pub fn get_batch(&self) -> Vec<CustomEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events rejected because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
