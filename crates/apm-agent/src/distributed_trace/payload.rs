//! Wire format of a distributed trace payload.
//!
//! ```text
//! {"v":[0,1],"d":{"ty":"App","ac":"33","ap":"5043","tk":"33","tr":"..",
//!  "id":"..","tx":"..","sa":true,"pr":1.234567,"ti":1700000000000}}
//! ```
//!
//! Payloads travel either as that JSON or base64-encoded for HTTP headers.
//! Decoding checks the major version before anything else and refuses
//! anything newer than it understands.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DistributedTraceError;

pub const SUPPORTED_MAJOR_VERSION: u64 = 0;
pub const SUPPORTED_MINOR_VERSION: u64 = 1;

/// Kind of agent that produced a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum PayloadType {
    App,
    Browser,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PayloadData {
    #[serde(rename = "ty")]
    pub(crate) payload_type: PayloadType,
    #[serde(rename = "ac")]
    pub(crate) account_id: String,
    #[serde(rename = "ap")]
    pub(crate) application_id: String,
    #[serde(rename = "tk", skip_serializing_if = "Option::is_none")]
    pub(crate) trusted_account_key: Option<String>,
    #[serde(rename = "tr")]
    pub(crate) trace_id: String,
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    pub(crate) span_id: Option<String>,
    #[serde(rename = "tx", skip_serializing_if = "Option::is_none")]
    pub(crate) transaction_id: Option<String>,
    #[serde(rename = "sa", skip_serializing_if = "Option::is_none")]
    pub(crate) sampled: Option<bool>,
    #[serde(rename = "pr", skip_serializing_if = "Option::is_none")]
    pub(crate) priority: Option<f32>,
    #[serde(rename = "ti")]
    pub(crate) timestamp_ms: u64,
}

/// Immutable trace context exchanged between services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTracePayload {
    #[serde(rename = "v")]
    version: [u64; 2],
    #[serde(rename = "d")]
    data: PayloadData,
}

impl DistributedTracePayload {
    pub(crate) fn new(data: PayloadData) -> Self {
        Self {
            version: [SUPPORTED_MAJOR_VERSION, SUPPORTED_MINOR_VERSION],
            data,
        }
    }

    /// Decodes a payload from JSON or from base64-encoded JSON.
    pub fn decode(text: &str) -> Result<Self, DistributedTraceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DistributedTraceError::Null);
        }

        let json = if text.starts_with('{') {
            Cow::Borrowed(text)
        } else {
            let bytes = STANDARD
                .decode(text)
                .map_err(|e| DistributedTraceError::ParseError(e.to_string()))?;
            Cow::Owned(
                String::from_utf8(bytes)
                    .map_err(|e| DistributedTraceError::ParseError(e.to_string()))?,
            )
        };

        let value: Value = serde_json::from_str(&json)
            .map_err(|e| DistributedTraceError::ParseError(e.to_string()))?;
        let version = value
            .get("v")
            .and_then(Value::as_array)
            .ok_or_else(|| DistributedTraceError::ParseError("missing version".to_string()))?;
        let major = version.first().and_then(Value::as_u64).ok_or_else(|| {
            DistributedTraceError::ParseError("missing major version".to_string())
        })?;
        let minor = version.get(1).and_then(Value::as_u64).unwrap_or_default();
        if major > SUPPORTED_MAJOR_VERSION {
            return Err(DistributedTraceError::UnsupportedVersion { major, minor });
        }

        let payload: Self = serde_json::from_value(value)
            .map_err(|e| DistributedTraceError::ParseError(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), DistributedTraceError> {
        let missing = |field: &str| {
            Err(DistributedTraceError::ParseError(format!(
                "missing required field `{field}`"
            )))
        };
        if self.data.account_id.is_empty() {
            return missing("ac");
        }
        if self.data.application_id.is_empty() {
            return missing("ap");
        }
        if self.data.trace_id.is_empty() {
            return missing("tr");
        }
        if self.data.timestamp_ms == 0 {
            return missing("ti");
        }
        if self.data.span_id.is_none() && self.data.transaction_id.is_none() {
            return missing("id` or `tx");
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Base64 of the JSON form, safe to place in an HTTP header.
    pub fn encode_http_safe(&self) -> Result<String, serde_json::Error> {
        Ok(STANDARD.encode(self.to_json()?))
    }

    #[must_use]
    pub fn version(&self) -> (u64, u64) {
        (self.version[0], self.version[1])
    }

    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        self.data.payload_type
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.data.account_id
    }

    #[must_use]
    pub fn application_id(&self) -> &str {
        &self.data.application_id
    }

    #[must_use]
    pub fn trusted_account_key(&self) -> Option<&str> {
        self.data.trusted_account_key.as_deref()
    }

    /// Key checked against the trusted account: `tk` when present, otherwise
    /// the account id.
    #[must_use]
    pub fn effective_trust_key(&self) -> &str {
        self.trusted_account_key().unwrap_or(&self.data.account_id)
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.data.trace_id
    }

    #[must_use]
    pub fn span_id(&self) -> Option<&str> {
        self.data.span_id.as_deref()
    }

    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.data.transaction_id.as_deref()
    }

    #[must_use]
    pub fn sampled(&self) -> Option<bool> {
        self.data.sampled
    }

    #[must_use]
    pub fn priority(&self) -> Option<f32> {
        self.data.priority
    }

    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.data.timestamp_ms
    }
}
