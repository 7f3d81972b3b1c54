//! Errors raised while creating or accepting distributed trace payloads.
//!
//! All of them are non-fatal: the transaction carries on unlinked and the
//! failure is counted in a supportability metric.

use apm_metrics::constants::{
    DT_ACCEPT_EXCEPTION_METRIC, DT_ACCEPT_IGNORED_CREATE_BEFORE_ACCEPT_METRIC,
    DT_ACCEPT_IGNORED_MAJOR_VERSION_METRIC, DT_ACCEPT_IGNORED_MULTIPLE_METRIC,
    DT_ACCEPT_IGNORED_NULL_METRIC, DT_ACCEPT_IGNORED_UNTRUSTED_ACCOUNT_METRIC,
    DT_ACCEPT_PARSE_EXCEPTION_METRIC,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributedTraceError {
    #[error("distributed tracing is disabled")]
    Disabled,
    #[error("transaction is not active")]
    InactiveTransaction,
    #[error("payload is empty")]
    Null,
    #[error("cannot parse payload: {0}")]
    ParseError(String),
    #[error("cannot encode payload: {0}")]
    EncodeError(String),
    #[error("unsupported payload version {major}.{minor}")]
    UnsupportedVersion { major: u64, minor: u64 },
    #[error("payload from untrusted account {0}")]
    UntrustedAccount(String),
    #[error("transaction has already accepted a payload")]
    AlreadyAccepted,
    #[error("transaction has already created an outbound payload")]
    AcceptAfterCreate,
}

impl DistributedTraceError {
    /// Supportability metric counting this failure on the accept path.
    #[must_use]
    pub fn accept_metric(&self) -> &'static str {
        match self {
            DistributedTraceError::Null => DT_ACCEPT_IGNORED_NULL_METRIC,
            DistributedTraceError::ParseError(_) => DT_ACCEPT_PARSE_EXCEPTION_METRIC,
            DistributedTraceError::UnsupportedVersion { .. } => {
                DT_ACCEPT_IGNORED_MAJOR_VERSION_METRIC
            }
            DistributedTraceError::UntrustedAccount(_) => {
                DT_ACCEPT_IGNORED_UNTRUSTED_ACCOUNT_METRIC
            }
            DistributedTraceError::AlreadyAccepted => DT_ACCEPT_IGNORED_MULTIPLE_METRIC,
            DistributedTraceError::AcceptAfterCreate => {
                DT_ACCEPT_IGNORED_CREATE_BEFORE_ACCEPT_METRIC
            }
            DistributedTraceError::Disabled
            | DistributedTraceError::InactiveTransaction
            | DistributedTraceError::EncodeError(_) => DT_ACCEPT_EXCEPTION_METRIC,
        }
    }
}
