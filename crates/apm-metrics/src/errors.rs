// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while building an aggregator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Creation {
    #[error("max contexts must be greater than zero")]
    Contexts,
}

/// Errors raised while inserting into an aggregator buffer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Insert {
    #[error("metric context limit of {0} reached")]
    Overflow(usize),
}
