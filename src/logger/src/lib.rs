// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics for the service module workspace.
//!
//! Crates log through the re-exported `log` macros; output goes through the
//! [`LOGGER`] singleton once it is initialized. Counters live in the
//! [`METRICS`] singleton and can be flushed as JSON at any time.

mod logger;
mod metrics;

pub use log::{debug, error, info, trace, warn, Level};

pub use crate::logger::{Logger, LOGGER};
pub use crate::metrics::{
    HsmMetrics, IncMetric, IrqfdMetrics, MemoryMetrics, SharedIncMetric, METRICS,
};
