// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use serde::{Serialize, Serializer};

lazy_static! {
    /// Static instance holding the service module counters.
    pub static ref METRICS: HsmMetrics = HsmMetrics::default();
}

/// A monotonically increasing counter.
pub trait IncMetric {
    fn inc(&self) {
        self.add(1);
    }
    fn add(&self, value: u64);
    fn count(&self) -> u64;
}

/// Counter safe to increment from any thread, including the dispatcher.
#[derive(Default)]
pub struct SharedIncMetric(AtomicU64);

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.count())
    }
}

/// Hugepage map registry counters.
#[derive(Default, Serialize)]
pub struct MemoryMetrics {
    /// Successfully completed `map_guest` requests.
    pub map_requests: SharedIncMetric,
    /// Failed `map_guest` requests.
    pub map_fails: SharedIncMetric,
    /// Hugepages pinned since start.
    pub pages_pinned: SharedIncMetric,
    /// Region batches flushed to the hypervisor.
    pub region_batches: SharedIncMetric,
}

/// IRQFD subsystem counters.
#[derive(Default, Serialize)]
pub struct IrqfdMetrics {
    pub assigns: SharedIncMetric,
    pub deassigns: SharedIncMetric,
    /// MSIs injected from the dispatcher and the assign-time pending check.
    pub injections: SharedIncMetric,
    /// Injection hypercalls that failed and were dropped.
    pub injection_fails: SharedIncMetric,
    /// Bindings torn down by the deferred shutdown worker.
    pub hangup_shutdowns: SharedIncMetric,
}

#[derive(Default, Serialize)]
pub struct HsmMetrics {
    pub memory: MemoryMetrics,
    pub irqfd: IrqfdMetrics,
}

impl HsmMetrics {
    /// Writes the current counters as one JSON line.
    pub fn write_json<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        let json = serde_json::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        writeln!(dest, "{}", json)
    }
}
