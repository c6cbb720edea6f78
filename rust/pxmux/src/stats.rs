//! Per-slot connection counters and their statsd-style gauges.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct SlotCounters {
    physical: AtomicU64,
    virtual_: AtomicU64,
    reconnects: AtomicU64,
}

/// Counters shared by the pool and every physical connection driver.
#[derive(Debug)]
pub struct MuxStats {
    slots: Box<[SlotCounters]>,
}

/// Point-in-time copy of one slot's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotStats {
    pub slot: usize,
    /// Physical connections currently established, summed over servers.
    pub physical_connections: u64,
    /// Virtual connections currently tracked, summed over servers.
    pub virtual_connections: u64,
    /// Reconnects scheduled after a failure or teardown, ever.
    pub reconnects_scheduled: u64,
}

/// Aggregates of virtual connections across slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSummary {
    pub min_virtual: u64,
    pub max_virtual: u64,
    pub average_virtual: u64,
    pub total_virtual: u64,
    pub total_physical: u64,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(1))
    });
}

impl MuxStats {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| SlotCounters::default()).collect(),
        }
    }

    fn counters(&self, slot: usize) -> Option<&SlotCounters> {
        self.slots.get(slot)
    }

    pub(crate) fn physical_opened(&self, slot: usize) {
        if let Some(c) = self.counters(slot) {
            c.physical.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn physical_closed(&self, slot: usize) {
        if let Some(c) = self.counters(slot) {
            decrement(&c.physical);
        }
    }

    pub(crate) fn virtual_opened(&self, slot: usize) {
        if let Some(c) = self.counters(slot) {
            c.virtual_.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn virtual_closed(&self, slot: usize) {
        if let Some(c) = self.counters(slot) {
            decrement(&c.virtual_);
        }
    }

    pub(crate) fn reconnect_scheduled(&self, slot: usize) {
        if let Some(c) = self.counters(slot) {
            c.reconnects.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn slot(&self, slot: usize) -> Option<SlotStats> {
        let c = self.counters(slot)?;
        Some(SlotStats {
            slot,
            physical_connections: c.physical.load(Ordering::Acquire),
            virtual_connections: c.virtual_.load(Ordering::Acquire),
            reconnects_scheduled: c.reconnects.load(Ordering::Acquire),
        })
    }

    pub fn snapshot(&self) -> Vec<SlotStats> {
        (0..self.slots.len()).filter_map(|i| self.slot(i)).collect()
    }

    pub fn summary(&self) -> StatsSummary {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return StatsSummary::default();
        }
        let total_virtual: u64 = snapshot.iter().map(|s| s.virtual_connections).sum();
        StatsSummary {
            min_virtual: snapshot.iter().map(|s| s.virtual_connections).min().unwrap_or(0),
            max_virtual: snapshot.iter().map(|s| s.virtual_connections).max().unwrap_or(0),
            average_virtual: total_virtual / snapshot.len() as u64,
            total_virtual,
            total_physical: snapshot.iter().map(|s| s.physical_connections).sum(),
        }
    }

    /// Gauges in the naming the monitoring side expects.
    pub fn gauges(&self) -> Vec<(String, u64)> {
        let mut out = Vec::with_capacity(self.slots.len() * 2 + 5);
        for s in self.snapshot() {
            out.push((
                format!("mux.iop{}.virtualConnectionsTotal", s.slot),
                s.virtual_connections,
            ));
            out.push((
                format!("mux.iop{}.physicalConnectionsTotal", s.slot),
                s.physical_connections,
            ));
        }
        let summary = self.summary();
        out.push(("mux.virtualConnectionsMinimum".into(), summary.min_virtual));
        out.push(("mux.virtualConnectionsMaximum".into(), summary.max_virtual));
        // Spelled as existing dashboards expect, misspelling included.
        out.push((
            "mux.virtualConnectionsAvergage".into(),
            summary.average_virtual,
        ));
        out.push(("mux.physicalConnectionsTotal".into(), summary.total_physical));
        out.push(("mux.TotalVirtualConnections".into(), summary.total_virtual));
        out
    }
}
