// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Device counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated from caller and interrupt context
#[derive(Default)]
pub struct DeviceStats {
    interrupts: AtomicU64,
    foreign_interrupts: AtomicU64,
    commands_issued: AtomicU64,
    command_timeouts: AtomicU64,
    command_errors: AtomicU64,
    dma_transfers: AtomicU64,
    dma_errors: AtomicU64,
    spurious_dma: AtomicU64,
    aio_submitted: AtomicU64,
    aio_completed: AtomicU64,
    event_log_overflows: AtomicU64,
    dropped_events: AtomicU64,
}

/// Point-in-time copy of [`DeviceStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub interrupts: u64,
    /// Interrupts on a shared line that carried none of our bits
    pub foreign_interrupts: u64,
    pub commands_issued: u64,
    pub command_timeouts: u64,
    pub command_errors: u64,
    pub dma_transfers: u64,
    pub dma_errors: u64,
    /// DMA completions with no outstanding transfer
    pub spurious_dma: u64,
    pub aio_submitted: u64,
    pub aio_completed: u64,
    /// Commands that found the host-to-device event log full
    pub event_log_overflows: u64,
    /// DMA statuses lost because the bottom half fell behind
    pub dropped_events: u64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_interrupt(&self, ours: bool) {
        if ours {
            self.interrupts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.foreign_interrupts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_command(&self, timed_out: bool, failed: bool) {
        self.commands_issued.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.command_timeouts.fetch_add(1, Ordering::Relaxed);
        } else if failed {
            self.command_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dma(&self, success: bool) {
        self.dma_transfers.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.dma_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_spurious_dma(&self) {
        self.spurious_dma.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aio_submitted(&self, count: usize) {
        self.aio_submitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_aio_completed(&self, count: usize) {
        self.aio_completed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_event_log_overflow(&self) {
        self.event_log_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsReport {
        StatsReport {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            foreign_interrupts: self.foreign_interrupts.load(Ordering::Relaxed),
            commands_issued: self.commands_issued.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            command_errors: self.command_errors.load(Ordering::Relaxed),
            dma_transfers: self.dma_transfers.load(Ordering::Relaxed),
            dma_errors: self.dma_errors.load(Ordering::Relaxed),
            spurious_dma: self.spurious_dma.load(Ordering::Relaxed),
            aio_submitted: self.aio_submitted.load(Ordering::Relaxed),
            aio_completed: self.aio_completed.load(Ordering::Relaxed),
            event_log_overflows: self.event_log_overflows.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_accounting() {
        let stats = DeviceStats::new();
        stats.record_command(false, false);
        stats.record_command(true, true);
        stats.record_command(false, true);
        let report = stats.snapshot();
        assert_eq!(report.commands_issued, 3);
        assert_eq!(report.command_timeouts, 1);
        assert_eq!(report.command_errors, 1);
    }
}
