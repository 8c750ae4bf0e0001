// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Device configuration
//!
//! Defaults match the shipped boards; every field can be overridden from
//! `BUSCTL_*` environment variables by [`DeviceConfig::from_env`].

use std::time::Duration;

use crate::event_log::EventLogLayout;

/// Upper bound for the number of AIO queues per device
pub const MAX_AIO_QUEUES_LIMIT: usize = 16;

/// How commands are announced to the on-board processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMode {
    /// Write `1 << channel` to a doorbell register
    Doorbell,
    /// Push `1 << channel` into the host-to-device event log
    EventLog,
}

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Bound for one command round trip
    pub channel_timeout: Duration,
    /// Bound for one blocking bulk DMA transfer
    pub dma_timeout: Duration,
    /// Number of AIO queue slots (ids `1..=max_aio_queues`)
    pub max_aio_queues: usize,
    /// Capacity of the top-half to bottom-half event hand-off
    pub deferred_queue_depth: usize,
    /// Command signalling mechanism
    pub signal_mode: SignalMode,
    /// Offset of the host interrupt event register
    pub event_register: usize,
    /// Offset of the command doorbell register
    pub doorbell_register: usize,
    /// Register kicked after injecting a host-to-device event
    pub event_kick_register: usize,
    /// Offset of the event log region in host-I/O memory
    pub event_log_base: usize,
    /// Device-to-host event log
    pub device_log: EventLogLayout,
    /// Host-to-device event log
    pub host_log: EventLogLayout,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            channel_timeout: Duration::from_millis(10_000),
            dma_timeout: Duration::from_millis(5_000),
            max_aio_queues: 4,
            deferred_queue_depth: 512,
            signal_mode: SignalMode::Doorbell,
            event_register: 0x40,
            doorbell_register: 0x44,
            event_kick_register: 0x74,
            event_log_base: 0x1_0000,
            device_log: EventLogLayout::DEVICE_TO_HOST,
            host_log: EventLogLayout::HOST_TO_DEVICE,
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `BUSCTL_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("BUSCTL_CHANNEL_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.channel_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("BUSCTL_DMA_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.dma_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("BUSCTL_MAX_AIO_QUEUES") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_aio_queues = n.clamp(1, MAX_AIO_QUEUES_LIMIT);
            }
        }

        if let Ok(val) = std::env::var("BUSCTL_DEFERRED_QUEUE_DEPTH") {
            if let Ok(n) = val.parse::<usize>() {
                config.deferred_queue_depth = n.max(1);
            }
        }

        if let Ok(val) = std::env::var("BUSCTL_SIGNAL_MODE") {
            config.signal_mode = match val.to_lowercase().as_str() {
                "eventlog" | "event-log" | "asp" => SignalMode::EventLog,
                _ => SignalMode::Doorbell,
            };
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.channel_timeout, Duration::from_secs(10));
        assert_eq!(config.dma_timeout, Duration::from_secs(5));
        assert_eq!(config.max_aio_queues, 4);
        assert_eq!(config.signal_mode, SignalMode::Doorbell);
    }
}
