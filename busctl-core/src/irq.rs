// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Interrupt cause bits and deferred work
//!
//! The top half runs in restricted context and only reads and acknowledges
//! the event register, bumps atomic counters and schedules the bottom half.
//! [`DeferredWork`] is that bottom half: a dedicated worker thread woken by
//! a non-blocking `schedule`. [`Scheduler`] is a detached handle for the
//! top half that needs no lock to reach the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, Thread};

use bitflags::bitflags;
use log::{debug, error};

use crate::error::{Error, Result};

/// Number of bus interface units with their own interrupt line
pub const MAX_BIU: usize = 4;

bitflags! {
    /// Host interrupt event register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqEvents: u32 {
        const CHANNELS = 0x0000_00ff;
        const BIU_1 = 1 << 8;
        const BIU_2 = 1 << 9;
        const BIU_3 = 1 << 10;
        const BIU_4 = 1 << 11;
        const DMA_DONE = 1 << 16;
        const DMA_ERROR = 1 << 17;
        /// Entries waiting in the device-to-host event log
        const EVENT_LOG = 1 << 18;
        const ASP = 1 << 19;
    }
}

impl IrqEvents {
    pub const BIU: [IrqEvents; MAX_BIU] = [Self::BIU_1, Self::BIU_2, Self::BIU_3, Self::BIU_4];

    /// Channel bits as a plain mask
    pub fn channel_mask(self) -> u32 {
        (self & Self::CHANNELS).bits()
    }
}

struct Shared {
    scheduled: AtomicBool,
    running: AtomicBool,
    runs: AtomicU64,
}

/// Bottom half worker
///
/// Multiple `schedule` calls before the worker gets to run collapse into a
/// single run, like a tasklet.
pub struct DeferredWork {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredWork {
    pub fn spawn<F>(name: &str, work: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            scheduled: AtomicBool::new(false),
            running: AtomicBool::new(true),
            runs: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("{} started", thread::current().name().unwrap_or("bottom half"));
                while worker.running.load(Ordering::Acquire) {
                    if worker.scheduled.swap(false, Ordering::AcqRel) {
                        work();
                        worker.runs.fetch_add(1, Ordering::Relaxed);
                    } else {
                        thread::park();
                    }
                }
            })
            .map_err(|err| {
                error!("failed to spawn {}: {}", name, err);
                Error::ResourceExhausted
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Request a run; never blocks
    pub fn schedule(&self) {
        self.shared.scheduled.store(true, Ordering::Release);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Handle that schedules this worker without borrowing it
    ///
    /// `None` once the worker has been stopped.
    pub fn scheduler(&self) -> Option<Scheduler> {
        let handle = self.handle.as_ref()?;
        Some(Scheduler {
            shared: Arc::clone(&self.shared),
            thread: handle.thread().clone(),
        })
    }

    /// Completed runs so far
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(Ordering::Relaxed)
    }

    /// Stop the worker after its current run
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.thread().unpark();
        // the last owner may be the worker itself
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

/// Lock-free trigger for a [`DeferredWork`]
///
/// Scheduling after the worker stopped is a no-op.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Thread,
}

impl Scheduler {
    pub fn schedule(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        self.shared.scheduled.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        self.stop();
    }
}
