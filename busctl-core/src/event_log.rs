// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Circular event logs shared with the on-board processor
//!
//! Boards without a command doorbell exchange interrupt causes through two
//! logs living in one host-I/O region: one written by the device and read by
//! the host, one written by the host and read by the device. Each log starts
//! with its GET, PUT and ERROR words followed by the entries. Cursors are
//! byte offsets from the start of the region.

use std::sync::Arc;

use log::{debug, error};
use spin::Mutex as SpinMutex;

use crate::error::{Error, Result};
use crate::io::{MemoryWindow, RegisterIo};
use crate::ring;

/// Channel `n` has a command or response ready
pub const fn event_channel(n: u8) -> u32 {
    1 << n
}

/// Auxiliary processor requests host attention
pub const EVENT_ASP_TO_HOST: u32 = 1 << 31;

/// Written to the ERROR word when the producer finds no free entry
pub const LOG_OVERFLOW: u32 = 0x1;

/// Software interrupt value for the device kick register
pub const KICK_SWINT: u32 = 1 << 3;

const GET: usize = 0x0;
const PUT: usize = 0x4;
const ERROR: usize = 0x8;
const ENTRIES: usize = 0xc;

/// Placement of one log within the host-I/O region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogLayout {
    /// Offset of the GET word from the start of the region
    pub control: u32,
    pub entry_size: u32,
    pub entry_count: u32,
}

impl EventLogLayout {
    pub const DEVICE_TO_HOST: Self = Self {
        control: 0x000,
        entry_size: 4,
        entry_count: 509,
    };

    pub const HOST_TO_DEVICE: Self = Self {
        control: 0x800,
        entry_size: 4,
        entry_count: 509,
    };

    /// Cursor value of the first entry
    pub const fn buffer_start(&self) -> u32 {
        self.control + ENTRIES as u32
    }

    pub const fn buffer_size(&self) -> u32 {
        self.entry_size * self.entry_count
    }

    /// Bytes from the start of the region to the end of this log
    pub const fn end(&self) -> usize {
        (self.buffer_start() + self.buffer_size()) as usize
    }

    fn contains(&self, cursor: u32) -> bool {
        cursor >= self.buffer_start() && cursor < self.buffer_start() + self.buffer_size()
    }
}

/// Register write that makes the device look at its log
pub struct Kick {
    pub regs: Arc<dyn RegisterIo>,
    pub offset: usize,
}

/// One direction of the host-I/O event log
pub struct EventLog {
    mem: Arc<dyn MemoryWindow>,
    region: usize,
    layout: EventLogLayout,
    kick: Option<Kick>,
    lock: SpinMutex<()>,
}

impl EventLog {
    /// Fails with `InvalidArgument` if the log does not fit the memory.
    pub fn new(
        mem: Arc<dyn MemoryWindow>,
        region: usize,
        layout: EventLogLayout,
        kick: Option<Kick>,
    ) -> Result<Self> {
        if layout.entry_size == 0 || layout.entry_count < 2 || region + layout.end() > mem.size() {
            return Err(Error::InvalidArgument);
        }
        if let Some(kick) = &kick {
            if kick.offset + 4 > kick.regs.io_size() {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(Self {
            mem,
            region,
            layout,
            kick,
            lock: SpinMutex::new(()),
        })
    }

    pub fn layout(&self) -> EventLogLayout {
        self.layout
    }

    fn word(&self, reg: usize) -> usize {
        self.region + self.layout.control as usize + reg
    }

    /// Empty the log and clear its error word
    pub fn reset(&self) {
        let _guard = self.lock.lock();
        let start = self.layout.buffer_start();
        self.mem.write_u32(self.word(GET), start);
        self.mem.write_u32(self.word(PUT), start);
        self.mem.write_u32(self.word(ERROR), 0);
    }

    pub fn error_word(&self) -> u32 {
        self.mem.read_u32(self.word(ERROR))
    }

    /// Number of entries waiting for the consumer
    pub fn pending(&self) -> u32 {
        let get = self.mem.read_u32(self.word(GET));
        let put = self.mem.read_u32(self.word(PUT));
        ring::available(self.layout.buffer_size(), put, get) / self.layout.entry_size
    }

    /// Producer side: append `event` and kick the device
    ///
    /// When no entry is free the overflow code is written to the ERROR word
    /// and `ResourceExhausted` is returned. The device is kicked either way
    /// so it drains what is already queued.
    pub fn push(&self, event: u32) -> Result<()> {
        let _guard = self.lock.lock();
        let layout = &self.layout;

        let get = self.mem.read_u32(self.word(GET));
        let mut put = self.mem.read_u32(self.word(PUT));
        if !layout.contains(get) || !layout.contains(put) {
            error!("event log cursors out of range: get={:#x} put={:#x}", get, put);
            return Err(Error::IoError);
        }

        let free_bytes = ring::free(layout.entry_size, layout.buffer_size(), put, get);
        let result = if free_bytes < layout.entry_size {
            self.mem.write_u32(self.word(ERROR), LOG_OVERFLOW);
            error!("no space left in host-io event log");
            Err(Error::ResourceExhausted)
        } else {
            self.mem.write_u32(self.region + put as usize, event);
            put = ring::increment_offset(put, layout.entry_size, layout.buffer_start(), layout.buffer_size());
            self.mem.write_u32(self.word(PUT), put);
            Ok(())
        };

        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        if let Some(kick) = &self.kick {
            kick.regs.write32(kick.offset, KICK_SWINT);
        }
        result
    }

    /// Consumer side: take the oldest entry, if any
    pub fn pop(&self) -> Result<Option<u32>> {
        let _guard = self.lock.lock();
        let layout = &self.layout;

        let get = self.mem.read_u32(self.word(GET));
        let put = self.mem.read_u32(self.word(PUT));
        if !layout.contains(get) || !layout.contains(put) {
            error!("event log cursors out of range: get={:#x} put={:#x}", get, put);
            return Err(Error::IoError);
        }
        if ring::available(layout.buffer_size(), put, get) < layout.entry_size {
            return Ok(None);
        }

        let event = self.mem.read_u32(self.region + get as usize);
        let get = ring::increment_offset(get, layout.entry_size, layout.buffer_start(), layout.buffer_size());
        self.mem.write_u32(self.word(GET), get);
        Ok(Some(event))
    }

    /// Consumer side: hand every queued entry to `handler` in log order
    pub fn drain<F>(&self, mut handler: F) -> Result<usize>
    where
        F: FnMut(u32),
    {
        let _guard = self.lock.lock();
        let layout = &self.layout;

        let mut get = self.mem.read_u32(self.word(GET));
        let put = self.mem.read_u32(self.word(PUT));
        if !layout.contains(get) || !layout.contains(put) {
            error!("event log cursors out of range: get={:#x} put={:#x}", get, put);
            return Err(Error::IoError);
        }

        let mut remaining = ring::available(layout.buffer_size(), put, get);
        debug!("event log get={:#x} put={:#x} entries={}", get, put, remaining / layout.entry_size);

        let mut count = 0;
        while remaining >= layout.entry_size {
            handler(self.mem.read_u32(self.region + get as usize));
            get = ring::increment_offset(get, layout.entry_size, layout.buffer_start(), layout.buffer_size());
            remaining -= layout.entry_size;
            count += 1;
        }
        self.mem.write_u32(self.word(GET), get);
        Ok(count)
    }
}
