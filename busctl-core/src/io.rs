// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Register and shared-memory access
//!
//! The controller reaches the board through two kinds of mapped windows:
//! 32-bit registers and byte-addressed shared memory holding the command
//! areas and event logs. Both are traits so the core can run on top of a
//! real BAR mapping or the in-memory backends in [`crate::sim`].

use std::ptr;
use std::sync::Arc;

use crate::error::{Error, Result};

/// 32-bit register access over a mapped I/O window
pub trait RegisterIo: Send + Sync {
    /// Size of the register window in bytes
    fn io_size(&self) -> usize;
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Byte-addressed memory shared with the device
pub trait MemoryWindow: Send + Sync {
    fn size(&self) -> usize;
    fn read_bytes(&self, offset: usize, buf: &mut [u8]);
    fn write_bytes(&self, offset: usize, data: &[u8]);

    /// Little-endian word read
    fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read_bytes(offset, &mut word);
        u32::from_le_bytes(word)
    }

    /// Little-endian word write
    fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

/// Memory-mapped BAR
///
/// Registers are accessed with volatile 32-bit operations, shared memory
/// with volatile byte copies.
pub struct Mmio {
    base: *mut u8,
    size: usize,
}

// SAFETY: Mmio only performs volatile accesses to device memory that stays
// mapped for the lifetime of the value. Concurrent accesses are serialized
// by the owners of each register or window.
unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `size` bytes that remains
    /// valid and is not unmapped while the returned value is alive.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            "mmio access {:#x}+{} outside window of {} bytes",
            offset,
            len,
            self.size
        );
    }
}

impl RegisterIo for Mmio {
    fn io_size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

impl MemoryWindow for Mmio {
    fn size(&self) -> usize {
        self.size
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        self.check(offset, buf.len());
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { ptr::read_volatile(self.base.add(offset + i)) };
        }
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        for (i, byte) in data.iter().enumerate() {
            unsafe { ptr::write_volatile(self.base.add(offset + i), *byte) };
        }
    }
}

/// Bounded sub-range of a shared memory window
#[derive(Clone)]
pub struct Window {
    mem: Arc<dyn MemoryWindow>,
    offset: usize,
    size: usize,
}

impl Window {
    /// Fails with `InvalidArgument` when the range does not fit the memory.
    pub fn new(mem: Arc<dyn MemoryWindow>, offset: usize, size: usize) -> Result<Self> {
        match offset.checked_add(size) {
            Some(end) if end <= mem.size() => Ok(Self { mem, offset, size }),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.size, "window read out of bounds");
        self.mem.read_bytes(self.offset + offset, buf);
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size, "window write out of bounds");
        self.mem.write_bytes(self.offset + offset, data);
    }
}
