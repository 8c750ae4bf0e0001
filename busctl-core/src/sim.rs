// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Simulated board resources
//!
//! In-memory stand-ins for the BAR windows, the OS page pinning layer and
//! the DMA engine. They back the unit and integration tests and allow
//! bring-up of the protocol layer without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use spin::Mutex as SpinMutex;

use crate::dma::{DmaBuffer, DmaDirection, DmaPlatform, DmaSegment, PAGE_SIZE, PageFrame, SgEntry};
use crate::dma_token::DmaEngine;
use crate::error::{Error, Result};
use crate::io::{MemoryWindow, RegisterIo};

/// Kind of a shared memory access reported to an access hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { offset: usize, len: usize },
    Write { offset: usize, len: usize },
}

type AccessHook = Arc<dyn Fn(Access) + Send + Sync>;
type WriteHook = Arc<dyn Fn(usize, u32) + Send + Sync>;

/// Byte-addressed memory standing in for a BAR window
pub struct SharedMemory {
    bytes: Mutex<Vec<u8>>,
    hook: SpinMutex<Option<AccessHook>>,
}

impl SharedMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
            hook: SpinMutex::new(None),
        }
    }

    /// Observe every access after it happened
    pub fn set_access_hook<F>(&self, hook: F)
    where
        F: Fn(Access) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    fn notify(&self, access: Access) {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(access);
        }
    }
}

impl MemoryWindow for SharedMemory {
    fn size(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes.lock()[offset..offset + buf.len()]);
        self.notify(Access::Read { offset, len: buf.len() });
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.bytes.lock()[offset..offset + data.len()].copy_from_slice(data);
        self.notify(Access::Write { offset, len: data.len() });
    }
}

/// 32-bit register file
///
/// Registers flagged write-one-to-clear behave like interrupt status
/// registers: writing a value clears the bits set in it.
pub struct SimRegisters {
    regs: Vec<AtomicU32>,
    w1c: Vec<AtomicBool>,
    hook: SpinMutex<Option<WriteHook>>,
}

impl SimRegisters {
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(4);
        Self {
            regs: (0..words).map(|_| AtomicU32::new(0)).collect(),
            w1c: (0..words).map(|_| AtomicBool::new(false)).collect(),
            hook: SpinMutex::new(None),
        }
    }

    pub fn set_write_one_to_clear(&self, offset: usize) {
        self.w1c[offset / 4].store(true, Ordering::SeqCst);
    }

    /// Called after every host write with the offset and the value written
    pub fn set_write_hook<F>(&self, hook: F)
    where
        F: Fn(usize, u32) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Device side: set bits in a register without triggering the hook
    pub fn raise(&self, offset: usize, bits: u32) {
        self.regs[offset / 4].fetch_or(bits, Ordering::SeqCst);
    }

    /// Device side: current value without side effects
    pub fn peek(&self, offset: usize) -> u32 {
        self.regs[offset / 4].load(Ordering::SeqCst)
    }
}

impl RegisterIo for SimRegisters {
    fn io_size(&self) -> usize {
        self.regs.len() * 4
    }

    fn read32(&self, offset: usize) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        let index = offset / 4;
        if self.w1c[index].load(Ordering::SeqCst) {
            self.regs[index].fetch_and(!value, Ordering::SeqCst);
        } else {
            self.regs[index].store(value, Ordering::SeqCst);
        }
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(offset, value);
        }
    }
}

const SIM_PHYS_BASE: u64 = 0x8000_0000;

/// Page pinning and mapping without an IOMMU
///
/// Physical addresses are derived from the virtual page number, either
/// contiguous or with a one page gap between neighbours.
pub struct SimPlatform {
    scattered: bool,
    pinned: Mutex<HashMap<u64, usize>>,
    dirty: AtomicUsize,
    mappings: AtomicUsize,
    pin_limit: AtomicUsize,
    fail_map: AtomicBool,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    /// Physically contiguous pages
    pub fn new() -> Self {
        Self {
            scattered: false,
            pinned: Mutex::new(HashMap::new()),
            dirty: AtomicUsize::new(0),
            mappings: AtomicUsize::new(0),
            pin_limit: AtomicUsize::new(usize::MAX),
            fail_map: AtomicBool::new(false),
        }
    }

    /// No two pages physically adjacent
    pub fn scattered() -> Self {
        Self {
            scattered: true,
            ..Self::new()
        }
    }

    /// Let at most `pages` pins of one request succeed
    pub fn fail_pin_after(&self, pages: usize) {
        self.pin_limit.store(pages, Ordering::SeqCst);
    }

    pub fn fail_map(&self, fail: bool) {
        self.fail_map.store(fail, Ordering::SeqCst);
    }

    /// Pages currently pinned, counting repeated pins
    pub fn pinned_pages(&self) -> usize {
        self.pinned.lock().values().sum()
    }

    /// Number of pages released with the dirty mark so far
    pub fn dirty_pages(&self) -> usize {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn active_mappings(&self) -> usize {
        self.mappings.load(Ordering::SeqCst)
    }

    fn phys_of(&self, vpage: usize) -> u64 {
        let stride = if self.scattered { 2 } else { 1 };
        SIM_PHYS_BASE + ((vpage as u64 & 0xf_ffff) * stride) * PAGE_SIZE as u64
    }
}

impl DmaPlatform for SimPlatform {
    fn pin_pages(&self, first_page: usize, count: usize, pages: &mut Vec<PageFrame>) -> Result<()> {
        let limit = self.pin_limit.load(Ordering::SeqCst);
        let mut pinned = self.pinned.lock();
        for i in 0..count {
            if i >= limit {
                return Err(Error::ResourceExhausted);
            }
            let frame = PageFrame {
                phys: self.phys_of(first_page / PAGE_SIZE + i),
                reserved: false,
            };
            *pinned.entry(frame.phys).or_insert(0) += 1;
            pages.push(frame);
        }
        Ok(())
    }

    fn unpin_page(&self, page: &PageFrame, dirty: bool) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&page.phys) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&page.phys);
            }
        }
        if dirty {
            self.dirty.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn map_sg(&self, entries: &[SgEntry], _direction: DmaDirection) -> Result<Vec<DmaSegment>> {
        if self.fail_map.load(Ordering::SeqCst) {
            return Err(Error::IoError);
        }
        let mut segments: Vec<DmaSegment> = Vec::with_capacity(entries.len());
        for entry in entries {
            let addr = entry.page.phys + entry.offset as u64;
            match segments.last_mut() {
                Some(last) if last.addr + last.length as u64 == addr => last.length += entry.length,
                _ => segments.push(DmaSegment {
                    addr,
                    length: entry.length,
                }),
            }
        }
        self.mappings.fetch_add(1, Ordering::SeqCst);
        Ok(segments)
    }

    fn unmap_sg(&self, _entries: &[SgEntry], _segments: &[DmaSegment], _direction: DmaDirection) {
        self.mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    host: usize,
    len: usize,
    offset: u64,
}

/// DMA engine copying from a device memory image
///
/// Started transfers are queued until [`SimDmaEngine::finish_next`] plays
/// the part of the hardware and copies the data into host memory.
pub struct SimDmaEngine {
    memory: Arc<dyn MemoryWindow>,
    transfers: Mutex<VecDeque<Transfer>>,
    refuse: AtomicBool,
}

impl SimDmaEngine {
    pub fn new(memory: Arc<dyn MemoryWindow>) -> Self {
        Self {
            memory,
            transfers: Mutex::new(VecDeque::new()),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Transfers started but not finished
    pub fn in_flight(&self) -> usize {
        self.transfers.lock().len()
    }

    /// Perform the oldest transfer, returning the number of bytes copied
    ///
    /// # Safety
    ///
    /// The host buffer of the transfer must still be alive and not
    /// accessed by anyone else until the transfer is completed.
    pub unsafe fn finish_next(&self) -> Option<usize> {
        let transfer = self.transfers.lock().pop_front()?;
        let end = (transfer.offset as usize + transfer.len).min(self.memory.size());
        let len = end.saturating_sub(transfer.offset as usize);
        let mut data = vec![0u8; len];
        self.memory.read_bytes(transfer.offset as usize, &mut data);
        // SAFETY: guaranteed by the caller
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), transfer.host as *mut u8, len) };
        Some(len)
    }

    /// Drop the oldest transfer without touching host memory
    pub fn discard_next(&self) -> bool {
        self.transfers.lock().pop_front().is_some()
    }
}

impl DmaEngine for SimDmaEngine {
    fn start_read(&self, buffer: &DmaBuffer, offset: u64) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::IoError);
        }
        self.transfers.lock().push_back(Transfer {
            host: buffer.base(),
            len: buffer.len(),
            offset,
        });
        Ok(())
    }
}
