// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Pinned host buffers for scatter/gather DMA
//!
//! A [`DmaBuffer`] walks through `init -> lock pages -> build segments ->
//! map for device`, and back through `unmap -> unlock -> free`. Every
//! teardown step is guarded by the flag its setup step sets, so repeated
//! calls are no-ops. Dropping a buffer that was never freed releases it
//! without marking pages dirty.

use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, error};

use crate::error::{Error, Result};

/// Host page size
pub const PAGE_SIZE: usize = 4096;

#[inline]
const fn offset_in_page(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Number of pages touched by `length` bytes starting at `base`
pub const fn page_count(base: usize, length: usize) -> usize {
    (base + length).div_ceil(PAGE_SIZE) - base / PAGE_SIZE
}

/// Transfer direction as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Host to device
    ToDevice,
    /// Device to host
    FromDevice,
    Bidirectional,
}

impl DmaDirection {
    /// Whether the device writes into host memory
    pub fn writes_host(self) -> bool {
        matches!(self, DmaDirection::FromDevice | DmaDirection::Bidirectional)
    }
}

bitflags! {
    /// Setup progress of a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaFlags: u32 {
        const LOCKED = 1 << 0;
        const MAPPED = 1 << 1;
    }
}

/// A pinned host page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrame {
    pub phys: u64,
    /// Reserved pages are never marked dirty
    pub reserved: bool,
}

/// Host-side scatter/gather entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub page: PageFrame,
    pub offset: usize,
    pub length: usize,
}

/// Device-visible segment produced by mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub length: usize,
}

/// Page pinning and IOMMU mapping provided by the operating system
pub trait DmaPlatform: Send + Sync {
    /// Pin `count` pages starting at the page containing `first_page`.
    ///
    /// Pinned pages are appended to `pages` as they are obtained. On error,
    /// pages already appended stay pinned and are released by the caller.
    fn pin_pages(&self, first_page: usize, count: usize, pages: &mut Vec<PageFrame>) -> Result<()>;

    fn unpin_page(&self, page: &PageFrame, dirty: bool);

    /// Produce device addresses for `entries`; may coalesce adjacent ones.
    fn map_sg(&self, entries: &[SgEntry], direction: DmaDirection) -> Result<Vec<DmaSegment>>;

    fn unmap_sg(&self, entries: &[SgEntry], segments: &[DmaSegment], direction: DmaDirection);
}

/// Host memory region prepared for device DMA
pub struct DmaBuffer {
    platform: Arc<dyn DmaPlatform>,
    base: usize,
    length: usize,
    num_pages: usize,
    direction: DmaDirection,
    pages: Vec<PageFrame>,
    sg: Vec<SgEntry>,
    segments: Vec<DmaSegment>,
    flags: DmaFlags,
}

impl DmaBuffer {
    /// Describe `length` bytes at user address `base`
    pub fn new(platform: Arc<dyn DmaPlatform>, base: usize, length: usize, direction: DmaDirection) -> Result<Self> {
        if length == 0 || base.checked_add(length).and_then(|end| end.checked_add(PAGE_SIZE)).is_none() {
            return Err(Error::InvalidArgument);
        }

        let num_pages = page_count(base, length);
        let mut pages = Vec::new();
        pages.try_reserve_exact(num_pages).map_err(|_| Error::ResourceExhausted)?;

        Ok(Self {
            platform,
            base,
            length,
            num_pages,
            direction,
            pages,
            sg: Vec::new(),
            segments: Vec::new(),
            flags: DmaFlags::empty(),
        })
    }

    /// Run all four setup steps, releasing everything acquired on failure
    pub fn prepare(platform: Arc<dyn DmaPlatform>, base: usize, length: usize, direction: DmaDirection) -> Result<Self> {
        let mut buffer = Self::new(platform, base, length, direction)?;
        buffer.lock_pages()?;
        buffer.build_segments()?;
        buffer.map_for_device()?;
        Ok(buffer)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    pub fn flags(&self) -> DmaFlags {
        self.flags
    }

    pub fn is_mapped(&self) -> bool {
        self.flags.contains(DmaFlags::MAPPED)
    }

    pub fn sg_entries(&self) -> &[SgEntry] {
        &self.sg
    }

    /// Device-visible segments, empty until mapped
    pub fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    /// Pin every page of the region
    pub fn lock_pages(&mut self) -> Result<()> {
        if self.flags.contains(DmaFlags::LOCKED) {
            return Ok(());
        }

        let first_page = self.base - offset_in_page(self.base);
        let pinned = self.platform.pin_pages(first_page, self.num_pages, &mut self.pages);

        if pinned.is_err() || self.pages.len() < self.num_pages {
            error!(
                "only {} of {} pages could be locked for DMA at {:#x}",
                self.pages.len(),
                self.num_pages,
                self.base
            );
            for page in self.pages.drain(..) {
                self.platform.unpin_page(&page, false);
            }
            return Err(pinned.err().unwrap_or(Error::ResourceExhausted));
        }

        self.flags |= DmaFlags::LOCKED;
        Ok(())
    }

    /// One entry per page; the first starts at the offset of `base`.
    pub fn build_segments(&mut self) -> Result<()> {
        assert!(self.flags.contains(DmaFlags::LOCKED), "scatter table built before pages were locked");
        if !self.sg.is_empty() {
            return Ok(());
        }

        let mut sg = Vec::new();
        sg.try_reserve_exact(self.num_pages).map_err(|_| {
            error!("allocation of scatter table with {} entries failed", self.num_pages);
            Error::ResourceExhausted
        })?;

        let mut bytes_left = self.length;
        let mut addr = self.base;
        for page in &self.pages {
            let offset = offset_in_page(addr);
            let length = bytes_left.min(PAGE_SIZE - offset);
            sg.push(SgEntry {
                page: *page,
                offset,
                length,
            });
            bytes_left -= length;
            addr += length;
        }
        debug_assert_eq!(bytes_left, 0);

        self.sg = sg;
        Ok(())
    }

    pub fn map_for_device(&mut self) -> Result<()> {
        assert!(!self.sg.is_empty(), "buffer mapped before its scatter table was built");
        if self.is_mapped() {
            return Ok(());
        }

        self.segments = self.platform.map_sg(&self.sg, self.direction).map_err(|err| {
            error!("mapping {} scatter entries for DMA failed: {}", self.sg.len(), err);
            err
        })?;
        self.flags |= DmaFlags::MAPPED;

        debug!(
            "DMA buffer {:#x}+{:#x}: {} pages, {} device segments",
            self.base,
            self.length,
            self.num_pages,
            self.segments.len()
        );
        Ok(())
    }

    pub fn unmap(&mut self) {
        if !self.is_mapped() {
            return;
        }
        self.platform.unmap_sg(&self.sg, &self.segments, self.direction);
        self.segments.clear();
        self.flags.remove(DmaFlags::MAPPED);
    }

    /// Release the pins; `dirty` only has an effect when the device wrote
    /// into host memory.
    pub fn unlock_pages(&mut self, dirty: bool) {
        if !self.flags.contains(DmaFlags::LOCKED) {
            return;
        }
        let mark = dirty && self.direction.writes_host();
        for page in self.pages.drain(..) {
            self.platform.unpin_page(&page, mark && !page.reserved);
        }
        self.flags.remove(DmaFlags::LOCKED);
    }

    fn release(&mut self, dirty: bool) {
        self.unmap();
        self.sg.clear();
        self.unlock_pages(dirty);
    }

    /// Tear the buffer down after the hardware is done with it
    pub fn free(mut self, dirty: bool) {
        self.release(dirty);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    const BASE: usize = 0x7f00_0000_0000;

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(BASE + 0x800, 4096), 2);
        assert_eq!(page_count(BASE, 4096), 1);
        assert_eq!(page_count(BASE, 4097), 2);
        assert_eq!(page_count(BASE + 0xfff, 1), 1);
        assert_eq!(page_count(BASE + 0xfff, 2), 2);
    }

    #[test]
    fn test_zero_length_rejected() {
        let platform = Arc::new(SimPlatform::new());
        assert_eq!(
            DmaBuffer::new(platform, BASE, 0, DmaDirection::FromDevice).err(),
            Some(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_segments_follow_page_boundaries() {
        let platform = Arc::new(SimPlatform::scattered());
        let mut buffer = DmaBuffer::new(platform.clone(), BASE + 0x800, 0x2000, DmaDirection::FromDevice).unwrap();
        assert_eq!(buffer.num_pages(), 3);
        buffer.lock_pages().unwrap();
        buffer.build_segments().unwrap();

        let lengths: Vec<_> = buffer.sg_entries().iter().map(|e| e.length).collect();
        assert_eq!(lengths, vec![0x800, 0x1000, 0x800]);
        assert_eq!(buffer.sg_entries()[0].offset, 0x800);
        assert_eq!(buffer.sg_entries()[1].offset, 0);

        buffer.map_for_device().unwrap();
        assert_eq!(buffer.segments().len(), 3);
        assert_eq!(buffer.segments().iter().map(|s| s.length).sum::<usize>(), 0x2000);
        buffer.free(true);
        assert_eq!(platform.pinned_pages(), 0);
        assert_eq!(platform.active_mappings(), 0);
    }

    #[test]
    fn test_contiguous_pages_coalesce() {
        let platform = Arc::new(SimPlatform::new());
        let buffer = DmaBuffer::prepare(platform.clone(), BASE + 0x10, 3 * PAGE_SIZE, DmaDirection::FromDevice).unwrap();
        assert_eq!(buffer.sg_entries().len(), 4);
        assert_eq!(buffer.segments().len(), 1);
        assert_eq!(buffer.segments()[0].length, 3 * PAGE_SIZE);
    }

    #[test]
    fn test_partial_pin_is_released() {
        let platform = Arc::new(SimPlatform::new());
        platform.fail_pin_after(2);
        let mut buffer = DmaBuffer::new(platform.clone(), BASE, 4 * PAGE_SIZE, DmaDirection::FromDevice).unwrap();
        assert_eq!(buffer.lock_pages(), Err(Error::ResourceExhausted));
        assert!(!buffer.flags().contains(DmaFlags::LOCKED));
        assert_eq!(platform.pinned_pages(), 0);

        platform.fail_pin_after(usize::MAX);
        buffer.lock_pages().unwrap();
        assert_eq!(platform.pinned_pages(), 4);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let platform = Arc::new(SimPlatform::new());
        let mut buffer = DmaBuffer::prepare(platform.clone(), BASE, PAGE_SIZE, DmaDirection::FromDevice).unwrap();
        buffer.unmap();
        buffer.unmap();
        buffer.unlock_pages(true);
        buffer.unlock_pages(true);
        assert_eq!(platform.dirty_pages(), 1);
        assert_eq!(platform.pinned_pages(), 0);
        drop(buffer);
        assert_eq!(platform.dirty_pages(), 1);
    }

    #[test]
    fn test_dirty_only_for_device_writes() {
        let platform = Arc::new(SimPlatform::new());
        let buffer = DmaBuffer::prepare(platform.clone(), BASE, 2 * PAGE_SIZE, DmaDirection::ToDevice).unwrap();
        buffer.free(true);
        assert_eq!(platform.dirty_pages(), 0);

        let buffer = DmaBuffer::prepare(platform.clone(), BASE, 2 * PAGE_SIZE, DmaDirection::Bidirectional).unwrap();
        buffer.free(true);
        assert_eq!(platform.dirty_pages(), 2);
    }

    #[test]
    fn test_drop_releases_without_dirty() {
        let platform = Arc::new(SimPlatform::new());
        {
            let _buffer = DmaBuffer::prepare(platform.clone(), BASE, 5 * PAGE_SIZE, DmaDirection::FromDevice).unwrap();
            assert_eq!(platform.pinned_pages(), 5);
            assert_eq!(platform.active_mappings(), 1);
        }
        assert_eq!(platform.pinned_pages(), 0);
        assert_eq!(platform.active_mappings(), 0);
        assert_eq!(platform.dirty_pages(), 0);
    }

    #[test]
    fn test_map_failure_unwinds() {
        let platform = Arc::new(SimPlatform::new());
        platform.fail_map(true);
        let result = DmaBuffer::prepare(platform.clone(), BASE, 2 * PAGE_SIZE, DmaDirection::FromDevice);
        assert_eq!(result.err(), Some(Error::IoError));
        assert_eq!(platform.pinned_pages(), 0);
    }
}
