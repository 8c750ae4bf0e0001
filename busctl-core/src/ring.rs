// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Offset arithmetic for circular regions shared with the device
//!
//! The cursors themselves live in device-visible memory. These helpers only
//! compute on their values; callers serialize producer and consumer access.
//! `put == get` means empty, so a producer always leaves one entry unused.

/// Bytes ready for the consumer.
pub const fn available(buffer_size: u32, put: u32, get: u32) -> u32 {
    if put >= get {
        put - get
    } else {
        put.wrapping_add(buffer_size).wrapping_sub(get)
    }
}

/// Bytes the producer may still write, keeping one entry in reserve.
pub const fn free(entry_size: u32, buffer_size: u32, put: u32, get: u32) -> u32 {
    let unused = buffer_size.saturating_sub(available(buffer_size, put, get));
    unused.saturating_sub(entry_size)
}

/// Contiguous run before `offset` has to wrap back to `buffer_start`.
pub const fn bytes_to_end(buffer_size: u32, buffer_start: u32, offset: u32) -> u32 {
    (buffer_start + buffer_size) - offset
}

/// Advance a cursor by `increment`, wrapping at the end of the region.
pub const fn increment_offset(offset: u32, increment: u32, buffer_start: u32, buffer_size: u32) -> u32 {
    if offset + increment < buffer_start + buffer_size {
        offset + increment
    } else {
        offset + increment - buffer_size
    }
}
