// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command channel framing
//!
//! Current firmware prefixes every command with a [`RequestHeader`] and every
//! response with a [`ResponseHeader`], both little-endian and tagged with
//! [`COM_MAGIC`]. Older firmware answers with legacy acknowledge frames whose
//! length is derived from the tag byte at offset 1. Both are still deployed.

/// Magic of the current framing
pub const COM_MAGIC: u32 = 0xA1A1_A1A1;

/// Legacy acknowledge, header plus one status word
pub const LEGACY_TAG_ACK: u8 = 0x20;
/// Legacy acknowledge with payload, total size in bytes 2..4 (big-endian)
pub const LEGACY_TAG_ACK2: u8 = 0x22;
/// Legacy negative acknowledge, header plus one error word
pub const LEGACY_TAG_NAK: u8 = 0x24;

const LEGACY_TAG_OFFSET: usize = 1;
const LEGACY_HEADER_SIZE: usize = 4;
/// Size of plain ACK and NAK frames
const LEGACY_SHORT_FRAME_SIZE: usize = 8;

fn word(bytes: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn put_word(bytes: &mut [u8], index: usize, value: u32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

/// Generic command header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u32,
    pub request_id: u32,
    /// Total request size including this header
    pub request_size: u32,
    pub reserved: [u32; 5],
}

impl RequestHeader {
    pub const SIZE: usize = 32;

    pub fn new(request_id: u32, request_size: u32) -> Self {
        Self {
            magic: COM_MAGIC,
            request_id,
            request_size,
            reserved: [0; 5],
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        put_word(&mut out, 0, self.magic);
        put_word(&mut out, 1, self.request_id);
        put_word(&mut out, 2, self.request_size);
        for (i, r) in self.reserved.iter().enumerate() {
            put_word(&mut out, 3 + i, *r);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut reserved = [0u32; 5];
        for (i, r) in reserved.iter_mut().enumerate() {
            *r = word(bytes, 3 + i);
        }
        Some(Self {
            magic: word(bytes, 0),
            request_id: word(bytes, 1),
            request_size: word(bytes, 2),
            reserved,
        })
    }
}

/// Generic response header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub magic: u32,
    pub request_id: u32,
    pub status: i32,
    /// Total response size including this header
    pub response_size: u32,
    pub reserved: [u32; 5],
}

impl ResponseHeader {
    pub const SIZE: usize = 36;

    pub fn new(request_id: u32, status: i32, response_size: u32) -> Self {
        Self {
            magic: COM_MAGIC,
            request_id,
            status,
            response_size,
            reserved: [0; 5],
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        put_word(&mut out, 0, self.magic);
        put_word(&mut out, 1, self.request_id);
        put_word(&mut out, 2, self.status as u32);
        put_word(&mut out, 3, self.response_size);
        for (i, r) in self.reserved.iter().enumerate() {
            put_word(&mut out, 4 + i, *r);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut reserved = [0u32; 5];
        for (i, r) in reserved.iter_mut().enumerate() {
            *r = word(bytes, 4 + i);
        }
        Some(Self {
            magic: word(bytes, 0),
            request_id: word(bytes, 1),
            status: word(bytes, 2) as i32,
            response_size: word(bytes, 3),
            reserved,
        })
    }
}

/// How the size of a response was determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSize {
    /// Magic matched, size taken from the response header
    Framed(usize),
    /// Legacy frame with a recognised acknowledge tag
    Legacy(usize),
    /// Neither path could tell; use the caller's expectation
    Unknown,
}

/// Total size of a legacy acknowledge frame
pub fn legacy_ack_size(frame: &[u8]) -> Option<usize> {
    match frame.get(LEGACY_TAG_OFFSET)? {
        &LEGACY_TAG_ACK | &LEGACY_TAG_NAK => Some(LEGACY_SHORT_FRAME_SIZE),
        &LEGACY_TAG_ACK2 => {
            let size = u16::from_be_bytes([*frame.get(2)?, *frame.get(3)?]) as usize;
            (size >= LEGACY_HEADER_SIZE).then_some(size)
        }
        _ => None,
    }
}

/// Inspect the start of a response window
///
/// `head` must hold at least [`ResponseHeader::SIZE`] bytes for a framed
/// response to be recognised.
pub fn response_size(head: &[u8]) -> ResponseSize {
    if let Some(header) = ResponseHeader::decode(head) {
        if header.magic == COM_MAGIC {
            return ResponseSize::Framed(header.response_size as usize);
        }
    }
    match legacy_ack_size(head) {
        Some(size) => ResponseSize::Legacy(size),
        None => ResponseSize::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_layout() {
        let bytes = RequestHeader::new(7, 64).encode();
        assert_eq!(&bytes[0..4], &[0xa1, 0xa1, 0xa1, 0xa1]);
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &64u32.to_le_bytes());
        assert!(bytes[12..].iter().all(|b| *b == 0));
        assert_eq!(RequestHeader::decode(&bytes), Some(RequestHeader::new(7, 64)));
    }

    #[test]
    fn test_response_header_status_is_signed() {
        let header = ResponseHeader::new(3, -22, 40);
        let bytes = header.encode();
        assert_eq!(&bytes[8..12], &(-22i32).to_le_bytes());
        assert_eq!(ResponseHeader::decode(&bytes).unwrap().status, -22);
        assert!(ResponseHeader::decode(&bytes[..35]).is_none());
    }

    #[test]
    fn test_framed_size_wins() {
        let mut head = ResponseHeader::new(1, 0, 100).encode().to_vec();
        // a legacy tag in the request id bytes must not matter
        head[1] = LEGACY_TAG_NAK;
        assert_eq!(response_size(&head), ResponseSize::Framed(100));
    }

    #[test]
    fn test_legacy_tags() {
        let mut head = [0u8; ResponseHeader::SIZE];
        head[1] = LEGACY_TAG_ACK;
        assert_eq!(response_size(&head), ResponseSize::Legacy(8));

        head[1] = LEGACY_TAG_ACK2;
        head[2] = 0x01;
        head[3] = 0x10;
        assert_eq!(response_size(&head), ResponseSize::Legacy(0x110));

        head[1] = LEGACY_TAG_NAK;
        assert_eq!(response_size(&head), ResponseSize::Legacy(8));

        head[1] = 0x55;
        assert_eq!(response_size(&head), ResponseSize::Unknown);
    }

    #[test]
    fn test_plain_ack_carries_status_word() {
        let frame = [0x01, LEGACY_TAG_ACK, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd];
        assert_eq!(legacy_ack_size(&frame), Some(8));
        assert_eq!(legacy_ack_size(&frame[..2]), Some(8));
    }

    #[test]
    fn test_legacy_ack2_shorter_than_header() {
        assert_eq!(legacy_ack_size(&[0, LEGACY_TAG_ACK2, 0, 2]), None);
        assert_eq!(legacy_ack_size(&[0]), None);
    }
}
