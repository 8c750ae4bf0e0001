// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types shared by every component of the controller core

use core::fmt;

/// Result type used throughout the crate
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Controller core error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Oversized command or attachment, unknown queue id, bad window layout
    InvalidArgument,
    /// Page, descriptor or event log space could not be obtained
    ResourceExhausted,
    /// No completion within the configured bound
    Timeout,
    /// Operation already started or already cancelled
    AlreadyInProgress,
    /// Request already reached a final state
    Busy,
    /// No request with the given id
    NotFound,
    /// Slot with the given id is already occupied
    AlreadyExists,
    /// Nothing queued to complete
    NoData,
    /// Device NAK, mapping failure, queue desynchronization or teardown
    IoError,
}

impl Error {
    /// Negative Linux errno reported to the ioctl layer
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => -22,
            Error::ResourceExhausted => -12,
            Error::Timeout => -62,
            Error::AlreadyInProgress => -114,
            Error::Busy => -16,
            Error::NotFound => -2,
            Error::AlreadyExists => -17,
            Error::NoData => -61,
            Error::IoError => -5,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::ResourceExhausted => write!(f, "Resource exhausted"),
            Error::Timeout => write!(f, "Operation timeout"),
            Error::AlreadyInProgress => write!(f, "Operation already in progress"),
            Error::Busy => write!(f, "Resource busy"),
            Error::NotFound => write!(f, "No such request"),
            Error::AlreadyExists => write!(f, "Already exists"),
            Error::NoData => write!(f, "No data available"),
            Error::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::InvalidArgument.errno(), -22);
        assert_eq!(Error::Timeout.errno(), -62);
        assert_eq!(Error::AlreadyInProgress.errno(), -114);
        assert_eq!(Error::NoData.errno(), -61);
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Busy.to_string(), "Resource busy");
        assert_eq!(Error::IoError.to_string(), "I/O error");
    }
}
