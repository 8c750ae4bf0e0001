// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Interrupt driven command/response channels
//!
//! Each channel owns a command window, a response window and a way to
//! signal the on-board processor. One command is in flight per channel:
//! the serializing lock is held from copying the command in until the
//! response has been copied out. The interrupt path only marks the
//! channel's completion.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use parking_lot::Mutex;

use crate::completion::Completion;
use crate::error::{Error, Result};
use crate::event_log::{EventLog, event_channel};
use crate::io::{RegisterIo, Window};
use crate::protocol::{self, ResponseHeader, ResponseSize};

/// Number of channel slots; channel `n` is signalled with bit `n`
pub const MAX_CHANNELS: usize = 8;

/// How the device is told that a command is ready
#[derive(Clone)]
pub enum Signal {
    /// Write `1 << id` to a doorbell register
    Doorbell { regs: Arc<dyn RegisterIo>, offset: usize },
    /// Inject the channel event through the host-to-device event log
    EventLog(Arc<EventLog>),
}

impl Signal {
    fn raise(&self, id: u8) -> Result<()> {
        match self {
            Signal::Doorbell { regs, offset } => {
                regs.write32(*offset, 1 << id);
                Ok(())
            }
            Signal::EventLog(log) => log.push(event_channel(id)),
        }
    }
}

/// Hardware resources of one channel
pub struct ChannelSetup {
    pub command: Window,
    pub response: Window,
    pub signal: Signal,
}

/// One request/response transport
pub struct CommandChannel {
    id: u8,
    hw: Mutex<Option<ChannelSetup>>,
    completion: Completion,
    timeout: Duration,
}

impl CommandChannel {
    /// Fails with `InvalidArgument` for an id without hardware slot or a
    /// doorbell outside the register window.
    pub fn new(id: u8, setup: ChannelSetup, timeout: Duration) -> Result<Self> {
        if id as usize >= MAX_CHANNELS {
            error!("no hardware slot for com channel {}", id);
            return Err(Error::InvalidArgument);
        }
        if let Signal::Doorbell { regs, offset } = &setup.signal {
            if offset.checked_add(4).is_none_or(|end| end > regs.io_size()) {
                error!("Event signal register of target com channel {} is out of range", id);
                return Err(Error::InvalidArgument);
            }
        }

        debug!(
            "Target com channel {} set up with command {:#x}+{:#x} response {:#x}+{:#x}",
            id,
            setup.command.offset(),
            setup.command.size(),
            setup.response.offset(),
            setup.response.size()
        );

        Ok(Self {
            id,
            hw: Mutex::new(Some(setup)),
            completion: Completion::new(),
            timeout,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Bit of this channel in the interrupt cause registers
    pub fn event_bit(&self) -> u32 {
        1 << self.id
    }

    /// Send `command` and copy the answer into `response`
    ///
    /// `expected` is the response size the caller expects, 0 if unknown.
    /// Returns the number of response bytes copied.
    pub fn issue(&self, command: &[u8], response: &mut [u8], expected: usize) -> Result<usize> {
        let hw = self.hw.lock();
        let Some(hw) = hw.as_ref() else {
            error!("Communication channel {} has no valid command area", self.id);
            return Err(Error::IoError);
        };

        if !command.is_empty() {
            if command.len() > hw.command.size() {
                error!("command size exceeds command area size of channel {}", self.id);
                return Err(Error::InvalidArgument);
            }
            hw.command.write(0, command);
        }

        self.completion.reinit();
        hw.signal.raise(self.id)?;

        if let Err(err) = self.completion.wait_timeout(self.timeout) {
            match err {
                Error::Timeout => error!("Command on com channel {} timed out", self.id),
                _ => error!("Command on com channel {} aborted", self.id),
            }
            return Err(err);
        }

        let size = self.response_size(&hw.response, response.len(), expected)?;
        hw.response.read(0, &mut response[..size]);
        Ok(size)
    }

    fn response_size(&self, window: &Window, capacity: usize, expected: usize) -> Result<usize> {
        let mut head = [0u8; ResponseHeader::SIZE];
        let head_len = head.len().min(window.size());
        window.read(0, &mut head[..head_len]);

        let size = match protocol::response_size(&head[..head_len]) {
            ResponseSize::Framed(size) | ResponseSize::Legacy(size) => size,
            ResponseSize::Unknown if expected != 0 => expected,
            ResponseSize::Unknown => capacity.min(window.size()),
        };

        if size > window.size() {
            error!("Response size exceeds response area size of channel {}", self.id);
            return Err(Error::InvalidArgument);
        }
        if expected != 0 && size > expected {
            error!("Response size {} from board exceeds expected response size {}", size, expected);
            return Err(Error::InvalidArgument);
        }
        if size > capacity {
            error!("Response of {} bytes does not fit the {} byte buffer", size, capacity);
            return Err(Error::InvalidArgument);
        }
        Ok(size)
    }

    /// Interrupt path: the device answered
    pub fn signal_completion(&self) {
        self.completion.complete();
    }

    /// Detach from the hardware
    ///
    /// A command waiting for its answer fails with `IoError`, as does every
    /// later `issue`.
    pub fn release(&self) {
        self.completion.abort();
        self.hw.lock().take();
        debug!("com channel {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventLogLayout;
    use crate::io::MemoryWindow;
    use crate::protocol::{LEGACY_TAG_ACK, LEGACY_TAG_ACK2, ResponseHeader};
    use crate::sim::{SharedMemory, SimRegisters};
    use std::sync::Weak;
    use std::thread;

    const DOORBELL: usize = 0x44;
    const CMD: usize = 0x0;
    const RSP: usize = 0x100;
    const WINDOW: usize = 0x100;

    struct Rig {
        mem: Arc<SharedMemory>,
        regs: Arc<SimRegisters>,
        channel: Arc<CommandChannel>,
    }

    fn rig(id: u8, timeout: Duration) -> Rig {
        let mem = Arc::new(SharedMemory::new(0x200));
        let regs = Arc::new(SimRegisters::new(0x100));
        let setup = ChannelSetup {
            command: Window::new(mem.clone(), CMD, WINDOW).unwrap(),
            response: Window::new(mem.clone(), RSP, WINDOW).unwrap(),
            signal: Signal::Doorbell {
                regs: regs.clone(),
                offset: DOORBELL,
            },
        };
        let channel = Arc::new(CommandChannel::new(id, setup, timeout).unwrap());
        Rig { mem, regs, channel }
    }

    /// Answer every doorbell ring with `reply`
    fn respond_with(rig: &Rig, reply: Vec<u8>) {
        let mem = rig.mem.clone();
        let channel: Weak<CommandChannel> = Arc::downgrade(&rig.channel);
        rig.regs.set_write_hook(move |offset, _| {
            if offset == DOORBELL {
                mem.write_bytes(RSP, &reply);
                if let Some(channel) = channel.upgrade() {
                    channel.signal_completion();
                }
            }
        });
    }

    #[test]
    fn test_invalid_setup() {
        let mem = Arc::new(SharedMemory::new(0x200));
        let regs = Arc::new(SimRegisters::new(0x40));
        let setup = || ChannelSetup {
            command: Window::new(mem.clone(), CMD, WINDOW).unwrap(),
            response: Window::new(mem.clone(), RSP, WINDOW).unwrap(),
            signal: Signal::Doorbell {
                regs: regs.clone(),
                offset: DOORBELL,
            },
        };
        // doorbell at 0x44 lies outside the 0x40 byte register window
        assert_eq!(
            CommandChannel::new(0, setup(), Duration::from_secs(1)).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(
            CommandChannel::new(MAX_CHANNELS as u8, setup(), Duration::from_secs(1)).err(),
            Some(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_oversized_command_does_not_signal() {
        let rig = rig(1, Duration::from_millis(50));
        let mut response = [0u8; 64];
        let command = vec![0xaa; WINDOW + 1];
        assert_eq!(rig.channel.issue(&command, &mut response, 0), Err(Error::InvalidArgument));
        assert_eq!(rig.regs.peek(DOORBELL), 0);
    }

    #[test]
    fn test_framed_size_is_authoritative() {
        let rig = rig(2, Duration::from_secs(5));
        let mut reply = ResponseHeader::new(1, 0, 40).encode().to_vec();
        reply.extend_from_slice(&[0x5a; 4]);
        respond_with(&rig, reply.clone());

        let mut response = [0u8; 128];
        let size = rig.channel.issue(&[1, 2, 3, 4], &mut response, 100).unwrap();
        assert_eq!(size, 40);
        assert_eq!(&response[..40], &reply[..]);
        assert_eq!(rig.regs.peek(DOORBELL), 1 << 2);

        let mut command = [0u8; 4];
        rig.mem.read_bytes(CMD, &mut command);
        assert_eq!(command, [1, 2, 3, 4]);
    }

    #[test]
    fn test_framed_size_beyond_window() {
        let rig = rig(0, Duration::from_secs(5));
        respond_with(&rig, ResponseHeader::new(1, 0, WINDOW as u32 + 4).encode().to_vec());
        let mut response = vec![0u8; 2 * WINDOW];
        assert_eq!(rig.channel.issue(&[0], &mut response, 0), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_framed_size_beyond_expected() {
        let rig = rig(0, Duration::from_secs(5));
        respond_with(&rig, ResponseHeader::new(1, 0, 64).encode().to_vec());
        let mut response = [0u8; 128];
        assert_eq!(rig.channel.issue(&[0], &mut response, 48), Err(Error::InvalidArgument));
        // the lock was released on the error path
        assert_eq!(rig.channel.issue(&[0], &mut response, 64), Ok(64));
    }

    #[test]
    fn test_legacy_ack2_size() {
        let rig = rig(3, Duration::from_secs(5));
        respond_with(&rig, vec![0x01, LEGACY_TAG_ACK2, 0x00, 0x0c, 9, 9, 9, 9, 9, 9, 9, 9]);
        let mut response = [0u8; 64];
        assert_eq!(rig.channel.issue(&[0x10], &mut response, 0), Ok(12));
        assert_eq!(response[4..12], [9; 8]);
    }

    #[test]
    fn test_legacy_plain_ack_size() {
        let rig = rig(2, Duration::from_secs(5));
        respond_with(&rig, vec![0x01, LEGACY_TAG_ACK, 0x00, 0x00, 0xaa, 0xbb, 0xcc, 0xdd]);
        let mut response = [0u8; 64];
        assert_eq!(rig.channel.issue(&[0x10], &mut response, 0), Ok(8));
        assert_eq!(response[4..8], [0xaa, 0xbb, 0xcc, 0xdd]);
        // an expectation below the frame size is rejected
        assert_eq!(rig.channel.issue(&[0x10], &mut response, 4), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_unknown_frame_uses_expected_size() {
        let rig = rig(3, Duration::from_secs(5));
        respond_with(&rig, vec![0x01, 0x77, 0x00, 0x00, 5, 6]);
        let mut response = [0u8; 64];
        assert_eq!(rig.channel.issue(&[0x10], &mut response, 6), Ok(6));
        assert_eq!(response[..6], [0x01, 0x77, 0x00, 0x00, 5, 6]);
    }

    #[test]
    fn test_timeout_without_answer() {
        let rig = rig(1, Duration::from_millis(20));
        let mut response = [0u8; 8];
        assert_eq!(rig.channel.issue(&[1], &mut response, 0), Err(Error::Timeout));
    }

    #[test]
    fn test_stale_completion_is_discarded() {
        let rig = rig(1, Duration::from_millis(20));
        rig.channel.signal_completion();
        let mut response = [0u8; 8];
        assert_eq!(rig.channel.issue(&[1], &mut response, 0), Err(Error::Timeout));
    }

    #[test]
    fn test_release_unblocks_waiter() {
        let rig = rig(4, Duration::from_secs(10));
        let channel = rig.channel.clone();
        let waiter = thread::spawn(move || {
            let mut response = [0u8; 8];
            channel.issue(&[1], &mut response, 0)
        });
        while rig.regs.peek(DOORBELL) == 0 {
            thread::yield_now();
        }
        rig.channel.release();
        assert_eq!(waiter.join().unwrap(), Err(Error::IoError));

        let mut response = [0u8; 8];
        assert_eq!(rig.channel.issue(&[1], &mut response, 0), Err(Error::IoError));
    }

    #[test]
    fn test_event_log_signalling() {
        let mem = Arc::new(SharedMemory::new(0x200));
        let io = Arc::new(SharedMemory::new(0x1000));
        let log = Arc::new(EventLog::new(io.clone(), 0, EventLogLayout::HOST_TO_DEVICE, None).unwrap());
        log.reset();
        let setup = ChannelSetup {
            command: Window::new(mem.clone(), CMD, WINDOW).unwrap(),
            response: Window::new(mem.clone(), RSP, WINDOW).unwrap(),
            signal: Signal::EventLog(log.clone()),
        };
        let channel = Arc::new(CommandChannel::new(5, setup, Duration::from_secs(5)).unwrap());

        let device = {
            let (channel, log, mem) = (channel.clone(), log.clone(), mem.clone());
            thread::spawn(move || {
                loop {
                    let mut events = Vec::new();
                    log.drain(|e| events.push(e)).unwrap();
                    if events.contains(&event_channel(5)) {
                        mem.write_bytes(RSP, &ResponseHeader::new(0, 0, 36).encode());
                        channel.signal_completion();
                        return events;
                    }
                    thread::yield_now();
                }
            })
        };

        let mut response = [0u8; 64];
        assert_eq!(channel.issue(&[7; 16], &mut response, 0), Ok(36));
        assert_eq!(device.join().unwrap(), vec![1 << 5]);
    }
}
