// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::thread;

use busctl::io::MemoryWindow;
use busctl::protocol::ResponseHeader;
use busctl::sim::{Access, SharedMemory, SimPlatform, SimRegisters};
use busctl::{ChannelLayout, Device, DeviceConfig, DeviceResources};

const EVENT_REG: usize = 0x40;
const DOORBELL: usize = 0x44;
const CMD: usize = 0x200;
const RSP: usize = 0x300;
const COMMAND_LEN: usize = 8;

thread_local! {
    static ON_BOARD: Cell<bool> = const { Cell::new(false) };
}

/// Board side of the channel: echo the command after a response header
fn answer(memory: &SharedMemory) {
    ON_BOARD.with(|flag| flag.set(true));
    let mut command = [0u8; COMMAND_LEN];
    memory.read_bytes(CMD, &mut command);
    let header = ResponseHeader::new(0, 0, (ResponseHeader::SIZE + COMMAND_LEN) as u32);
    memory.write_bytes(RSP, &header.encode());
    memory.write_bytes(RSP + ResponseHeader::SIZE, &command);
    ON_BOARD.with(|flag| flag.set(false));
}

#[test]
fn test_commands_are_serialized() {
    let regs = Arc::new(SimRegisters::new(0x100));
    regs.set_write_one_to_clear(EVENT_REG);
    let memory = Arc::new(SharedMemory::new(0x1000));
    let device = Device::new(
        DeviceConfig::default(),
        DeviceResources {
            registers: regs.clone(),
            memory: memory.clone(),
            host_io: None,
            platform: Arc::new(SimPlatform::new()),
            dma_engine: None,
        },
    )
    .unwrap();
    device
        .add_channel(ChannelLayout {
            id: 3,
            command_offset: CMD,
            command_size: 0x100,
            response_offset: RSP,
            response_size: 0x100,
        })
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        memory.set_access_hook(move |access| {
            if !ON_BOARD.with(Cell::get) {
                log.lock().unwrap().push(access);
            }
        });
    }
    {
        let (regs_hook, memory) = (regs.clone(), memory.clone());
        let device = Arc::downgrade(&device);
        regs.set_write_hook(move |offset, value| {
            if offset != DOORBELL {
                return;
            }
            answer(&memory);
            regs_hook.raise(EVENT_REG, value);
            if let Some(device) = device.upgrade() {
                device.handle_interrupt();
            }
        });
    }

    let workers: Vec<_> = (0..2u8)
        .map(|tag| {
            let device = device.clone();
            thread::spawn(move || {
                for round in 0..200u32 {
                    let mut command = [tag; COMMAND_LEN];
                    command[4..].copy_from_slice(&round.to_le_bytes());
                    let mut response = [0u8; 128];
                    let size = device.issue_command(3, &command, &mut response, 0).unwrap();
                    assert_eq!(size, ResponseHeader::SIZE + COMMAND_LEN);
                    assert_eq!(&response[ResponseHeader::SIZE..size], &command);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let log = log.lock().unwrap();
    let mut expect_write = true;
    for access in log.iter() {
        match access {
            Access::Write { offset, len } => {
                assert!(expect_write, "command written while a response was outstanding");
                assert_eq!((*offset, *len), (CMD, COMMAND_LEN));
                expect_write = false;
            }
            Access::Read { offset, .. } => {
                assert_eq!(*offset, RSP);
                expect_write = true;
            }
        }
    }
    assert_eq!(log.iter().filter(|a| matches!(a, Access::Write { .. })).count(), 400);
    assert_eq!(device.stats().commands_issued, 400);
}
