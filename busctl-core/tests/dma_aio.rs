// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use busctl::io::MemoryWindow;
use busctl::irq::IrqEvents;
use busctl::sim::{SharedMemory, SimDmaEngine, SimPlatform, SimRegisters};
use busctl::{AioOp, AioState, Device, DeviceConfig, DeviceResources, Error};

const EVENT_REG: usize = 0x40;

struct Board {
    regs: Arc<SimRegisters>,
    platform: Arc<SimPlatform>,
    engine: Arc<SimDmaEngine>,
    device: Arc<Device>,
}

fn board() -> Board {
    let regs = Arc::new(SimRegisters::new(0x100));
    regs.set_write_one_to_clear(EVENT_REG);
    let memory = Arc::new(SharedMemory::new(0x4000));
    let image: Vec<u8> = (0..0x4000).map(|i| (i % 251) as u8).collect();
    memory.write_bytes(0, &image);

    let platform = Arc::new(SimPlatform::new());
    let engine = Arc::new(SimDmaEngine::new(memory.clone()));
    let device = Device::new(
        DeviceConfig::default(),
        DeviceResources {
            registers: regs.clone(),
            memory,
            host_io: None,
            platform: platform.clone(),
            dma_engine: Some(engine.clone()),
        },
    )
    .unwrap();
    Board {
        regs,
        platform,
        engine,
        device,
    }
}

fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Play the DMA engine: wait for a transfer, perform it and interrupt
fn run_transfer(board: &Board, success: bool) -> thread::JoinHandle<()> {
    let (engine, regs, device) = (board.engine.clone(), board.regs.clone(), board.device.clone());
    thread::spawn(move || {
        wait_for(|| engine.in_flight() > 0);
        if success {
            // SAFETY: the submitter keeps the host buffer alive until completion
            unsafe { engine.finish_next() };
            regs.raise(EVENT_REG, IrqEvents::DMA_DONE.bits());
        } else {
            engine.discard_next();
            regs.raise(EVENT_REG, IrqEvents::DMA_ERROR.bits());
        }
        assert!(device.handle_interrupt());
    })
}

fn expected(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_blocking_dma_read() {
    let board = board();
    let hardware = run_transfer(&board, true);

    let mut buf = vec![0u8; 3 * 4096 + 100];
    let len = buf.len();
    assert_eq!(board.device.read(0x123, &mut buf, true), Ok(len));
    hardware.join().unwrap();

    assert_eq!(buf, expected(0x123, len));
    assert_eq!(board.platform.pinned_pages(), 0);
    assert_eq!(board.platform.active_mappings(), 0);
}

#[test]
fn test_refused_dma_read_releases_pages() {
    let board = board();
    board.engine.refuse(true);
    let mut buf = vec![0u8; 8192];
    assert_eq!(board.device.read(0, &mut buf, true), Err(Error::IoError));
    assert_eq!(board.platform.pinned_pages(), 0);
    assert_eq!(board.platform.dirty_pages(), 0);
}

#[test]
fn test_dma_read_beyond_device_memory() {
    let board = board();
    let mut buf = vec![0u8; 0x200];
    assert_eq!(board.device.read(0x3f00, &mut buf, true), Err(Error::InvalidArgument));
    assert_eq!(board.device.read(u64::MAX, &mut buf, true), Err(Error::InvalidArgument));
    assert_eq!(board.engine.in_flight(), 0);
    assert_eq!(board.platform.pinned_pages(), 0);

    board.device.create_aio_queue(1, None).unwrap();
    let op = AioOp::read(0x3f00, buf.as_mut_ptr() as usize, buf.len());
    assert_eq!(board.device.submit_aio(1, &[op]).err(), Some(Error::InvalidArgument));
    assert_eq!(board.engine.in_flight(), 0);
    assert_eq!(board.platform.pinned_pages(), 0);

    // the last in-range window still works
    let hardware = run_transfer(&board, true);
    assert_eq!(board.device.read(0x3e00, &mut buf, true), Ok(0x200));
    hardware.join().unwrap();
    assert_eq!(buf, expected(0x3e00, 0x200));
}

#[test]
fn test_interrupt_after_shutdown() {
    let board = board();
    board.device.shutdown();
    board.regs.raise(EVENT_REG, IrqEvents::DMA_DONE.bits());
    assert!(board.device.handle_interrupt());
    thread::sleep(Duration::from_millis(10));
    assert_eq!(board.device.stats().spurious_dma, 0);
}

#[test]
fn test_dma_backed_aio_read() {
    let board = board();
    let device = &board.device;
    device.create_aio_queue(1, None).unwrap();

    let mut buf = vec![0u8; 5000];
    let hardware = run_transfer(&board, true);
    let ids = device
        .submit_aio(1, &[AioOp::read(0x800, buf.as_mut_ptr() as usize, buf.len())])
        .unwrap();
    hardware.join().unwrap();

    let events = device.aio_events(1, 4, Duration::from_secs(5)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, ids[0]);
    assert_eq!(events[0].state, AioState::Completed);
    assert_eq!(events[0].bytes_transferred, 5000);
    assert_eq!(buf, expected(0x800, 5000));

    wait_for(|| board.platform.pinned_pages() == 0);
    assert!(board.platform.dirty_pages() > 0);
}

#[test]
fn test_failed_dma_fails_request() {
    let board = board();
    let device = &board.device;
    device.create_aio_queue(2, None).unwrap();

    let mut buf = vec![0u8; 4096];
    let hardware = run_transfer(&board, false);
    device
        .submit_aio(2, &[AioOp::read(0, buf.as_mut_ptr() as usize, buf.len())])
        .unwrap();
    hardware.join().unwrap();

    let events = device.aio_events(2, 4, Duration::from_secs(5)).unwrap();
    assert_eq!(events[0].state, AioState::Failed);
    assert_eq!(events[0].bytes_transferred, 0);
    wait_for(|| board.platform.pinned_pages() == 0);
    assert_eq!(board.platform.dirty_pages(), 0);
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn test_spurious_dma_interrupt() {
    let board = board();
    board.regs.raise(EVENT_REG, IrqEvents::DMA_DONE.bits());
    assert!(board.device.handle_interrupt());
    wait_for(|| board.device.stats().spurious_dma == 1);
}

#[test]
fn test_dma_write_rejected() {
    let board = board();
    board.device.create_aio_queue(1, None).unwrap();
    let mut op = AioOp::read(0, 0x10_0000, 16);
    op.direction = busctl::DmaDirection::ToDevice;
    assert_eq!(board.device.submit_aio(1, &[op]).err(), Some(Error::InvalidArgument));
    assert_eq!(board.device.write(0, &[1, 2], true), Err(Error::InvalidArgument));
}
