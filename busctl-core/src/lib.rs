// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Controller core for PCI data-bus interface boards
//!
//! Command/response channels to the on-board processor, bulk DMA from
//! device memory, and queues of asynchronous I/O requests completed from
//! the interrupt bottom half. Register and memory access goes through the
//! [`io`] traits; [`sim`] provides in-memory implementations.

pub mod aio;
pub mod channel;
pub mod completion;
pub mod config;
pub mod device;
pub mod dma;
pub mod dma_token;
pub mod error;
pub mod event_log;
pub mod io;
pub mod irq;
pub mod protocol;
pub mod ring;
pub mod sim;
pub mod stats;

pub use aio::{AioQueue, AioRequest, AioState, HandleId};
pub use channel::CommandChannel;
pub use config::{DeviceConfig, SignalMode};
pub use device::{AioEvent, AioOp, ChannelLayout, Device, DeviceResources, ProtocolHandler};
pub use dma::{DmaBuffer, DmaDirection, DmaPlatform};
pub use dma_token::{DmaEngine, DmaTokenQueue};
pub use error::{Error, Result};
pub use io::{MemoryWindow, Mmio, RegisterIo};
pub use stats::StatsReport;
