// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Board instance
//!
//! [`Device`] owns the channel table, the AIO queue table and the DMA token
//! FIFO of one board and routes interrupts to them. The interrupt top half
//! ([`Device::handle_interrupt`]) acknowledges the event register and
//! records the causes in atomic counters and a bounded queue of DMA
//! statuses; the bottom half worker completes channels and DMA tokens,
//! drains the device event log and calls the protocol handler.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use spin::{Mutex as SpinMutex, Once};

use crate::aio::{AioHook, AioQueue, AioRequest, AioState, HandleId};
use crate::channel::{ChannelSetup, CommandChannel, MAX_CHANNELS, Signal};
use crate::config::{DeviceConfig, MAX_AIO_QUEUES_LIMIT, SignalMode};
use crate::dma::{DmaBuffer, DmaDirection, DmaPlatform};
use crate::dma_token::{DmaEngine, DmaTokenQueue};
use crate::error::{Error, Result};
use crate::event_log::{EVENT_ASP_TO_HOST, EventLog, Kick};
use crate::io::{MemoryWindow, RegisterIo, Window};
use crate::irq::{DeferredWork, IrqEvents, MAX_BIU, Scheduler};
use crate::stats::{DeviceStats, StatsReport};

/// Layout version of [`AioOp`] understood by this core
pub const AIO_OP_VERSION: u32 = 1;

/// Hardware the device is built on
pub struct DeviceResources {
    /// Control registers, including the event register and doorbell
    pub registers: Arc<dyn RegisterIo>,
    /// Device memory holding the channel windows
    pub memory: Arc<dyn MemoryWindow>,
    /// Host-I/O memory with the event logs, required for [`SignalMode::EventLog`]
    pub host_io: Option<Arc<dyn MemoryWindow>>,
    pub platform: Arc<dyn DmaPlatform>,
    /// Bulk DMA engine; without it only programmed I/O is available
    pub dma_engine: Option<Arc<dyn DmaEngine>>,
}

/// Placement of one command channel in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub id: u8,
    pub command_offset: usize,
    pub command_size: usize,
    pub response_offset: usize,
    pub response_size: usize,
}

/// Submission parameters of one asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioOp {
    pub version: u32,
    pub direction: DmaDirection,
    pub device_offset: u64,
    /// Host buffer, `host_len == 0` for operations handled by the protocol layer
    pub host_base: usize,
    pub host_len: usize,
}

impl AioOp {
    /// Bulk read of device memory into a host buffer
    pub fn read(device_offset: u64, host_base: usize, host_len: usize) -> Self {
        Self {
            version: AIO_OP_VERSION,
            direction: DmaDirection::FromDevice,
            device_offset,
            host_base,
            host_len,
        }
    }

    /// Operation without host buffer, started by the protocol handler
    pub fn protocol(direction: DmaDirection, device_offset: u64) -> Self {
        Self {
            version: AIO_OP_VERSION,
            direction,
            device_offset,
            host_base: 0,
            host_len: 0,
        }
    }
}

/// Completion record returned by [`Device::aio_events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AioEvent {
    pub id: u64,
    pub state: AioState,
    pub bytes_transferred: usize,
    pub attachment: Vec<u8>,
}

/// Bus protocol layer sitting on top of this core
///
/// Called from the bottom half, except for the AIO hooks which run in the
/// context of the submitting or cancelling caller.
pub trait ProtocolHandler: Send + Sync {
    /// `count` interrupts of bus interface unit `biu` since the last call
    fn biu_interrupt(&self, biu: usize, count: u32) {
        debug!("BIU {}: {} unhandled interrupts", biu, count);
    }

    /// The auxiliary processor raised `count` events
    fn asp_interrupt(&self, count: u32) {
        debug!("{} unhandled ASP events", count);
    }

    /// Event log entry without meaning to this core
    fn device_event(&self, event: u32) {
        debug!("unhandled device event {:#x}", event);
    }

    /// Start an operation without host buffer. Completion is reported
    /// later through [`Device::complete_aio`] or the queue directly.
    fn start_aio(&self, queue: &Arc<AioQueue>, request: &Arc<AioRequest>) -> Result<()> {
        let _ = (queue, request);
        Ok(())
    }

    fn cancel_aio(&self, request: &Arc<AioRequest>) -> Result<()> {
        let _ = request;
        Ok(())
    }
}

struct Pending {
    channels: AtomicU32,
    biu: [AtomicU32; MAX_BIU],
    asp: AtomicU32,
    event_log: AtomicBool,
}

/// One controller board
pub struct Device {
    config: DeviceConfig,
    registers: Arc<dyn RegisterIo>,
    memory: Arc<dyn MemoryWindow>,
    platform: Arc<dyn DmaPlatform>,
    dma_engine: Option<Arc<dyn DmaEngine>>,
    device_log: Option<EventLog>,
    host_log: Option<Arc<EventLog>>,
    channels: SpinMutex<[Option<Arc<CommandChannel>>; MAX_CHANNELS]>,
    aio_queues: SpinMutex<Vec<Option<Arc<AioQueue>>>>,
    dma_tokens: DmaTokenQueue,
    pending: Pending,
    dma_status: ArrayQueue<bool>,
    handler: SpinMutex<Option<Arc<dyn ProtocolHandler>>>,
    bottom_half: Mutex<Option<DeferredWork>>,
    /// Set once the worker is up; the top half schedules through it
    scheduler: Once<Scheduler>,
    stats: DeviceStats,
}

impl Device {
    /// Set up the board and start its bottom half worker
    pub fn new(mut config: DeviceConfig, resources: DeviceResources) -> Result<Arc<Self>> {
        let DeviceResources {
            registers,
            memory,
            host_io,
            platform,
            dma_engine,
        } = resources;

        if config.event_register + 4 > registers.io_size() {
            error!("event register {:#x} outside register window", config.event_register);
            return Err(Error::InvalidArgument);
        }
        config.max_aio_queues = config.max_aio_queues.clamp(1, MAX_AIO_QUEUES_LIMIT);

        let (device_log, host_log) = match config.signal_mode {
            SignalMode::Doorbell => (None, None),
            SignalMode::EventLog => {
                let Some(host_io) = host_io else {
                    error!("event log signalling needs host-io memory");
                    return Err(Error::InvalidArgument);
                };
                let device_log = EventLog::new(host_io.clone(), config.event_log_base, config.device_log, None)?;
                let kick = Kick {
                    regs: registers.clone(),
                    offset: config.event_kick_register,
                };
                let host_log = EventLog::new(host_io, config.event_log_base, config.host_log, Some(kick))?;
                device_log.reset();
                host_log.reset();
                (Some(device_log), Some(Arc::new(host_log)))
            }
        };

        let device = Arc::new(Self {
            aio_queues: SpinMutex::new(vec![None; config.max_aio_queues]),
            dma_tokens: DmaTokenQueue::new(config.dma_timeout),
            dma_status: ArrayQueue::new(config.deferred_queue_depth.max(1)),
            config,
            registers,
            memory,
            platform,
            dma_engine,
            device_log,
            host_log,
            channels: SpinMutex::new(Default::default()),
            pending: Pending {
                channels: AtomicU32::new(0),
                biu: Default::default(),
                asp: AtomicU32::new(0),
                event_log: AtomicBool::new(false),
            },
            handler: SpinMutex::new(None),
            bottom_half: Mutex::new(None),
            scheduler: Once::new(),
            stats: DeviceStats::new(),
        });

        let weak = Arc::downgrade(&device);
        let worker = DeferredWork::spawn("busctl-bh", move || {
            if let Some(device) = weak.upgrade() {
                device.bottom_half();
            }
        })?;
        if let Some(scheduler) = worker.scheduler() {
            device.scheduler.call_once(|| scheduler);
        }
        *device.bottom_half.lock() = Some(worker);

        info!(
            "busctl: device up, {:?} signalling, {} AIO queues, DMA {}",
            device.config.signal_mode,
            device.config.max_aio_queues,
            if device.dma_engine.is_some() { "enabled" } else { "disabled" }
        );
        Ok(device)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn set_protocol_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        *self.handler.lock() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.handler.lock().clone()
    }

    // ---- command channels ----

    /// Create channel `layout.id` over the device memory
    pub fn add_channel(&self, layout: ChannelLayout) -> Result<Arc<CommandChannel>> {
        let window = |offset, size| {
            Window::new(self.memory.clone(), offset, size).map_err(|err| {
                error!("data areas of com channel {} exceed resource size", layout.id);
                err
            })
        };
        let signal = match &self.host_log {
            Some(log) => Signal::EventLog(log.clone()),
            None => Signal::Doorbell {
                regs: self.registers.clone(),
                offset: self.config.doorbell_register,
            },
        };
        let setup = ChannelSetup {
            command: window(layout.command_offset, layout.command_size)?,
            response: window(layout.response_offset, layout.response_size)?,
            signal,
        };
        let channel = Arc::new(CommandChannel::new(layout.id, setup, self.config.channel_timeout)?);

        let mut channels = self.channels.lock();
        let slot = &mut channels[layout.id as usize];
        if slot.is_some() {
            error!("com channel {} already set up", layout.id);
            return Err(Error::AlreadyExists);
        }
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Detach and forget channel `id`; a command in flight fails with `IoError`
    pub fn remove_channel(&self, id: u8) -> Result<()> {
        let channel = self.channels.lock().get_mut(id as usize).and_then(Option::take);
        match channel {
            Some(channel) => {
                channel.release();
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    pub fn channel(&self, id: u8) -> Option<Arc<CommandChannel>> {
        self.channels.lock().get(id as usize).cloned().flatten()
    }

    /// Blocking command round trip on channel `id`
    pub fn issue_command(&self, id: u8, command: &[u8], response: &mut [u8], expected: usize) -> Result<usize> {
        let Some(channel) = self.channel(id) else {
            error!("no com channel {}", id);
            return Err(Error::InvalidArgument);
        };
        let result = channel.issue(command, response, expected);
        self.stats
            .record_command(result == Err(Error::Timeout), result.is_err());
        if result == Err(Error::ResourceExhausted) {
            self.stats.record_event_log_overflow();
        }
        result
    }

    // ---- AIO queues ----

    fn queue_slot(&self, id: u32) -> Result<usize> {
        match id as usize {
            n @ 1.. if n <= self.config.max_aio_queues => Ok(n - 1),
            _ => {
                error!("invalid AIO queue id {}", id);
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Create queue `id` (1-based) owned by `owner`
    pub fn create_aio_queue(&self, id: u32, owner: Option<HandleId>) -> Result<Arc<AioQueue>> {
        let slot = self.queue_slot(id)?;
        let mut queues = self.aio_queues.lock();
        if queues[slot].is_some() {
            error!("AIO queue {} already exists", id);
            return Err(Error::AlreadyExists);
        }
        let queue = Arc::new(AioQueue::new(id));
        queue.assign_owner(owner);
        queues[slot] = Some(queue.clone());
        debug!("created AIO queue {}", id);
        Ok(queue)
    }

    pub fn aio_queue(&self, id: u32) -> Result<Arc<AioQueue>> {
        let slot = self.queue_slot(id)?;
        self.aio_queues.lock()[slot].clone().ok_or_else(|| {
            error!("AIO queue {} not set up", id);
            Error::InvalidArgument
        })
    }

    /// Remove queue `id`; pending requests are cancelled once the last
    /// reference is gone.
    pub fn delete_aio_queue(&self, id: u32) -> Result<()> {
        let slot = self.queue_slot(id)?;
        let queue = self.aio_queues.lock()[slot].take();
        match queue {
            Some(queue) => {
                drop(queue);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Delete every queue owned by a closing file handle
    pub fn release_handle(&self, owner: HandleId) -> usize {
        let released: Vec<_> = {
            let mut queues = self.aio_queues.lock();
            queues
                .iter_mut()
                .filter(|slot| slot.as_ref().is_some_and(|q| q.owner() == Some(owner)))
                .filter_map(Option::take)
                .collect()
        };
        if !released.is_empty() {
            debug!("file handle {} closed, releasing {} AIO queues", owner, released.len());
        }
        released.len()
    }

    /// Submit `ops` to queue `queue_id`, returning the request ids
    ///
    /// Stops at the first failing operation; the ones before it stay
    /// submitted.
    pub fn submit_aio(self: &Arc<Self>, queue_id: u32, ops: &[AioOp]) -> Result<Vec<u64>> {
        let queue = self.aio_queue(queue_id)?;
        let mut ids = Vec::with_capacity(ops.len());

        for op in ops {
            let request = self.build_request(&queue, op)?;
            queue.submit(&request)?;
            self.stats.record_aio_submitted(1);
            ids.push(request.id());
        }
        Ok(ids)
    }

    fn build_request(self: &Arc<Self>, queue: &Arc<AioQueue>, op: &AioOp) -> Result<Arc<AioRequest>> {
        if op.version != AIO_OP_VERSION {
            error!("unsupported AIO parameter version {}", op.version);
            return Err(Error::InvalidArgument);
        }

        let request = if op.host_len == 0 {
            let request = AioRequest::new(op.direction, op.device_offset);
            let device = Arc::downgrade(self);
            let cancel: AioHook = Arc::new(move |request: &Arc<AioRequest>| {
                match device.upgrade().and_then(|device| device.handler()) {
                    Some(handler) => handler.cancel_aio(request),
                    None => Ok(()),
                }
            });
            request.set_cancel_hook(cancel);
            request
        } else {
            if op.direction != DmaDirection::FromDevice {
                error!("DMA transfers to the device are not supported");
                return Err(Error::InvalidArgument);
            }
            if self.dma_engine.is_none() {
                error!("no DMA engine for AIO read");
                return Err(Error::InvalidArgument);
            }
            self.check_range(op.device_offset, op.host_len)?;
            AioRequest::with_dma(
                self.platform.clone(),
                op.direction,
                op.device_offset,
                op.host_base,
                op.host_len,
            )?
        };

        let device = Arc::downgrade(self);
        let weak_queue = Arc::downgrade(queue);
        let start: AioHook = Arc::new(move |request: &Arc<AioRequest>| {
            let (Some(device), Some(queue)) = (device.upgrade(), weak_queue.upgrade()) else {
                return Err(Error::IoError);
            };
            device.start_request(&queue, request)
        });
        request.set_start_hook(start);
        Ok(request)
    }

    fn start_request(&self, queue: &Arc<AioQueue>, request: &Arc<AioRequest>) -> Result<()> {
        let Some(buffer) = request.dma_buffer() else {
            return match self.handler() {
                Some(handler) => handler.start_aio(queue, request),
                None => Ok(()),
            };
        };
        let Some(engine) = &self.dma_engine else {
            return Err(Error::IoError);
        };

        // the callback keeps the request, and with it the buffer, alive
        // until the transfer has finished
        let keep = Arc::clone(request);
        let weak_queue: Weak<AioQueue> = Arc::downgrade(queue);
        let len = buffer.len();
        self.dma_tokens
            .start_read_async(engine.as_ref(), buffer, request.device_offset(), move |success| {
                let bytes = if success { len } else { 0 };
                if let Some(queue) = weak_queue.upgrade() {
                    if let Err(err) = queue.complete_request(keep.id(), success, bytes, &[]) {
                        debug!("DMA done for AIO request {} no longer pending: {}", keep.id(), err);
                    }
                }
                drop(keep);
            })
            .map(|_| ())
    }

    /// Wait up to `timeout` for completed requests on queue `queue_id`
    pub fn aio_events(&self, queue_id: u32, max: usize, timeout: Duration) -> Result<Vec<AioEvent>> {
        let queue = self.aio_queue(queue_id)?;
        let done = queue.pop_completed(max, timeout)?;
        self.stats.record_aio_completed(done.len());
        Ok(done
            .iter()
            .map(|request| AioEvent {
                id: request.id(),
                state: request.state(),
                bytes_transferred: request.bytes_transferred(),
                attachment: request.attachment(),
            })
            .collect())
    }

    pub fn cancel_aio(&self, queue_id: u32, request_id: u64) -> Result<()> {
        self.aio_queue(queue_id)?.cancel(request_id)
    }

    /// Protocol side: complete the oldest pending request of a queue
    pub fn complete_aio(&self, queue_id: u32, success: bool, bytes_transferred: usize, attachment: &[u8]) -> Result<()> {
        self.aio_queue(queue_id)?
            .complete_next(success, bytes_transferred, attachment)
    }

    // ---- device memory ----

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let offset = usize::try_from(offset).map_err(|_| Error::InvalidArgument)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.memory.size() => Ok(offset),
            _ => {
                error!("access of {} bytes at {:#x} outside device memory", len, offset);
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Read device memory at `offset`, by bulk DMA if `use_dma`
    pub fn read(&self, offset: u64, buf: &mut [u8], use_dma: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let start = self.check_range(offset, buf.len())?;
        if !use_dma {
            self.memory.read_bytes(start, buf);
            return Ok(buf.len());
        }

        let Some(engine) = &self.dma_engine else {
            error!("DMA read requested without DMA engine");
            return Err(Error::IoError);
        };
        let buffer = DmaBuffer::prepare(
            self.platform.clone(),
            buf.as_mut_ptr() as usize,
            buf.len(),
            DmaDirection::FromDevice,
        )?;
        let result = self.dma_tokens.start_read(engine.as_ref(), &buffer, offset);
        buffer.free(result.is_ok());
        result.map(|()| buf.len())
    }

    /// Programmed write of device memory; DMA writes are not supported
    pub fn write(&self, offset: u64, data: &[u8], use_dma: bool) -> Result<usize> {
        if use_dma {
            error!("DMA writes are not supported");
            return Err(Error::InvalidArgument);
        }
        let offset = self.check_range(offset, data.len())?;
        self.memory.write_bytes(offset, data);
        Ok(data.len())
    }

    // ---- interrupts ----

    fn signal_channels(&self, mask: u32) {
        if mask == 0 {
            return;
        }
        let channels = self.channels.lock().clone();
        for (id, channel) in channels.iter().enumerate() {
            if mask & (1 << id) == 0 {
                continue;
            }
            match channel {
                Some(channel) => channel.signal_completion(),
                None => warn!("event for com channel {} which is not set up", id),
            }
        }
    }

    /// Interrupt top half
    ///
    /// Only reads and acknowledges the event register, records what
    /// happened and schedules the bottom half. Returns false when none of
    /// our event bits were set, so a shared interrupt line can be passed on.
    pub fn handle_interrupt(&self) -> bool {
        let raw = self.registers.read32(self.config.event_register);
        let events = IrqEvents::from_bits_truncate(raw);
        if events.is_empty() {
            self.stats.record_interrupt(false);
            return false;
        }
        self.registers.write32(self.config.event_register, events.bits());
        self.stats.record_interrupt(true);

        self.pending.channels.fetch_or(events.channel_mask(), Ordering::AcqRel);
        for (biu, bit) in IrqEvents::BIU.iter().enumerate() {
            if events.contains(*bit) {
                self.pending.biu[biu].fetch_add(1, Ordering::AcqRel);
            }
        }
        if events.contains(IrqEvents::ASP) {
            self.pending.asp.fetch_add(1, Ordering::AcqRel);
        }
        if events.contains(IrqEvents::EVENT_LOG) {
            self.pending.event_log.store(true, Ordering::Release);
        }
        if events.intersects(IrqEvents::DMA_DONE | IrqEvents::DMA_ERROR) {
            let success = !events.contains(IrqEvents::DMA_ERROR);
            if self.dma_status.push(success).is_err() {
                error!("DMA completion queue full, transfer status lost");
                self.stats.record_dropped_event();
            }
        }

        if let Some(scheduler) = self.scheduler.get() {
            scheduler.schedule();
        }
        true
    }

    fn dispatch_log_event(&self, event: u32, handler: Option<&Arc<dyn ProtocolHandler>>) {
        self.signal_channels(event & IrqEvents::CHANNELS.bits());
        if event & EVENT_ASP_TO_HOST != 0 {
            self.pending.asp.fetch_add(1, Ordering::AcqRel);
        }
        let rest = event & !(IrqEvents::CHANNELS.bits() | EVENT_ASP_TO_HOST);
        if rest != 0 {
            match handler {
                Some(handler) => handler.device_event(rest),
                None => debug!("device event {:#x} without protocol handler", rest),
            }
        }
    }

    /// Interrupt bottom half, run on the deferred work thread
    fn bottom_half(&self) {
        let handler = self.handler();

        self.signal_channels(self.pending.channels.swap(0, Ordering::AcqRel));

        while let Some(success) = self.dma_status.pop() {
            match self.dma_tokens.complete_oldest(success) {
                Ok(()) => self.stats.record_dma(success),
                Err(_) => self.stats.record_spurious_dma(),
            }
        }

        if self.pending.event_log.swap(false, Ordering::AcqRel) {
            if let Some(log) = &self.device_log {
                if let Err(err) = log.drain(|event| self.dispatch_log_event(event, handler.as_ref())) {
                    error!("failed to read device event log: {}", err);
                }
            }
        }

        for (biu, pending) in self.pending.biu.iter().enumerate() {
            let count = pending.swap(0, Ordering::AcqRel);
            if count == 0 {
                continue;
            }
            match &handler {
                Some(handler) => handler.biu_interrupt(biu, count),
                None => debug!("BIU {}: {} interrupts without protocol handler", biu, count),
            }
        }

        let asp = self.pending.asp.swap(0, Ordering::AcqRel);
        if asp != 0 {
            match &handler {
                Some(handler) => handler.asp_interrupt(asp),
                None => debug!("{} ASP events without protocol handler", asp),
            }
        }
    }

    pub fn stats(&self) -> StatsReport {
        self.stats.snapshot()
    }

    /// Detach from the hardware
    ///
    /// Outstanding DMA transfers fail, waiting commands fail with `IoError`
    /// and every AIO queue is released. Safe to call more than once.
    pub fn shutdown(&self) {
        let worker = self.bottom_half.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }

        self.dma_tokens.abort_all();

        let channels: Vec<_> = self.channels.lock().iter_mut().filter_map(Option::take).collect();
        for channel in &channels {
            channel.release();
        }

        let queues: Vec<_> = self.aio_queues.lock().iter_mut().filter_map(Option::take).collect();
        if !channels.is_empty() || !queues.is_empty() {
            info!(
                "busctl: shut down, released {} channels and {} AIO queues",
                channels.len(),
                queues.len()
            );
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}
