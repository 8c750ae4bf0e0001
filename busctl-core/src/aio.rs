// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Asynchronous I/O requests and queues
//!
//! A request moves `NotProcessed -> Pending -> {Completed | Failed |
//! Cancelled}` and never leaves a final state. A queue keeps submitted
//! requests on a pending list in submission order and moves them to a
//! completed list as the hardware reports them done. Completion runs in the
//! bottom half; callers block in [`AioQueue::pop_completed`].
//!
//! Lock order is queue lists before request state. Start and cancel hooks
//! are always invoked with no lock held, so they may complete the request
//! re-entrantly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use spin::Mutex as SpinMutex;

use crate::completion::WaitQueue;
use crate::dma::{DmaBuffer, DmaDirection, DmaPlatform};
use crate::error::{Error, Result};

/// Inline capacity for protocol specific completion data
pub const AIO_MAX_ATTACHMENT_SIZE: usize = 128;

/// Identifies the open file handle owning a queue
pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioState {
    NotProcessed,
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl AioState {
    pub fn is_final(self) -> bool {
        matches!(self, AioState::Completed | AioState::Failed | AioState::Cancelled)
    }
}

/// Protocol specific start or cancel action
pub type AioHook = Arc<dyn Fn(&Arc<AioRequest>) -> Result<()> + Send + Sync>;

struct RequestState {
    state: AioState,
    bytes_transferred: usize,
    attachment: [u8; AIO_MAX_ATTACHMENT_SIZE],
    attachment_len: usize,
}

/// One outstanding asynchronous operation
pub struct AioRequest {
    id: u64,
    direction: DmaDirection,
    device_offset: u64,
    dma_buffer: Option<DmaBuffer>,
    inner: SpinMutex<RequestState>,
    start_hook: SpinMutex<Option<AioHook>>,
    cancel_hook: SpinMutex<Option<AioHook>>,
}

impl fmt::Debug for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioRequest")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl AioRequest {
    /// Request without host buffer; ids are random so they stay unique
    /// across queues and driver restarts.
    pub fn new(direction: DmaDirection, device_offset: u64) -> Arc<Self> {
        Arc::new(Self::build(direction, device_offset, None))
    }

    /// Request owning a DMA buffer for `length` bytes at `base`
    ///
    /// A zero length creates a request without buffer. Setup failures
    /// release whatever was acquired before returning.
    pub fn with_dma(
        platform: Arc<dyn DmaPlatform>,
        direction: DmaDirection,
        device_offset: u64,
        base: usize,
        length: usize,
    ) -> Result<Arc<Self>> {
        if length == 0 {
            return Ok(Self::new(direction, device_offset));
        }
        let buffer = DmaBuffer::prepare(platform, base, length, direction).map_err(|err| {
            error!("failed to set up DMA buffer for AIO request: {}", err);
            err
        })?;
        Ok(Arc::new(Self::build(direction, device_offset, Some(buffer))))
    }

    fn build(direction: DmaDirection, device_offset: u64, dma_buffer: Option<DmaBuffer>) -> Self {
        Self {
            id: rand::random(),
            direction,
            device_offset,
            dma_buffer,
            inner: SpinMutex::new(RequestState {
                state: AioState::NotProcessed,
                bytes_transferred: 0,
                attachment: [0; AIO_MAX_ATTACHMENT_SIZE],
                attachment_len: 0,
            }),
            start_hook: SpinMutex::new(None),
            cancel_hook: SpinMutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Device memory offset the operation targets
    pub fn device_offset(&self) -> u64 {
        self.device_offset
    }

    pub fn dma_buffer(&self) -> Option<&DmaBuffer> {
        self.dma_buffer.as_ref()
    }

    pub fn state(&self) -> AioState {
        self.inner.lock().state
    }

    pub fn bytes_transferred(&self) -> usize {
        self.inner.lock().bytes_transferred
    }

    /// Copy of the attachment stored on completion
    pub fn attachment(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        inner.attachment[..inner.attachment_len].to_vec()
    }

    pub fn set_start_hook(&self, hook: AioHook) {
        *self.start_hook.lock() = Some(hook);
    }

    pub fn set_cancel_hook(&self, hook: AioHook) {
        *self.cancel_hook.lock() = Some(hook);
    }

    /// Mark pending and run the start hook
    pub fn start(self: &Arc<Self>) -> Result<()> {
        debug!("Starting AIO request {}", self.id);
        {
            let mut inner = self.inner.lock();
            if inner.state != AioState::NotProcessed {
                error!("AIO request {} already processed", self.id);
                return Err(Error::AlreadyInProgress);
            }
            inner.state = AioState::Pending;
        }

        let hook = self.start_hook.lock().clone();
        match hook {
            Some(hook) => hook(self),
            None => Ok(()),
        }
    }

    /// Cancel a request that has not reached a final state
    ///
    /// The cancel hook still runs when the hardware operation was already
    /// started; it has to cope with a transfer in flight.
    pub fn cancel(self: &Arc<Self>) -> Result<()> {
        debug!("Cancelling AIO request {}", self.id);
        {
            let mut inner = self.inner.lock();
            match inner.state {
                AioState::Cancelled => return Err(Error::AlreadyInProgress),
                AioState::Completed | AioState::Failed => return Err(Error::Busy),
                AioState::NotProcessed | AioState::Pending => inner.state = AioState::Cancelled,
            }
        }

        let hook = self.cancel_hook.lock().clone();
        match hook {
            Some(hook) => hook(self),
            None => Ok(()),
        }
    }

    /// Record the hardware result
    ///
    /// Also accepted from `NotProcessed` for hardware that completes before
    /// the submitter marked the request pending.
    pub fn complete(&self, success: bool, bytes_transferred: usize, attachment: &[u8]) -> Result<()> {
        debug!(
            "Completing AIO request {} ({} bytes were transferred)",
            self.id, bytes_transferred
        );

        if attachment.len() > AIO_MAX_ATTACHMENT_SIZE {
            error!(
                "attachment of {} bytes too large for AIO request completion",
                attachment.len()
            );
            return Err(Error::InvalidArgument);
        }

        let mut inner = self.inner.lock();
        match inner.state {
            AioState::Completed | AioState::Failed => Err(Error::AlreadyInProgress),
            AioState::Cancelled => Err(Error::Busy),
            AioState::NotProcessed | AioState::Pending => {
                inner.state = if success { AioState::Completed } else { AioState::Failed };
                inner.bytes_transferred = bytes_transferred;
                inner.attachment[..attachment.len()].copy_from_slice(attachment);
                inner.attachment_len = attachment.len();
                Ok(())
            }
        }
    }
}

impl Drop for AioRequest {
    fn drop(&mut self) {
        debug!("Freeing AIO request {}", self.id);
        if let Some(buffer) = self.dma_buffer.take() {
            let dirty = self.inner.get_mut().state == AioState::Completed;
            buffer.free(dirty);
        }
    }
}

#[derive(Default)]
struct Lists {
    pending: VecDeque<Arc<AioRequest>>,
    completed: VecDeque<Arc<AioRequest>>,
}

fn take_by<F>(list: &mut VecDeque<Arc<AioRequest>>, f: F) -> Option<Arc<AioRequest>>
where
    F: Fn(&Arc<AioRequest>) -> bool,
{
    let pos = list.iter().position(f)?;
    list.remove(pos)
}

/// Container of submitted requests
///
/// Shared as `Arc<AioQueue>`; when the last reference goes away every
/// pending request is cancelled and every request released.
pub struct AioQueue {
    id: u32,
    owner: SpinMutex<Option<HandleId>>,
    lists: SpinMutex<Lists>,
    waiters: WaitQueue,
}

impl AioQueue {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            owner: SpinMutex::new(None),
            lists: SpinMutex::new(Lists::default()),
            waiters: WaitQueue::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn owner(&self) -> Option<HandleId> {
        *self.owner.lock()
    }

    pub fn assign_owner(&self, handle: Option<HandleId>) {
        debug!("Assigning file handle {:?} to AIO queue {}", handle, self.id);
        *self.owner.lock() = handle;
    }

    pub fn pending_len(&self) -> usize {
        self.lists.lock().pending.len()
    }

    pub fn completed_len(&self) -> usize {
        self.lists.lock().completed.len()
    }

    /// Queue `request` and start it
    ///
    /// If the start hook fails the request is taken back off the pending
    /// list and the error returned.
    pub fn submit(&self, request: &Arc<AioRequest>) -> Result<()> {
        debug!("Submitting request {} to AIO queue {}", request.id, self.id);

        self.lists.lock().pending.push_back(Arc::clone(request));

        if let Err(err) = request.start() {
            let removed = take_by(&mut self.lists.lock().pending, |r| Arc::ptr_eq(r, request));
            drop(removed);
            return Err(err);
        }
        Ok(())
    }

    fn finish<F>(&self, select: F, success: bool, bytes_transferred: usize, attachment: &[u8]) -> Result<()>
    where
        F: Fn(&VecDeque<Arc<AioRequest>>) -> Option<usize>,
    {
        {
            let mut lists = self.lists.lock();
            let pos = select(&lists.pending).ok_or(Error::NoData)?;
            let request = &lists.pending[pos];
            if let Err(err) = request.complete(success, bytes_transferred, attachment) {
                error!("Failed to complete AIO request {} on queue {}: {}", request.id, self.id, err);
                return Err(err);
            }
            if let Some(request) = lists.pending.remove(pos) {
                lists.completed.push_back(request);
            }
        }
        self.waiters.wake_up();
        Ok(())
    }

    /// Complete the oldest pending request
    ///
    /// Fails with `NoData` when nothing is pending.
    pub fn complete_next(&self, success: bool, bytes_transferred: usize, attachment: &[u8]) -> Result<()> {
        debug!("Completing next AIO request on queue {}", self.id);
        self.finish(|pending| (!pending.is_empty()).then_some(0), success, bytes_transferred, attachment)
    }

    /// Complete the pending request with the given id
    pub fn complete_request(&self, id: u64, success: bool, bytes_transferred: usize, attachment: &[u8]) -> Result<()> {
        self.finish(
            |pending| pending.iter().position(|r| r.id == id),
            success,
            bytes_transferred,
            attachment,
        )
        .map_err(|err| if err == Error::NoData { Error::NotFound } else { err })
    }

    /// Take up to `max` completed requests
    ///
    /// Waits until at least one is available; a zero timeout only checks.
    /// Fails with `Timeout` when none arrived in time.
    pub fn pop_completed(&self, max: usize, timeout: Duration) -> Result<Vec<Arc<AioRequest>>> {
        debug!("Popping {} completed requests from queue {} with timeout {:?}", max, self.id, timeout);

        let ready = self
            .waiters
            .wait_event_timeout(|| !self.lists.lock().completed.is_empty(), timeout);
        if !ready {
            debug!("aio completion wait on queue {} timed out", self.id);
            return Err(Error::Timeout);
        }

        let mut lists = self.lists.lock();
        let count = max.min(lists.completed.len());
        Ok(lists.completed.drain(..count).collect())
    }

    /// Cancel the pending request `id` and move it to the completed list
    pub fn cancel(&self, id: u64) -> Result<()> {
        debug!("Cancelling AIO request {} in queue {}", id, self.id);

        let request = self.lists.lock().pending.iter().find(|r| r.id == id).cloned();
        let Some(request) = request else {
            error!("Request {} for cancellation not found", id);
            return Err(Error::NotFound);
        };

        if let Err(err) = request.cancel() {
            error!("Cancellation of request {} failed: {}", id, err);
            return Err(err);
        }

        {
            let mut lists = self.lists.lock();
            if let Some(request) = take_by(&mut lists.pending, |r| Arc::ptr_eq(r, &request)) {
                lists.completed.push_back(request);
            }
        }
        self.waiters.wake_up();
        Ok(())
    }
}

impl Drop for AioQueue {
    fn drop(&mut self) {
        debug!("Freeing AIO queue {}", self.id);

        let Lists { pending, completed } = std::mem::take(self.lists.get_mut());
        drop(completed);

        for request in pending {
            if let Err(err) = request.cancel() {
                warn!("Couldn't cancel aio request {}: {}", request.id, err);
            }
        }
    }
}
