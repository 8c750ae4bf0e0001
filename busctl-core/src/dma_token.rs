// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! FIFO of in-flight bulk DMA transfers
//!
//! The board has a single active DMA channel, so the interrupt path always
//! completes the oldest outstanding token. Submissions are serialized by a
//! request lock so FIFO order equals the order transfers were programmed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error};
use parking_lot::Mutex;
use spin::Mutex as SpinMutex;

use crate::completion::Completion;
use crate::dma::DmaBuffer;
use crate::error::{Error, Result};

/// Platform specific "program the DMA engine and start" primitive
pub trait DmaEngine: Send + Sync {
    /// Start copying `buffer.len()` bytes of device memory at `offset` into
    /// the mapped segments of `buffer`. Completion arrives through the
    /// interrupt path.
    fn start_read(&self, buffer: &DmaBuffer, offset: u64) -> Result<()>;
}

type Callback = Box<dyn FnOnce(bool) + Send>;

/// One in-flight transfer
pub struct DmaToken {
    id: u64,
    completion: Completion,
    success: AtomicBool,
    callback: SpinMutex<Option<Callback>>,
}

impl DmaToken {
    fn new(id: u64, callback: Option<Callback>) -> Self {
        Self {
            id,
            completion: Completion::new(),
            success: AtomicBool::new(false),
            callback: SpinMutex::new(callback),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn finish(&self, success: bool) {
        self.success.store(success, Ordering::Release);
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => callback(success),
            None => self.completion.complete(),
        }
    }
}

/// Per-device FIFO of DMA tokens
pub struct DmaTokenQueue {
    tokens: SpinMutex<VecDeque<Arc<DmaToken>>>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    timeout: Duration,
}

/// Removes a token that never reached the interrupt path
struct TokenGuard<'a> {
    queue: &'a DmaTokenQueue,
    token: &'a Arc<DmaToken>,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.token);
    }
}

impl DmaTokenQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tokens: SpinMutex::new(VecDeque::new()),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Number of transfers waiting for completion
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    fn remove(&self, token: &Arc<DmaToken>) {
        let mut tokens = self.tokens.lock();
        if let Some(pos) = tokens.iter().position(|t| Arc::ptr_eq(t, token)) {
            tokens.remove(pos);
        }
    }

    fn enqueue(&self, callback: Option<Callback>) -> Arc<DmaToken> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = Arc::new(DmaToken::new(id, callback));
        self.tokens.lock().push_back(Arc::clone(&token));
        token
    }

    /// Blocking transfer of device memory at `offset` into `buffer`
    ///
    /// The token leaves the FIFO on every exit path, also when the engine
    /// refuses the transfer or the wait times out.
    pub fn start_read(&self, engine: &dyn DmaEngine, buffer: &DmaBuffer, offset: u64) -> Result<()> {
        assert!(buffer.is_mapped(), "DMA read into an unmapped buffer");

        let _request = self.request_lock.lock();
        let token = self.enqueue(None);
        let _guard = TokenGuard { queue: self, token: &token };

        debug!("DMA token {}: {} bytes from device offset {:#x}", token.id, buffer.len(), offset);
        engine.start_read(buffer, offset)?;

        if let Err(err) = token.completion.wait_timeout(self.timeout) {
            error!("DMA token {} timed out", token.id);
            return Err(err);
        }

        if token.success.load(Ordering::Acquire) {
            Ok(())
        } else {
            error!("DMA token {} completed with error", token.id);
            Err(Error::IoError)
        }
    }

    /// Start a transfer whose completion is reported through `on_complete`
    ///
    /// Used by asynchronous requests; the caller keeps `buffer` alive until
    /// `on_complete` runs.
    pub fn start_read_async<F>(&self, engine: &dyn DmaEngine, buffer: &DmaBuffer, offset: u64, on_complete: F) -> Result<u64>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        assert!(buffer.is_mapped(), "DMA read into an unmapped buffer");

        let _request = self.request_lock.lock();
        let token = self.enqueue(Some(Box::new(on_complete)));
        if let Err(err) = engine.start_read(buffer, offset) {
            self.remove(&token);
            return Err(err);
        }
        debug!("DMA token {} started asynchronously", token.id);
        Ok(token.id)
    }

    /// Complete the oldest outstanding transfer
    ///
    /// An empty FIFO means the hardware and the driver disagree about the
    /// number of transfers in flight; this is logged and reported as
    /// `IoError`.
    pub fn complete_oldest(&self, success: bool) -> Result<()> {
        let token = self.tokens.lock().pop_front();
        match token {
            Some(token) => {
                token.finish(success);
                Ok(())
            }
            None => {
                error!("DMA completion without an outstanding request");
                Err(Error::IoError)
            }
        }
    }

    /// Fail every outstanding transfer, used on device teardown
    pub fn abort_all(&self) {
        let tokens: Vec<_> = self.tokens.lock().drain(..).collect();
        for token in tokens {
            token.finish(false);
        }
    }
}
