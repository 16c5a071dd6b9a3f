//! Logical streams multiplexed over a control session
//!
//! The session driver owns every stream slot. Handles only hold the shared
//! per-stream state below plus channels back into the driver.

mod handle;

pub use handle::{StreamHandle, StreamReader, StreamWriter};

use bytes::Bytes;
use poglets_common::TunnelError;
use poglets_protocol::{ErrorCode, ResponseHead, StreamId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Inbound event delivered to a stream's reader, in wire order.
#[derive(Debug)]
pub enum StreamEvent {
    /// Response head (server side only)
    Reply(ResponseHead),
    Data(Bytes),
    /// The peer half-closed its direction
    End,
    Failed(TunnelError),
}

/// Last-activity timestamp readable from any task.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// State shared between the driver's slot and the stream's handles.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: StreamId,
    /// Credit for outbound data; one permit per byte
    pub(crate) send_window: Semaphore,
    pub(crate) activity: ActivityClock,
    pub(crate) cancel: CancellationToken,
    failure: OnceLock<(ErrorCode, String)>,
}

impl StreamShared {
    pub(crate) fn new(id: StreamId, initial_window: u32) -> Self {
        Self {
            id,
            send_window: Semaphore::new(initial_window as usize),
            activity: ActivityClock::new(),
            cancel: CancellationToken::new(),
            failure: OnceLock::new(),
        }
    }

    /// Terminate the stream: wakes blocked writers and cancels local work.
    pub(crate) fn fail(&self, code: ErrorCode, message: &str) {
        let _ = self.failure.set((code, message.to_string()));
        self.release();
        self.cancel.cancel();
    }

    /// Release the window once the stream has completed normally.
    pub(crate) fn release(&self) {
        self.send_window.close();
    }

    pub(crate) fn failure(&self) -> TunnelError {
        match self.failure.get() {
            Some((code, message)) => TunnelError::from_code(*code, message.clone()),
            None => TunnelError::SessionClosing,
        }
    }
}
