// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::frame::ControlFrame;

/// Frames queued per viewer before it counts as too slow.
pub const VIEWER_QUEUE: usize = 1024;

static NEXT_VIEWER: AtomicU64 = AtomicU64::new(1);

/// One item of a viewer's outbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Bytes),
    Control(ControlFrame),
}

/// Sending half of a viewer's outbound queue.
///
/// Sessions hold sinks without owning the connection behind them: once the
/// connection goes away the queue closes and the sink is dropped on the next
/// delivery.
#[derive(Debug, Clone)]
pub struct ViewerSink {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl ViewerSink {
    /// Create a sink and the receiver a connection drains.
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(VIEWER_QUEUE)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_VIEWER.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame without waiting. Returns false if the viewer is full or
    /// gone.
    pub fn offer(&self, frame: Outbound) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
