// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity concurrent FIFO with a drain-request signal.
//!
//! Producers insert with [`Ring::offer`] (never waits) or [`Ring::push`] (waits
//! for space). Every successful insert raises the ready signal, which a single
//! consumer awaits with [`Ring::ready`] before draining with [`Ring::pop`].
//! The signal channel has the same capacity as the ring, so redundant signals
//! collapse instead of piling up.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::constants::POP_GRACE_PERIOD_MS;
use crate::errors::RingError;

/// Rejected non-blocking insert. The item is handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferError<T> {
    Full(T),
    Closed(T),
}

impl<T> OfferError<T> {
    pub fn into_inner(self) -> T {
        match self {
            OfferError::Full(item) | OfferError::Closed(item) => item,
        }
    }
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

#[derive(Debug)]
pub struct Ring<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<State<T>>,
    space: Notify,
    kick_tx: mpsc::Sender<()>,
    kick_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl<T> Ring<T> {
    #[must_use]
    pub fn new(capacity: usize, name: &'static str) -> Self {
        let (kick_tx, kick_rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            space: Notify::new(),
            kick_tx,
            kick_rx: tokio::sync::Mutex::new(kick_rx),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let state = self.state.lock().expect("lock poisoned");
        state.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts without waiting. Fails with `Full` when the ring is at capacity.
    pub fn offer(&self, item: T) -> Result<(), OfferError<T>> {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            if state.closed {
                return Err(OfferError::Closed(item));
            }
            if state.items.len() >= self.capacity {
                return Err(OfferError::Full(item));
            }
            state.items.push_back(item);
        }
        self.kick();
        Ok(())
    }

    /// Inserts, waiting for a drain to free space if needed.
    pub async fn push(&self, item: T) -> Result<(), RingError> {
        let mut item = item;
        loop {
            let space = self.space.notified();
            match self.offer(item) {
                Ok(()) => return Ok(()),
                Err(OfferError::Closed(_)) => return Err(RingError::Closed),
                Err(OfferError::Full(rejected)) => item = rejected,
            }
            trace!("{} ring is full, waiting for space", self.name);
            space.await;
        }
    }

    /// Removes up to `threshold` items, or everything when `threshold` is 0.
    ///
    /// An empty ring is given one grace period for late producers before the
    /// batch is considered complete, so this never waits longer than that per
    /// item.
    pub async fn pop(&self, threshold: usize) -> Vec<T> {
        let grace = Duration::from_millis(POP_GRACE_PERIOD_MS);
        let mut batch = Vec::new();
        loop {
            if threshold != 0 && batch.len() >= threshold {
                break;
            }
            if let Some(item) = self.take() {
                batch.push(item);
                continue;
            }
            tokio::time::sleep(grace).await;
            match self.take() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    /// Drains the ring completely.
    pub async fn poll(&self) -> Vec<T> {
        self.pop(0).await
    }

    /// Raises the ready signal. Dropped silently if a signal is already pending
    /// for every slot.
    pub fn kick(&self) {
        let _ = self.kick_tx.try_send(());
    }

    /// Waits for the ready signal.
    pub async fn ready(&self) {
        let mut rx = self.kick_rx.lock().await;
        // The sender lives as long as the ring, so `recv` only yields signals.
        let _ = rx.recv().await;
    }

    /// Rejects further inserts, wakes blocked producers and discards pending
    /// ready signals. Buffered items stay poppable.
    pub fn close(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.space.notify_waiters();

        if let Ok(mut rx) = self.kick_rx.try_lock() {
            let mut drained = 0;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
            debug!("{} ring closed, discarded {} ready signals", self.name, drained);
        }
    }

    fn take(&self) -> Option<T> {
        let item = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.items.pop_front()
        };
        if item.is_some() {
            self.space.notify_waiters();
        }
        item
    }
}
