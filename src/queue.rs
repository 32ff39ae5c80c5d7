// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Blocking FIFO with cooperative enable/disable.
//!
//! Disabling closes the underlying `kanal` channel, which wakes every blocked
//! [`pop`](BlockingQueue::pop) with `None`. Enabling opens a fresh channel.

use crate::lock;
use kanal::{Receiver, Sender};
use std::{sync::Mutex, time::Duration};

struct Channel<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    enabled: bool,
}

impl<T> Channel<T> {
    fn open() -> Self {
        let (tx, rx) = kanal::unbounded();
        Self {
            tx,
            rx,
            enabled: true,
        }
    }
}

pub struct BlockingQueue<T> {
    chan: Mutex<Channel<T>>,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    /// Creates an enabled, empty queue.
    pub fn new() -> Self {
        Self {
            chan: Mutex::new(Channel::open()),
        }
    }

    /// Appends `item`. Returns `false` and drops the item if the queue is
    /// disabled.
    pub fn push(&self, item: T) -> bool {
        let chan = lock(&self.chan);
        chan.enabled && chan.tx.send(item).is_ok()
    }

    /// Blocks until an item is available or the queue is disabled.
    pub fn pop(&self) -> Option<T> {
        let rx = self.receiver()?;
        rx.recv().ok()
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let rx = self.receiver()?;
        rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        let rx = self.receiver()?;
        rx.try_recv().ok().flatten()
    }

    /// Disables the queue, returning whatever it still held. Every blocked
    /// waiter returns `None`.
    pub fn disable(&self) -> Vec<T> {
        let mut chan = lock(&self.chan);
        let mut drained = Vec::new();
        if !chan.enabled {
            return drained;
        }
        while let Ok(Some(item)) = chan.rx.try_recv() {
            drained.push(item);
        }
        chan.enabled = false;
        let _ = chan.rx.close();
        drained
    }

    /// Re-enables a disabled queue with no items in it.
    pub fn enable(&self) {
        let mut chan = lock(&self.chan);
        if !chan.enabled {
            *chan = Channel::open();
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.chan).enabled
    }

    pub fn len(&self) -> usize {
        let chan = lock(&self.chan);
        if chan.enabled {
            chan.rx.len()
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn receiver(&self) -> Option<Receiver<T>> {
        let chan = lock(&self.chan);
        chan.enabled.then(|| chan.rx.clone())
    }
}
