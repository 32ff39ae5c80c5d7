// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Timestamp and event ring.
//!
//! Input submissions push their timing in submission order and output
//! completions consume it in completion order, so the k-th delivered frame
//! carries the k-th submitted timestamp. Pipeline events are serialized into
//! the same ring so they reach the consumer between the frames they were sent
//! between.
//!
//! Entries carry monotonically increasing sequence numbers. Entries below
//! the flush boundary were submitted before the last flush and are discarded
//! on the way out.
//!
//! Frame timings are never evicted. When the ring is full the oldest queued
//! event makes room; a ring holding nothing but frames refuses another one.

use crate::error::{Error, Result};
use std::{collections::VecDeque, time::Duration};
use tracing::warn;

/// Pipeline event carried through the ring.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// New playback segment starting at `start`.
    Segment { start: Duration, rate: f64 },
    /// Stream metadata.
    Tag(String),
    /// Application-defined serialized event.
    Custom(String),
    FlushStart,
    FlushStop,
    /// End of stream.
    Eos,
}

/// Timing of a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    pub timestamp: Option<Duration>,
    pub duration: Option<Duration>,
}

#[derive(Debug)]
enum Entry {
    Frame(Timing),
    Event(Event),
}

/// Where [`TimestampRing::push_event`] put an event.
#[derive(Debug, PartialEq)]
pub enum Forward {
    /// Nothing is in flight; forward the event now.
    Now(Event),
    /// Queued behind the frames in flight. `overflow` is set when an older
    /// event, or this one, was dropped for lack of room.
    Queued { overflow: bool },
}

/// What an output completion resolved to.
#[derive(Debug, Default)]
pub struct Completion {
    /// Events queued ahead of the frame.
    pub before: Vec<Event>,
    /// Timing of the frame, if the ring held one.
    pub timing: Option<Timing>,
    /// The frame was submitted before the last flush.
    pub stale: bool,
    /// Events queued after the last in-flight frame.
    pub after: Vec<Event>,
    /// A deferred end of stream is now due.
    pub eos: bool,
}

/// Cursor snapshot for statistics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub capacity: usize,
    pub write: u64,
    pub read: u64,
    pub boundary: u64,
    pub frames_in_flight: usize,
    pub pending_eos: bool,
}

pub struct TimestampRing {
    entries: VecDeque<(u64, Entry)>,
    capacity: usize,
    write: u64,
    read: u64,
    boundary: u64,
    frames_in_flight: usize,
    pending_eos: bool,
}

impl TimestampRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            write: 0,
            read: 0,
            boundary: 0,
            frames_in_flight: 0,
            pending_eos: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the oldest queued event. Returns `false` if only frames remain.
    fn evict_event(&mut self) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|(_, entry)| matches!(entry, Entry::Event(_)))
        else {
            return false;
        };
        if let Some((seq, entry)) = self.entries.remove(pos) {
            warn!(seq, dropped = ?entry, "timestamp ring overflow");
        }
        true
    }

    fn store(&mut self, entry: Entry) {
        self.entries.push_back((self.write, entry));
        self.write += 1;
    }

    fn take(&mut self) -> Option<(u64, Entry)> {
        let (seq, entry) = self.entries.pop_front()?;
        self.read = seq + 1;
        Some((seq, entry))
    }

    /// Records the timing of a frame submitted to the coprocessor. Returns
    /// `true` if an event had to be dropped to make room.
    ///
    /// Fails with [`Error::RingFull`] when every entry is a frame in flight.
    pub fn push_timestamp(&mut self, timing: Timing) -> Result<bool> {
        let mut overflow = false;
        if self.entries.len() >= self.capacity {
            if !self.evict_event() {
                return Err(Error::RingFull(self.frames_in_flight));
            }
            overflow = true;
        }
        self.frames_in_flight += 1;
        self.store(Entry::Frame(timing));
        Ok(overflow)
    }

    /// Queues `event` behind the frames in flight. With nothing in flight the
    /// event is handed back to be forwarded immediately.
    pub fn push_event(&mut self, event: Event) -> Forward {
        if self.frames_in_flight == 0 {
            return Forward::Now(event);
        }
        if self.entries.len() < self.capacity {
            self.store(Entry::Event(event));
            return Forward::Queued { overflow: false };
        }
        if self.evict_event() {
            self.store(Entry::Event(event));
        } else {
            warn!(?event, "timestamp ring full of frames, event dropped");
        }
        Forward::Queued { overflow: true }
    }

    /// Requests end of stream. Returns `true` when it is due immediately;
    /// otherwise it is delivered by the completion that empties the pipeline.
    pub fn request_eos(&mut self) -> bool {
        if self.frames_in_flight == 0 {
            self.pending_eos = false;
            true
        } else {
            self.pending_eos = true;
            false
        }
    }

    /// Consumes the entries belonging to one output completion.
    pub fn complete_frame(&mut self) -> Completion {
        let mut completion = Completion::default();
        while let Some((seq, entry)) = self.take() {
            match entry {
                Entry::Event(event) if seq >= self.boundary => completion.before.push(event),
                Entry::Event(_) => {}
                Entry::Frame(timing) => {
                    completion.timing = Some(timing);
                    completion.stale = seq < self.boundary;
                    break;
                }
            }
        }

        self.frames_in_flight = self.frames_in_flight.saturating_sub(1);
        if self.frames_in_flight == 0 {
            while let Some((seq, entry)) = self.take() {
                match entry {
                    Entry::Event(event) if seq >= self.boundary => completion.after.push(event),
                    _ => {}
                }
            }
            completion.eos = std::mem::take(&mut self.pending_eos);
        }
        completion
    }

    /// Marks everything written so far as stale and cancels a pending end of
    /// stream.
    pub fn mark_flush(&mut self) {
        self.boundary = self.write;
        self.pending_eos = false;
    }

    /// Empties the ring and rewinds every cursor.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.write = 0;
        self.read = 0;
        self.boundary = 0;
        self.frames_in_flight = 0;
        self.pending_eos = false;
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn pending_eos(&self) -> bool {
        self.pending_eos
    }

    pub fn write_cursor(&self) -> u64 {
        self.write
    }

    pub fn read_cursor(&self) -> u64 {
        self.read
    }

    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            capacity: self.capacity(),
            write: self.write,
            read: self.read,
            boundary: self.boundary,
            frames_in_flight: self.frames_in_flight,
            pending_eos: self.pending_eos,
        }
    }
}
