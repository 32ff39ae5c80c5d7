// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Output thread and the downstream interface.
//!
//! The output thread pops completed buffers from the output port, pairs each
//! one with the next timestamp of the ring and pushes it downstream as a
//! [`Frame`]. Frames lend their buffer; dropping a frame hands the buffer
//! back to the coprocessor.

use crate::{
    engine::{Shared, State},
    error::{Error, Fault, Result},
    lock,
    port::{BufferId, PooledBuffer, PortId},
    ring::Event,
};
use kanal::{Receiver, SendErrorTimeout, Sender};
use std::{
    fmt,
    sync::{atomic::Ordering, Arc, Weak},
    time::Duration,
};
use tracing::{debug, trace, trace_span};

/// How often a blocked [`ChannelSink::push`] checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// A decoded or encoded frame produced by the coprocessor.
pub struct Frame {
    buffer: Option<PooledBuffer>,
    owner: Weak<Shared>,
    pub timestamp: Option<Duration>,
    pub duration: Option<Duration>,
    pub keyframe: bool,
}

impl Frame {
    /// Valid bytes written by the coprocessor.
    pub fn data(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[][..], |buf| buf.as_slice())
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Pool handle of the lent output buffer.
    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.as_ref().map(|buf| buf.id())
    }

    /// Whether the engine that produced the frame has left the running
    /// state. A [`Downstream`] blocked on a frame should give up with
    /// [`Error::Cancelled`] once this is set.
    pub fn is_cancelled(&self) -> bool {
        self.owner
            .upgrade()
            .map_or(true, |owner| owner.status() != State::Running)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let Some(buf) = self.buffer.take() else {
            return;
        };
        if let Some(owner) = self.owner.upgrade() {
            owner.recycle(buf);
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("buffer", &self.buffer_id())
            .field("len", &self.len())
            .field("timestamp", &self.timestamp)
            .field("duration", &self.duration)
            .field("keyframe", &self.keyframe)
            .finish()
    }
}

/// Consumer of the engine's output.
///
/// Calls arrive from the engine's output thread, except events forwarded
/// while nothing is in flight and faults, which arrive on whichever thread
/// observed them. `push` may block, but flush and stop wait for the output
/// thread, so a blocked `push` must return once [`Frame::is_cancelled`]
/// turns true.
pub trait Downstream: Send + Sync {
    /// Takes ownership of a frame. An error fails a running engine and is
    /// ignored once the engine has left the running state.
    fn push(&self, frame: Frame) -> Result<()>;

    fn event(&self, event: Event);

    /// Called once when the engine enters the error state.
    fn fault(&self, fault: &Fault);
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug)]
pub enum Output {
    Frame(Frame),
    Event(Event),
    Fault(Fault),
}

/// [`Downstream`] that forwards everything over a bounded `kanal` channel.
pub struct ChannelSink {
    tx: Sender<Output>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Output>) {
        let (tx, rx) = kanal::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl Downstream for ChannelSink {
    fn push(&self, frame: Frame) -> Result<()> {
        let mut output = Some(Output::Frame(frame));
        loop {
            match self.tx.send_option_timeout(&mut output, CANCEL_POLL) {
                Ok(()) => return Ok(()),
                Err(SendErrorTimeout::Timeout) => {
                    if let Some(Output::Frame(frame)) = &output {
                        if frame.is_cancelled() {
                            debug!(buffer = ?frame.buffer_id(), "delivery cancelled");
                            return Err(Error::Cancelled);
                        }
                    }
                }
                Err(err) => return Err(Error::Downstream(err.to_string())),
            }
        }
    }

    fn event(&self, event: Event) {
        if self.tx.send(Output::Event(event)).is_err() {
            debug!("event dropped, receiver closed");
        }
    }

    fn fault(&self, fault: &Fault) {
        if self.tx.send(Output::Fault(fault.clone())).is_err() {
            debug!("fault dropped, receiver closed");
        }
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    let port = &shared.ports[PortId::Output.index()];
    debug!("output thread started");

    while let Some(buf) = port.acquire() {
        let _span = trace_span!("deliver", buffer = buf.id().index).entered();
        let _delivery = lock(&shared.delivery);
        let done = lock(&shared.ring).complete_frame();

        for event in done.before {
            shared.downstream.event(event);
        }

        if done.stale {
            shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
            shared.recycle(buf);
        } else if buf.skip {
            shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
            shared.recycle(buf);
        } else {
            let timing = done.timing.unwrap_or_default();
            let keyframe = buf.keyframe;
            trace!(len = buf.len(), ?timing, keyframe, "deliver");
            let frame = Frame {
                buffer: Some(buf),
                owner: Arc::downgrade(&shared),
                timestamp: timing.timestamp,
                duration: timing.duration,
                keyframe,
            };
            if let Err(err) = shared.downstream.push(frame) {
                match shared.status() {
                    State::Running => shared.fail(Fault::Downstream(err.to_string())),
                    state => debug!(?state, "delivery abandoned: {err}"),
                }
                break;
            }
            shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
        }

        for event in done.after {
            shared.downstream.event(event);
        }
        if done.eos {
            debug!("end of stream");
            shared.downstream.event(Event::Eos);
        }
    }
    debug!("output thread done");
}
