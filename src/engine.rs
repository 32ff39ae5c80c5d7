// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Lifecycle and fault state machine of the offload engine.
//!
//! The engine owns two supervised worker threads: `dsp-notify` waits on the
//! coprocessor's notifications and dispatches its messages, `dsp-output`
//! pops completed output buffers and delivers them downstream. Submission
//! runs on the caller's thread and blocks on the input pool for
//! backpressure.
//!
//! Cancellation is cooperative. Every blocking wait is either bounded by a
//! timeout or sits on a [`BlockingQueue`] that is disabled on the way into
//! `flushing`, `error` or `stopped`.

use crate::{
    bridge::{Bridge, Link, NodeId, Notification},
    buffer::{Direction, DmaBuffer, HostMemory, Placement},
    codec::{Codec, PortLayout, PortShape},
    config::EngineConfig,
    error::{Error, Fault, Result},
    lock,
    notify,
    output::{self, Downstream},
    port::{PooledBuffer, Port, PortId},
    protocol::Message,
    queue::BlockingQueue,
    ring::{Event, Forward, RingSnapshot, TimestampRing, Timing},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace_span, warn};

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Idle = 0,
    Running = 1,
    Flushing = 2,
    Error = 3,
    Stopped = 4,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Idle,
            1 => State::Running,
            2 => State::Flushing,
            3 => State::Error,
            _ => State::Stopped,
        }
    }
}

/// A frame of input data with its timing.
pub struct InputFrame {
    pub data: Box<dyn HostMemory>,
    pub timestamp: Option<Duration>,
    pub duration: Option<Duration>,
}

impl InputFrame {
    pub fn new(data: impl HostMemory) -> Self {
        Self {
            data: Box::new(data),
            timestamp: None,
            duration: None,
        }
    }

    pub fn with_timing(mut self, timestamp: Duration, duration: Duration) -> Self {
        self.timestamp = Some(timestamp);
        self.duration = Some(duration);
        self
    }
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Input frames handed to the coprocessor.
    pub submitted: u64,
    /// Input frames whose unaligned memory had to be copied.
    pub copied: u64,
    /// Output buffers returned by the coprocessor.
    pub completed: u64,
    /// Frames pushed downstream.
    pub delivered: u64,
    /// Frames dropped by a flush.
    pub discarded: u64,
    /// Frames the codec asked to skip.
    pub skipped: u64,
    /// Timestamp entries lost to ring overflow.
    pub overflows: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub copied: AtomicU64,
    pub completed: AtomicU64,
    pub delivered: AtomicU64,
    pub discarded: AtomicU64,
    pub skipped: AtomicU64,
    pub overflows: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            submitted: self.submitted.load(Ordering::Relaxed),
            copied: self.copied.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the engine handle and its worker threads.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub bridge: Arc<dyn Bridge>,
    pub codec: Arc<dyn Codec>,
    pub downstream: Arc<dyn Downstream>,
    status: AtomicU8,
    pub done: AtomicBool,
    node: Mutex<Option<NodeId>>,
    pub ports: [Port; 2],
    pub ring: Mutex<TimestampRing>,
    /// Serializes submissions against flush and stop.
    gate: Mutex<()>,
    /// Serializes deliveries with events forwarded outside the ring.
    pub delivery: Mutex<()>,
    pub flush_acks: BlockingQueue<u8>,
    pub stop_acks: BlockingQueue<()>,
    alg_ctrl: Mutex<Vec<DmaBuffer>>,
    fault: Mutex<Option<Fault>>,
    fault_reported: AtomicBool,
    pub stats: Counters,
}

impl Shared {
    pub fn status(&self) -> State {
        State::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, state: State) {
        self.status.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn link(&self) -> Option<Link<'_>> {
        let node = (*lock(&self.node))?;
        Some(Link {
            bridge: &*self.bridge,
            node,
            endian: self.config.endian,
        })
    }

    pub fn fault(&self) -> Option<Fault> {
        lock(&self.fault).clone()
    }

    /// The error a caller sees when the engine is not accepting work.
    fn refusal(&self) -> Error {
        match self.status() {
            State::Error => match self.fault() {
                Some(fault) => Error::Fault(fault),
                None => Error::NotRunning(State::Error),
            },
            State::Flushing => Error::Flushing,
            state => Error::NotRunning(state),
        }
    }

    /// Enters the terminal error state and reports `fault` downstream once.
    pub fn fail(&self, fault: Fault) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state != State::Stopped as u8).then_some(State::Error as u8)
            });
        lock(&self.fault).get_or_insert_with(|| fault.clone());

        for port in &self.ports {
            port.disable();
        }
        self.flush_acks.disable();
        self.stop_acks.disable();

        if !self.fault_reported.swap(true, Ordering::SeqCst) {
            error!(code = fault.code(), "{fault}");
            self.downstream.fault(&fault);
        }
    }

    /// Hands a delivered output buffer back to the coprocessor, or frees it
    /// if the pool has been replaced or the engine is no longer running.
    pub fn recycle(&self, buf: PooledBuffer) {
        let port = &self.ports[PortId::Output.index()];
        let _gate = lock(&self.gate);
        if self.status() != State::Running || !port.is_current(buf.id()) {
            debug!(buffer = ?buf.id(), "dropping output buffer");
            return;
        }
        let Some(link) = self.link() else {
            return;
        };
        let size = buf.size();
        if let Err(err) = port.submit(&link, buf, size) {
            self.fail(Fault::Driver(err.to_string()));
        }
    }

    /// Releases the oldest pending algorithm control buffer.
    pub fn alg_ctrl_done(&self) {
        let mut pending = lock(&self.alg_ctrl);
        if pending.is_empty() {
            warn!("algorithm control acknowledged with none pending");
        } else {
            pending.remove(0);
        }
    }

    /// Terminates and frees the node, if one was created.
    fn release_node(&self) {
        let Some(node) = lock(&self.node).take() else {
            return;
        };
        match self.bridge.terminate_node(node) {
            Ok(status) => debug!(node = node.0, status, "node terminated"),
            Err(err) => warn!(node = node.0, "terminate node failed: {err}"),
        }
        if let Err(err) = self.bridge.free_node(node) {
            warn!(node = node.0, "free node failed: {err}");
        }
    }

    fn submit_outputs(&self, link: &Link<'_>) -> Result<()> {
        let port = &self.ports[PortId::Output.index()];
        for buf in port.take_all() {
            let size = buf.size();
            port.submit(link, buf, size)?;
        }
        Ok(())
    }

    fn alloc_pools(&self) -> Result<()> {
        let config = &self.config;
        self.ports[PortId::Input.index()].alloc_buffers(
            &self.bridge,
            config.input_buffers,
            config.input_buffer_size,
        )?;
        self.ports[PortId::Output.index()].alloc_buffers(
            &self.bridge,
            config.output_buffers,
            config.output_buffer_size,
        )
    }
}

#[derive(Default)]
struct Workers {
    notify: Option<JoinHandle<()>>,
    output: Option<JoinHandle<()>>,
}

fn join(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!("{name} thread panicked");
        }
    }
}

/// Host side of a coprocessor node.
///
/// ```no_run
/// use edgefirst_dsp::{ChannelSink, Engine, EngineConfig, InputFrame, Loopback, Passthrough};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (sink, rx) = ChannelSink::bounded(8);
/// let engine = Engine::new(
///     EngineConfig::default(),
///     Arc::new(Loopback::new()),
///     Arc::new(Passthrough),
///     Arc::new(sink),
/// )?;
/// engine.push(InputFrame::new(vec![0u8; 4096]))?;
/// engine.send_eos()?;
/// let _first = rx.recv()?;
/// engine.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
}

impl Engine {
    /// Validates `config` and attaches to the coprocessor.
    pub fn new(
        config: EngineConfig,
        bridge: Arc<dyn Bridge>,
        codec: Arc<dyn Codec>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self> {
        config.validate()?;
        bridge.attach()?;
        let ports = [
            Port::new(
                PortId::Input,
                config.input_alignment,
                config.heap,
                codec.clone(),
            ),
            Port::new(
                PortId::Output,
                config.output_alignment,
                config.heap,
                codec.clone(),
            ),
        ];
        let ring = TimestampRing::new(config.ring_capacity);
        info!(codec = codec.name(), ?config, "engine created");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                bridge,
                codec,
                downstream,
                status: AtomicU8::new(State::Idle as u8),
                done: AtomicBool::new(false),
                node: Mutex::new(None),
                ports,
                ring: Mutex::new(ring),
                gate: Mutex::new(()),
                delivery: Mutex::new(()),
                flush_acks: BlockingQueue::new(),
                stop_acks: BlockingQueue::new(),
                alg_ctrl: Mutex::new(Vec::new()),
                fault: Mutex::new(None),
                fault_reported: AtomicBool::new(false),
                stats: Counters::default(),
            }),
            workers: Mutex::new(Workers::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn status(&self) -> State {
        self.shared.status()
    }

    /// The fault that moved the engine into the error state, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.shared.fault()
    }

    pub fn stats(&self) -> Stats {
        self.shared.stats.snapshot()
    }

    pub fn ring(&self) -> RingSnapshot {
        lock(&self.shared.ring).snapshot()
    }

    /// Buffers of `port` currently held by the coprocessor.
    pub fn in_flight(&self, port: PortId) -> usize {
        self.shared.ports[port.index()].in_flight()
    }

    /// Buffers of `port` queued on the host.
    pub fn queued(&self, port: PortId) -> usize {
        self.shared.ports[port.index()].queued()
    }

    /// Creates and runs the node, allocates both pools, starts the worker
    /// threads, sends PLAY and hands every output buffer to the coprocessor.
    ///
    /// A failure before the node plays tears the node and both pools down
    /// again, leaving the engine ready for another attempt.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let _gate = lock(&shared.gate);
        match self.status() {
            State::Idle | State::Stopped => {}
            State::Running | State::Flushing => return Ok(()),
            State::Error => return Err(shared.refusal()),
        }
        let config = &shared.config;

        let layout = PortLayout {
            input: PortShape {
                count: config.input_buffers,
                size: config.input_buffer_size,
            },
            output: PortShape {
                count: config.output_buffers,
                size: config.output_buffer_size,
            },
        };
        let args = shared.codec.create_node_args(&layout);
        let node = shared.bridge.create_node(&args)?;
        *lock(&shared.node) = Some(node);
        let prepared = shared
            .bridge
            .run_node(node)
            .and_then(|_| {
                [
                    Notification::MessageReady,
                    Notification::MmuFault,
                    Notification::SystemError,
                ]
                .into_iter()
                .try_for_each(|source| shared.bridge.register_notify(node, source))
            })
            .map_err(Error::from)
            .and_then(|_| shared.alloc_pools());
        if let Err(err) = prepared {
            warn!(node = node.0, "start failed: {err}");
            for port in &shared.ports {
                port.flush();
            }
            shared.release_node();
            return Err(err);
        }

        lock(&shared.ring).reset();
        *lock(&shared.fault) = None;
        shared.fault_reported.store(false, Ordering::SeqCst);
        shared.done.store(false, Ordering::SeqCst);
        shared.flush_acks.disable();
        shared.flush_acks.enable();
        shared.stop_acks.disable();
        shared.stop_acks.enable();
        shared.set_status(State::Running);

        let link = Link {
            bridge: &*shared.bridge,
            node,
            endian: config.endian,
        };
        let started = self
            .spawn_workers()
            .and_then(|_| link.send(Message::play()).map_err(Error::from))
            .and_then(|_| shared.submit_outputs(&link));
        if let Err(err) = started {
            shared.fail(Fault::Driver(err.to_string()));
            return Err(err);
        }
        info!(node = node.0, codec = shared.codec.name(), "node playing");
        Ok(())
    }

    fn spawn_workers(&self) -> Result<()> {
        let mut workers = lock(&self.workers);
        let shared = self.shared.clone();
        workers.notify = Some(
            thread::Builder::new()
                .name("dsp-notify".into())
                .spawn(move || notify::run(shared))?,
        );
        workers.output = Some(self.spawn_output()?);
        Ok(())
    }

    fn spawn_output(&self) -> Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        Ok(thread::Builder::new()
            .name("dsp-output".into())
            .spawn(move || output::run(shared))?)
    }

    /// Submits one input frame, starting the engine on first use. Blocks while
    /// every input buffer is in flight.
    pub fn push(&self, frame: InputFrame) -> Result<()> {
        let _span = trace_span!("push").entered();
        let shared = &self.shared;
        if self.status() == State::Idle {
            self.start()?;
        }
        if self.status() != State::Running {
            return Err(shared.refusal());
        }

        let port = &shared.ports[PortId::Input.index()];
        let Some(mut buf) = port.acquire() else {
            return Err(shared.refusal());
        };
        let _gate = lock(&shared.gate);
        let link = match shared.link() {
            Some(link) if self.status() == State::Running => link,
            _ => {
                port.put(buf);
                return Err(shared.refusal());
            }
        };

        let len = frame.data.as_bytes().len();
        let min = shared.config.input_buffer_size;
        let placed = if len < min {
            buf.copy_in(frame.data.as_bytes(), min).map(|_| Placement::Copied)
        } else {
            buf.use_external(frame.data)
        };
        match placed {
            Ok(Placement::Copied) => {
                shared.stats.copied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Placement::ZeroCopy) => {}
            Err(err) => {
                port.put(buf);
                return Err(err);
            }
        }

        let pushed = lock(&shared.ring).push_timestamp(Timing {
            timestamp: frame.timestamp,
            duration: frame.duration,
        });
        match pushed {
            Ok(true) => {
                shared.stats.overflows.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(err) => {
                port.put(buf);
                return Err(err);
            }
        }

        if let Err(err) = port.submit(&link, buf, len) {
            shared.fail(Fault::Driver(err.to_string()));
            return Err(err);
        }
        shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forwards a pipeline event in order with the frames in flight. Flush
    /// and end-of-stream events are acted upon.
    pub fn push_event(&self, event: Event) -> Result<()> {
        match event {
            Event::Eos => return self.send_eos(),
            Event::FlushStart => return self.flush_start(),
            Event::FlushStop => return self.flush_stop(),
            _ => {}
        }
        let shared = &self.shared;
        let _delivery = lock(&shared.delivery);
        let forward = lock(&shared.ring).push_event(event);
        match forward {
            Forward::Now(event) => shared.downstream.event(event),
            Forward::Queued { overflow: true } => {
                shared.stats.overflows.fetch_add(1, Ordering::Relaxed);
            }
            Forward::Queued { overflow: false } => {}
        }
        Ok(())
    }

    /// Signals end of stream. Delivered downstream once the last frame in
    /// flight has been delivered.
    pub fn send_eos(&self) -> Result<()> {
        let shared = &self.shared;
        if self.status() == State::Error {
            return Err(shared.refusal());
        }
        let _delivery = lock(&shared.delivery);
        if lock(&shared.ring).request_eos() {
            shared.downstream.event(Event::Eos);
        } else {
            debug!("end of stream deferred");
        }
        Ok(())
    }

    /// Sends an algorithm control block to the running node. The control
    /// buffer is kept mapped until the node acknowledges it.
    pub fn send_alg_ctrl(&self, control: &[u8]) -> Result<()> {
        let shared = &self.shared;
        if self.status() != State::Running {
            return Err(shared.refusal());
        }
        let mut buf = DmaBuffer::new(
            shared.bridge.clone(),
            Direction::Bidirectional,
            shared.config.output_alignment,
        );
        buf.copy_in(control, 0)?;
        buf.begin_transfer(control.len())?;
        let address = buf.device_address().ok_or(Error::NotMapped)?;

        let mut pending = lock(&shared.alg_ctrl);
        let link = shared
            .link()
            .ok_or(Error::NotRunning(self.status()))?;
        link.send(Message::alg_ctrl(address, control.len() as u32))?;
        pending.push(buf);
        Ok(())
    }

    /// First half of a flush: stop delivering, forget every transfer in
    /// flight and ask the node to drop its queued buffers.
    pub fn flush_start(&self) -> Result<()> {
        let shared = &self.shared;
        match self.status() {
            State::Running => {}
            State::Flushing => return Ok(()),
            _ => return Err(shared.refusal()),
        }
        if !shared.transition(State::Running, State::Flushing) {
            return Err(shared.refusal());
        }
        info!("flush start");
        shared.downstream.event(Event::FlushStart);
        lock(&shared.ring).mark_flush();

        for port in &shared.ports {
            port.disable();
        }
        let output = lock(&self.workers).output.take();
        join("dsp-output", output);

        let _gate = lock(&shared.gate);
        let cancelled = shared.ports[PortId::Input.index()].cancel_in_flight();
        shared
            .stats
            .discarded
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        shared.ports[PortId::Output.index()].cancel_in_flight();

        let Some(link) = shared.link() else {
            return Err(Error::NotRunning(self.status()));
        };
        for port in &shared.ports {
            if let Err(err) = link.send(Message::flush(port.id() as u8)) {
                shared.fail(Fault::Driver(err.to_string()));
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Second half of a flush: wait for both ports to acknowledge, rebuild the
    /// pools and resume.
    pub fn flush_stop(&self) -> Result<()> {
        let shared = &self.shared;
        match self.status() {
            State::Flushing => {}
            State::Running => return Ok(()),
            _ => return Err(shared.refusal()),
        }

        let deadline = Instant::now() + shared.config.ack_timeout;
        let mut acked = [false; 2];
        while !acked.iter().all(|&ack| ack) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match shared.flush_acks.pop_timeout(remaining) {
                Some(port) => match PortId::from_wire(port) {
                    Some(id) => acked[id.index()] = true,
                    None => warn!(port, "flush acknowledged for unknown port"),
                },
                None if self.status() == State::Error => return Err(shared.refusal()),
                None => {
                    let fault = Fault::Timeout("flush acknowledgement");
                    shared.fail(fault.clone());
                    return Err(fault.into());
                }
            }
        }

        {
            let _gate = lock(&shared.gate);
            for port in &shared.ports {
                port.flush();
            }
            lock(&shared.ring).reset();
            if let Err(err) = shared.alloc_pools() {
                shared.fail(Fault::Driver(err.to_string()));
                return Err(err);
            }
            if !shared.transition(State::Flushing, State::Running) {
                return Err(shared.refusal());
            }
            match self.spawn_output() {
                Ok(output) => lock(&self.workers).output = Some(output),
                Err(err) => {
                    shared.fail(Fault::Driver(err.to_string()));
                    return Err(err);
                }
            }

            let Some(link) = shared.link() else {
                return Err(Error::NotRunning(self.status()));
            };
            if let Err(err) = shared.submit_outputs(&link) {
                shared.fail(Fault::Driver(err.to_string()));
                return Err(err);
            }
        }

        info!("flush stop");
        shared.downstream.event(Event::FlushStop);
        Ok(())
    }

    /// Flushes every frame in flight without delivering it.
    pub fn flush(&self) -> Result<()> {
        self.flush_start()?;
        self.flush_stop()
    }

    /// Stops the node and releases both pools. The STOP handshake is skipped
    /// once the engine has failed.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let previous = self.status();
        if matches!(previous, State::Idle | State::Stopped) {
            return Ok(());
        }
        let faulted = previous == State::Error;
        shared.set_status(State::Stopped);

        for port in &shared.ports {
            port.disable();
        }
        let output = lock(&self.workers).output.take();
        join("dsp-output", output);

        if !faulted {
            if let Some(link) = shared.link() {
                match link.send(Message::stop()) {
                    Ok(()) => {
                        if shared.stop_acks.pop_timeout(shared.config.ack_timeout).is_none() {
                            warn!("timed out waiting for stop acknowledgement");
                        }
                    }
                    Err(err) => warn!("send stop failed: {err}"),
                }
            }
        }

        shared.done.store(true, Ordering::SeqCst);
        let notify = lock(&self.workers).notify.take();
        join("dsp-notify", notify);

        {
            let _gate = lock(&shared.gate);
            for port in &shared.ports {
                port.flush();
            }
        }
        lock(&shared.alg_ctrl).clear();
        shared.flush_acks.disable();
        shared.stop_acks.disable();

        shared.release_node();
        info!(stats = ?shared.stats.snapshot(), "engine stopped");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("stop failed: {err}");
        }
        if let Err(err) = self.shared.bridge.detach() {
            warn!("detach failed: {err}");
        }
    }
}
