// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Software coprocessor.
//!
//! [`Loopback`] implements [`Bridge`] without hardware. Its node copies every
//! input buffer into the next output buffer, so a running engine behaves like
//! a passthrough codec. Address space reservations and mappings are tracked
//! so callers can check that nothing leaks, and the test controls can hold
//! back completions, reorder output buffers, inject faults, post events,
//! swallow acknowledgements or make driver calls fail.

use crate::{
    bridge::{Bridge, NodeArgs, NodeId, Notification},
    buffer::{round_up, PAGE_SIZE},
    lock,
    protocol::{
        Command, CommRecord, DeviceAddr, Endian, Message, CMD_FLUSH, RECORD_SIZE,
    },
};
use std::{
    collections::{BTreeMap, VecDeque},
    io,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, trace, warn};

const BASE_ADDRESS: DeviceAddr = 0x2000_0000;

/// Reservations and mappings currently held on the loopback device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outstanding {
    pub reservations: usize,
    pub mappings: usize,
}

/// Cache maintenance calls seen by the loopback device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheOps {
    pub flushes: u64,
    pub invalidates: u64,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    host: usize,
    size: usize,
}

struct Device {
    endian: Endian,
    attached: bool,
    next_address: DeviceAddr,
    next_node: u32,
    node: Option<NodeId>,
    args: Option<NodeArgs>,
    running: bool,
    playing: bool,
    reservations: BTreeMap<DeviceAddr, usize>,
    mappings: BTreeMap<DeviceAddr, Region>,
    inputs: VecDeque<DeviceAddr>,
    outputs: VecDeque<DeviceAddr>,
    outbox: VecDeque<Message>,
    faults: VecDeque<Notification>,
    sent: Vec<Message>,
    alg_ctrl: Vec<Vec<u8>>,
    manual: bool,
    credits: usize,
    reorder: bool,
    mute_acks: bool,
    exhausted: bool,
    refuse_buffers: bool,
    cache: CacheOps,
}

impl Device {
    fn new(endian: Endian) -> Self {
        Self {
            endian,
            attached: false,
            next_address: BASE_ADDRESS,
            next_node: 1,
            node: None,
            args: None,
            running: false,
            playing: false,
            reservations: BTreeMap::new(),
            mappings: BTreeMap::new(),
            inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            outbox: VecDeque::new(),
            faults: VecDeque::new(),
            sent: Vec::new(),
            alg_ctrl: Vec::new(),
            manual: false,
            credits: 0,
            reorder: false,
            mute_acks: false,
            exhausted: false,
            refuse_buffers: false,
            cache: CacheOps::default(),
        }
    }

    fn check_node(&self, node: NodeId) -> io::Result<()> {
        if self.node == Some(node) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no node {}", node.0),
            ))
        }
    }

    /// Host pointer of `len` bytes at device address `address`.
    fn resolve(&self, address: DeviceAddr, len: usize) -> Option<*mut u8> {
        let (&base, region) = self.mappings.range(..=address).next_back()?;
        let offset = (address - base) as usize;
        (offset + len <= region.size).then_some((region.host + offset) as *mut u8)
    }

    /// Whether the host range lies inside one mapping.
    fn covers(&self, host: *const u8, len: usize) -> bool {
        let host = host as usize;
        self.mappings
            .values()
            .any(|region| host >= region.host && host + len <= region.host + region.size)
    }

    fn read_record(&self, comm: DeviceAddr) -> Option<CommRecord> {
        let ptr = self.resolve(comm, RECORD_SIZE)?;
        let bytes = unsafe { from_raw_parts(ptr, RECORD_SIZE) };
        Some(CommRecord::decode(self.endian, bytes))
    }

    fn write_record(&self, comm: DeviceAddr, record: &CommRecord) -> bool {
        let Some(ptr) = self.resolve(comm, RECORD_SIZE) else {
            return false;
        };
        let bytes = unsafe { from_raw_parts_mut(ptr, RECORD_SIZE) };
        record.encode(self.endian, bytes);
        true
    }

    fn pump(&mut self) {
        while self.playing && !self.inputs.is_empty() && !self.outputs.is_empty() {
            if self.manual {
                if self.credits == 0 {
                    break;
                }
                self.credits -= 1;
            }
            let input = self.inputs.pop_front();
            let output = if self.reorder {
                self.outputs.pop_back()
            } else {
                self.outputs.pop_front()
            };
            if let (Some(input), Some(output)) = (input, output) {
                self.transfer(input, output);
            }
        }
    }

    fn transfer(&mut self, input: DeviceAddr, output: DeviceAddr) {
        let (Some(src), Some(mut dst)) = (self.read_record(input), self.read_record(output))
        else {
            warn!(input, output, "transfer with unmapped comm record");
            return;
        };
        let len = src.valid_length.min(dst.buffer_size) as usize;
        match (
            self.resolve(src.buffer_address, len),
            self.resolve(dst.buffer_address, len),
        ) {
            (Some(from), Some(to)) => unsafe { std::ptr::copy(from, to, len) },
            _ => {
                warn!(input, output, len, "transfer with unmapped buffer");
                return;
            }
        }
        dst.valid_length = len as u32;
        self.write_record(output, &dst);
        trace!(input, output, len, "loopback transfer");
        self.outbox.push_back(Message::buffer(0, input));
        self.outbox.push_back(Message::buffer(1, output));
    }

    fn ack(&mut self, msg: Message) {
        if self.mute_acks {
            debug!(%msg, "acknowledgement swallowed");
        } else {
            self.outbox.push_back(msg);
        }
    }

    fn handle(&mut self, msg: Message) -> io::Result<()> {
        if self.refuse_buffers && msg.command() == Command::Buffer {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "message queue full"));
        }
        self.sent.push(msg);
        match msg.command() {
            Command::Play => {
                self.playing = true;
                self.pump();
            }
            Command::Buffer => {
                match msg.port() {
                    0 => self.inputs.push_back(msg.arg_1),
                    1 => self.outputs.push_back(msg.arg_1),
                    port => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("no port {port}"),
                        ))
                    }
                }
                self.pump();
            }
            Command::Flush => {
                match msg.port() {
                    0 => self.inputs.clear(),
                    _ => self.outputs.clear(),
                }
                self.ack(Message::new(CMD_FLUSH | msg.port() as u32, 0, 0));
            }
            Command::Stop => {
                self.playing = false;
                self.inputs.clear();
                self.outputs.clear();
                self.ack(Message::stop());
            }
            Command::AlgCtrl => {
                let len = msg.arg_2 as usize;
                let data = self
                    .resolve(msg.arg_1, len)
                    .map(|ptr| unsafe { from_raw_parts(ptr, len) }.to_vec())
                    .unwrap_or_default();
                self.alg_ctrl.push(data);
                self.ack(Message::alg_ctrl(msg.arg_1, msg.arg_2));
            }
            Command::Event | Command::Unknown(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported message {msg}"),
                ))
            }
        }
        Ok(())
    }
}

/// A [`Bridge`] backed by a software coprocessor.
pub struct Loopback {
    device: Mutex<Device>,
    wake: Condvar,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self::with_endian(Endian::Little)
    }

    /// Creates a device that reads and writes comm records in `endian`.
    pub fn with_endian(endian: Endian) -> Self {
        Self {
            device: Mutex::new(Device::new(endian)),
            wake: Condvar::new(),
        }
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        lock(&self.device)
    }

    /// Runs `f` on the device and wakes any waiter.
    fn poke<T>(&self, f: impl FnOnce(&mut Device) -> T) -> T {
        let result = f(&mut self.device());
        self.wake.notify_all();
        result
    }

    /// Holds back transfers until [`release`](Self::release) grants them.
    pub fn set_manual(&self, manual: bool) {
        self.poke(|dev| {
            dev.manual = manual;
            dev.pump();
        });
    }

    /// Lets `count` more transfers complete in manual mode.
    pub fn release(&self, count: usize) {
        self.poke(|dev| {
            dev.credits += count;
            dev.pump();
        });
    }

    /// Hands out output buffers newest first.
    pub fn set_reorder(&self, reorder: bool) {
        self.device().reorder = reorder;
    }

    /// Swallows flush, stop and algorithm control acknowledgements.
    pub fn set_mute_acks(&self, mute: bool) {
        self.device().mute_acks = mute;
    }

    /// Fails every address space reservation while set.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.device().exhausted = exhausted;
    }

    /// Rejects buffer messages while set.
    pub fn set_refuse_buffers(&self, refuse: bool) {
        self.device().refuse_buffers = refuse;
    }

    /// Whether a node is currently created.
    pub fn has_node(&self) -> bool {
        self.device().node.is_some()
    }

    pub fn inject_fault(&self, source: Notification) {
        self.poke(|dev| dev.faults.push_back(source));
    }

    /// Queues `msg` as if the node had sent it.
    pub fn post(&self, msg: Message) {
        self.poke(|dev| dev.outbox.push_back(msg));
    }

    /// Queues an event message from the node.
    pub fn post_event(&self, arg_1: u32, arg_2: u32) {
        self.post(Message::event(arg_1, arg_2));
    }

    pub fn outstanding(&self) -> Outstanding {
        let dev = self.device();
        Outstanding {
            reservations: dev.reservations.len(),
            mappings: dev.mappings.len(),
        }
    }

    pub fn cache_ops(&self) -> CacheOps {
        self.device().cache
    }

    /// Input transfers waiting for an output buffer or a release.
    pub fn pending(&self) -> usize {
        self.device().inputs.len()
    }

    /// Every message the host sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.device().sent.clone()
    }

    /// Payloads of the algorithm control messages received.
    pub fn alg_ctrl(&self) -> Vec<Vec<u8>> {
        self.device().alg_ctrl.clone()
    }

    /// Arguments of the most recently created node.
    pub fn node_args(&self) -> Option<NodeArgs> {
        self.device().args.clone()
    }

    pub fn is_running(&self) -> bool {
        self.device().running
    }
}

impl Bridge for Loopback {
    fn attach(&self) -> io::Result<()> {
        self.device().attached = true;
        debug!("loopback attached");
        Ok(())
    }

    fn detach(&self) -> io::Result<()> {
        let mut dev = self.device();
        if dev.node.is_some() {
            warn!("detaching with a live node");
        }
        dev.attached = false;
        Ok(())
    }

    fn create_node(&self, args: &NodeArgs) -> io::Result<NodeId> {
        let mut dev = self.device();
        if !dev.attached {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "processor not attached",
            ));
        }
        if let Some(node) = dev.node {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("node {} still allocated", node.0),
            ));
        }
        let node = NodeId(dev.next_node);
        dev.next_node += 1;
        dev.node = Some(node);
        dev.args = Some(args.clone());
        dev.sent.clear();
        Ok(node)
    }

    fn run_node(&self, node: NodeId) -> io::Result<()> {
        let mut dev = self.device();
        dev.check_node(node)?;
        dev.running = true;
        Ok(())
    }

    fn terminate_node(&self, node: NodeId) -> io::Result<u32> {
        self.poke(|dev| {
            dev.check_node(node)?;
            dev.running = false;
            dev.playing = false;
            dev.inputs.clear();
            dev.outputs.clear();
            Ok(0)
        })
    }

    fn free_node(&self, node: NodeId) -> io::Result<()> {
        let mut dev = self.device();
        dev.check_node(node)?;
        dev.node = None;
        dev.outbox.clear();
        dev.faults.clear();
        Ok(())
    }

    fn register_notify(&self, node: NodeId, source: Notification) -> io::Result<()> {
        self.device().check_node(node)?;
        trace!(node = node.0, ?source, "notification registered");
        Ok(())
    }

    fn send_message(&self, node: NodeId, msg: Message) -> io::Result<()> {
        self.poke(|dev| {
            dev.check_node(node)?;
            dev.handle(msg)
        })
    }

    fn get_message(&self, node: NodeId, _timeout: Duration) -> io::Result<Option<Message>> {
        let mut dev = self.device();
        dev.check_node(node)?;
        Ok(dev.outbox.pop_front())
    }

    fn wait_for_events(&self, timeout: Duration) -> io::Result<Option<Notification>> {
        let dev = self.device();
        let (mut dev, _) = self
            .wake
            .wait_timeout_while(dev, timeout, |dev| {
                dev.faults.is_empty() && dev.outbox.is_empty()
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(fault) = dev.faults.pop_front() {
            return Ok(Some(fault));
        }
        Ok((!dev.outbox.is_empty()).then_some(Notification::MessageReady))
    }

    fn reserve(&self, size: usize) -> io::Result<DeviceAddr> {
        let mut dev = self.device();
        if dev.exhausted {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "address space exhausted",
            ));
        }
        let address = dev.next_address;
        let span = DeviceAddr::try_from(round_up(size, PAGE_SIZE))
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "reservation too large"))?;
        dev.next_address = address
            .checked_add(span)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "address space exhausted"))?;
        dev.reservations.insert(address, size);
        Ok(address)
    }

    fn unreserve(&self, reservation: DeviceAddr) -> io::Result<()> {
        let mut dev = self.device();
        if dev.mappings.contains_key(&reservation) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "reservation still mapped",
            ));
        }
        dev.reservations
            .remove(&reservation)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown reservation"))
    }

    fn map(&self, host: *mut u8, size: usize, reservation: DeviceAddr) -> io::Result<DeviceAddr> {
        let mut dev = self.device();
        let reserved = *dev
            .reservations
            .get(&reservation)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown reservation"))?;
        if size > reserved || dev.mappings.contains_key(&reservation) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping does not fit its reservation",
            ));
        }
        dev.mappings.insert(
            reservation,
            Region {
                host: host as usize,
                size,
            },
        );
        Ok(reservation)
    }

    fn unmap(&self, mapping: DeviceAddr) -> io::Result<()> {
        self.device()
            .mappings
            .remove(&mapping)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown mapping"))
    }

    fn flush(&self, host: *const u8, len: usize) -> io::Result<()> {
        let mut dev = self.device();
        if !dev.covers(host, len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cache flush on unmapped memory",
            ));
        }
        dev.cache.flushes += 1;
        Ok(())
    }

    fn invalidate(&self, host: *const u8, len: usize) -> io::Result<()> {
        let mut dev = self.device();
        if !dev.covers(host, len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cache invalidate on unmapped memory",
            ));
        }
        dev.cache.invalidates += 1;
        Ok(())
    }
}
