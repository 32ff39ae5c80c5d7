// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Driver interface to the coprocessor.
//!
//! The engine consumes the DSP bridge driver through the [`Bridge`] trait:
//! processor attach, node lifecycle, message passing, notification waits and
//! the reserve/map/cache calls used by [`DmaBuffer`](crate::buffer::DmaBuffer).
//! [`Loopback`](crate::loopback::Loopback) is a software implementation.

use crate::protocol::{DeviceAddr, Endian, Message};
use std::{io, time::Duration};
use tracing::trace;

/// Handle of a created coprocessor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Notification sources the engine registers and waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    /// The node has queued messages for the host.
    MessageReady,
    /// The coprocessor MMU faulted.
    MmuFault,
    /// The coprocessor hit a system error.
    SystemError,
    /// The driver reported an index outside the registered set.
    Unknown(u32),
}

/// Node creation arguments produced by the codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeArgs {
    /// Heap profile requested for the node.
    pub profile: u32,
    /// Codec-specific create arguments, already marshalled.
    pub data: Vec<u8>,
}

/// Opaque DSP bridge driver.
///
/// Host pointers passed to [`map`](Bridge::map), [`flush`](Bridge::flush) and
/// [`invalidate`](Bridge::invalidate) stay valid until the matching
/// [`unmap`](Bridge::unmap); callers guarantee this.
pub trait Bridge: Send + Sync {
    /// Opens the device and attaches to the coprocessor.
    fn attach(&self) -> io::Result<()>;

    /// Detaches from the coprocessor and closes the device.
    fn detach(&self) -> io::Result<()>;

    /// Allocates and creates a node.
    fn create_node(&self, args: &NodeArgs) -> io::Result<NodeId>;

    fn run_node(&self, node: NodeId) -> io::Result<()>;

    /// Terminates a running node, returning its exit status.
    fn terminate_node(&self, node: NodeId) -> io::Result<u32>;

    fn free_node(&self, node: NodeId) -> io::Result<()>;

    fn register_notify(&self, node: NodeId, source: Notification) -> io::Result<()>;

    fn send_message(&self, node: NodeId, msg: Message) -> io::Result<()>;

    /// Polls the node's message queue, waiting at most `timeout`.
    fn get_message(&self, node: NodeId, timeout: Duration) -> io::Result<Option<Message>>;

    /// Waits for any registered notification; `None` on timeout.
    fn wait_for_events(&self, timeout: Duration) -> io::Result<Option<Notification>>;

    /// Reserves a coprocessor address range of `size` bytes.
    fn reserve(&self, size: usize) -> io::Result<DeviceAddr>;

    fn unreserve(&self, reservation: DeviceAddr) -> io::Result<()>;

    /// Maps `size` bytes of host memory into `reservation`.
    fn map(&self, host: *mut u8, size: usize, reservation: DeviceAddr) -> io::Result<DeviceAddr>;

    fn unmap(&self, mapping: DeviceAddr) -> io::Result<()>;

    /// Writes back CPU caches for the range before the coprocessor reads it.
    fn flush(&self, host: *const u8, len: usize) -> io::Result<()>;

    /// Discards CPU caches for the range after the coprocessor wrote it.
    fn invalidate(&self, host: *const u8, len: usize) -> io::Result<()>;
}

/// A created node together with the driver and wire format used to reach it.
#[derive(Clone, Copy)]
pub struct Link<'a> {
    pub bridge: &'a dyn Bridge,
    pub node: NodeId,
    pub endian: Endian,
}

impl Link<'_> {
    pub fn send(&self, msg: Message) -> io::Result<()> {
        trace!(node = self.node.0, %msg, "send");
        self.bridge.send_message(self.node, msg)
    }
}
