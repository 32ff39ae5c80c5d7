// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer pools attached to the coprocessor node's streams.
//!
//! A [`Port`] owns a fixed pool of [`DmaBuffer`]s and one comm slot per
//! buffer. Buffers live in an arena indexed by [`BufferId`]; taking one out
//! moves it to the caller as a [`PooledBuffer`] and submitting it moves it
//! into a comm slot, so a buffer is in exactly one place at a time. Each
//! replacement of the pool bumps its generation, and ids from an older
//! generation are never honoured.
//!
//! Input pools start with every buffer free in the queue. Output pools start
//! parked and are handed to the coprocessor with [`Port::take_all`]; their
//! queue carries completed buffers waiting for delivery.

use crate::{
    bridge::{Bridge, Link},
    buffer::{Direction, DmaBuffer, HeapSource},
    codec::{Codec, Severity},
    error::{Error, Result},
    lock,
    protocol::{CommRecord, DeviceAddr, Message, RECORD_SIZE},
    queue::BlockingQueue,
};
use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, trace, trace_span};

/// Coprocessor stream id of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PortId {
    Input = 0,
    Output = 1,
}

impl PortId {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn from_wire(port: u8) -> Option<Self> {
        match port {
            0 => Some(PortId::Input),
            1 => Some(PortId::Output),
            _ => None,
        }
    }
}

/// Generation-checked handle of a pool slot, carried on the wire as the comm
/// record's back-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub index: u16,
    pub generation: u16,
}

impl BufferId {
    pub const fn to_wire(self) -> u32 {
        (self.generation as u32) << 16 | self.index as u32
    }

    pub const fn from_wire(word: u32) -> Self {
        Self {
            index: word as u16,
            generation: (word >> 16) as u16,
        }
    }
}

/// A buffer taken out of its port's pool.
pub struct PooledBuffer {
    id: BufferId,
    buf: DmaBuffer,
}

impl PooledBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }
}

impl Deref for PooledBuffer {
    type Target = DmaBuffer;

    fn deref(&self) -> &DmaBuffer {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut DmaBuffer {
        &mut self.buf
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("buf", &self.buf)
            .finish()
    }
}

struct CommSlot {
    comm: DmaBuffer,
    params: Option<DmaBuffer>,
    in_flight: Option<PooledBuffer>,
}

#[derive(Default)]
struct Pool {
    generation: u16,
    parked: Vec<Option<DmaBuffer>>,
    slots: Vec<CommSlot>,
    /// Buffers cancelled while the coprocessor may still touch them.
    graveyard: Vec<PooledBuffer>,
}

impl Pool {
    fn park(&mut self, buf: PooledBuffer) -> Option<BufferId> {
        let PooledBuffer { id, mut buf } = buf;
        if id.generation != self.generation {
            return None;
        }
        let slot = self.parked.get_mut(id.index as usize)?;
        if slot.is_some() {
            return None;
        }
        buf.in_use = false;
        *slot = Some(buf);
        Some(id)
    }

    fn take(&mut self, id: BufferId) -> Option<PooledBuffer> {
        if id.generation != self.generation {
            return None;
        }
        let buf = self.parked.get_mut(id.index as usize)?.take()?;
        Some(PooledBuffer { id, buf })
    }
}

pub struct Port {
    id: PortId,
    direction: Direction,
    alignment: usize,
    source: HeapSource,
    codec: Arc<dyn Codec>,
    pool: Mutex<Pool>,
    queue: BlockingQueue<BufferId>,
}

impl Port {
    pub fn new(id: PortId, alignment: usize, source: HeapSource, codec: Arc<dyn Codec>) -> Self {
        let direction = match id {
            PortId::Input => Direction::ToDevice,
            PortId::Output => Direction::FromDevice,
        };
        Self {
            id,
            direction,
            alignment,
            source,
            codec,
            pool: Mutex::new(Pool::default()),
            queue: BlockingQueue::new(),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Replaces the pool with `count` buffers of `size` bytes and as many
    /// comm slots, and re-enables the queue.
    ///
    /// # Panics
    ///
    /// Panics if a buffer of the current pool is still in flight.
    pub fn alloc_buffers(&self, bridge: &Arc<dyn Bridge>, count: usize, size: usize) -> Result<()> {
        let mut pool = lock(&self.pool);
        assert!(
            pool.slots.iter().all(|slot| slot.in_flight.is_none()),
            "{:?} pool replaced with buffers in flight",
            self.id
        );
        if count > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!("pool of {count} buffers")));
        }

        pool.parked.clear();
        pool.slots.clear();
        pool.graveyard.clear();
        pool.generation = pool.generation.wrapping_add(1);
        while self.queue.try_pop().is_some() {}

        let param_size = self.codec.param_size(self.id);
        for _ in 0..count {
            let mut buf = DmaBuffer::new(bridge.clone(), self.direction, self.alignment)
                .with_source(self.source);
            if size > 0 {
                buf.allocate(size)?;
            }
            pool.parked.push(Some(buf));

            let mut comm = DmaBuffer::new(bridge.clone(), Direction::Bidirectional, 0);
            comm.allocate(RECORD_SIZE)?;
            comm.set_len(RECORD_SIZE);
            let params = if param_size > 0 {
                let mut params = DmaBuffer::new(bridge.clone(), Direction::Bidirectional, 0);
                params.allocate(param_size)?;
                params.set_len(param_size);
                Some(params)
            } else {
                None
            };
            pool.slots.push(CommSlot {
                comm,
                params,
                in_flight: None,
            });
        }

        let generation = pool.generation;
        drop(pool);
        debug!(port = ?self.id, count, size, generation, "pool allocated");

        self.queue.enable();
        if self.direction == Direction::ToDevice {
            for index in 0..count as u16 {
                self.queue.push(BufferId { index, generation });
            }
        }
        Ok(())
    }

    /// Blocks until a buffer is queued. Returns `None` once the queue is
    /// disabled.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        loop {
            let id = self.queue.pop()?;
            if let Some(buf) = lock(&self.pool).take(id) {
                return Some(buf);
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PooledBuffer> {
        loop {
            let id = self.queue.pop_timeout(timeout)?;
            if let Some(buf) = lock(&self.pool).take(id) {
                return Some(buf);
            }
        }
    }

    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        loop {
            let id = self.queue.try_pop()?;
            if let Some(buf) = lock(&self.pool).take(id) {
                return Some(buf);
            }
        }
    }

    /// Takes every parked buffer of the current pool, bypassing the queue.
    pub fn take_all(&self) -> Vec<PooledBuffer> {
        let mut pool = lock(&self.pool);
        let generation = pool.generation;
        (0..pool.parked.len() as u16)
            .filter_map(|index| pool.take(BufferId { index, generation }))
            .collect()
    }

    /// Parks `buf` and queues its id. Buffers from an older pool are freed.
    /// Returns `true` if the buffer was queued.
    pub fn put(&self, buf: PooledBuffer) -> bool {
        let id = lock(&self.pool).park(buf);
        match id {
            Some(id) => self.queue.push(id),
            None => false,
        }
    }

    /// Whether `id` belongs to the current pool.
    pub fn is_current(&self, id: BufferId) -> bool {
        lock(&self.pool).generation == id.generation
    }

    pub fn generation(&self) -> u16 {
        lock(&self.pool).generation
    }

    /// Hands `buf` to the coprocessor with `len` valid bytes.
    ///
    /// On error the buffer is parked again, and input buffers are requeued,
    /// so a failed submission never shrinks the pool.
    ///
    /// # Panics
    ///
    /// Panics if every comm slot is already in flight.
    pub fn submit(&self, link: &Link<'_>, mut buf: PooledBuffer, len: usize) -> Result<()> {
        let _span = trace_span!("submit", port = ?self.id).entered();
        let mut pool = lock(&self.pool);
        let Some(index) = pool.slots.iter().position(|slot| slot.in_flight.is_none()) else {
            panic!("no free comm slot on {:?} port", self.id);
        };
        let slot = &mut pool.slots[index];

        let comm_address = match self.prepare(link, slot, &mut buf, len) {
            Ok(address) => address,
            Err(err) => return self.restore(pool, buf, err),
        };
        trace!(
            port = ?self.id,
            slot = index,
            buffer = buf.id.index,
            len = buf.len(),
            "buffer ready"
        );
        slot.in_flight = Some(buf);
        if let Err(err) = link.send(Message::buffer(self.id as u8, comm_address)) {
            return match slot.in_flight.take() {
                Some(buf) => self.restore(pool, buf, err.into()),
                None => Err(err.into()),
            };
        }
        Ok(())
    }

    /// Runs the codec hook and cache maintenance for `buf` and writes its
    /// comm record into `slot`. Returns the record's coprocessor address.
    fn prepare(
        &self,
        link: &Link<'_>,
        slot: &mut CommSlot,
        buf: &mut PooledBuffer,
        len: usize,
    ) -> Result<DeviceAddr> {
        buf.in_use = true;
        buf.set_len(len);
        self.codec.on_send(
            self.id,
            buf,
            slot.params.as_mut().map(|params| params.as_mut_slice()),
        );
        let transfer = match self.direction {
            Direction::FromDevice => buf.size(),
            _ => buf.len(),
        };
        buf.begin_transfer(transfer)?;

        let (param_address, param_size) = match slot.params.as_mut() {
            Some(params) => {
                params.begin_transfer(params.size())?;
                (params.device_address().ok_or(Error::NotMapped)?, params.size())
            }
            None => (0, 0),
        };

        let record = CommRecord {
            buffer_address: buf.device_address().ok_or(Error::NotMapped)?,
            buffer_size: buf.size() as u32,
            param_address,
            param_size: param_size as u32,
            valid_length: buf.len() as u32,
            back_reference: buf.id.to_wire(),
            stream_id: self.id as u32,
            ..Default::default()
        };
        record.encode(link.endian, slot.comm.as_mut_slice());
        slot.comm.begin_transfer(RECORD_SIZE)?;
        slot.comm.device_address().ok_or(Error::NotMapped)
    }

    /// Parks a buffer whose submission failed and hands back `err`.
    fn restore(&self, mut pool: MutexGuard<'_, Pool>, buf: PooledBuffer, err: Error) -> Result<()> {
        debug!(port = ?self.id, buffer = buf.id.index, "submit failed: {err}");
        let id = pool.park(buf);
        drop(pool);
        if let (Some(id), Direction::ToDevice) = (id, self.direction) {
            self.queue.push(id);
        }
        Err(err)
    }

    /// Resolves a "buffer done" message whose argument is the comm record at
    /// `comm_address`. Returns `None` if no in-flight slot owns that record.
    ///
    /// # Panics
    ///
    /// Panics if the record's back-reference does not name the buffer the
    /// slot holds.
    pub fn complete(
        &self,
        link: &Link<'_>,
        comm_address: DeviceAddr,
    ) -> Result<Option<(PooledBuffer, Severity)>> {
        let _span = trace_span!("complete", port = ?self.id).entered();
        let mut pool = lock(&self.pool);
        let Some(slot) = pool.slots.iter_mut().find(|slot| {
            slot.in_flight.is_some() && slot.comm.device_address() == Some(comm_address)
        }) else {
            return Ok(None);
        };
        let Some(mut buf) = slot.in_flight.take() else {
            return Ok(None);
        };

        slot.comm.end_transfer(RECORD_SIZE)?;
        let record = CommRecord::decode(link.endian, slot.comm.as_slice());
        assert_eq!(
            BufferId::from_wire(record.back_reference),
            buf.id,
            "comm record back-reference does not match its slot"
        );

        let valid = (record.valid_length as usize).min(buf.size());
        buf.end_transfer(valid)?;
        buf.set_len(valid);
        buf.in_use = false;
        if let Some(params) = slot.params.as_mut() {
            params.end_transfer(params.size())?;
        }

        let severity = self.codec.on_receive(
            self.id,
            &mut buf,
            slot.params.as_ref().map(|params| params.as_slice()),
        );
        trace!(port = ?self.id, buffer = buf.id.index, valid, ?severity, "buffer done");
        Ok(Some((buf, severity)))
    }

    /// Forgets every in-flight transfer. The buffers are kept alive until the
    /// next [`flush`](Self::flush) or pool replacement since the coprocessor
    /// may still access them.
    pub fn cancel_in_flight(&self) -> usize {
        let mut pool = lock(&self.pool);
        let Pool {
            slots, graveyard, ..
        } = &mut *pool;
        let before = graveyard.len();
        graveyard.extend(slots.iter_mut().filter_map(|slot| slot.in_flight.take()));
        graveyard.len() - before
    }

    /// Disables the queue and frees every buffer, comm slot and parameter
    /// buffer of the pool.
    pub fn flush(&self) {
        self.queue.disable();
        let mut pool = lock(&self.pool);
        let in_flight = pool.slots.iter().filter(|s| s.in_flight.is_some()).count();
        let cancelled = pool.graveyard.len();
        for slot in pool.slots.iter_mut() {
            if let Some(mut buf) = slot.in_flight.take() {
                drop(buf.detach_external());
            }
        }
        for buf in pool.graveyard.iter_mut() {
            drop(buf.detach_external());
        }
        pool.parked.clear();
        pool.slots.clear();
        pool.graveyard.clear();
        debug!(port = ?self.id, in_flight, cancelled, "pool flushed");
    }

    /// Disables the queue, waking every blocked [`acquire`](Self::acquire).
    pub fn disable(&self) {
        self.queue.disable();
    }

    pub fn enable(&self) {
        self.queue.enable();
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_enabled()
    }

    /// Number of buffers currently held by the coprocessor.
    pub fn in_flight(&self) -> usize {
        lock(&self.pool)
            .slots
            .iter()
            .filter(|slot| slot.in_flight.is_some())
            .count()
    }

    /// Number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        lock(&self.pool).parked.len()
    }

    /// Number of ids waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
