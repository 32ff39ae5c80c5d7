// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! DMA-aware buffers shared with the coprocessor.
//!
//! A [`DmaBuffer`] pairs a host memory region with a coprocessor mapping and
//! performs the cache maintenance each transfer needs. The host region is
//! either owned (aligned host allocation or a dma-heap allocation mapped with
//! `mmap`) or borrowed from the caller through [`HostMemory`].
//!
//! Mapping a buffer reserves `round_up(size, PAGE) + PAGE` bytes of
//! coprocessor address space and maps the host region into it. A buffer never
//! holds a mapping without the reservation backing it, and every change of
//! size or address tears the previous pair down first.

use crate::{
    bridge::Bridge,
    error::{Error, Result},
    protocol::DeviceAddr,
};
use dma_heap::{Heap, HeapKind};
use std::{
    ffi::c_void,
    fmt,
    os::{fd::AsRawFd, unix::io::OwnedFd},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, trace, warn};

/// Coprocessor MMU page size.
pub const PAGE_SIZE: usize = 0x1000;

static LIVE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Number of owned backing allocations currently alive in this process.
pub fn live_allocations() -> usize {
    LIVE_ALLOCATIONS.load(Ordering::SeqCst)
}

pub const fn round_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Transfer direction of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host writes, coprocessor reads.
    ToDevice,
    /// Coprocessor writes, host reads.
    FromDevice,
    Bidirectional,
}

/// Where owned buffers get their memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapSource {
    /// Aligned host allocation.
    #[default]
    Host,
    /// Contiguous memory from the CMA dma-heap.
    Cma,
    /// Memory from the system dma-heap.
    System,
}

/// Caller-owned memory a [`DmaBuffer`] can borrow for a transfer.
pub trait HostMemory: Send + 'static {
    fn as_bytes(&self) -> &[u8];
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

impl HostMemory for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl HostMemory for Box<[u8]> {
    fn as_bytes(&self) -> &[u8] {
        self
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// How [`DmaBuffer::use_external`] placed the caller's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The coprocessor sees the caller's memory directly.
    ZeroCopy,
    /// The memory was misaligned and has been copied into an owned buffer.
    Copied,
}

/// dma-heap allocation mapped into the host address space.
struct HeapRegion {
    _fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed!");
        }
        LIVE_ALLOCATIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aligned host allocation from `posix_memalign`.
struct HostRegion {
    ptr: NonNull<u8>,
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr().cast::<c_void>()) };
        LIVE_ALLOCATIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Backing {
    Empty,
    Owned(HostRegion),
    Heap(HeapRegion),
    External(Box<dyn HostMemory>),
}

impl Backing {
    fn host(size: usize, alignment: usize) -> Result<Self> {
        let align = alignment.max(std::mem::size_of::<usize>()).next_power_of_two();
        let len = round_up(size, align);
        let mut ptr: *mut c_void = null_mut();
        if unsafe { libc::posix_memalign(&mut ptr, align, len) } != 0 {
            return Err(Error::Alloc(size));
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Error::Alloc(size))?;
        unsafe { ptr.as_ptr().write_bytes(0, len) };
        LIVE_ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        Ok(Backing::Owned(HostRegion { ptr }))
    }

    fn heap(kind: HeapKind, size: usize) -> Result<Self> {
        let len = round_up(size, PAGE_SIZE);
        let heap = Heap::new(kind).map_err(|err| Error::Heap(err.to_string()))?;
        let fd = heap
            .allocate(len)
            .map_err(|err| Error::Heap(err.to_string()))?;
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Error::Alloc(size))?;
        LIVE_ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        Ok(Backing::Heap(HeapRegion { _fd: fd, ptr, len }))
    }

    fn as_ptr(&mut self) -> Option<*mut u8> {
        match self {
            Backing::Empty => None,
            Backing::Owned(region) => Some(region.ptr.as_ptr()),
            Backing::Heap(region) => Some(region.ptr.as_ptr()),
            Backing::External(mem) => Some(mem.as_bytes_mut().as_mut_ptr()),
        }
    }

    fn is_owned(&self) -> bool {
        matches!(self, Backing::Owned(_) | Backing::Heap(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    reservation: DeviceAddr,
    address: DeviceAddr,
}

/// Host memory region plus its coprocessor mapping.
pub struct DmaBuffer {
    bridge: Arc<dyn Bridge>,
    direction: Direction,
    source: HeapSource,
    alignment: usize,
    backing: Backing,
    /// Caller memory to copy results back into after a misaligned `use_external`.
    shadow: Option<Box<dyn HostMemory>>,
    mapping: Option<Mapping>,
    size: usize,
    len: usize,
    pub in_use: bool,
    pub needs_copy: bool,
    pub keyframe: bool,
    pub skip: bool,
}

// The raw host pointers are only dereferenced by the thread owning the buffer.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Creates an empty buffer with no backing and no mapping.
    pub fn new(bridge: Arc<dyn Bridge>, direction: Direction, alignment: usize) -> Self {
        Self {
            bridge,
            direction,
            source: HeapSource::Host,
            alignment,
            backing: Backing::Empty,
            shadow: None,
            mapping: None,
            size: 0,
            len: 0,
            in_use: false,
            needs_copy: false,
            keyframe: false,
            skip: false,
        }
    }

    /// Selects where [`allocate`](Self::allocate) takes its memory from.
    pub fn with_source(mut self, source: HeapSource) -> Self {
        self.source = source;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Declared capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the number of valid bytes, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.size);
    }

    pub fn device_address(&self) -> Option<DeviceAddr> {
        self.mapping.map(|m| m.address)
    }

    /// Coprocessor reservation backing the current mapping.
    pub fn reservation(&self) -> Option<DeviceAddr> {
        self.mapping.map(|m| m.reservation)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Whether the buffer borrows caller memory.
    pub fn is_external(&self) -> bool {
        matches!(self.backing, Backing::External(_))
    }

    /// Valid bytes of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        let Some(ptr) = self.host_ptr() else {
            return &[];
        };
        unsafe { from_raw_parts(ptr, self.len) }
    }

    /// The full capacity of the buffer, for filling before [`set_len`](Self::set_len).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let size = self.size;
        let Some(ptr) = self.backing.as_ptr() else {
            return &mut [];
        };
        unsafe { from_raw_parts_mut(ptr, size) }
    }

    fn host_ptr(&self) -> Option<*const u8> {
        match &self.backing {
            Backing::Empty => None,
            Backing::Owned(region) => Some(region.ptr.as_ptr()),
            Backing::Heap(region) => Some(region.ptr.as_ptr()),
            Backing::External(mem) => Some(mem.as_bytes().as_ptr()),
        }
    }

    /// Replaces the backing with `size` bytes of fresh aligned memory and maps
    /// it.
    pub fn allocate(&mut self, size: usize) -> Result<()> {
        self.release();
        if size == 0 {
            return Ok(());
        }
        self.backing = match self.source {
            HeapSource::Host => Backing::host(size, self.alignment)?,
            HeapSource::Cma if self.alignment <= PAGE_SIZE => Backing::heap(HeapKind::Cma, size)?,
            HeapSource::System if self.alignment <= PAGE_SIZE => {
                Backing::heap(HeapKind::System, size)?
            }
            _ => Backing::host(size, self.alignment)?,
        };
        self.size = size;
        self.len = 0;
        trace!(size, source = ?self.source, "buffer allocated");
        self.map()
    }

    /// Borrows caller memory for the next transfer.
    ///
    /// Memory that does not meet the buffer's alignment is copied into an
    /// owned aligned allocation instead, and `needs_copy` is set so results
    /// of device writes are copied back when the transfer ends. Empty regions
    /// take the copy path too so the transfer still has a mapping.
    pub fn use_external(&mut self, mut mem: Box<dyn HostMemory>) -> Result<Placement> {
        let addr = mem.as_bytes_mut().as_mut_ptr() as usize;
        let size = mem.as_bytes().len();
        if size > 0 && (self.alignment == 0 || addr % self.alignment == 0) {
            self.release();
            self.backing = Backing::External(mem);
            self.size = size;
            self.len = size;
            self.map()?;
            return Ok(Placement::ZeroCopy);
        }

        debug!(addr, size, alignment = self.alignment, "unaligned region, copying");
        self.allocate(size.max(1))?;
        self.as_mut_slice()[..size].copy_from_slice(mem.as_bytes());
        self.len = size;
        self.needs_copy = true;
        self.shadow = Some(mem);
        Ok(Placement::Copied)
    }

    /// Copies `data` into owned memory of at least `min_capacity` bytes,
    /// reusing the current allocation when it is large enough.
    pub fn copy_in(&mut self, data: &[u8], min_capacity: usize) -> Result<()> {
        let needed = data.len().max(min_capacity).max(1);
        if !self.backing.is_owned() || self.size < needed {
            self.allocate(needed)?;
        }
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Establishes the coprocessor mapping, tearing down any stale one first.
    pub fn map(&mut self) -> Result<()> {
        self.unmap();
        let Some(host) = self.backing.as_ptr() else {
            return Ok(());
        };
        let reserve_size = round_up(self.size, PAGE_SIZE) + PAGE_SIZE;
        let reservation = self.bridge.reserve(reserve_size)?;
        match self.bridge.map(host, self.size, reservation) {
            Ok(address) => {
                trace!(reservation, address, size = self.size, "buffer mapped");
                self.mapping = Some(Mapping {
                    reservation,
                    address,
                });
                Ok(())
            }
            Err(err) => {
                if let Err(err) = self.bridge.unreserve(reservation) {
                    warn!(reservation, "unreserve failed: {err}");
                }
                Err(err.into())
            }
        }
    }

    fn unmap(&mut self) {
        let Some(mapping) = self.mapping.take() else {
            return;
        };
        if let Err(err) = self.bridge.unmap(mapping.address) {
            warn!(address = mapping.address, "unmap failed: {err}");
        }
        if let Err(err) = self.bridge.unreserve(mapping.reservation) {
            warn!(reservation = mapping.reservation, "unreserve failed: {err}");
        }
    }

    fn check_len(&self, len: usize) {
        assert!(
            len <= self.size,
            "cache operation of {len} bytes exceeds buffer capacity of {}",
            self.size
        );
    }

    /// Cache maintenance before handing the first `len` bytes to the
    /// coprocessor.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn begin_transfer(&mut self, len: usize) -> Result<()> {
        self.check_len(len);
        let host = self.host_ptr().ok_or(Error::NotMapped)?;
        if self.mapping.is_none() {
            return Err(Error::NotMapped);
        }
        match self.direction {
            Direction::ToDevice | Direction::Bidirectional => self.bridge.flush(host, len)?,
            Direction::FromDevice => self.bridge.invalidate(host, len)?,
        }
        Ok(())
    }

    /// Cache maintenance after the coprocessor returned the first `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn end_transfer(&mut self, len: usize) -> Result<()> {
        self.check_len(len);
        let host = self.host_ptr().ok_or(Error::NotMapped)?;
        if self.direction != Direction::ToDevice {
            self.bridge.invalidate(host, len)?;
            if self.needs_copy {
                if let Some(shadow) = self.shadow.as_mut() {
                    let data = unsafe { from_raw_parts(host, len) };
                    let dst = shadow.as_bytes_mut();
                    let n = len.min(dst.len());
                    dst[..n].copy_from_slice(&data[..n]);
                }
            }
        }
        Ok(())
    }

    /// Hands borrowed caller memory back, releasing the buffer.
    pub fn detach_external(&mut self) -> Option<Box<dyn HostMemory>> {
        let shadow = self.shadow.take();
        let external = match std::mem::replace(&mut self.backing, Backing::Empty) {
            Backing::External(mem) => Some(mem),
            other => {
                self.backing = other;
                None
            }
        };
        if external.is_some() || shadow.is_some() {
            self.release();
        }
        external.or(shadow)
    }

    /// Unmaps, unreserves and frees the backing.
    pub fn release(&mut self) {
        self.unmap();
        self.backing = Backing::Empty;
        self.shadow = None;
        self.size = 0;
        self.len = 0;
        self.needs_copy = false;
        self.keyframe = false;
        self.skip = false;
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("direction", &self.direction)
            .field("size", &self.size)
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .field("device_address", &self.device_address())
            .field("external", &self.is_external())
            .field("needs_copy", &self.needs_copy)
            .finish()
    }
}
