// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Error types for the DSP offload engine.
//!
//! [`Error`] is returned by fallible engine, port and buffer operations.
//! [`Fault`] describes why an engine entered the terminal error state; it is
//! reported once to the downstream consumer and carried by
//! [`Error::Fault`] for every later call.

use crate::engine::State;
use std::{error, fmt, io};

/// Terminal engine failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The coprocessor signalled an MMU fault.
    MmuFault,
    /// The coprocessor signalled a system error.
    SystemError,
    /// The driver woke the notification loop with a source it never registered.
    UnknownNotification(u32),
    /// A codec hook judged an event or an output buffer fatal.
    Codec { arg_1: u32, arg_2: u32 },
    /// A driver call failed while the engine was running.
    Driver(String),
    /// The downstream consumer refused a frame.
    Downstream(String),
    /// The coprocessor did not acknowledge a request in time.
    Timeout(&'static str),
    /// Buffer or comm-slot bookkeeping was found corrupted.
    Corruption,
}

impl Fault {
    /// Numeric fault code, matching the order of the notification sources.
    pub fn code(&self) -> u32 {
        match self {
            Fault::MmuFault => 1,
            Fault::SystemError => 2,
            Fault::UnknownNotification(_) => 3,
            Fault::Codec { .. } => 4,
            Fault::Driver(_) => 5,
            Fault::Downstream(_) => 6,
            Fault::Timeout(_) => 7,
            Fault::Corruption => 8,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::MmuFault => f.write_str("got DSP MMU fault"),
            Fault::SystemError => f.write_str("got DSP system error"),
            Fault::UnknownNotification(index) => write!(f, "wrong event index {index}"),
            Fault::Codec { arg_1, arg_2 } => {
                write!(f, "codec error: arg1={arg_1:#x} arg2={arg_2:#x}")
            }
            Fault::Driver(msg) => write!(f, "driver failure: {msg}"),
            Fault::Downstream(msg) => write!(f, "downstream refused frame: {msg}"),
            Fault::Timeout(what) => write!(f, "timed out waiting for {what}"),
            Fault::Corruption => f.write_str("buffer bookkeeping corrupted"),
        }
    }
}

/// Errors returned by the engine and its components.
#[derive(Debug)]
pub enum Error {
    /// A driver call failed.
    Io(io::Error),
    /// The engine has failed and will not process more buffers.
    Fault(Fault),
    /// The engine is flushing; the buffer was not submitted.
    Flushing,
    /// The operation needs a running engine.
    NotRunning(State),
    /// The coprocessor did not answer in time.
    Timeout(&'static str),
    /// Backing memory of the given size could not be allocated.
    Alloc(usize),
    /// A dma-heap allocation failed.
    Heap(String),
    /// The buffer has no coprocessor mapping.
    NotMapped,
    /// The engine configuration is inconsistent.
    InvalidConfig(String),
    /// The downstream consumer refused a frame.
    Downstream(String),
    /// Every timestamp ring entry belongs to a frame in flight.
    RingFull(usize),
    /// Delivery was abandoned because the engine left the running state.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "driver error: {err}"),
            Error::Fault(fault) => write!(f, "engine failed: {fault}"),
            Error::Flushing => f.write_str("engine is flushing"),
            Error::NotRunning(state) => write!(f, "engine is not running ({state:?})"),
            Error::Timeout(what) => write!(f, "timed out waiting for {what}"),
            Error::Alloc(size) => write!(f, "failed to allocate {size} bytes"),
            Error::Heap(msg) => write!(f, "dma-heap allocation failed: {msg}"),
            Error::NotMapped => f.write_str("buffer is not mapped to the coprocessor"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Downstream(msg) => write!(f, "downstream error: {msg}"),
            Error::RingFull(frames) => write!(f, "timestamp ring full with {frames} frames"),
            Error::Cancelled => f.write_str("delivery cancelled"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Fault(fault)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
