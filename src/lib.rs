// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst DSP Offload Engine
//!
//! This library streams media buffers between a host pipeline and a DSP
//! coprocessor running an encode or decode node. Input frames are mapped
//! into the coprocessor's address space and handed over through fixed-format
//! comm records; completed output buffers come back asynchronously and are
//! delivered downstream in submission order with their timestamps.
//!
//! ## Features
//!
//! - **DMA Buffers**: Host memory, caller memory or dma-heap allocations
//!   mapped for the coprocessor with explicit cache maintenance.
//! - **Ports**: Fixed buffer pools with one comm slot per buffer and
//!   generation-checked handles.
//! - **Timestamp Ring**: Pairs completions with submissions and keeps
//!   pipeline events in order, including deferred end of stream.
//! - **Lifecycle**: Start, flush, stop and fault handling with cooperative
//!   cancellation of every worker thread.
//! - **Loopback**: A software coprocessor for tests and demos.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_dsp::{
//!     ChannelSink, Engine, EngineConfig, InputFrame, Loopback, Output, Passthrough,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, rx) = ChannelSink::bounded(4);
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(Loopback::new()),
//!     Arc::new(Passthrough),
//!     Arc::new(sink),
//! )?;
//!
//! let frame = InputFrame::new(vec![0u8; 1024])
//!     .with_timing(Duration::ZERO, Duration::from_millis(33));
//! engine.push(frame)?;
//!
//! if let Output::Frame(frame) = rx.recv()? {
//!     println!("{} bytes at {:?}", frame.len(), frame.timestamp);
//! }
//! engine.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Safety
//!
//! Buffers hand raw host addresses to the coprocessor driver. The unsafe
//! code is confined to the `buffer` and `loopback` modules; a buffer keeps
//! its memory alive until its mapping has been torn down.

pub mod bridge;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod loopback;
mod notify;
pub mod output;
pub mod port;
pub mod protocol;
pub mod queue;
pub mod ring;

pub use bridge::{Bridge, NodeArgs, NodeId, Notification};
pub use buffer::{DmaBuffer, HeapSource, HostMemory};
pub use codec::{Codec, Passthrough, Severity};
pub use config::EngineConfig;
pub use engine::{Engine, InputFrame, State, Stats};
pub use error::{Error, Fault, Result};
pub use loopback::Loopback;
pub use output::{ChannelSink, Downstream, Frame, Output};
pub use port::PortId;
pub use protocol::Endian;
pub use ring::Event;

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
