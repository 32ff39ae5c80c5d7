// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_dsp::{EngineConfig, Endian, HeapSource};
use serde_json::{json, Value};
use std::time::Duration;

/// Byte order of the comm records.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum ByteOrder {
    /// Little-endian coprocessor
    Little,
    /// Big-endian coprocessor
    Big,
}

/// Memory source for owned buffers.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Heap {
    /// Aligned host allocations
    Host,
    /// CMA dma-heap
    Cma,
    /// System dma-heap
    System,
}

/// Command-line arguments for the DSP offload demo.
///
/// Runs a session against the software coprocessor and prints a JSON
/// report. Arguments can be specified via command line or environment
/// variables.
///
/// # Example
///
/// ```bash
/// edgefirst-dsp --frames 300 --frame-size 65536 --flush-every 100
///
/// export OUTPUT_BUFFERS=4
/// edgefirst-dsp --report
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of input frames to push
    #[arg(short, long, env = "FRAMES", default_value = "120")]
    pub frames: u64,

    /// Size of each input frame in bytes
    #[arg(long, env = "FRAME_SIZE", default_value = "65536")]
    pub frame_size: usize,

    /// Frame duration in milliseconds
    #[arg(long, env = "FRAME_DURATION_MS", default_value = "33")]
    pub frame_duration_ms: u64,

    /// Number of input buffers (bounds the frames in flight)
    #[arg(long, env = "INPUT_BUFFERS", default_value = "2")]
    pub input_buffers: usize,

    /// Number of output buffers
    #[arg(long, env = "OUTPUT_BUFFERS", default_value = "2")]
    pub output_buffers: usize,

    /// Minimum input buffer size; smaller inputs are copied
    #[arg(long, env = "INPUT_BUFFER_SIZE", default_value = "0")]
    pub input_buffer_size: usize,

    /// Output buffer size in bytes
    #[arg(long, env = "OUTPUT_BUFFER_SIZE", default_value = "1048576")]
    pub output_buffer_size: usize,

    /// Required alignment of input memory (0 accepts any address)
    #[arg(long, env = "INPUT_ALIGNMENT", default_value = "0")]
    pub input_alignment: usize,

    /// Alignment of output buffers
    #[arg(long, env = "OUTPUT_ALIGNMENT", default_value = "128")]
    pub output_alignment: usize,

    /// Byte order of the comm records
    #[arg(long, env = "ENDIAN", default_value = "little", value_enum)]
    pub endian: ByteOrder,

    /// Timestamp ring capacity
    #[arg(long, env = "RING_CAPACITY", default_value = "32")]
    pub ring_capacity: usize,

    /// Notification wait timeout in milliseconds
    #[arg(long, env = "EVENT_TIMEOUT_MS", default_value = "1000")]
    pub event_timeout_ms: u64,

    /// Message poll timeout in milliseconds
    #[arg(long, env = "MESSAGE_TIMEOUT_MS", default_value = "100")]
    pub message_timeout_ms: u64,

    /// Flush and stop acknowledgement timeout in milliseconds
    #[arg(long, env = "ACK_TIMEOUT_MS", default_value = "5000")]
    pub ack_timeout_ms: u64,

    /// Flush the pipeline after every N frames (0 disables)
    #[arg(long, env = "FLUSH_EVERY", default_value = "0")]
    pub flush_every: u64,

    /// Memory source for owned buffers
    #[arg(long, env = "HEAP", default_value = "host", value_enum)]
    pub heap: Heap,

    /// Print the session report as JSON
    #[arg(long, env = "REPORT")]
    pub report: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    /// Effective settings, for the session report.
    pub fn to_json(&self) -> Value {
        json!({
            "frames": self.frames,
            "frame_size": self.frame_size,
            "input_buffers": self.input_buffers,
            "output_buffers": self.output_buffers,
            "output_buffer_size": self.output_buffer_size,
            "endian": format!("{:?}", self.endian).to_lowercase(),
            "heap": format!("{:?}", self.heap).to_lowercase(),
            "flush_every": self.flush_every,
        })
    }
}

impl From<&Args> for EngineConfig {
    fn from(args: &Args) -> Self {
        EngineConfig {
            input_buffers: args.input_buffers,
            output_buffers: args.output_buffers,
            input_buffer_size: args.input_buffer_size,
            output_buffer_size: args.output_buffer_size,
            input_alignment: args.input_alignment,
            output_alignment: args.output_alignment,
            endian: match args.endian {
                ByteOrder::Little => Endian::Little,
                ByteOrder::Big => Endian::Big,
            },
            ring_capacity: args.ring_capacity,
            event_timeout: Duration::from_millis(args.event_timeout_ms),
            message_timeout: Duration::from_millis(args.message_timeout_ms),
            ack_timeout: Duration::from_millis(args.ack_timeout_ms),
            heap: match args.heap {
                Heap::Host => HeapSource::Host,
                Heap::Cma => HeapSource::Cma,
                Heap::System => HeapSource::System,
            },
        }
    }
}
