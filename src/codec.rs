// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Codec strategy plugged into the engine.
//!
//! A [`Codec`] marshals the node creation arguments and may inspect or
//! decorate every buffer crossing a port. The engine holds one codec for its
//! lifetime; there is no registry.

use crate::{bridge::NodeArgs, buffer::DmaBuffer, port::PortId};
use tracing::warn;

/// Verdict of a codec hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    /// The engine cannot continue.
    Fatal,
}

/// Pool dimensions of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortShape {
    pub count: usize,
    pub size: usize,
}

/// Pool dimensions handed to [`Codec::create_node_args`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    pub input: PortShape,
    pub output: PortShape,
}

pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Builds the node creation arguments for the given pools.
    fn create_node_args(&self, layout: &PortLayout) -> NodeArgs;

    /// Size of the parameter buffer attached to each transfer on `port`.
    fn param_size(&self, _port: PortId) -> usize {
        0
    }

    /// Called before a buffer is handed to the coprocessor.
    fn on_send(&self, _port: PortId, _buf: &mut DmaBuffer, _params: Option<&mut [u8]>) {}

    /// Called when the coprocessor returns a buffer. The codec may set
    /// `keyframe` or `skip` on output buffers.
    fn on_receive(&self, _port: PortId, _buf: &mut DmaBuffer, _params: Option<&[u8]>) -> Severity {
        Severity::Info
    }

    /// Called for coprocessor events other than playback completion.
    fn on_event(&self, arg_1: u32, arg_2: u32) -> Severity {
        warn!(codec = self.name(), arg_1, arg_2, "unhandled DSP event");
        Severity::Warning
    }
}

/// Codec for nodes that return their input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Codec for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn create_node_args(&self, layout: &PortLayout) -> NodeArgs {
        let words: [u16; 8] = [
            2,
            PortId::Input as u16,
            0,
            layout.input.count as u16,
            PortId::Output as u16,
            0,
            layout.output.count as u16,
            0,
        ];
        NodeArgs {
            profile: 0,
            data: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        }
    }

    fn on_receive(&self, port: PortId, buf: &mut DmaBuffer, _params: Option<&[u8]>) -> Severity {
        if port == PortId::Output {
            buf.keyframe = true;
        }
        Severity::Info
    }
}
