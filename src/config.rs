// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    buffer::HeapSource,
    error::{Error, Result},
    protocol::Endian,
};
use std::time::Duration;

/// Engine configuration.
///
/// Defaults match the coprocessor firmware: two buffers per port, 1 MiB
/// output buffers aligned to 128 bytes, a one second event wait and a 100 ms
/// message poll.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of input buffers, which bounds the frames in flight.
    pub input_buffers: usize,
    /// Number of output buffers handed to the coprocessor.
    pub output_buffers: usize,
    /// Inputs smaller than this are copied into an owned buffer of this size.
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
    /// Required address alignment of input memory; 0 accepts any address.
    pub input_alignment: usize,
    pub output_alignment: usize,
    /// Byte order of the comm records.
    pub endian: Endian,
    /// Timestamp ring entries; must exceed the total number of buffers.
    pub ring_capacity: usize,
    /// Bound of each wait for coprocessor notifications.
    pub event_timeout: Duration,
    /// Bound of each message poll once notified.
    pub message_timeout: Duration,
    /// How long flush and stop wait for the coprocessor to acknowledge.
    pub ack_timeout: Duration,
    /// Memory source of owned buffers.
    pub heap: HeapSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_buffers: 2,
            output_buffers: 2,
            input_buffer_size: 0,
            output_buffer_size: 1 << 20,
            input_alignment: 0,
            output_alignment: 128,
            endian: Endian::Little,
            ring_capacity: 32,
            event_timeout: Duration::from_millis(1000),
            message_timeout: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(5),
            heap: HeapSource::Host,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_buffers == 0 || self.output_buffers == 0 {
            return Err(Error::InvalidConfig("ports need at least one buffer".into()));
        }
        if self.output_buffer_size == 0 {
            return Err(Error::InvalidConfig("output buffer size is zero".into()));
        }
        for (name, align) in [
            ("input", self.input_alignment),
            ("output", self.output_alignment),
        ] {
            if align != 0 && !align.is_power_of_two() {
                return Err(Error::InvalidConfig(format!(
                    "{name} alignment {align} is not a power of two"
                )));
            }
        }
        if self.ring_capacity <= self.input_buffers + self.output_buffers {
            return Err(Error::InvalidConfig(format!(
                "ring capacity {} must exceed the {} pooled buffers",
                self.ring_capacity,
                self.input_buffers + self.output_buffers
            )));
        }
        if self.event_timeout.is_zero() || self.message_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn ring_must_outgrow_pools() {
        let config = EngineConfig {
            input_buffers: 16,
            output_buffers: 16,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        let config = EngineConfig {
            output_alignment: 96,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
