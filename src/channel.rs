//! Data channels: one leaf-level named storage slot each.
//!
//! A channel starts as a [`ChannelSpec`] while GAMs are declaring their
//! signals, and becomes a [`DataChannel`] with two allocated buffers once the
//! registry is allocated. After that point only the buffer contents change.

#![forbid(unsafe_code)]

use crate::memory::ByteBlock;
use crate::types::TypeDescriptor;
use std::collections::BTreeMap;

/// Number of buffers held by every channel.
pub const NUMBER_OF_BUFFERS: usize = 2;

/// Configuration-phase description of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Unique dotted path.
    pub path: String,
    /// Type name the channel was declared with.
    pub type_name: String,
    /// Resolved storage descriptor.
    pub descriptor: TypeDescriptor,
    /// Default literal, as last declared.
    pub default_value: String,
    /// Decoded default literal.
    pub default_bytes: Vec<u8>,
    /// Producer count per state.
    pub producers: BTreeMap<String, u32>,
    /// Consumer count per state.
    pub consumers: BTreeMap<String, u32>,
    /// Channel of the timing group.
    pub timing: bool,
}

impl ChannelSpec {
    /// Producers of this channel in `state`.
    pub fn producers_in(&self, state: &str) -> u32 {
        self.producers.get(state).copied().unwrap_or(0)
    }

    /// Consumers of this channel in `state`.
    pub fn consumers_in(&self, state: &str) -> u32 {
        self.consumers.get(state).copied().unwrap_or(0)
    }

    /// Every state that produces or consumes the channel.
    pub fn states(&self) -> impl Iterator<Item = &str> {
        let mut states: Vec<&str> = self
            .producers
            .keys()
            .chain(self.consumers.keys())
            .map(String::as_str)
            .collect();
        states.sort_unstable();
        states.dedup();
        states.into_iter()
    }
}

/// An allocated, double-buffered channel.
#[derive(Debug)]
pub struct DataChannel {
    path: String,
    type_name: String,
    descriptor: TypeDescriptor,
    default_bytes: Vec<u8>,
    buffers: [ByteBlock; NUMBER_OF_BUFFERS],
    producers: BTreeMap<String, u32>,
    consumers: BTreeMap<String, u32>,
    timing: bool,
}

impl DataChannel {
    /// Allocate both buffers of `spec` and seed them with its default.
    pub fn allocate(spec: &ChannelSpec) -> Self {
        Self {
            path: spec.path.clone(),
            type_name: spec.type_name.clone(),
            descriptor: spec.descriptor.clone(),
            default_bytes: spec.default_bytes.clone(),
            buffers: [
                ByteBlock::from_bytes(&spec.default_bytes),
                ByteBlock::from_bytes(&spec.default_bytes),
            ],
            producers: spec.producers.clone(),
            consumers: spec.consumers.clone(),
            timing: spec.timing,
        }
    }

    /// Unique dotted path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Storage descriptor.
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Size of one buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.buffers[0].len()
    }

    /// Decoded default value.
    pub fn default_bytes(&self) -> &[u8] {
        &self.default_bytes
    }

    /// Buffer `index`, taken modulo the number of buffers.
    #[inline]
    pub fn buffer(&self, index: usize) -> &ByteBlock {
        &self.buffers[index % NUMBER_OF_BUFFERS]
    }

    /// Producers of this channel in `state`.
    pub fn producers_in(&self, state: &str) -> u32 {
        self.producers.get(state).copied().unwrap_or(0)
    }

    /// Consumers of this channel in `state`.
    pub fn consumers_in(&self, state: &str) -> u32 {
        self.consumers.get(state).copied().unwrap_or(0)
    }

    /// True when some GAM of `state` produces or consumes the channel.
    pub fn is_referenced_in(&self, state: &str) -> bool {
        self.producers.contains_key(state) || self.consumers.contains_key(state)
    }

    /// True for the per-GAM execution time channels.
    pub fn is_timing(&self) -> bool {
        self.timing
    }

    /// Rewrite buffer `index` with the default value.
    pub fn reset_to_default(&self, index: usize) {
        self.buffer(index).fill_from(&self.default_bytes);
    }

    /// Copy the contents of buffer `from` into buffer `to`.
    pub fn carry_over(&self, from: usize, to: usize) {
        let len = self.byte_size();
        self.buffer(to).copy_from(0, self.buffer(from), 0, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BasicType;

    fn spec() -> ChannelSpec {
        ChannelSpec {
            path: "DDB1.X".into(),
            type_name: "uint32".into(),
            descriptor: TypeDescriptor::basic(BasicType::UInt32, vec![]),
            default_value: "1".into(),
            default_bytes: 1u32.to_ne_bytes().to_vec(),
            producers: BTreeMap::from([("state1".to_string(), 1)]),
            consumers: BTreeMap::from([("state1".to_string(), 2), ("state2".to_string(), 1)]),
            timing: false,
        }
    }

    #[test]
    fn allocation_seeds_both_buffers() {
        let channel = DataChannel::allocate(&spec());
        assert_eq!(channel.byte_size(), 4);
        assert_eq!(channel.buffer(0).to_vec(), 1u32.to_ne_bytes());
        assert_eq!(channel.buffer(1).to_vec(), 1u32.to_ne_bytes());
        assert_eq!(channel.buffer(3).to_vec(), channel.buffer(1).to_vec());
    }

    #[test]
    fn reset_and_carry_over() {
        let channel = DataChannel::allocate(&spec());
        channel.buffer(0).store(0, &9u32.to_ne_bytes());
        channel.carry_over(0, 1);
        assert_eq!(channel.buffer(1).to_vec(), 9u32.to_ne_bytes());
        channel.reset_to_default(1);
        assert_eq!(channel.buffer(1).to_vec(), 1u32.to_ne_bytes());
    }

    #[test]
    fn state_bookkeeping() {
        let spec = spec();
        assert_eq!(spec.states().collect::<Vec<_>>(), vec!["state1", "state2"]);
        let channel = DataChannel::allocate(&spec);
        assert_eq!(channel.producers_in("state1"), 1);
        assert_eq!(channel.producers_in("state2"), 0);
        assert_eq!(channel.consumers_in("state1"), 2);
        assert!(channel.is_referenced_in("state2"));
        assert!(!channel.is_referenced_in("state3"));
    }
}
