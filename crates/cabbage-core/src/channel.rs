//! Named-channel exchange between the control plane and the audio thread.
//!
//! The channel set of a compiled orchestra is one immutable
//! [`ChannelLayout`]. Installing a layout swaps in a fresh
//! [`ChannelTable`] in one atomic step, so readers see either the old set
//! or the new one, never a mix.
//!
//! - GUI → engine: every control channel owns a staged slot (value bits
//!   plus a dirty flag). Writers overwrite; the audio thread takes the
//!   latest value at block start.
//! - engine → GUI: the audio thread writes all channel values into the
//!   back slot of a triple buffer and publishes once per block.
//!
//! Neither direction takes a lock on the audio thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::document::{ChannelDirection, ChannelRate};
use crate::error::ChannelError;
use crate::triple_buffer::{triple_buffer, TripleReader, TripleWriter};

/// One channel of a layout, with its position in the published vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub rate: ChannelRate,
    pub direction: ChannelDirection,
    pub default_value: f64,
    /// First index in the published value vector.
    pub offset: usize,
    /// Number of values (1 for control channels, ksmps for audio channels).
    pub len: usize,
}

/// Immutable channel set of one compiled orchestra.
#[derive(Debug, Default)]
pub struct ChannelLayout {
    specs: Vec<ChannelSpec>,
    index: HashMap<String, usize>,
    total_len: usize,
}

impl ChannelLayout {
    /// Build a layout. Duplicate names keep their first entry.
    ///
    /// `audio_len` is the length of each audio-rate channel (the engine's ksmps).
    pub fn new<I>(channels: I, audio_len: usize) -> Self
    where
        I: IntoIterator<Item = (String, ChannelRate, ChannelDirection, f64)>,
    {
        let mut layout = ChannelLayout::default();
        for (name, rate, direction, default_value) in channels {
            if layout.index.contains_key(&name) {
                continue;
            }
            let len = match rate {
                ChannelRate::Control => 1,
                ChannelRate::Audio => audio_len.max(1),
            };
            layout.index.insert(name.clone(), layout.specs.len());
            layout.specs.push(ChannelSpec {
                name,
                rate,
                direction,
                default_value,
                offset: layout.total_len,
                len,
            });
            layout.total_len += len;
        }
        layout
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ChannelSpec] {
        &self.specs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn spec(&self, index: usize) -> Option<&ChannelSpec> {
        self.specs.get(index)
    }

    /// Length of the published value vector.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Published vector holding every channel's default.
    pub fn default_values(&self) -> Vec<f64> {
        let mut values = vec![0.0; self.total_len];
        for spec in &self.specs {
            if spec.rate == ChannelRate::Control {
                values[spec.offset] = spec.default_value;
            }
        }
        values
    }
}

/// A staged GUI write for one control channel.
struct StagedSlot {
    bits: AtomicU64,
    dirty: AtomicBool,
}

/// An update taken from the staged slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagedUpdate {
    /// Channel index in the layout
    pub index: usize,
    pub value: f64,
}

/// Shared state of one installed layout.
pub struct ChannelTable {
    layout: ChannelLayout,
    staged: Box<[StagedSlot]>,
    // Contended only by control-plane readers; the audio thread never locks it.
    published: Mutex<TripleReader<Vec<f64>>>,
}

impl ChannelTable {
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    fn control_index(&self, name: &str) -> Result<usize, ChannelError> {
        let index = self
            .layout
            .index_of(name)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))?;
        match self.layout.specs[index].rate {
            ChannelRate::Control => Ok(index),
            ChannelRate::Audio => Err(ChannelError::NotControl(name.to_string())),
        }
    }

    fn stage(&self, index: usize, value: f64) {
        let slot = &self.staged[index];
        slot.bits.store(value.to_bits(), Ordering::Release);
        slot.dirty.store(true, Ordering::Release);
    }
}

/// Control-plane side of the channel exchange. Shared by every GUI caller.
pub struct ChannelBridge {
    current: ArcSwap<ChannelTable>,
}

impl Default for ChannelBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBridge {
    /// A bridge with an empty channel set.
    pub fn new() -> Self {
        let (_, table) = build_table(ChannelLayout::default());
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// Replace the channel set. Returns the audio-side publisher for it.
    ///
    /// Values staged against the previous set are discarded with it.
    pub fn install(&self, layout: ChannelLayout) -> ChannelPublisher {
        let last = layout.default_values();
        let (writer, table) = build_table(layout);
        let table = Arc::new(table);
        self.current.store(Arc::clone(&table));
        ChannelPublisher {
            table,
            writer,
            last,
        }
    }

    /// The installed table.
    pub fn table(&self) -> Arc<ChannelTable> {
        self.current.load_full()
    }

    /// Names of the installed channels, in layout order.
    pub fn channel_names(&self) -> Vec<String> {
        self.current
            .load()
            .layout
            .specs
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current.load().layout.index_of(name).is_some()
    }

    /// Stage a value for the engine. Applied at the start of the next block.
    pub fn set_channel(&self, name: &str, value: f64) -> Result<(), ChannelError> {
        let table = self.current.load();
        let index = table.control_index(name)?;
        table.stage(index, value);
        Ok(())
    }

    /// Value published by the audio thread at the end of the last block.
    ///
    /// Unknown names report [`ChannelError::NotFound`]; callers that want
    /// the zero default use [`ChannelBridge::get_channel_or_default`].
    pub fn get_channel(&self, name: &str) -> Result<f64, ChannelError> {
        let table = self.current.load();
        let index = table.control_index(name)?;
        let offset = table.layout.specs[index].offset;
        let mut reader = table.published.lock();
        Ok(reader.read()[offset])
    }

    pub fn get_channel_or_default(&self, name: &str) -> f64 {
        match self.get_channel(name) {
            Ok(value) => value,
            Err(err) => {
                log::debug!("{}", err);
                0.0
            }
        }
    }

    /// Published snapshot of an audio-rate channel.
    pub fn get_channel_array(&self, name: &str) -> Result<Vec<f64>, ChannelError> {
        let table = self.current.load();
        let spec = table
            .layout
            .index_of(name)
            .map(|i| &table.layout.specs[i])
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))?;
        let mut reader = table.published.lock();
        Ok(reader.read()[spec.offset..spec.offset + spec.len].to_vec())
    }

    /// Every control channel with its newest value: staged if pending,
    /// otherwise the last published value.
    pub fn current_values(&self) -> Vec<(String, f64)> {
        let table = self.current.load();
        let mut reader = table.published.lock();
        let published = reader.read();
        table
            .layout
            .specs
            .iter()
            .enumerate()
            .filter(|(_, spec)| spec.rate == ChannelRate::Control)
            .map(|(i, spec)| {
                let slot = &table.staged[i];
                let value = if slot.dirty.load(Ordering::Acquire) {
                    f64::from_bits(slot.bits.load(Ordering::Acquire))
                } else {
                    published[spec.offset]
                };
                (spec.name.clone(), value)
            })
            .collect()
    }
}

fn build_table(layout: ChannelLayout) -> (TripleWriter<Vec<f64>>, ChannelTable) {
    let staged = layout
        .specs
        .iter()
        .map(|spec| StagedSlot {
            bits: AtomicU64::new(spec.default_value.to_bits()),
            dirty: AtomicBool::new(false),
        })
        .collect();
    let (writer, reader) = triple_buffer(layout.default_values());
    let table = ChannelTable {
        layout,
        staged,
        published: Mutex::new(reader),
    };
    (writer, table)
}

/// Audio-thread side of one installed layout.
pub struct ChannelPublisher {
    table: Arc<ChannelTable>,
    writer: TripleWriter<Vec<f64>>,
    /// Copy of the last published values.
    last: Vec<f64>,
}

impl ChannelPublisher {
    pub fn layout(&self) -> &ChannelLayout {
        &self.table.layout
    }

    /// Take every pending staged write into `out`.
    ///
    /// `out` is cleared first. Give it a capacity of at least the channel
    /// count and this never allocates.
    pub fn pull_staged_updates(&self, out: &mut Vec<StagedUpdate>) {
        out.clear();
        for (index, slot) in self.table.staged.iter().enumerate() {
            if slot.dirty.swap(false, Ordering::AcqRel) {
                out.push(StagedUpdate {
                    index,
                    value: f64::from_bits(slot.bits.load(Ordering::Acquire)),
                });
            }
        }
    }

    /// Publish the values of every channel for the block just processed.
    ///
    /// `values` is laid out by [`ChannelSpec::offset`]; extra values are
    /// ignored and missing ones keep their previous contents.
    pub fn publish_outputs(&mut self, values: &[f64]) {
        let n = self.last.len().min(values.len());
        self.last[..n].copy_from_slice(&values[..n]);
        let back = self.writer.back_mut();
        back.copy_from_slice(&self.last);
        self.writer.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(names: &[&str]) -> ChannelLayout {
        ChannelLayout::new(
            names.iter().map(|n| {
                (
                    n.to_string(),
                    ChannelRate::Control,
                    ChannelDirection::Bidirectional,
                    0.0,
                )
            }),
            32,
        )
    }

    #[test]
    fn test_layout_offsets() {
        let layout = ChannelLayout::new(
            vec![
                ("a".to_string(), ChannelRate::Control, ChannelDirection::Input, 0.5),
                ("sig".to_string(), ChannelRate::Audio, ChannelDirection::Output, 0.0),
                ("b".to_string(), ChannelRate::Control, ChannelDirection::Output, 0.0),
                ("a".to_string(), ChannelRate::Control, ChannelDirection::Output, 9.0),
            ],
            4,
        );
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.total_len(), 6);
        assert_eq!(layout.spec(2).unwrap().offset, 5);
        assert_eq!(layout.default_values()[0], 0.5);
    }

    #[test]
    fn test_unknown_channel() {
        let bridge = ChannelBridge::new();
        bridge.install(layout(&["gain"]));
        assert_eq!(
            bridge.set_channel("nope", 1.0),
            Err(ChannelError::NotFound("nope".to_string()))
        );
        assert!(bridge.get_channel("nope").is_err());
        assert_eq!(bridge.get_channel_or_default("nope"), 0.0);
    }

    #[test]
    fn test_staged_not_visible_until_published() {
        let bridge = ChannelBridge::new();
        let mut publisher = bridge.install(layout(&["gain"]));
        bridge.set_channel("gain", 0.8).unwrap();
        assert_eq!(bridge.get_channel("gain").unwrap(), 0.0);

        let mut updates = Vec::with_capacity(1);
        publisher.pull_staged_updates(&mut updates);
        assert_eq!(updates, vec![StagedUpdate { index: 0, value: 0.8 }]);
        publisher.publish_outputs(&[updates[0].value]);
        assert_eq!(bridge.get_channel("gain").unwrap(), 0.8);

        publisher.pull_staged_updates(&mut updates);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_short_publish_keeps_last_values() {
        let bridge = ChannelBridge::new();
        let mut publisher = bridge.install(layout(&["a", "b"]));
        publisher.publish_outputs(&[1.0, 2.0]);
        publisher.publish_outputs(&[3.0, 4.0]);
        publisher.publish_outputs(&[5.0]);
        assert_eq!(bridge.get_channel("a").unwrap(), 5.0);
        assert_eq!(bridge.get_channel("b").unwrap(), 4.0);
    }

    #[test]
    fn test_latest_staged_value_wins() {
        let bridge = ChannelBridge::new();
        let publisher = bridge.install(layout(&["a", "b"]));
        bridge.set_channel("b", 1.0).unwrap();
        bridge.set_channel("b", 2.0).unwrap();
        bridge.set_channel("b", 3.0).unwrap();
        let mut updates = Vec::with_capacity(2);
        publisher.pull_staged_updates(&mut updates);
        assert_eq!(updates, vec![StagedUpdate { index: 1, value: 3.0 }]);
    }

    #[test]
    fn test_install_replaces_channel_set() {
        let bridge = ChannelBridge::new();
        bridge.install(layout(&["old1", "old2"]));
        bridge.install(layout(&["new"]));
        assert_eq!(bridge.channel_names(), vec!["new"]);
        assert!(!bridge.contains("old1"));
    }

    #[test]
    fn test_current_values_prefers_staged() {
        let bridge = ChannelBridge::new();
        let mut publisher = bridge.install(layout(&["a", "b"]));
        publisher.publish_outputs(&[1.0, 2.0]);
        bridge.set_channel("b", 5.0).unwrap();
        assert_eq!(
            bridge.current_values(),
            vec![("a".to_string(), 1.0), ("b".to_string(), 5.0)]
        );
    }

    #[test]
    fn test_array_channel() {
        let bridge = ChannelBridge::new();
        let mut publisher = bridge.install(ChannelLayout::new(
            vec![("scope".to_string(), ChannelRate::Audio, ChannelDirection::Output, 0.0)],
            3,
        ));
        publisher.publish_outputs(&[0.1, 0.2, 0.3]);
        assert_eq!(bridge.get_channel_array("scope").unwrap(), vec![0.1, 0.2, 0.3]);
        assert_eq!(
            bridge.get_channel("scope"),
            Err(ChannelError::NotControl("scope".to_string()))
        );
    }
}
