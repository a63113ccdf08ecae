//! The data channel registry: groups of channels built from GAM definitions.
//!
//! Mutation is staged. Every [`DataChannelRegistry::add_data_definition`] is
//! applied to a working copy and kept only if the whole GAM was accepted;
//! [`DataChannelRegistry::verify`] commits the staged channels or discards
//! them. [`DataChannelRegistry::allocate`] freezes the committed set into a
//! [`ChannelTable`] that brokers bind to.

use crate::channel::{ChannelSpec, DataChannel, NUMBER_OF_BUFFERS};
use crate::error::{Error, Result};
use crate::gam::{Direction, GamDefinitions};
use crate::invariant_ppt::{
    assert_invariant, DEFAULTS_SEEDED, NEXT_BUFFER_SEEDED, PRODUCER_CARDINALITY,
    REGISTRY_REJECTS_INVALID,
};
use crate::types::{BasicType, TypeDescriptor, TypeRegistry};
use crate::value::encode_default;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Group holding the per-GAM execution time channels.
pub const TIMING_GROUP: &str = "GAM_Times";

/// Path of the absolute execution time channel of `gam`.
pub fn absolute_time_path(gam: &str) -> String {
    format!("{TIMING_GROUP}.{gam}.AbsoluteUsecTime")
}

/// Path of the relative execution time channel of `gam`.
pub fn relative_time_path(gam: &str) -> String {
    format!("{TIMING_GROUP}.{gam}.RelativeUsecTime")
}

/// Parameters of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInfo {
    /// State being left; empty when no state is running.
    pub current_state: String,
    /// State being prepared.
    pub next_state: String,
    /// Buffer the running state reads and writes.
    pub active_buffer: usize,
}

impl StateInfo {
    /// Buffer the next state will use.
    pub fn next_buffer(&self) -> usize {
        (self.active_buffer + 1) % NUMBER_OF_BUFFERS
    }
}

/// The frozen, allocated channel set.
#[derive(Debug)]
pub struct ChannelTable {
    types: Arc<TypeRegistry>,
    groups: BTreeMap<String, Vec<String>>,
    channels: BTreeMap<String, Arc<DataChannel>>,
}

impl ChannelTable {
    /// Channel at `path`, when its group is owned by the table.
    pub fn find(&self, path: &str) -> Option<&Arc<DataChannel>> {
        let (group, _) = path.split_once('.')?;
        if !self.groups.contains_key(group) {
            return None;
        }
        self.channels.get(path)
    }

    /// Introspection used to build the channels.
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Paths of the channels of `group`.
    pub fn group(&self, group: &str) -> Option<&[String]> {
        self.groups.get(group).map(Vec::as_slice)
    }

    /// Every channel, ordered by path.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<DataChannel>> {
        self.channels.values()
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channel was declared.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelSet {
    groups: BTreeSet<String>,
    channels: BTreeMap<String, ChannelSpec>,
}

/// Owner of every data channel.
#[derive(Debug)]
pub struct DataChannelRegistry {
    types: Arc<TypeRegistry>,
    is_final: bool,
    committed: ChannelSet,
    staged: Option<ChannelSet>,
    verified: bool,
    table: Option<Arc<ChannelTable>>,
}

impl DataChannelRegistry {
    /// Empty registry using `types` for every signal.
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            types,
            is_final: false,
            committed: ChannelSet::default(),
            staged: None,
            verified: false,
            table: None,
        }
    }

    /// Pre-declare groups.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for group in groups {
            self.committed.groups.insert(group.into());
        }
        self
    }

    /// Pre-declare one group.
    pub fn declare_group(&mut self, group: impl Into<String>) {
        self.committed.groups.insert(group.into());
    }

    /// A final registry never creates groups besides the timing group.
    pub fn set_final(&mut self, is_final: bool) {
        self.is_final = is_final;
    }

    /// See [`Self::set_final`].
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Introspection shared with the brokers.
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    fn view(&self) -> &ChannelSet {
        self.staged.as_ref().unwrap_or(&self.committed)
    }

    /// Channel description at `path`, staged changes included.
    pub fn channel_spec(&self, path: &str) -> Option<&ChannelSpec> {
        self.view().channels.get(path)
    }

    /// Group names, staged changes included.
    pub fn group_names(&self) -> Vec<String> {
        self.view().groups.iter().cloned().collect()
    }

    /// Paths of the channels of `group`, staged changes included.
    pub fn group(&self, group: &str) -> Option<Vec<String>> {
        let view = self.view();
        view.groups.contains(group).then(|| {
            let prefix = format!("{group}.");
            view.channels
                .keys()
                .filter(|p| p.starts_with(&prefix))
                .cloned()
                .collect()
        })
    }

    /// True when changes are waiting for [`Self::verify`].
    pub fn has_staged_changes(&self) -> bool {
        self.staged.is_some()
    }

    /// Register the signals of one GAM.
    ///
    /// Every leaf of the GAM's Input and Output containers resolves to a
    /// channel, created on first use. Output leaves count as producers and
    /// Input leaves as consumers in every state the GAM supports. The two
    /// execution time channels of the GAM are added to the timing group.
    pub fn add_data_definition(&mut self, gam: &GamDefinitions) -> Result<()> {
        if self.table.is_some() {
            return Err(Error::fatal(format!(
                "cannot add GAM {}: the registry is already allocated",
                gam.name
            )));
        }
        if gam.name.is_empty() || gam.name.contains('.') {
            return Err(Error::parameters(format!("invalid GAM name '{}'", gam.name)));
        }
        if gam.states.is_empty() {
            return Err(Error::parameters(format!("GAM {} supports no state", gam.name)));
        }

        let mut working = self.view().clone();
        for container in &gam.containers {
            if container.name.is_empty() {
                return Err(Error::parameters(format!(
                    "GAM {} has an unnamed definition container",
                    gam.name
                )));
            }
            for definition in &container.definitions {
                if !definition.is_final {
                    return Err(Error::parameters(format!(
                        "definition {} of GAM {} is not final",
                        definition.name, gam.name
                    )));
                }
                definition.verify(&self.types)?;
                for (path, leaf) in definition.leaves()? {
                    let descriptor = leaf.descriptor(&self.types)?;
                    let default_bytes =
                        encode_default(&descriptor, &leaf.default_value, &self.types)?;
                    let channel = self.resolve(
                        &mut working,
                        &path,
                        &leaf.type_name,
                        descriptor,
                        &leaf.default_value,
                        default_bytes,
                        false,
                    )?;
                    let counts = match container.direction {
                        Direction::Output => &mut channel.producers,
                        Direction::Input => &mut channel.consumers,
                    };
                    for state in &gam.states {
                        *counts.entry(state.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        let zero = 0u64.to_ne_bytes().to_vec();
        for path in [absolute_time_path(&gam.name), relative_time_path(&gam.name)] {
            self.resolve(
                &mut working,
                &path,
                "uint64",
                TypeDescriptor::basic(BasicType::UInt64, vec![]),
                "0",
                zero.clone(),
                true,
            )?;
        }

        debug!(gam = %gam.name, channels = working.channels.len(), "staged GAM definitions");
        self.staged = Some(working);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve<'a>(
        &self,
        set: &'a mut ChannelSet,
        path: &str,
        type_name: &str,
        descriptor: TypeDescriptor,
        default_value: &str,
        default_bytes: Vec<u8>,
        timing: bool,
    ) -> Result<&'a mut ChannelSpec> {
        let (group, rest) = path
            .split_once('.')
            .filter(|(g, r)| !g.is_empty() && !r.is_empty())
            .ok_or_else(|| Error::parameters(format!("path '{path}' is not <group>.<signal>")))?;
        if !set.groups.contains(group) {
            if self.is_final && group != TIMING_GROUP {
                return Err(Error::parameters(format!(
                    "group {group} of {path} does not exist and the registry is final"
                )));
            }
            debug!(group, "creating data group");
            set.groups.insert(group.to_string());
        }
        // A prefix of an existing path cannot also be a leaf.
        let nested = format!("{path}.");
        if set.channels.keys().any(|p| p.starts_with(&nested))
            || parents(rest).any(|parent| set.channels.contains_key(&format!("{group}.{parent}")))
        {
            return Err(Error::parameters(format!(
                "path {path} overlaps another signal's path"
            )));
        }

        let spec = set
            .channels
            .entry(path.to_string())
            .or_insert_with(|| ChannelSpec {
                path: path.to_string(),
                type_name: type_name.to_string(),
                descriptor: descriptor.clone(),
                default_value: default_value.to_string(),
                default_bytes: default_bytes.clone(),
                producers: BTreeMap::new(),
                consumers: BTreeMap::new(),
                timing,
            });
        if spec.type_name != type_name || spec.descriptor != descriptor {
            return Err(Error::parameters(format!(
                "channel {path} is {} with shape {:?}, redeclared as {type_name} with shape {:?}",
                spec.type_name, spec.descriptor.shape, descriptor.shape
            )));
        }
        if !default_value.is_empty() && spec.default_bytes != default_bytes {
            if !spec.default_value.is_empty() {
                warn!(
                    path,
                    old = %spec.default_value,
                    new = default_value,
                    "default value redeclared, the new one is kept"
                );
            }
            spec.default_value = default_value.to_string();
            spec.default_bytes = default_bytes;
        }
        Ok(spec)
    }

    /// Check the producer cardinality of every channel in every state.
    ///
    /// Channels consumed without a producer or a default only raise a warning.
    ///
    /// On success the staged changes are committed; on failure they are
    /// discarded and the registry keeps its last committed content.
    pub fn verify(&mut self) -> Result<()> {
        let result = check(self.view());
        match &result {
            Ok(()) => {
                if let Some(staged) = self.staged.take() {
                    self.committed = staged;
                }
                self.verified = true;
                info!(channels = self.committed.channels.len(), "registry verified");
            }
            Err(err) => {
                warn!(%err, "registry verification failed, staged changes discarded");
                self.staged = None;
                assert_invariant(
                    REGISTRY_REJECTS_INVALID,
                    single_producers(&self.committed),
                    "the content kept after a rejection is valid",
                    Some("verify"),
                );
            }
        }
        result
    }

    /// Allocate and seed the buffers of every committed channel.
    ///
    /// Requires a successful [`Self::verify`] with nothing staged since.
    /// Calling it again returns the existing table.
    pub fn allocate(&mut self) -> Result<Arc<ChannelTable>> {
        if let Some(table) = &self.table {
            return Ok(Arc::clone(table));
        }
        if !self.verified || self.staged.is_some() {
            return Err(Error::fatal("allocate called before a successful verify"));
        }
        let mut groups: BTreeMap<String, Vec<String>> = self
            .committed
            .groups
            .iter()
            .map(|g| (g.clone(), Vec::new()))
            .collect();
        assert_invariant(
            PRODUCER_CARDINALITY,
            single_producers(&self.committed),
            "at most one producer per channel and state",
            Some("allocate"),
        );
        let mut channels = BTreeMap::new();
        for (path, spec) in &self.committed.channels {
            let channel = DataChannel::allocate(spec);
            assert_invariant(
                DEFAULTS_SEEDED,
                channel.buffer(0).to_vec() == spec.default_bytes
                    && channel.buffer(1).to_vec() == spec.default_bytes,
                "both buffers start with the default",
                Some(path),
            );
            if let Some((group, _)) = path.split_once('.') {
                groups.entry(group.to_string()).or_default().push(path.clone());
            }
            channels.insert(path.clone(), Arc::new(channel));
        }
        let table = Arc::new(ChannelTable {
            types: Arc::clone(&self.types),
            groups,
            channels,
        });
        info!(channels = table.len(), "registry allocated");
        self.table = Some(Arc::clone(&table));
        Ok(table)
    }

    /// The allocated table, if [`Self::allocate`] succeeded.
    pub fn table(&self) -> Option<&Arc<ChannelTable>> {
        self.table.as_ref()
    }

    /// Allocated channel at `path`.
    pub fn find(&self, path: &str) -> Option<&Arc<DataChannel>> {
        self.table.as_ref()?.find(path)
    }

    /// Seed the next buffer for `info.next_state`.
    ///
    /// Channels of the next state that have no producer there, or that were
    /// not used by the current state, get their default. Channels used by
    /// both states and produced in the next one keep their current value.
    /// Timing channels restart from zero.
    pub fn prepare_next_state(&self, info: &StateInfo) -> Result<()> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| Error::fatal("prepare_next_state called before allocate"))?;
        let active = info.active_buffer % NUMBER_OF_BUFFERS;
        let next = info.next_buffer();
        let mut seeded = 0usize;
        let mut defaults_hold = true;
        for channel in table.channels() {
            let reseed = channel.is_timing()
                || (channel.is_referenced_in(&info.next_state)
                    && !(is_live(channel, info) && channel.producers_in(&info.next_state) > 0));
            if reseed {
                channel.reset_to_default(next);
                defaults_hold &= channel.buffer(next).to_vec() == channel.default_bytes();
                seeded += 1;
            } else if channel.is_referenced_in(&info.next_state) {
                channel.carry_over(active, next);
            }
        }
        assert_invariant(
            NEXT_BUFFER_SEEDED,
            defaults_hold,
            "reseeded channels hold their default in the next buffer",
            Some(&info.next_state),
        );
        debug!(
            current = %info.current_state,
            next = %info.next_state,
            buffer = next,
            seeded,
            "next buffer prepared"
        );
        Ok(())
    }
}

/// Referenced by the state being left.
fn is_live(channel: &DataChannel, info: &StateInfo) -> bool {
    !info.current_state.is_empty() && channel.is_referenced_in(&info.current_state)
}

fn single_producers(set: &ChannelSet) -> bool {
    set.channels
        .values()
        .all(|c| c.producers.values().all(|n| *n <= 1))
}

fn parents(rest: &str) -> impl Iterator<Item = &str> {
    rest.match_indices('.').map(move |(i, _)| &rest[..i])
}

fn check(set: &ChannelSet) -> Result<()> {
    for spec in set.channels.values() {
        for (state, producers) in &spec.producers {
            if *producers > 1 {
                return Err(Error::parameters(format!(
                    "channel {} has {producers} producers in state {state}",
                    spec.path
                )));
            }
        }
        for state in spec.consumers.keys() {
            if spec.producers_in(state) == 0 && spec.default_value.is_empty() {
                warn!(
                    path = %spec.path,
                    state,
                    "consumed without producer nor default, reads zero"
                );
            }
        }
        if !spec.timing && spec.consumers.is_empty() {
            warn!(path = %spec.path, "channel is never consumed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DataDefinition;
    use crate::error::ErrorKind;

    fn registry() -> DataChannelRegistry {
        DataChannelRegistry::new(Arc::new(TypeRegistry::new()))
    }

    fn producer(name: &str, path: &str) -> GamDefinitions {
        GamDefinitions::new(name, ["state1"])
            .with_output(DataDefinition::leaf("Out", "uint32", path, "1"))
    }

    #[test]
    fn timing_channels_per_gam() {
        let mut reg = registry();
        reg.add_data_definition(&producer("A", "DDB1.X")).unwrap();
        let abs = reg.channel_spec("GAM_Times.A.AbsoluteUsecTime").unwrap();
        assert!(abs.timing);
        assert_eq!(abs.descriptor.byte_size(), 8);
        assert!(reg.channel_spec("GAM_Times.A.RelativeUsecTime").is_some());
        assert!(reg.group_names().contains(&TIMING_GROUP.to_string()));
    }

    #[test]
    fn failing_gam_leaves_nothing_behind() {
        let mut reg = registry();
        let bad = GamDefinitions::new("B", ["state1"])
            .with_output(DataDefinition::leaf("Ok", "uint32", "DDB1.Ok", "0"))
            .with_output(DataDefinition::leaf("Bad", "uint32", "nogroup", "0"));
        assert!(reg.add_data_definition(&bad).is_err());
        assert!(reg.channel_spec("DDB1.Ok").is_none());
        assert!(!reg.has_staged_changes());
    }

    #[test]
    fn verify_failure_rolls_back_to_committed() {
        let mut reg = registry();
        reg.add_data_definition(&producer("A", "DDB1.X")).unwrap();
        reg.verify().unwrap();
        reg.add_data_definition(&producer("B", "DDB1.X")).unwrap();
        assert_eq!(reg.channel_spec("DDB1.X").unwrap().producers_in("state1"), 2);
        assert!(reg.verify().is_err());
        assert_eq!(reg.channel_spec("DDB1.X").unwrap().producers_in("state1"), 1);
        assert!(reg.channel_spec("GAM_Times.B.AbsoluteUsecTime").is_none());
        reg.allocate().unwrap();
    }

    #[test]
    fn oversized_signals_are_rejected() {
        let mut reg = registry();
        let leaf = DataDefinition::leaf("Out", "uint64", "DDB1.Huge", "");
        let huge = GamDefinitions::new("A", ["state1"])
            .with_output(leaf.with_shape(vec![1 << 32, 1 << 32]));
        let err = reg.add_data_definition(&huge).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parameters);
        assert!(reg.channel_spec("DDB1.Huge").is_none());
    }

    #[test]
    fn type_conflicts_are_rejected() {
        let mut reg = registry();
        reg.add_data_definition(&producer("A", "DDB1.X")).unwrap();
        let other = GamDefinitions::new("B", ["state1"])
            .with_input(DataDefinition::leaf("In", "float32", "DDB1.X", "0"));
        assert!(reg.add_data_definition(&other).is_err());
        let overlapping = GamDefinitions::new("C", ["state1"])
            .with_input(DataDefinition::leaf("In", "uint32", "DDB1.X.Y", "0"));
        assert!(reg.add_data_definition(&overlapping).is_err());
    }

    #[test]
    fn consumer_without_default_or_producer_reads_zero() {
        let mut reg = registry();
        let gam = GamDefinitions::new("A", ["state1"])
            .with_input(DataDefinition::leaf("In", "uint32", "DDB1.Lonely", ""));
        reg.add_data_definition(&gam).unwrap();
        reg.verify().unwrap();
        let table = reg.allocate().unwrap();
        assert_eq!(table.find("DDB1.Lonely").unwrap().buffer(0).to_vec(), vec![0; 4]);
    }

    #[test]
    fn allocate_requires_verify_and_is_idempotent() {
        let mut reg = registry();
        reg.add_data_definition(&producer("A", "DDB1.X")).unwrap();
        assert!(reg.allocate().is_err());
        reg.verify().unwrap();
        let first = reg.allocate().unwrap();
        let second = reg.allocate().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(reg.add_data_definition(&producer("B", "DDB1.Y")).is_err());
    }

    #[test]
    fn table_lookup_requires_owned_group() {
        let mut reg = registry();
        reg.add_data_definition(&producer("A", "DDB1.X")).unwrap();
        reg.verify().unwrap();
        let table = reg.allocate().unwrap();
        assert!(table.find("DDB1.X").is_some());
        assert!(table.find("DDB2.X").is_none());
        assert!(table.find("X").is_none());
        assert_eq!(table.group("DDB1").unwrap(), ["DDB1.X".to_string()]);
    }

    #[test]
    fn state_info_next_buffer() {
        let info = StateInfo {
            current_state: String::new(),
            next_state: "s".into(),
            active_buffer: 1,
        };
        assert_eq!(info.next_buffer(), 0);
    }
}
