//! Reader and Writer brokers: the copy engines between channels and GAM memory.
//!
//! A broker binds GAM variables to channels during setup, then each cycle
//! copies every bound leaf between the selected channel buffer and the
//! variable's memory. Memory is either owned (one contiguous block allocated
//! by [`Broker::finalise`]) or static (a caller-provided block and offset).
//!
//! `read` and `write` neither allocate nor lock.

#![forbid(unsafe_code)]

use crate::channel::DataChannel;
use crate::definition::DataDefinition;
use crate::error::{Error, Result};
use crate::invariant_ppt::{assert_invariant, BROKER_BINDS_ALLOCATED, BROKER_FINALISED};
use crate::memory::{ByteBlock, SignalView};
use crate::registry::ChannelTable;
use crate::types::{TypeDescriptor, TypeKind, TypeRegistry};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Caller-provided memory for one variable.
#[derive(Debug, Clone)]
pub struct StaticMemory {
    /// Block holding the variable.
    pub block: Arc<ByteBlock>,
    /// Byte offset of the variable inside `block`.
    pub offset: usize,
}

impl StaticMemory {
    /// Memory at `offset` in `block`.
    pub fn new(block: Arc<ByteBlock>, offset: usize) -> Self {
        Self { block, offset }
    }
}

/// Marker for brokers copying channel to memory.
#[derive(Debug)]
pub enum Reads {}

/// Marker for brokers copying memory to channel.
#[derive(Debug)]
pub enum Writes {}

/// Broker copying channel contents into GAM memory.
pub type ReaderBroker = Broker<Reads>;

/// Broker copying GAM memory into channels.
pub type WriterBroker = Broker<Writes>;

#[derive(Debug)]
enum Placement {
    Owned(usize),
    Static(StaticMemory),
}

#[derive(Debug)]
struct Variable {
    name: String,
    size: usize,
    placement: Placement,
}

#[derive(Debug)]
struct BindRecord {
    channel: Arc<DataChannel>,
    variable: usize,
    offset: usize,
    size: usize,
}

/// A resolved bind record: everything one copy needs.
#[derive(Debug)]
struct Binding {
    channel: Arc<DataChannel>,
    block: Arc<ByteBlock>,
    offset: usize,
    size: usize,
}

/// Common core of [`ReaderBroker`] and [`WriterBroker`].
#[derive(Debug)]
pub struct Broker<D> {
    table: Option<Arc<ChannelTable>>,
    variables: Vec<Variable>,
    records: Vec<BindRecord>,
    owned_size: usize,
    owned: Option<Arc<ByteBlock>>,
    bindings: Vec<Binding>,
    // Start of each variable, resolved at finalise.
    locations: Vec<(Arc<ByteBlock>, usize)>,
    finalised: bool,
    _direction: PhantomData<D>,
}

impl<D> Default for Broker<D> {
    fn default() -> Self {
        Self {
            table: None,
            variables: Vec::new(),
            records: Vec::new(),
            owned_size: 0,
            owned: None,
            bindings: Vec::new(),
            locations: Vec::new(),
            finalised: false,
            _direction: PhantomData,
        }
    }
}

impl<D> Broker<D> {
    /// Broker with no registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker bound to `table`.
    pub fn with_registry(table: Arc<ChannelTable>) -> Self {
        let mut broker = Self::new();
        broker.set_registry(table);
        broker
    }

    /// Set the allocated channel table variables are resolved against.
    pub fn set_registry(&mut self, table: Arc<ChannelTable>) {
        self.table = Some(table);
    }

    /// Bind one GAM variable.
    ///
    /// Structured definitions with members bind one record per leaf, in the
    /// member order of the type's introspection, at each member's offset.
    /// With `memory` set the variable lives in the caller's block.
    pub fn add_variable(
        &mut self,
        definition: &DataDefinition,
        memory: Option<StaticMemory>,
    ) -> Result<()> {
        if self.finalised {
            return Err(Error::fatal(format!(
                "cannot add {}: broker already finalised",
                definition.name
            )));
        }
        let table = self
            .table
            .clone()
            .ok_or_else(|| Error::parameters("broker has no registry"))?;
        if !definition.is_final {
            return Err(Error::parameters(format!(
                "definition {} is not final",
                definition.name
            )));
        }
        let types = table.types();
        definition.verify(types)?;
        let descriptor = definition.descriptor(types)?;
        let path = definition.effective_path(None).ok_or_else(|| {
            Error::parameters(format!("definition {} has no Path", definition.name))
        })?;
        let size = descriptor.byte_size();

        let placement = match memory {
            Some(memory) => {
                let end = memory.offset.checked_add(size);
                if end.map_or(true, |end| end > memory.block.len()) {
                    return Err(Error::parameters(format!(
                        "static memory of {} bytes cannot hold {} ({size} bytes at offset {})",
                        memory.block.len(),
                        definition.name,
                        memory.offset
                    )));
                }
                Placement::Static(memory)
            }
            None => Placement::Owned(self.owned_size),
        };

        let variable = self.variables.len();
        let mut records = Vec::new();
        bind(&table, types, definition, &path, &descriptor, variable, 0, &mut records)?;
        assert_invariant(
            BROKER_BINDS_ALLOCATED,
            records.iter().all(|r| r.offset + r.size <= size),
            "leaves fit in their variable",
            Some(&path),
        );

        if matches!(placement, Placement::Owned(_)) {
            self.owned_size += size;
        }
        debug!(variable = %definition.name, %path, leaves = records.len(), size, "variable bound");
        self.variables.push(Variable {
            name: definition.name.clone(),
            size,
            placement,
        });
        self.records.extend(records);
        Ok(())
    }

    /// Allocate owned memory and resolve every bind record.
    pub fn finalise(&mut self) -> Result<()> {
        if self.finalised {
            return Ok(());
        }
        let owned = Arc::new(ByteBlock::new(self.owned_size));
        self.locations = self
            .variables
            .iter()
            .map(|v| match &v.placement {
                Placement::Owned(offset) => (Arc::clone(&owned), *offset),
                Placement::Static(memory) => (Arc::clone(&memory.block), memory.offset),
            })
            .collect();
        self.bindings = self
            .records
            .iter()
            .map(|r| {
                let (block, base) = &self.locations[r.variable];
                Binding {
                    channel: Arc::clone(&r.channel),
                    block: Arc::clone(block),
                    offset: base + r.offset,
                    size: r.size,
                }
            })
            .collect();
        self.owned = Some(owned);
        self.finalised = true;
        assert_invariant(
            BROKER_FINALISED,
            self.bindings.len() == self.records.len(),
            "every bind record resolved to memory",
            None,
        );
        debug!(
            variables = self.variables.len(),
            leaves = self.bindings.len(),
            owned_bytes = self.owned_size,
            "broker finalised"
        );
        Ok(())
    }

    /// True once [`Self::finalise`] succeeded.
    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    /// Number of bound variables.
    pub fn number_of_variables(&self) -> usize {
        self.variables.len()
    }

    /// Number of bound leaves.
    pub fn number_of_leaves(&self) -> usize {
        self.records.len()
    }

    /// Bytes of owned memory.
    pub fn total_size(&self) -> usize {
        self.owned_size
    }

    /// Name of variable `n`.
    pub fn variable_name(&self, n: usize) -> Option<&str> {
        self.variables.get(n).map(|v| v.name.as_str())
    }

    /// Memory of variable `n`, available after finalise.
    pub fn data(&self, n: usize) -> Option<SignalView<'_>> {
        let (block, offset) = self.locations.get(n)?;
        block.view(*offset, self.variables[n].size)
    }

    /// Memory of bound leaf `n`, available after finalise.
    pub fn memory(&self, n: usize) -> Option<SignalView<'_>> {
        let binding = self.bindings.get(n)?;
        binding.block.view(binding.offset, binding.size)
    }

    /// Channel of bound leaf `n`.
    pub fn channel(&self, n: usize) -> Option<&Arc<DataChannel>> {
        self.records.get(n).map(|r| &r.channel)
    }

    fn ensure_finalised(&self) -> Result<()> {
        if self.finalised {
            Ok(())
        } else {
            Err(Error::fatal("broker used before finalise"))
        }
    }
}

impl Broker<Reads> {
    /// Copy every bound leaf from channel buffer `buffer % 2` into memory.
    #[inline]
    pub fn read(&self, buffer: usize) -> Result<()> {
        self.ensure_finalised()?;
        for b in &self.bindings {
            b.block.copy_from(b.offset, b.channel.buffer(buffer), 0, b.size);
        }
        Ok(())
    }
}

impl Broker<Writes> {
    /// Copy every bound leaf from memory into channel buffer `buffer % 2`.
    #[inline]
    pub fn write(&self, buffer: usize) -> Result<()> {
        self.ensure_finalised()?;
        for b in &self.bindings {
            b.channel.buffer(buffer).copy_from(0, &b.block, b.offset, b.size);
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn bind(
    table: &ChannelTable,
    types: &TypeRegistry,
    definition: &DataDefinition,
    path: &str,
    descriptor: &TypeDescriptor,
    variable: usize,
    offset: usize,
    out: &mut Vec<BindRecord>,
) -> Result<()> {
    if definition.is_leaf() {
        let channel = table
            .find(path)
            .ok_or_else(|| Error::parameters(format!("no channel at {path}")))?;
        if channel.descriptor() != descriptor || channel.byte_size() != descriptor.byte_size() {
            return Err(Error::parameters(format!(
                "{} ({} bytes) does not match channel {path} ({} bytes of {})",
                definition.name,
                descriptor.byte_size(),
                channel.byte_size(),
                channel.type_name()
            )));
        }
        out.push(BindRecord {
            channel: Arc::clone(channel),
            variable,
            offset,
            size: descriptor.byte_size(),
        });
        return Ok(());
    }

    let TypeKind::Structured(id) = descriptor.kind else {
        return Err(Error::parameters(format!(
            "basic definition {} cannot have members",
            definition.name
        )));
    };
    let structured = types.get(id).ok_or_else(|| {
        Error::parameters(format!("no introspection for {}", definition.type_name))
    })?;
    for entry in structured.members() {
        let member = definition.child(&entry.member_name).ok_or_else(|| {
            Error::parameters(format!(
                "member {} missing from {}",
                entry.member_name, definition.name
            ))
        })?;
        let member_descriptor = types.resolve(&entry.member_type_name, &entry.shape)?;
        let member_path = member
            .effective_path(Some(path))
            .ok_or_else(|| Error::parameters(format!("member {} has no path", member.name)))?;
        bind(
            table,
            types,
            member,
            &member_path,
            &member_descriptor,
            variable,
            offset + entry.byte_offset,
            out,
        )?;
    }
    Ok(())
}
