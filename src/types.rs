//! Type descriptors and the introspection side table for structured types.
//!
//! Basic types are a closed enum. Structured types live in a [`TypeRegistry`]
//! that is built once, during configuration, and passed by reference to the
//! definitions, the channel registry and the brokers.

#![forbid(unsafe_code)]

use crate::config::StructuredData;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ops::Index;

/// Maximum number of dimensions a signal may have.
pub const MAX_DIMENSIONS: usize = 3;

/// Largest storage a single signal or structured type may need.
pub const MAX_SIGNAL_BYTES: usize = 1 << 26;

/// Primitive element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Signed 64-bit integer.
    Int64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// One-byte boolean.
    Bool,
}

impl BasicType {
    /// Look a basic type up by its configuration name (`uint32`, `float64`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "uint8" => BasicType::UInt8,
            "int8" => BasicType::Int8,
            "uint16" => BasicType::UInt16,
            "int16" => BasicType::Int16,
            "uint32" => BasicType::UInt32,
            "int32" => BasicType::Int32,
            "uint64" => BasicType::UInt64,
            "int64" => BasicType::Int64,
            "float32" => BasicType::Float32,
            "float64" => BasicType::Float64,
            "bool" => BasicType::Bool,
            _ => return None,
        })
    }

    /// Configuration name of the type.
    pub fn name(&self) -> &'static str {
        match self {
            BasicType::UInt8 => "uint8",
            BasicType::Int8 => "int8",
            BasicType::UInt16 => "uint16",
            BasicType::Int16 => "int16",
            BasicType::UInt32 => "uint32",
            BasicType::Int32 => "int32",
            BasicType::UInt64 => "uint64",
            BasicType::Int64 => "int64",
            BasicType::Float32 => "float32",
            BasicType::Float64 => "float64",
            BasicType::Bool => "bool",
        }
    }

    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            BasicType::UInt8 | BasicType::Int8 | BasicType::Bool => 1,
            BasicType::UInt16 | BasicType::Int16 => 2,
            BasicType::UInt32 | BasicType::Int32 | BasicType::Float32 => 4,
            BasicType::UInt64 | BasicType::Int64 | BasicType::Float64 => 8,
        }
    }

    /// Natural alignment, equal to the size for every primitive.
    pub fn align(&self) -> usize {
        self.size()
    }
}

/// Index of a structured type inside a [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructuredId(pub usize);

/// Element kind of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// A primitive element.
    Basic(BasicType),
    /// A registered structured type.
    Structured(StructuredId),
}

/// Resolved type of a signal: element kind, element size and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Element kind.
    pub kind: TypeKind,
    /// Size of one element in bytes.
    pub element_size: usize,
    /// Extent of each dimension; empty for scalars.
    pub shape: Vec<usize>,
}

impl TypeDescriptor {
    /// Descriptor of a basic type with the given shape.
    pub fn basic(basic: BasicType, shape: Vec<usize>) -> Self {
        Self {
            kind: TypeKind::Basic(basic),
            element_size: basic.size(),
            shape,
        }
    }

    /// Number of elements (product of the extents, 1 for scalars).
    pub fn number_of_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    pub fn number_of_dimensions(&self) -> usize {
        self.shape.len()
    }

    /// Total storage in bytes.
    pub fn byte_size(&self) -> usize {
        self.element_size * self.number_of_elements()
    }
}

/// One member of a structured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectionEntry {
    /// Member name.
    pub member_name: String,
    /// Element type name of the member, without modifiers.
    pub member_type_name: String,
    /// Offset of the member inside the structure.
    pub byte_offset: usize,
    /// Size of the member including all its elements.
    pub byte_size: usize,
    /// Shape of the member.
    pub shape: Vec<usize>,
}

impl IntrospectionEntry {
    /// Number of dimensions of the member.
    pub fn number_of_dimensions(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements of the member.
    pub fn number_of_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Introspection data of a structured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredType {
    /// Registered name.
    pub name: String,
    members: Vec<IntrospectionEntry>,
    size: usize,
    align: usize,
}

impl StructuredType {
    /// Number of members.
    pub fn number_of_members(&self) -> usize {
        self.members.len()
    }

    /// Members in declaration order.
    pub fn members(&self) -> &[IntrospectionEntry] {
        &self.members
    }

    /// Find a member by name.
    pub fn member(&self, name: &str) -> Option<&IntrospectionEntry> {
        self.members.iter().find(|m| m.member_name == name)
    }

    /// Size of the whole structure, padded to its alignment.
    pub fn class_size(&self) -> usize {
        self.size
    }
}

impl Index<usize> for StructuredType {
    type Output = IntrospectionEntry;

    fn index(&self, i: usize) -> &IntrospectionEntry {
        &self.members[i]
    }
}

/// Registry of structured types, built during configuration.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Vec<StructuredType>,
    by_name: HashMap<String, StructuredId>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a structured type from `(member name, member type)` pairs.
    ///
    /// Member types are basic or already registered type names, optionally with
    /// modifiers (`uint32[2]`). Offsets follow C layout rules.
    pub fn register(&mut self, name: &str, members: &[(&str, &str)]) -> Result<StructuredId> {
        if name.is_empty() || BasicType::from_name(name).is_some() {
            return Err(Error::parameters(format!("invalid structured type name '{name}'")));
        }
        if self.by_name.contains_key(name) {
            return Err(Error::parameters(format!("type {name} is already registered")));
        }
        if members.is_empty() {
            return Err(Error::parameters(format!("type {name} has no members")));
        }

        let mut entries = Vec::with_capacity(members.len());
        let mut offset = 0usize;
        let mut max_align = 1usize;
        for (member_name, member_type) in members {
            if entries
                .iter()
                .any(|e: &IntrospectionEntry| e.member_name == *member_name)
            {
                return Err(Error::parameters(format!(
                    "duplicated member {member_name} in type {name}"
                )));
            }
            let (base, shape) = split_type_modifiers(member_type)?;
            let (element_size, align) = match BasicType::from_name(base) {
                Some(basic) => (basic.size(), basic.align()),
                None => {
                    if !shape.is_empty() {
                        return Err(Error::parameters(format!(
                            "unsupported multi-dimensional structured member {member_name} in {name}"
                        )));
                    }
                    let nested = self.structured(base).ok_or_else(|| {
                        Error::parameters(format!(
                            "member {member_name} of {name} has unknown type {base}"
                        ))
                    })?;
                    (nested.size, nested.align)
                }
            };
            max_align = max_align.max(align);
            let too_large =
                || Error::parameters(format!("type {name} exceeds {MAX_SIGNAL_BYTES} bytes"));
            let byte_size = storage_size(element_size, &shape).ok_or_else(too_large)?;
            let start = align_up(offset, align);
            offset = start
                .checked_add(byte_size)
                .filter(|end| *end <= MAX_SIGNAL_BYTES)
                .ok_or_else(too_large)?;
            entries.push(IntrospectionEntry {
                member_name: member_name.to_string(),
                member_type_name: base.to_string(),
                byte_offset: start,
                byte_size,
                shape,
            });
        }

        let id = StructuredId(self.types.len());
        self.types.push(StructuredType {
            name: name.to_string(),
            members: entries,
            size: align_up(offset, max_align),
            align: max_align,
        });
        self.by_name.insert(name.to_string(), id);
        tracing::debug!(type_name = name, "registered structured type");
        Ok(id)
    }

    /// Register every structured type of a `[Types]` configuration table.
    ///
    /// Each child table is one type; its values are `member = "type"` pairs, in
    /// document order. Types may reference types declared before them.
    pub fn initialise(&mut self, data: &dyn StructuredData) -> Result<()> {
        for type_name in data.child_names() {
            let table = data
                .child(&type_name)
                .ok_or_else(|| Error::parameters(format!("type {type_name} vanished")))?;
            let mut members = Vec::new();
            for member in table.value_names() {
                let member_type = table.read(&member).ok_or_else(|| {
                    Error::parameters(format!("member {member} of {type_name} has no type"))
                })?;
                members.push((member, member_type));
            }
            let borrowed: Vec<(&str, &str)> = members
                .iter()
                .map(|(m, t)| (m.as_str(), t.as_str()))
                .collect();
            self.register(&type_name, &borrowed)?;
        }
        Ok(())
    }

    /// Introspection of a structured type by name.
    pub fn structured(&self, name: &str) -> Option<&StructuredType> {
        self.by_name.get(name).map(|id| &self.types[id.0])
    }

    /// Introspection of a structured type by id.
    pub fn get(&self, id: StructuredId) -> Option<&StructuredType> {
        self.types.get(id.0)
    }

    /// True when `name` is a basic or a registered structured type.
    pub fn is_known(&self, name: &str) -> bool {
        BasicType::from_name(name).is_some() || self.by_name.contains_key(name)
    }

    /// Resolve a type name plus shape into a descriptor.
    pub fn resolve(&self, type_name: &str, shape: &[usize]) -> Result<TypeDescriptor> {
        if let Some(basic) = BasicType::from_name(type_name) {
            if storage_size(basic.size(), shape).is_none() {
                return Err(Error::parameters(format!(
                    "{type_name}{} exceeds {MAX_SIGNAL_BYTES} bytes",
                    format_modifiers(shape)
                )));
            }
            return Ok(TypeDescriptor::basic(basic, shape.to_vec()));
        }
        let id = self
            .by_name
            .get(type_name)
            .ok_or_else(|| Error::parameters(format!("type {type_name} is not registered")))?;
        if !shape.is_empty() {
            return Err(Error::parameters(format!(
                "unsupported multi-dimensional structured type {type_name}"
            )));
        }
        Ok(TypeDescriptor {
            kind: TypeKind::Structured(*id),
            element_size: self.types[id.0].size,
            shape: Vec::new(),
        })
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Bytes needed by `shape` elements of `element_size`, if within [`MAX_SIGNAL_BYTES`].
fn storage_size(element_size: usize, shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(element_size, |acc, extent| acc.checked_mul(*extent))
        .filter(|size| *size <= MAX_SIGNAL_BYTES)
}

/// Parse a modifiers string such as `[3][2]` into a shape.
pub fn parse_modifiers(modifiers: &str) -> Result<Vec<usize>> {
    let mut shape = Vec::new();
    let mut rest = modifiers.trim();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .and_then(|r| r.split_once(']'))
            .ok_or_else(|| Error::parameters(format!("malformed modifiers '{modifiers}'")))?;
        let extent: usize = inner.0.trim().parse().map_err(|_| {
            Error::parameters(format!("invalid extent '{}' in '{modifiers}'", inner.0))
        })?;
        if extent == 0 {
            return Err(Error::parameters(format!("zero extent in '{modifiers}'")));
        }
        shape.push(extent);
        rest = inner.1.trim_start();
    }
    if shape.len() > MAX_DIMENSIONS {
        return Err(Error::parameters(format!(
            "too many dimensions in '{modifiers}' (max {MAX_DIMENSIONS})"
        )));
    }
    if storage_size(1, &shape).is_none() {
        return Err(Error::parameters(format!("'{modifiers}' has too many elements")));
    }
    Ok(shape)
}

/// Render a shape back into modifiers syntax.
pub fn format_modifiers(shape: &[usize]) -> String {
    shape.iter().map(|n| format!("[{n}]")).collect()
}

/// Split `uint32[2]` into `("uint32", [2])`.
fn split_type_modifiers(spec: &str) -> Result<(&str, Vec<usize>)> {
    let spec = spec.trim();
    match spec.find('[') {
        Some(pos) => Ok((&spec[..pos], parse_modifiers(&spec[pos..])?)),
        None => Ok((spec, Vec::new())),
    }
}
