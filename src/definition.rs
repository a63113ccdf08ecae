//! Signal definitions declared by GAMs.
//!
//! A [`DataDefinition`] names one signal, or a tree of them when its type is a
//! structured type. Drafts (not final) can be completed by merging with
//! another draft; only final definitions are bound to channels.

use crate::config::StructuredData;
use crate::error::{Error, Result};
use crate::invariant_ppt::{assert_invariant, DEFINITION_MERGE_DRAFT_ONLY, DEFINITION_VERIFIED};
use crate::types::{format_modifiers, parse_modifiers, TypeDescriptor, TypeKind, TypeRegistry};

/// One named signal definition, possibly with member definitions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataDefinition {
    /// Name of the definition inside its parent.
    pub name: String,
    /// Basic or registered structured type name.
    pub type_name: String,
    /// Dotted storage path (`DDB1.PidError1`); empty to derive it from the parent.
    pub path: String,
    /// Default value literal.
    pub default_value: String,
    /// Final definitions are complete and may be bound.
    pub is_final: bool,
    /// Extent of each dimension; empty for scalars.
    pub shape: Vec<usize>,
    /// Member definitions of a structured signal.
    pub children: Vec<DataDefinition>,
}

impl DataDefinition {
    /// Empty draft named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Final leaf definition in one call.
    pub fn leaf(
        name: impl Into<String>,
        type_name: impl Into<String>,
        path: impl Into<String>,
        default_value: impl Into<String>,
    ) -> Self {
        Self::new(name)
            .with_type(type_name)
            .with_path(path)
            .with_default(default_value)
            .finalised()
    }

    /// Set the type name.
    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Set the storage path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the default literal.
    pub fn with_default(mut self, default_value: impl Into<String>) -> Self {
        self.default_value = default_value.into();
        self
    }

    /// Set the shape.
    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = shape;
        self
    }

    /// Append a member definition.
    pub fn with_child(mut self, child: DataDefinition) -> Self {
        self.children.push(child);
        self
    }

    /// Mark this definition and every member final.
    pub fn finalised(mut self) -> Self {
        self.mark_final();
        self
    }

    /// Mark this definition and every member final.
    pub fn mark_final(&mut self) {
        self.is_final = true;
        self.children.iter_mut().for_each(DataDefinition::mark_final);
    }

    /// True when the definition has no members.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Build a definition from its configuration node.
    ///
    /// Reads `Type`, `Default`, `Path`, `IsFinal` and `Modifiers`; every child
    /// node is a member definition.
    pub fn initialise(name: &str, data: &dyn StructuredData, types: &TypeRegistry) -> Result<Self> {
        let type_name = data.read("Type").unwrap_or_default();
        if !type_name.is_empty() && !types.is_known(&type_name) {
            return Err(Error::parameters(format!(
                "definition {name}: type {type_name} is neither basic nor registered"
            )));
        }
        let is_final = matches!(data.read("IsFinal").as_deref(), Some("true"));
        if is_final && type_name.is_empty() {
            return Err(Error::parameters(format!(
                "definition {name}: a final definition needs a Type"
            )));
        }
        let shape = match data.read("Modifiers") {
            Some(modifiers) => parse_modifiers(&modifiers)?,
            None => Vec::new(),
        };

        let mut children = Vec::new();
        for child in data.child_names() {
            let node = data
                .child(&child)
                .ok_or_else(|| Error::parameters(format!("member {child} of {name} vanished")))?;
            children.push(DataDefinition::initialise(&child, node, types)?);
        }

        let mut definition = Self {
            name: name.to_string(),
            type_name,
            path: data.read("Path").unwrap_or_default(),
            default_value: data.read("Default").unwrap_or_default(),
            is_final,
            shape,
            children,
        };
        if definition.is_final {
            definition.mark_final();
        }
        Ok(definition)
    }

    /// Check the definition against the introspection of its type.
    pub fn verify(&self, types: &TypeRegistry) -> Result<()> {
        if self.type_name.is_empty() {
            return Err(Error::parameters(format!("definition {}: empty type", self.name)));
        }
        let descriptor = self
            .descriptor(types)
            .map_err(|err| Error::parameters(format!("definition {}: {err}", self.name)))?;
        let structured = match descriptor.kind {
            TypeKind::Basic(_) if !self.children.is_empty() => {
                return Err(Error::parameters(format!(
                    "definition {}: basic type {} cannot have members",
                    self.name, self.type_name
                )));
            }
            TypeKind::Basic(_) => None,
            TypeKind::Structured(id) => types.get(id),
        };
        if let Some(structured) = structured.filter(|_| !self.children.is_empty()) {
            if self.children.len() != structured.number_of_members() {
                return Err(Error::parameters(format!(
                    "definition {} has {} members, type {} has {}",
                    self.name,
                    self.children.len(),
                    self.type_name,
                    structured.number_of_members()
                )));
            }
            for entry in structured.members() {
                let child = self
                    .child(&entry.member_name)
                    .ok_or_else(|| {
                        Error::parameters(format!(
                            "member {} of {} not found in definition {}",
                            entry.member_name, self.type_name, self.name
                        ))
                    })?;
                if child.type_name != entry.member_type_name || child.shape != entry.shape {
                    return Err(Error::parameters(format!(
                        "member {} of {} is {}{}, introspection says {}{}",
                        entry.member_name,
                        self.name,
                        child.type_name,
                        format_modifiers(&child.shape),
                        entry.member_type_name,
                        format_modifiers(&entry.shape)
                    )));
                }
                child.verify(types)?;
            }
        }
        let members_fit = self.children.iter().all(|child| {
            child
                .descriptor(types)
                .is_ok_and(|d| d.byte_size() <= descriptor.byte_size())
        });
        assert_invariant(
            DEFINITION_VERIFIED,
            members_fit,
            "members fit inside the storage of their definition",
            Some(&self.name),
        );
        Ok(())
    }

    /// Complete this draft with another draft of the same signal.
    ///
    /// Empty fields are taken from `local`; members present by name are merged
    /// recursively and missing ones appended. Fails if either side is final.
    pub fn merge_with_local(&mut self, local: &DataDefinition) -> Result<()> {
        if self.is_final || local.is_final {
            return Err(Error::fatal(format!(
                "cannot merge definition {}: a final definition is involved",
                self.name
            )));
        }
        if self.type_name.is_empty() {
            self.type_name = local.type_name.clone();
        }
        if self.path.is_empty() {
            self.path = local.path.clone();
        }
        if self.default_value.is_empty() {
            self.default_value = local.default_value.clone();
        }
        if self.shape.is_empty() {
            self.shape = local.shape.clone();
        }
        for other in &local.children {
            match self.children.iter_mut().find(|c| c.name == other.name) {
                Some(existing) => existing.merge_with_local(other)?,
                None => self.children.push(other.clone()),
            }
        }
        let members_kept = local.children.iter().all(|c| self.child(&c.name).is_some());
        assert_invariant(
            DEFINITION_MERGE_DRAFT_ONLY,
            !self.is_final && members_kept,
            "a merged draft holds every member of both sides",
            Some(&self.name),
        );
        Ok(())
    }

    /// Member definition by name.
    pub fn child(&self, name: &str) -> Option<&DataDefinition> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Storage path, derived from the parent's when not set.
    pub fn effective_path(&self, parent_path: Option<&str>) -> Option<String> {
        if !self.path.is_empty() {
            Some(self.path.clone())
        } else {
            parent_path.map(|p| format!("{p}.{}", self.name))
        }
    }

    /// Every leaf of the tree with its effective storage path.
    pub fn leaves(&self) -> Result<Vec<(String, &DataDefinition)>> {
        let mut out = Vec::new();
        self.collect_leaves(None, &mut out)?;
        Ok(out)
    }

    fn collect_leaves<'a>(
        &'a self,
        parent_path: Option<&str>,
        out: &mut Vec<(String, &'a DataDefinition)>,
    ) -> Result<()> {
        let path = self.effective_path(parent_path).ok_or_else(|| {
            Error::parameters(format!("definition {} has no Path", self.name))
        })?;
        if self.is_leaf() {
            out.push((path, self));
        } else {
            for child in &self.children {
                child.collect_leaves(Some(&path), out)?;
            }
        }
        Ok(())
    }

    /// Descriptor of this definition's storage.
    pub fn descriptor(&self, types: &TypeRegistry) -> Result<TypeDescriptor> {
        types.resolve(&self.type_name, &self.shape)
    }

    /// Write the definition back as a configuration table.
    pub fn to_table(&self) -> toml::Table {
        let mut table = toml::Table::new();
        if !self.type_name.is_empty() {
            table.insert("Type".into(), self.type_name.clone().into());
        }
        if !self.path.is_empty() {
            table.insert("Path".into(), self.path.clone().into());
        }
        if !self.default_value.is_empty() {
            table.insert("Default".into(), self.default_value.clone().into());
        }
        if !self.shape.is_empty() {
            table.insert("Modifiers".into(), format_modifiers(&self.shape).into());
        }
        table.insert("IsFinal".into(), self.is_final.into());
        for child in &self.children {
            table.insert(child.name.clone(), toml::Value::Table(child.to_table()));
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_error_types() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        types
            .register("TrackError", &[("Par1", "uint32"), ("Par2", "uint32")])
            .unwrap();
        types
    }

    #[test]
    fn initialise_from_toml() {
        let types = track_error_types();
        let table: toml::Table = toml::from_str(
            r#"
            Type = "TrackError"
            Path = "DDB1.TrackError"
            IsFinal = true
            [Par1]
            Type = "uint32"
            Default = "1"
            [Par2]
            Type = "uint32"
            Default = "2"
            "#,
        )
        .unwrap();
        let def = DataDefinition::initialise("TrackError", &table, &types).unwrap();
        assert!(def.is_final);
        assert!(def.children.iter().all(|c| c.is_final));
        def.verify(&types).unwrap();
        let leaves = def.leaves().unwrap();
        assert_eq!(leaves[0].0, "DDB1.TrackError.Par1");
        assert_eq!(leaves[1].0, "DDB1.TrackError.Par2");
        assert_eq!(leaves[1].1.default_value, "2");
    }

    #[test]
    fn initialise_rejects_unknown_type() {
        let types = TypeRegistry::new();
        let table: toml::Table = toml::from_str("Type = \"Ghost\"\n").unwrap();
        assert!(DataDefinition::initialise("x", &table, &types).is_err());
        let table: toml::Table = toml::from_str("IsFinal = true\n").unwrap();
        assert!(DataDefinition::initialise("x", &table, &types).is_err());
    }

    #[test]
    fn verify_checks_members() {
        let types = track_error_types();
        let missing = DataDefinition::new("T")
            .with_type("TrackError")
            .with_path("DDB1.T")
            .with_child(DataDefinition::new("Par1").with_type("uint32"));
        assert!(missing.verify(&types).is_err());

        let wrong_type = DataDefinition::new("T")
            .with_type("TrackError")
            .with_child(DataDefinition::new("Par1").with_type("uint32"))
            .with_child(DataDefinition::new("Par2").with_type("float32"));
        assert!(wrong_type.verify(&types).is_err());

        let wrong_name = DataDefinition::new("T")
            .with_type("TrackError")
            .with_child(DataDefinition::new("Par1").with_type("uint32"))
            .with_child(DataDefinition::new("Par3").with_type("uint32"));
        assert!(wrong_name.verify(&types).is_err());

        let terminal = DataDefinition::leaf("T", "TrackError", "DDB1.T", "{1,2}");
        terminal.verify(&types).unwrap();
        assert!(DataDefinition::new("empty").verify(&types).is_err());
    }

    #[test]
    fn verify_checks_basic_definitions() {
        let types = TypeRegistry::new();
        DataDefinition::leaf("x", "uint32", "DDB1.x", "0").verify(&types).unwrap();
        let with_members = DataDefinition::leaf("x", "uint32", "DDB1.x", "0")
            .with_child(DataDefinition::new("a").with_type("uint8"));
        assert!(with_members.verify(&types).is_err());
        let huge =
            DataDefinition::leaf("x", "uint64", "DDB1.x", "").with_shape(vec![1 << 32, 1 << 32]);
        assert!(huge.verify(&types).is_err());
        assert!(DataDefinition::leaf("x", "Nope", "DDB1.x", "").verify(&types).is_err());
    }

    #[test]
    fn merge_completes_drafts() {
        let mut global = DataDefinition::new("Error")
            .with_type("TrackError")
            .with_child(DataDefinition::new("Par1").with_type("uint32"));
        let local = DataDefinition::new("Error")
            .with_path("DDB1.Error")
            .with_child(DataDefinition::new("Par1").with_default("1"))
            .with_child(DataDefinition::new("Par2").with_type("uint32").with_default("2"));
        global.merge_with_local(&local).unwrap();
        assert_eq!(global.path, "DDB1.Error");
        assert_eq!(global.type_name, "TrackError");
        assert_eq!(global.children.len(), 2);
        assert_eq!(global.child("Par1").unwrap().default_value, "1");
        global.mark_final();
        global.verify(&track_error_types()).unwrap();
    }

    #[test]
    fn merge_rejects_final() {
        let mut draft = DataDefinition::new("a");
        let done = DataDefinition::leaf("a", "uint32", "DDB1.a", "0");
        assert!(draft.merge_with_local(&done).is_err());
        let mut done = done;
        assert!(done.merge_with_local(&DataDefinition::new("a")).is_err());
    }

    #[test]
    fn leaves_need_a_path() {
        let orphan = DataDefinition::leaf("x", "uint32", "", "0");
        assert!(orphan.leaves().is_err());
    }

    #[test]
    fn to_table_round_trips_through_initialise() {
        let types = track_error_types();
        let def = DataDefinition::new("V")
            .with_type("uint32")
            .with_path("DDB1.V")
            .with_default("{1,2}")
            .with_shape(vec![2])
            .finalised();
        let table = def.to_table();
        let back = DataDefinition::initialise("V", &table, &types).unwrap();
        assert_eq!(back, def);
    }
}
