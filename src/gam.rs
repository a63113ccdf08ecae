//! The GAM contract: declared signals, supported states and the cycle callback.
//!
//! A GAM (Generic Application Module) declares its signals in definition
//! containers, each with a direction, and the states it runs in. At runtime
//! it only sees its broker memory through [`GamIo`].

use crate::broker::{ReaderBroker, WriterBroker};
use crate::config::StructuredData;
use crate::definition::DataDefinition;
use crate::error::{Error, Result};
use crate::memory::SignalView;
use crate::registry::ChannelTable;
use crate::types::TypeRegistry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Class name every definition container node must carry.
pub const CONTAINER_CLASS: &str = "DefinitionContainer";

/// Data-flow direction of a container, seen from the GAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Signals the GAM consumes.
    Input,
    /// Signals the GAM produces.
    Output,
}

impl Direction {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "Input" => Some(Self::Input),
            "Output" => Some(Self::Output),
            _ => None,
        }
    }
}

/// A named group of definitions sharing one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionContainer {
    pub name: String,
    pub direction: Direction,
    pub definitions: Vec<DataDefinition>,
}

/// Everything a GAM declares to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct GamDefinitions {
    /// Unique GAM name.
    pub name: String,
    /// Implementation class, looked up in a [`GamFactory`].
    pub class: String,
    /// States the GAM runs in.
    pub states: Vec<String>,
    pub containers: Vec<DefinitionContainer>,
}

impl GamDefinitions {
    /// A GAM with no signals.
    pub fn new<I, S>(name: impl Into<String>, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            class: String::new(),
            states: states.into_iter().map(Into::into).collect(),
            containers: Vec::new(),
        }
    }

    /// Set the implementation class.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Append an input definition to the `Inputs` container.
    pub fn with_input(mut self, definition: DataDefinition) -> Self {
        self.container_mut("Inputs", Direction::Input)
            .definitions
            .push(definition);
        self
    }

    /// Append an output definition to the `Outputs` container.
    pub fn with_output(mut self, definition: DataDefinition) -> Self {
        self.container_mut("Outputs", Direction::Output)
            .definitions
            .push(definition);
        self
    }

    fn container_mut(&mut self, name: &str, direction: Direction) -> &mut DefinitionContainer {
        let index = match self.containers.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                self.containers.push(DefinitionContainer {
                    name: name.to_string(),
                    direction,
                    definitions: Vec::new(),
                });
                self.containers.len() - 1
            }
        };
        &mut self.containers[index]
    }

    /// Build the declarations of GAM `name` from its configuration node.
    ///
    /// The node carries `Class`, `States` and GAM parameters as values; each
    /// child is a container with `Class = "DefinitionContainer"` and a
    /// `Direction`, whose children are definitions.
    pub fn initialise(name: &str, data: &dyn StructuredData, types: &TypeRegistry) -> Result<Self> {
        let class = data
            .read("Class")
            .ok_or_else(|| Error::parameters(format!("GAM {name} has no Class")))?;
        let states = data.read_list("States").unwrap_or_default();
        if states.is_empty() {
            return Err(Error::parameters(format!("GAM {name} lists no States")));
        }

        let mut containers = Vec::new();
        for container_name in data.child_names() {
            let node = data.child(&container_name).ok_or_else(|| {
                Error::parameters(format!("container {container_name} of {name} vanished"))
            })?;
            if node.read("Class").as_deref() != Some(CONTAINER_CLASS) {
                return Err(Error::parameters(format!(
                    "{name}.{container_name} is not a {CONTAINER_CLASS}"
                )));
            }
            let direction = node
                .read("Direction")
                .as_deref()
                .and_then(Direction::parse)
                .ok_or_else(|| {
                    Error::parameters(format!(
                        "{name}.{container_name} needs Direction = \"Input\" or \"Output\""
                    ))
                })?;
            if let Some(stray) = node
                .value_names()
                .into_iter()
                .find(|k| k != "Class" && k != "Direction")
            {
                return Err(Error::parameters(format!(
                    "{name}.{container_name}.{stray} is not a definition"
                )));
            }
            let mut definitions = Vec::new();
            for def_name in node.child_names() {
                let def_node = node.child(&def_name).ok_or_else(|| {
                    Error::parameters(format!("definition {def_name} of {name} vanished"))
                })?;
                definitions.push(DataDefinition::initialise(&def_name, def_node, types)?);
            }
            containers.push(DefinitionContainer {
                name: container_name,
                direction,
                definitions,
            });
        }
        debug!(gam = name, %class, containers = containers.len(), "GAM definitions read");
        Ok(Self {
            name: name.to_string(),
            class,
            states,
            containers,
        })
    }

    /// Definitions of every container of `direction`, in declaration order.
    pub fn definitions(&self, direction: Direction) -> impl Iterator<Item = &DataDefinition> {
        self.containers
            .iter()
            .filter(move |c| c.direction == direction)
            .flat_map(|c| c.definitions.iter())
    }

    /// Mutable access to every definition.
    pub fn definitions_mut(&mut self) -> impl Iterator<Item = &mut DataDefinition> {
        self.containers
            .iter_mut()
            .flat_map(|c| c.definitions.iter_mut())
    }

    /// True when the GAM runs in `state`.
    pub fn supports(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }
}

/// Broker memory of one GAM, as seen from [`Gam::execute`].
#[derive(Clone, Copy)]
pub struct GamIo<'a> {
    inputs: &'a ReaderBroker,
    outputs: &'a WriterBroker,
}

impl<'a> GamIo<'a> {
    pub fn new(inputs: &'a ReaderBroker, outputs: &'a WriterBroker) -> Self {
        Self { inputs, outputs }
    }

    /// Input variable `n`, in input declaration order.
    #[inline]
    pub fn input(&self, n: usize) -> Option<SignalView<'a>> {
        self.inputs.data(n)
    }

    /// Output variable `n`, in output declaration order.
    #[inline]
    pub fn output(&self, n: usize) -> Option<SignalView<'a>> {
        self.outputs.data(n)
    }

    pub fn number_of_inputs(&self) -> usize {
        self.inputs.number_of_variables()
    }

    pub fn number_of_outputs(&self) -> usize {
        self.outputs.number_of_variables()
    }
}

/// A Generic Application Module.
pub trait Gam: Send {
    /// Check the bound signals once, after the brokers are finalised.
    fn setup(&mut self, _io: &GamIo<'_>) -> Result<()> {
        Ok(())
    }

    /// One cycle. Inputs are already read; outputs are written afterwards.
    ///
    /// Must not allocate, lock or block.
    fn execute(&mut self, io: &GamIo<'_>) -> Result<()>;
}

/// A GAM with its brokers, owned by the scheduler.
pub struct GamPipeline {
    name: String,
    gam: Box<dyn Gam>,
    inputs: ReaderBroker,
    outputs: WriterBroker,
}

impl fmt::Debug for GamPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GamPipeline")
            .field("name", &self.name)
            .field("inputs", &self.inputs.number_of_variables())
            .field("outputs", &self.outputs.number_of_variables())
            .finish()
    }
}

impl GamPipeline {
    /// Bind every declared signal of `definitions` and finalise both brokers.
    pub fn new(
        definitions: &GamDefinitions,
        mut gam: Box<dyn Gam>,
        table: &Arc<ChannelTable>,
    ) -> Result<Self> {
        let mut inputs = ReaderBroker::with_registry(Arc::clone(table));
        let mut outputs = WriterBroker::with_registry(Arc::clone(table));
        for definition in definitions.definitions(Direction::Input) {
            inputs.add_variable(definition, None)?;
        }
        for definition in definitions.definitions(Direction::Output) {
            outputs.add_variable(definition, None)?;
        }
        inputs.finalise()?;
        outputs.finalise()?;
        gam.setup(&GamIo::new(&inputs, &outputs))?;
        Ok(Self {
            name: definitions.name.clone(),
            gam,
            inputs,
            outputs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &ReaderBroker {
        &self.inputs
    }

    pub fn outputs(&self) -> &WriterBroker {
        &self.outputs
    }

    /// Copy the inputs in from `buffer`.
    #[inline]
    pub fn read(&self, buffer: usize) -> Result<()> {
        self.inputs.read(buffer)
    }

    #[inline]
    pub fn execute(&mut self) -> Result<()> {
        self.gam.execute(&GamIo::new(&self.inputs, &self.outputs))
    }

    /// Copy the outputs out to `buffer`.
    #[inline]
    pub fn write(&self, buffer: usize) -> Result<()> {
        self.outputs.write(buffer)
    }
}

/// Constructor of one GAM class from its declarations and configuration node.
pub type GamConstructor =
    fn(&GamDefinitions, &dyn StructuredData) -> Result<Box<dyn Gam>>;

/// Maps class names to GAM constructors.
#[derive(Default)]
pub struct GamFactory {
    constructors: HashMap<String, GamConstructor>,
}

impl fmt::Debug for GamFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<&String> = self.constructors.keys().collect();
        classes.sort();
        f.debug_struct("GamFactory").field("classes", &classes).finish()
    }
}

impl GamFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory knowing the built-in GAM classes.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        crate::gams::register_builtins(&mut factory);
        factory
    }

    /// Register `class`, replacing any previous constructor.
    pub fn register(&mut self, class: impl Into<String>, constructor: GamConstructor) {
        self.constructors.insert(class.into(), constructor);
    }

    /// True when `class` can be built.
    pub fn knows(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    /// Build the GAM declared by `definitions`.
    pub fn create(
        &self,
        definitions: &GamDefinitions,
        data: &dyn StructuredData,
    ) -> Result<Box<dyn Gam>> {
        let constructor = self.constructors.get(&definitions.class).ok_or_else(|| {
            Error::parameters(format!(
                "GAM {}: unknown class {}",
                definitions.name, definitions.class
            ))
        })?;
        constructor(definitions, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAM: &str = r#"
        Class = "CounterGam"
        States = ["state1", "state2"]
        Step = 2
        [Outputs]
        Class = "DefinitionContainer"
        Direction = "Output"
        [Outputs.Count]
        Type = "uint32"
        Path = "DDB1.Count"
        IsFinal = true
    "#;

    #[test]
    fn initialise_reads_containers() {
        let table: toml::Table = toml::from_str(GAM).unwrap();
        let gam = GamDefinitions::initialise("C", &table, &TypeRegistry::new()).unwrap();
        assert_eq!(gam.class, "CounterGam");
        assert_eq!(gam.states, vec!["state1", "state2"]);
        assert!(gam.supports("state2"));
        let outputs: Vec<_> = gam.definitions(Direction::Output).collect();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].path, "DDB1.Count");
        assert_eq!(gam.definitions(Direction::Input).count(), 0);
    }

    #[test]
    fn malformed_trees_are_rejected() {
        let types = TypeRegistry::new();
        let no_class = GAM.replace("Class = \"DefinitionContainer\"", "");
        let table: toml::Table = toml::from_str(&no_class).unwrap();
        assert!(GamDefinitions::initialise("C", &table, &types).is_err());

        let bad_direction = GAM.replace("Direction = \"Output\"", "Direction = \"Sideways\"");
        let table: toml::Table = toml::from_str(&bad_direction).unwrap();
        assert!(GamDefinitions::initialise("C", &table, &types).is_err());

        let stray = GAM.replace("Direction = \"Output\"", "Direction = \"Output\"\nGain = 3");
        let table: toml::Table = toml::from_str(&stray).unwrap();
        assert!(GamDefinitions::initialise("C", &table, &types).is_err());

        let stateless = GAM.replace("States = [\"state1\", \"state2\"]", "");
        let table: toml::Table = toml::from_str(&stateless).unwrap();
        assert!(GamDefinitions::initialise("C", &table, &types).is_err());
    }

    #[test]
    fn builder_groups_by_direction() {
        let gam = GamDefinitions::new("G", ["s"])
            .with_input(DataDefinition::leaf("a", "uint32", "D.a", ""))
            .with_input(DataDefinition::leaf("b", "uint32", "D.b", ""))
            .with_output(DataDefinition::leaf("c", "uint32", "D.c", ""));
        assert_eq!(gam.containers.len(), 2);
        assert_eq!(gam.definitions(Direction::Input).count(), 2);
    }

    #[test]
    fn factory_reports_unknown_class() {
        let factory = GamFactory::with_builtins();
        assert!(factory.knows("PidGam"));
        let gam = GamDefinitions::new("G", ["s"]).with_class("Nope");
        assert!(factory.create(&gam, &toml::Table::new()).is_err());
    }
}
