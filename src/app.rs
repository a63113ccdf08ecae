//! A real-time application assembled from one configuration document.
//!
//! Setup order: logging, types, data groups, GAM definitions (completed with
//! shared drafts from `[Definitions]`), registry verification and
//! allocation, GAM pipelines, state records. After that the application only
//! moves between states.

use crate::channel::DataChannel;
use crate::config::{ApplicationConfig, ApplicationDocument, StructuredData};
use crate::definition::DataDefinition;
use crate::error::{Error, Result};
use crate::gam::{GamDefinitions, GamFactory, GamPipeline};
use crate::invariant_rt::CycleFault;
use crate::registry::{ChannelTable, DataChannelRegistry};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerStatus, ThreadRecord};
use crate::types::TypeRegistry;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// A configured application.
#[derive(Debug)]
pub struct Application {
    config: ApplicationConfig,
    types: Arc<TypeRegistry>,
    registry: DataChannelRegistry,
    table: Arc<ChannelTable>,
    scheduler: Scheduler,
    definitions: BTreeMap<String, GamDefinitions>,
    _log_guard: Option<WorkerGuard>,
}

impl Application {
    /// Build from TOML text.
    pub fn from_toml_str(text: &str, factory: &GamFactory) -> Result<Self> {
        Self::from_document(ApplicationDocument::from_toml_str(text)?, factory)
    }

    /// Build from a TOML file.
    pub fn from_path(path: impl AsRef<Path>, factory: &GamFactory) -> Result<Self> {
        Self::from_document(ApplicationDocument::from_path(path)?, factory)
    }

    /// Build from a parsed document.
    pub fn from_document(document: ApplicationDocument, factory: &GamFactory) -> Result<Self> {
        let log_guard = match &document.logging {
            Some(logging) => logging.init()?,
            None => None,
        };

        let mut types = TypeRegistry::new();
        if let Some(section) = document.section("Types") {
            types.initialise(section)?;
        }
        let types = Arc::new(types);

        let mut registry = DataChannelRegistry::new(Arc::clone(&types));
        if let Some(data) = document.section("Data") {
            for group in data.read_list("Groups").unwrap_or_default() {
                registry.declare_group(group);
            }
            registry.set_final(matches!(data.read("IsFinal").as_deref(), Some("true")));
        }

        let drafts = read_drafts(document.section("Definitions"), &types)?;
        let functions = document
            .section("Functions")
            .ok_or_else(|| Error::parameters("missing [Functions] table"))?;
        let mut definitions = BTreeMap::new();
        for name in functions.child_names() {
            let node = functions
                .child(&name)
                .ok_or_else(|| Error::parameters(format!("function {name} vanished")))?;
            let mut gam = GamDefinitions::initialise(&name, node, &types)?;
            for definition in gam.definitions_mut() {
                complete_from_draft(definition, &drafts)?;
            }
            registry.add_data_definition(&gam)?;
            definitions.insert(name, gam);
        }
        registry.verify()?;
        let table = registry.allocate()?;

        let mut scheduler = Scheduler::new(SchedulerConfig {
            termination_timeout: Duration::from_millis(document.application.termination_timeout_ms),
            cycle_period: Duration::from_micros(document.application.cycle_period_us),
        });
        for (name, gam) in &definitions {
            let node = functions
                .child(name)
                .ok_or_else(|| Error::parameters(format!("function {name} vanished")))?;
            let instance = factory.create(gam, node)?;
            let pipeline = GamPipeline::new(gam, instance, &table)?;
            scheduler.insert_gam(pipeline, gam.states.iter().cloned())?;
        }

        let states = document
            .section("States")
            .ok_or_else(|| Error::parameters("missing [States] table"))?;
        for state in states.child_names() {
            let threads = states
                .child(&state)
                .and_then(|s| s.child("Threads"))
                .ok_or_else(|| Error::parameters(format!("state {state} has no Threads")))?;
            for thread in threads.child_names() {
                let gams = threads
                    .child(&thread)
                    .and_then(|t| t.read_list("Functions"))
                    .ok_or_else(|| {
                        Error::parameters(format!("thread {state}.{thread} lists no Functions"))
                    })?;
                if let Some(unknown) = gams.iter().find(|g| !definitions.contains_key(*g)) {
                    return Err(Error::parameters(format!(
                        "thread {state}.{thread} runs unknown function {unknown}"
                    )));
                }
                scheduler.insert_record(&state, ThreadRecord::new(thread, gams));
            }
        }
        if scheduler.record(&document.application.first_state).is_none() {
            return Err(Error::parameters(format!(
                "first state {} is not declared",
                document.application.first_state
            )));
        }

        info!(
            gams = definitions.len(),
            channels = table.len(),
            states = scheduler.state_names().len(),
            "application configured"
        );
        Ok(Self {
            config: document.application,
            types,
            registry,
            table,
            scheduler,
            definitions,
            _log_guard: log_guard,
        })
    }

    /// Enter the first state.
    pub fn start(&mut self) -> Result<()> {
        let first = self.config.first_state.clone();
        self.prepare_next_state(&first)?;
        self.change_state()
    }

    /// Prepare `next` while the current state keeps running.
    pub fn prepare_next_state(&mut self, next: &str) -> Result<()> {
        let info = self.scheduler.state_info(next);
        self.scheduler.prepare_next_state(&info, &self.table)?;
        self.registry.prepare_next_state(&info)
    }

    /// Switch to the prepared state.
    pub fn change_state(&mut self) -> Result<()> {
        self.scheduler.change_state()
    }

    /// Stop the running state.
    pub fn stop(&mut self) -> Result<()> {
        let faults = self.scheduler.drain_faults();
        if !faults.is_empty() {
            warn!(count = faults.len(), "cycle faults pending at stop");
        }
        self.scheduler.stop()
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn registry(&self) -> &DataChannelRegistry {
        &self.registry
    }

    pub fn table(&self) -> &Arc<ChannelTable> {
        &self.table
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Declarations of GAM `name`.
    pub fn definitions(&self, name: &str) -> Option<&GamDefinitions> {
        self.definitions.get(name)
    }

    /// Channel at `path`.
    pub fn channel(&self, path: &str) -> Option<&Arc<DataChannel>> {
        self.table.find(path)
    }

    /// Buffer the running state uses.
    pub fn active_buffer(&self) -> usize {
        self.scheduler.active_buffer()
    }

    /// Faults reported by workers since the last call.
    pub fn drain_faults(&mut self) -> Vec<CycleFault> {
        self.scheduler.drain_faults()
    }

    /// Invariant signals raised by workers since the last call.
    pub fn drain_signals(&mut self) -> Vec<u8> {
        self.scheduler.drain_signals()
    }
}

fn read_drafts(
    section: Option<&dyn StructuredData>,
    types: &TypeRegistry,
) -> Result<BTreeMap<String, DataDefinition>> {
    let mut drafts = BTreeMap::new();
    let Some(section) = section else {
        return Ok(drafts);
    };
    for name in section.child_names() {
        let node = section
            .child(&name)
            .ok_or_else(|| Error::parameters(format!("definition {name} vanished")))?;
        let draft = DataDefinition::initialise(&name, node, types)?;
        if draft.is_final {
            return Err(Error::parameters(format!(
                "shared definition {name} must be a draft"
            )));
        }
        drafts.insert(name, draft);
    }
    Ok(drafts)
}

/// A non-final GAM definition is completed by the shared draft of the same
/// name and becomes final.
fn complete_from_draft(
    definition: &mut DataDefinition,
    drafts: &BTreeMap<String, DataDefinition>,
) -> Result<()> {
    if definition.is_final {
        return Ok(());
    }
    let Some(draft) = drafts.get(&definition.name) else {
        return Ok(());
    };
    let mut merged = draft.clone();
    merged.merge_with_local(definition)?;
    merged.mark_final();
    *definition = merged;
    Ok(())
}
