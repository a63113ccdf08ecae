//! The scheduler: state records, worker threads and the double-buffer cut-over.
//!
//! GAM pipelines live in an arena keyed by name. Starting a state moves the
//! pipelines of each of its threads into a worker; stopping the state hands
//! them back. Between the two, the only shared mutable value is the active
//! buffer index.
//!
//! ```text
//! Idle --prepare--> Prepared --change_state--> Running --prepare--> Prepared ...
//!                                                 |
//!                                                 +--stop--> Idle
//! ```

use crate::broker::WriterBroker;
use crate::channel::NUMBER_OF_BUFFERS;
use crate::definition::DataDefinition;
use crate::error::{Error, Result};
use crate::gam::GamPipeline;
use crate::invariant_ppt::{assert_invariant, BUFFER_FLIPPED, STATE_PREPARED};
use crate::invariant_rt::{
    drain_faults, drain_invariant_signals, new_fault_queue, new_invariant_queue, signal_fault,
    signal_invariant, CycleFault, FaultKind, INV_CYCLE_COMPLETED, INV_TIMES_WRITTEN,
    INV_WORKER_STOPPED_CLEAN,
};
use crate::registry::{absolute_time_path, relative_time_path, ChannelTable, StateInfo};
use crate::service::{EmbeddedService, EmbeddedThread, ExecutionOutcome, ExecutionStage};
use rtrb::{Consumer, Producer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// GAMs run in order by one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub name: String,
    pub gams: Vec<String>,
}

impl ThreadRecord {
    pub fn new<I, S>(name: impl Into<String>, gams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            gams: gams.into_iter().map(Into::into).collect(),
        }
    }
}

/// The threads of one state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateRecord {
    pub name: String,
    pub threads: Vec<ThreadRecord>,
}

/// Where the scheduler is in its state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// No state running, none prepared.
    Idle,
    /// `next` is ready; `current` (if any) is still running.
    Prepared {
        current: Option<String>,
        next: String,
    },
    /// The named state is running.
    Running(String),
}

/// Timing parameters of the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Time a worker gets to leave its loop.
    pub termination_timeout: Duration,
    /// Minimum cycle period; zero runs cycles back to back.
    pub cycle_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            termination_timeout: Duration::from_millis(1000),
            cycle_period: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct PreparedState {
    name: String,
    buffer: usize,
    timing: Vec<WriterBroker>,
}

/// The per-thread cycle loop.
struct Worker {
    thread: usize,
    buffer: usize,
    pipelines: Vec<GamPipeline>,
    timing: WriterBroker,
    cycle_period: Duration,
    cycle: u64,
    signals: Producer<u8>,
    faults: Producer<CycleFault>,
}

impl Worker {
    fn fault(&mut self, gam: usize, kind: FaultKind) -> ExecutionOutcome {
        signal_fault(
            &mut self.faults,
            CycleFault {
                thread: self.thread,
                gam,
                cycle: self.cycle,
                kind,
            },
        );
        ExecutionOutcome::FatalError
    }

    fn cycle(&mut self) -> ExecutionOutcome {
        let cycle_start = Instant::now();
        for index in 0..self.pipelines.len() {
            let gam_start = Instant::now();
            let pipeline = &mut self.pipelines[index];
            if pipeline.read(self.buffer).is_err() {
                return self.fault(index, FaultKind::InputRead);
            }
            if pipeline.execute().is_err() {
                return self.fault(index, FaultKind::Execute);
            }
            if pipeline.write(self.buffer).is_err() {
                return self.fault(index, FaultKind::OutputWrite);
            }
            let now = Instant::now();
            let absolute = now.duration_since(cycle_start).as_micros() as u64;
            let relative = now.duration_since(gam_start).as_micros() as u64;
            let abs = self.timing.memory(2 * index);
            let rel = self.timing.memory(2 * index + 1);
            let timed = match (abs, rel) {
                (Some(abs), Some(rel)) => {
                    abs.set(0, absolute).is_ok() && rel.set(0, relative).is_ok()
                }
                _ => false,
            };
            if !timed {
                return self.fault(index, FaultKind::TimingWrite);
            }
        }
        if self.timing.write(self.buffer).is_err() {
            return self.fault(usize::MAX, FaultKind::TimingWrite);
        }
        self.cycle += 1;
        signal_invariant(&mut self.signals, INV_TIMES_WRITTEN);
        signal_invariant(&mut self.signals, INV_CYCLE_COMPLETED);

        if let Some(rest) = self.cycle_period.checked_sub(cycle_start.elapsed()) {
            if !rest.is_zero() {
                std::thread::sleep(rest);
            }
        }
        ExecutionOutcome::NoError
    }
}

impl EmbeddedService for Worker {
    fn execute(&mut self, stage: ExecutionStage) -> ExecutionOutcome {
        match stage {
            ExecutionStage::Startup => ExecutionOutcome::NoError,
            ExecutionStage::Main => self.cycle(),
            ExecutionStage::Termination => {
                signal_invariant(&mut self.signals, INV_WORKER_STOPPED_CLEAN);
                ExecutionOutcome::Completed
            }
            ExecutionStage::BadTermination | ExecutionStage::AsyncTermination => {
                ExecutionOutcome::Completed
            }
        }
    }
}

struct RunningThread {
    thread: EmbeddedThread<Worker>,
    signals: Consumer<u8>,
    faults: Consumer<CycleFault>,
}

/// Runs the threads of one state at a time and switches between states.
pub struct Scheduler {
    config: SchedulerConfig,
    records: BTreeMap<String, StateRecord>,
    arena: HashMap<String, GamPipeline>,
    supported: HashMap<String, Vec<String>>,
    active_buffer: AtomicUsize,
    current: Option<String>,
    prepared: Option<PreparedState>,
    running: Vec<RunningThread>,
    faults: Vec<CycleFault>,
    signals: Vec<u8>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("status", &self.status())
            .field("states", &self.records.keys().collect::<Vec<_>>())
            .field("active_buffer", &self.active_buffer())
            .field("running_threads", &self.running.len())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
            arena: HashMap::new(),
            supported: HashMap::new(),
            active_buffer: AtomicUsize::new(0),
            current: None,
            prepared: None,
            running: Vec::new(),
            faults: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Append `thread` to the record of `state`, creating it if needed.
    pub fn insert_record(&mut self, state: &str, thread: ThreadRecord) {
        let record = self
            .records
            .entry(state.to_string())
            .or_insert_with(|| StateRecord {
                name: state.to_string(),
                threads: Vec::new(),
            });
        record.threads.push(thread);
    }

    /// Move a GAM pipeline into the arena.
    ///
    /// `states` are the states the GAM declared; a thread of any other state
    /// cannot schedule it.
    pub fn insert_gam<I, S>(&mut self, pipeline: GamPipeline, states: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = pipeline.name().to_string();
        if self.supported.contains_key(&name) {
            return Err(Error::parameters(format!("GAM {name} inserted twice")));
        }
        self.supported
            .insert(name.clone(), states.into_iter().map(Into::into).collect());
        self.arena.insert(name, pipeline);
        Ok(())
    }

    /// Record of `state`.
    pub fn record(&self, state: &str) -> Option<&StateRecord> {
        self.records.get(state)
    }

    /// Names of every recorded state.
    pub fn state_names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Pipeline `name`, while it is not owned by a running worker.
    pub fn gam(&self, name: &str) -> Option<&GamPipeline> {
        self.arena.get(name)
    }

    pub fn status(&self) -> SchedulerStatus {
        match (&self.prepared, &self.current) {
            (Some(prepared), current) => SchedulerStatus::Prepared {
                current: current.clone(),
                next: prepared.name.clone(),
            },
            (None, Some(current)) => SchedulerStatus::Running(current.clone()),
            (None, None) => SchedulerStatus::Idle,
        }
    }

    /// Buffer the running state uses.
    pub fn active_buffer(&self) -> usize {
        self.active_buffer.load(Ordering::Acquire)
    }

    /// Name of the running state.
    pub fn current_state(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Transition parameters towards `next_state`.
    pub fn state_info(&self, next_state: &str) -> StateInfo {
        StateInfo {
            current_state: self.current.clone().unwrap_or_default(),
            next_state: next_state.to_string(),
            active_buffer: self.active_buffer(),
        }
    }

    /// Number of workers that have not left their loop.
    pub fn running_threads(&self) -> usize {
        self.running.iter().filter(|t| t.thread.is_running()).count()
    }

    /// Ready `info.next_state` while the current state keeps running.
    ///
    /// Checks that every GAM of the state exists, supports it and is listed
    /// once, and binds one timing writer per thread at the next buffer.
    pub fn prepare_next_state(
        &mut self,
        info: &StateInfo,
        table: &Arc<ChannelTable>,
    ) -> Result<()> {
        let record = self
            .records
            .get(&info.next_state)
            .ok_or_else(|| Error::fatal(format!("unknown state {}", info.next_state)))?;
        if info.active_buffer % NUMBER_OF_BUFFERS != self.active_buffer() {
            return Err(Error::fatal(format!(
                "transition expects active buffer {}, scheduler is on {}",
                info.active_buffer,
                self.active_buffer()
            )));
        }

        let mut seen = HashSet::new();
        let mut timing = Vec::with_capacity(record.threads.len());
        for thread in &record.threads {
            let mut writer = WriterBroker::with_registry(Arc::clone(table));
            for gam in &thread.gams {
                let states = self.supported.get(gam).ok_or_else(|| {
                    Error::fatal(format!("state {}: unknown GAM {gam}", info.next_state))
                })?;
                if !states.iter().any(|s| *s == info.next_state) {
                    return Err(Error::fatal(format!(
                        "GAM {gam} does not support state {}",
                        info.next_state
                    )));
                }
                if !seen.insert(gam.as_str()) {
                    return Err(Error::fatal(format!(
                        "GAM {gam} scheduled twice in state {}",
                        info.next_state
                    )));
                }
                for (name, path) in [
                    ("AbsoluteUsecTime", absolute_time_path(gam)),
                    ("RelativeUsecTime", relative_time_path(gam)),
                ] {
                    writer.add_variable(&DataDefinition::leaf(name, "uint64", path, "0"), None)?;
                }
            }
            writer.finalise()?;
            timing.push(writer);
        }

        let buffer = info.next_buffer();
        assert_invariant(
            STATE_PREPARED,
            buffer != self.active_buffer() && timing.len() == record.threads.len(),
            "prepared state targets the inactive buffer",
            Some(&info.next_state),
        );
        info!(
            current = %info.current_state,
            next = %info.next_state,
            buffer,
            threads = timing.len(),
            "state prepared"
        );
        self.prepared = Some(PreparedState {
            name: info.next_state.clone(),
            buffer,
            timing,
        });
        Ok(())
    }

    /// Stop the running state and start the prepared one on the next buffer.
    ///
    /// On failure nothing runs: the prepared state is kept when every timing
    /// writer could be recovered, the active buffer is left unchanged, and
    /// pipelines of workers that did stop are back in the arena.
    pub fn change_state(&mut self) -> Result<()> {
        let prepared = self
            .prepared
            .take()
            .ok_or_else(|| Error::fatal("change_state called with no prepared state"))?;
        if let Some(missing) = self.unavailable_gam(&prepared.name) {
            let err = Error::fatal(format!(
                "GAM {missing} of state {} is not available",
                prepared.name
            ));
            self.prepared = Some(prepared);
            return Err(err);
        }
        let stopped = self.stop_workers(&mut Vec::new());
        if let Some(state) = self.current.take() {
            debug!(%state, "state stopped for transition");
        }
        let record = match (stopped, self.records.get(&prepared.name)) {
            (Ok(()), Some(record)) => record.clone(),
            (Err(err), _) => {
                self.prepared = Some(prepared);
                return Err(err);
            }
            (Ok(()), None) => {
                let err = Error::fatal(format!("state {} vanished", prepared.name));
                self.prepared = Some(prepared);
                return Err(err);
            }
        };
        if let Some(missing) = self.unavailable_gam(&prepared.name) {
            let err = Error::fatal(format!("GAM {missing} was lost by the stopped state"));
            self.prepared = Some(prepared);
            return Err(err);
        }
        let groups: Vec<Vec<GamPipeline>> = record
            .threads
            .iter()
            .map(|thread| {
                thread
                    .gams
                    .iter()
                    .filter_map(|gam| self.arena.remove(gam))
                    .collect()
            })
            .collect();

        let previous = self.active_buffer.swap(prepared.buffer, Ordering::AcqRel);
        assert_invariant(
            BUFFER_FLIPPED,
            previous != prepared.buffer,
            "the new state runs on the other buffer",
            Some(&prepared.name),
        );

        let mut pending = groups.into_iter().zip(prepared.timing).enumerate();
        while let Some((index, (pipelines, timing))) = pending.next() {
            let (signals_tx, signals_rx) = new_invariant_queue();
            let (faults_tx, faults_rx) = new_fault_queue();
            let worker = Worker {
                thread: index,
                buffer: prepared.buffer,
                pipelines,
                timing,
                cycle_period: self.config.cycle_period,
                cycle: 0,
                signals: signals_tx,
                faults: faults_tx,
            };
            let name = format!("{}.{}", prepared.name, record.threads[index].name);
            match EmbeddedThread::try_start(name, worker) {
                Ok(thread) => self.running.push(RunningThread {
                    thread,
                    signals: signals_rx,
                    faults: faults_rx,
                }),
                Err((err, worker)) => {
                    let mut timing = Vec::with_capacity(record.threads.len());
                    let recalled = self.stop_workers(&mut timing);
                    timing.push(worker.timing);
                    self.return_pipelines(worker.pipelines);
                    for (_, (pipelines, writer)) in pending {
                        self.return_pipelines(pipelines);
                        timing.push(writer);
                    }
                    self.active_buffer.store(previous, Ordering::Release);
                    warn!(state = %prepared.name, %err, "state failed to start");
                    if recalled.is_ok() {
                        self.prepared = Some(PreparedState {
                            name: prepared.name,
                            buffer: prepared.buffer,
                            timing,
                        });
                    }
                    return Err(err);
                }
            }
        }
        info!(state = %prepared.name, buffer = prepared.buffer, "state running");
        self.current = Some(prepared.name);
        Ok(())
    }

    /// Stop the running state. Any prepared state is dropped.
    pub fn stop(&mut self) -> Result<()> {
        self.prepared = None;
        let result = self.stop_workers(&mut Vec::new());
        if let Some(state) = self.current.take() {
            info!(%state, "state stopped");
        }
        result
    }

    /// Faults reported by workers since the last call.
    pub fn drain_faults(&mut self) -> Vec<CycleFault> {
        for running in &mut self.running {
            self.faults.extend(drain_faults(&mut running.faults));
        }
        std::mem::take(&mut self.faults)
    }

    /// Invariant signals raised by workers since the last call.
    pub fn drain_signals(&mut self) -> Vec<u8> {
        for running in &mut self.running {
            self.signals
                .extend(drain_invariant_signals(&mut running.signals));
        }
        std::mem::take(&mut self.signals)
    }

    /// A GAM of `state` that is neither in the arena nor owned by the running state.
    fn unavailable_gam(&self, state: &str) -> Option<String> {
        let running: HashSet<&str> = self
            .current
            .as_deref()
            .and_then(|current| self.records.get(current))
            .into_iter()
            .flat_map(|record| record.threads.iter())
            .flat_map(|thread| thread.gams.iter().map(String::as_str))
            .collect();
        self.records
            .get(state)?
            .threads
            .iter()
            .flat_map(|thread| thread.gams.iter())
            .find(|gam| !self.arena.contains_key(*gam) && !running.contains(gam.as_str()))
            .cloned()
    }

    fn return_pipelines(&mut self, pipelines: Vec<GamPipeline>) {
        for pipeline in pipelines {
            self.arena.insert(pipeline.name().to_string(), pipeline);
        }
    }

    /// Stop every worker, even past a failure, and report the first error.
    ///
    /// Pipelines of stopped workers go back to the arena and their timing
    /// writers are appended to `timing`, in thread order.
    fn stop_workers(&mut self, timing: &mut Vec<WriterBroker>) -> Result<()> {
        let mut first_error = None;
        let timeout = self.config.termination_timeout;
        for running in &self.running {
            running.thread.request_stop();
        }
        for mut running in std::mem::take(&mut self.running) {
            let name = running.thread.name().to_string();
            match running.thread.stop(timeout) {
                Ok((worker, outcome)) => {
                    debug!(thread = %name, ?outcome, cycles = worker.cycle, "worker stopped");
                    self.return_pipelines(worker.pipelines);
                    timing.push(worker.timing);
                }
                Err(err) => {
                    warn!(thread = %name, %err, "worker lost");
                    first_error.get_or_insert(err);
                }
            }
            self.faults.extend(drain_faults(&mut running.faults));
            self.signals
                .extend(drain_invariant_signals(&mut running.signals));
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.running.is_empty() {
            let _ = self.stop_workers(&mut Vec::new());
        }
    }
}
