//! Contract tests: setup-phase invariants are asserted, worker signals fire.

use gamrt::invariant_ppt::{
    contract_test, BROKER_BINDS_ALLOCATED, BROKER_FINALISED, BUFFER_FLIPPED, DEFAULTS_SEEDED,
    DEFINITION_MERGE_DRAFT_ONLY, DEFINITION_VERIFIED, NEXT_BUFFER_SEEDED, PRODUCER_CARDINALITY,
    REGISTRY_REJECTS_INVALID, STATE_PREPARED,
};
use gamrt::invariant_rt::{
    contract_test_rt, INV_CYCLE_COMPLETED, INV_TIMES_WRITTEN, INV_WORKER_STOPPED_CLEAN,
};
use gamrt::{
    Application, DataChannelRegistry, DataDefinition, GamDefinitions, GamFactory, TypeRegistry,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const APP: &str = r#"
[Application]
FirstState = "run"
CyclePeriodUs = 1000

[Functions.Counter]
Class = "CounterGam"
States = ["run", "again"]
[Functions.Counter.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Counter.Outputs.Count]
Type = "uint32"
Path = "DDB1.Count"
IsFinal = true

[States.run.Threads.T]
Functions = ["Counter"]
[States.again.Threads.T]
Functions = ["Counter"]
"#;

#[test]
fn contract_setup_phase() {
    let mut app = Application::from_toml_str(APP, &GamFactory::with_builtins()).unwrap();
    app.start().unwrap();
    app.prepare_next_state("again").unwrap();
    app.change_state().unwrap();
    app.stop().unwrap();
    contract_test(
        "application setup and transitions",
        &[
            DEFINITION_VERIFIED,
            PRODUCER_CARDINALITY,
            DEFAULTS_SEEDED,
            BROKER_BINDS_ALLOCATED,
            BROKER_FINALISED,
            STATE_PREPARED,
            NEXT_BUFFER_SEEDED,
            BUFFER_FLIPPED,
        ],
    );
}

#[test]
fn contract_rejection_and_merge() {
    let mut draft = DataDefinition::new("X").with_type("uint32");
    draft
        .merge_with_local(&DataDefinition::new("X").with_path("DDB1.X"))
        .unwrap();

    let mut registry = DataChannelRegistry::new(Arc::new(TypeRegistry::new()));
    let x = draft.finalised();
    registry
        .add_data_definition(&GamDefinitions::new("A", ["s"]).with_output(x.clone()))
        .unwrap();
    registry
        .add_data_definition(&GamDefinitions::new("B", ["s"]).with_output(x))
        .unwrap();
    assert!(registry.verify().is_err());
    contract_test(
        "draft merge and registry rejection",
        &[DEFINITION_MERGE_DRAFT_ONLY, REGISTRY_REJECTS_INVALID],
    );
}

#[test]
fn contract_worker_signals() {
    let mut app = Application::from_toml_str(APP, &GamFactory::with_builtins()).unwrap();
    app.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    app.stop().unwrap();
    let signals = app.drain_signals();
    contract_test_rt(
        "worker cycle",
        &signals,
        &[INV_CYCLE_COMPLETED, INV_TIMES_WRITTEN, INV_WORKER_STOPPED_CLEAN],
    );
}
