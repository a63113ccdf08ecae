//! A closed PID loop configured from a TOML file.

use gamrt::config::StructuredData;
use gamrt::{Application, Gam, GamDefinitions, GamFactory, GamIo, Result, SchedulerStatus};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

/// First-order plant: x += u * gain.
struct Plant {
    x: f64,
    gain: f64,
}

impl Gam for Plant {
    fn execute(&mut self, io: &GamIo<'_>) -> Result<()> {
        let u = io.input(0).and_then(|v| v.get::<f64>(0)).unwrap_or(0.0);
        self.x += u * self.gain;
        if let Some(out) = io.output(0) {
            out.set(0, self.x)?;
        }
        Ok(())
    }
}

struct Sink;

impl Gam for Sink {
    fn execute(&mut self, _io: &GamIo<'_>) -> Result<()> {
        Ok(())
    }
}

fn sink(_: &GamDefinitions, _: &dyn StructuredData) -> Result<Box<dyn Gam>> {
    Ok(Box::new(Sink))
}

fn plant(_: &GamDefinitions, data: &dyn StructuredData) -> Result<Box<dyn Gam>> {
    let gain = data
        .read("Gain")
        .and_then(|g| g.parse().ok())
        .unwrap_or(0.01);
    Ok(Box::new(Plant { x: 0.0, gain }))
}

const DOCUMENT: &str = r#"
[Application]
FirstState = "control"
CyclePeriodUs = 100

[Logging]
level = "warn"

[Types.Setpoint]
Value = "float64"
Limits = "float64[2]"

[Definitions.Measurement]
Type = "float64"
Default = "0"

[Functions.Pid]
Class = "PidGam"
States = ["control", "hold"]
Kp = 5.0
Ki = 0.0
Dt = 0.01
[Functions.Pid.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Pid.Inputs.Reference]
Type = "float64"
Path = "DDB1.Reference"
Default = "1"
IsFinal = true
[Functions.Pid.Inputs.Measurement]
Path = "DDB1.Measurement"
[Functions.Pid.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Pid.Outputs.Control]
Type = "float64"
Path = "DDB1.Control"
Default = "0"
IsFinal = true

[Functions.Plant]
Class = "Plant"
States = ["control"]
Gain = 0.01
[Functions.Plant.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Plant.Inputs.Control]
Type = "float64"
Path = "DDB1.Control"
IsFinal = true
[Functions.Plant.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Plant.Outputs.Measurement]
Type = "float64"
Path = "DDB1.Measurement"
IsFinal = true

[Functions.Target]
Class = "CounterGam"
States = ["control"]
[Functions.Target.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Target.Inputs.Setpoint]
Type = "Setpoint"
Path = "DDB1.Setpoint"
Default = "{0.5, {0, 2}}"
IsFinal = true

[States.control.Threads.Loop]
Functions = ["Pid", "Plant"]

[States.hold.Threads.Loop]
Functions = ["Pid"]
"#;

fn read_f64(app: &Application, path: &str, buffer: usize) -> f64 {
    let bytes = app.channel(path).unwrap().buffer(buffer).to_vec();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_ne_bytes(raw)
}

fn factory() -> GamFactory {
    let mut factory = GamFactory::with_builtins();
    factory.register("Plant", plant);
    factory.register("Sink", sink);
    factory
}

#[test]
fn structured_input_rejected_by_counter() {
    // The counter needs uint32 signals; a Setpoint is 24 bytes.
    let err = Application::from_toml_str(DOCUMENT, &factory()).unwrap_err();
    assert!(err.to_string().contains("Target"));
}

#[test]
fn pid_loop_converges_from_file() {
    let document = DOCUMENT.replace(
        "[Functions.Target]\nClass = \"CounterGam\"",
        "[Functions.Target]\nClass = \"Sink\"",
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(document.as_bytes()).unwrap();

    let mut app = Application::from_path(file.path(), &factory()).unwrap();
    assert_eq!(app.config().first_state, "control");
    let setpoint = app.channel("DDB1.Setpoint").unwrap();
    assert_eq!(setpoint.byte_size(), 24);
    assert_eq!(read_f64(&app, "DDB1.Setpoint", 0), 0.5);

    app.start().unwrap();
    assert_eq!(read_f64(&app, "DDB1.Setpoint", 1), 0.5);
    let deadline = Instant::now() + Duration::from_secs(10);
    while (read_f64(&app, "DDB1.Measurement", 1) - 1.0).abs() > 0.01 {
        assert!(Instant::now() < deadline, "loop did not converge");
        thread::sleep(Duration::from_millis(5));
    }

    // In hold nobody produces the measurement: it falls back to its default
    // and the controller output follows.
    app.prepare_next_state("hold").unwrap();
    app.change_state().unwrap();
    assert_eq!(app.status(), SchedulerStatus::Running("hold".into()));
    assert_eq!(read_f64(&app, "DDB1.Measurement", 0), 0.0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while (read_f64(&app, "DDB1.Control", 0) - 5.0).abs() > 1e-9 {
        assert!(Instant::now() < deadline, "controller did not react");
        thread::sleep(Duration::from_millis(2));
    }
    app.stop().unwrap();
    assert!(app.drain_faults().is_empty());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Application::from_path(dir.path().join("absent.toml"), &factory()).unwrap_err();
    assert!(matches!(err, gamrt::Error::Io(_)));
}
