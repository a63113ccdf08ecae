//! Closed PID loop
//!
//! A built-in PidGam drives a first-order plant defined here. Both run in one
//! thread; the measurement is printed while the loop settles.

use gamrt::config::StructuredData;
use gamrt::{Application, Gam, GamDefinitions, GamFactory, GamIo, Result};
use std::thread;
use std::time::Duration;

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

fn plant(_: &GamDefinitions, data: &dyn StructuredData) -> Result<Box<dyn Gam>> {
    let gain = data.read("Gain").and_then(|g| g.parse().ok()).unwrap_or(0.01);
    Ok(Box::new(Plant { x: 0.0, gain }))
}

const CONFIG: &str = r#"
[Application]
FirstState = "control"
CyclePeriodUs = 1000

[Logging]
level = "info"

[Functions.Pid]
Class = "PidGam"
States = ["control"]
Kp = 2.0
Ki = 0.5
Dt = 0.001
OutputMin = -10.0
OutputMax = 10.0
[Functions.Pid.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Pid.Inputs.Reference]
Type = "float64"
Path = "Plant.Reference"
Default = "1"
IsFinal = true
[Functions.Pid.Inputs.Measurement]
Type = "float64"
Path = "Plant.Measurement"
IsFinal = true
[Functions.Pid.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Pid.Outputs.Control]
Type = "float64"
Path = "Plant.Control"
IsFinal = true

[Functions.Plant]
Class = "Plant"
States = ["control"]
Gain = 0.02
[Functions.Plant.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Plant.Inputs.Control]
Type = "float64"
Path = "Plant.Control"
IsFinal = true
[Functions.Plant.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Plant.Outputs.Measurement]
Type = "float64"
Path = "Plant.Measurement"
IsFinal = true

[States.control.Threads.Loop]
Functions = ["Pid", "Plant"]
"#;

fn sample(app: &Application, path: &str) -> f64 {
    let buffer = app.active_buffer();
    app.channel(path)
        .and_then(|c| c.buffer(buffer).view(0, 8).and_then(|v| v.get::<f64>(0)))
        .unwrap_or(f64::NAN)
}

fn main() -> Result<()> {
    let mut factory = GamFactory::with_builtins();
    factory.register("Plant", plant);
    let mut app = Application::from_toml_str(CONFIG, &factory)?;

    app.start()?;
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(50));
        println!(
            "measurement {:.4}  control {:.4}  pid time {} us",
            sample(&app, "Plant.Measurement"),
            sample(&app, "Plant.Control"),
            app.channel("GAM_Times.Pid.RelativeUsecTime")
                .and_then(|c| c
                    .buffer(app.active_buffer())
                    .view(0, 8)
                    .and_then(|v| v.get::<u64>(0)))
                .unwrap_or(0),
        );
    }
    app.stop()?;
    println!("faults: {:?}", app.drain_faults());
    Ok(())
}
