//! State switching
//!
//! Two counters share a channel table. `count` runs both, `freeze` runs only
//! the first: the live counter carries over, the other falls back to its
//! default.

use gamrt::{Application, GamFactory, Result};
use std::thread;
use std::time::Duration;

const CONFIG: &str = r#"
[Application]
FirstState = "count"
CyclePeriodUs = 500

[Functions.Ticks]
Class = "CounterGam"
States = ["count", "freeze"]
[Functions.Ticks.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Ticks.Inputs.Ticks]
Type = "uint32"
Path = "DDB1.Ticks"
IsFinal = true
[Functions.Ticks.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Ticks.Outputs.Ticks]
Type = "uint32"
Path = "DDB1.Ticks"
IsFinal = true

[Functions.Laps]
Class = "CounterGam"
States = ["count"]
Step = 10
[Functions.Laps.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Laps.Outputs.Laps]
Type = "uint32"
Path = "DDB1.Laps"
Default = "7"
IsFinal = true

[Functions.Watch]
Class = "CounterGam"
States = ["count", "freeze"]
[Functions.Watch.Inputs]
Class = "DefinitionContainer"
Direction = "Input"
[Functions.Watch.Inputs.Laps]
Type = "uint32"
Path = "DDB1.Laps"
IsFinal = true
[Functions.Watch.Outputs]
Class = "DefinitionContainer"
Direction = "Output"
[Functions.Watch.Outputs.Seen]
Type = "uint32"
Path = "DDB1.Seen"
IsFinal = true

[States.count.Threads.Main]
Functions = ["Ticks", "Laps"]
[States.count.Threads.Monitor]
Functions = ["Watch"]

[States.freeze.Threads.Main]
Functions = ["Ticks", "Watch"]
"#;

fn read_u32(app: &Application, path: &str) -> u32 {
    let buffer = app.active_buffer();
    app.channel(path)
        .and_then(|c| c.buffer(buffer).view(0, 4).and_then(|v| v.get::<u32>(0)))
        .unwrap_or(0)
}

fn report(app: &Application) {
    println!(
        "{:?} on buffer {}: ticks {} laps {}",
        app.status(),
        app.active_buffer(),
        read_u32(app, "DDB1.Ticks"),
        read_u32(app, "DDB1.Laps"),
    );
}

fn main() -> Result<()> {
    let _guard = gamrt::logger::LoggerConfig::from_env().init()?;
    let mut app = Application::from_toml_str(CONFIG, &GamFactory::with_builtins())?;

    app.start()?;
    thread::sleep(Duration::from_millis(100));
    report(&app);

    app.prepare_next_state("freeze")?;
    report(&app);
    app.change_state()?;
    thread::sleep(Duration::from_millis(100));
    report(&app);

    app.prepare_next_state("count")?;
    app.change_state()?;
    thread::sleep(Duration::from_millis(100));
    report(&app);

    app.stop()?;
    Ok(())
}
