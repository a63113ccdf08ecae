//! Built-in GAMs.

use crate::config::StructuredData;
use crate::error::{Error, Result};
use crate::gam::{Gam, GamDefinitions, GamFactory, GamIo};
use std::str::FromStr;

/// Register every built-in class in `factory`.
pub fn register_builtins(factory: &mut GamFactory) {
    factory.register("PidGam", PidGam::create);
    factory.register("CounterGam", CounterGam::create);
}

fn parameter<T: FromStr>(data: &dyn StructuredData, gam: &str, key: &str, default: T) -> Result<T> {
    match data.read(key) {
        Some(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::parameters(format!("GAM {gam}: invalid {key} '{text}'"))),
        None => Ok(default),
    }
}

fn expect_signals(
    gam: &str,
    io: &GamIo<'_>,
    inputs: &[usize],
    outputs: &[usize],
) -> Result<()> {
    let ok = io.number_of_inputs() == inputs.len()
        && io.number_of_outputs() >= outputs.len()
        && inputs
            .iter()
            .enumerate()
            .all(|(n, size)| io.input(n).is_some_and(|v| v.len() == *size))
        && outputs
            .iter()
            .enumerate()
            .all(|(n, size)| io.output(n).is_some_and(|v| v.len() == *size));
    if ok {
        Ok(())
    } else {
        Err(Error::parameters(format!(
            "GAM {gam} needs inputs of {inputs:?} bytes and outputs of {outputs:?} bytes"
        )))
    }
}

/// Discrete PID controller on float64 signals.
///
/// Inputs: reference, measurement. Outputs: control, then optionally the
/// error. Parameters `Kp`, `Ki`, `Kd`, `Dt` (seconds), and the saturation
/// limits `OutputMin` / `OutputMax`.
#[derive(Debug, Clone)]
pub struct PidGam {
    name: String,
    kp: f64,
    ki: f64,
    kd: f64,
    dt: f64,
    min: f64,
    max: f64,
    integral: f64,
    previous_error: f64,
}

impl PidGam {
    fn create(definitions: &GamDefinitions, data: &dyn StructuredData) -> Result<Box<dyn Gam>> {
        let name = definitions.name.as_str();
        let gam = Self {
            name: name.to_string(),
            kp: parameter(data, name, "Kp", 1.0)?,
            ki: parameter(data, name, "Ki", 0.0)?,
            kd: parameter(data, name, "Kd", 0.0)?,
            dt: parameter(data, name, "Dt", 1e-3)?,
            min: parameter(data, name, "OutputMin", f64::NEG_INFINITY)?,
            max: parameter(data, name, "OutputMax", f64::INFINITY)?,
            integral: 0.0,
            previous_error: 0.0,
        };
        if gam.dt <= 0.0 || gam.min > gam.max {
            return Err(Error::parameters(format!(
                "GAM {name}: Dt must be positive and OutputMin <= OutputMax"
            )));
        }
        Ok(Box::new(gam))
    }

    /// One controller step.
    pub fn step(&mut self, reference: f64, measurement: f64) -> (f64, f64) {
        let error = reference - measurement;
        self.integral += error * self.dt;
        let derivative = (error - self.previous_error) / self.dt;
        self.previous_error = error;
        let control = self.kp * error + self.ki * self.integral + self.kd * derivative;
        (control.clamp(self.min, self.max), error)
    }
}

impl Gam for PidGam {
    fn setup(&mut self, io: &GamIo<'_>) -> Result<()> {
        expect_signals(&self.name, io, &[8, 8], &[8])
    }

    fn execute(&mut self, io: &GamIo<'_>) -> Result<()> {
        let missing = || Error::fatal("PidGam signal missing");
        let reference = io.input(0).and_then(|v| v.get::<f64>(0)).ok_or_else(missing)?;
        let measurement = io.input(1).and_then(|v| v.get::<f64>(0)).ok_or_else(missing)?;
        let (control, error) = self.step(reference, measurement);
        io.output(0).ok_or_else(missing)?.set(0, control)?;
        if let Some(out) = io.output(1) {
            out.set(0, error)?;
        }
        Ok(())
    }
}

/// Counts cycles into a uint32 output. Parameter `Step`, default 1.
///
/// With one uint32 input the count continues from the input's value; reading
/// back the output channel keeps the count across state changes.
#[derive(Debug, Clone)]
pub struct CounterGam {
    name: String,
    step: u32,
}

impl CounterGam {
    fn create(definitions: &GamDefinitions, data: &dyn StructuredData) -> Result<Box<dyn Gam>> {
        let name = definitions.name.as_str();
        Ok(Box::new(Self {
            name: name.to_string(),
            step: parameter(data, name, "Step", 1)?,
        }))
    }
}

impl Gam for CounterGam {
    fn setup(&mut self, io: &GamIo<'_>) -> Result<()> {
        match io.number_of_inputs() {
            0 => expect_signals(&self.name, io, &[], &[4]),
            _ => expect_signals(&self.name, io, &[4], &[4]),
        }
    }

    fn execute(&mut self, io: &GamIo<'_>) -> Result<()> {
        let out = io
            .output(0)
            .ok_or_else(|| Error::fatal("CounterGam output missing"))?;
        let current = match io.input(0) {
            Some(input) => input.get::<u32>(0),
            None => out.get::<u32>(0),
        }
        .unwrap_or(0);
        out.set(0, current.wrapping_add(self.step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_step_is_proportional_integral_derivative() {
        let mut pid = PidGam {
            name: "p".into(),
            kp: 2.0,
            ki: 1.0,
            kd: 0.0,
            dt: 0.5,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            integral: 0.0,
            previous_error: 0.0,
        };
        let (control, error) = pid.step(1.0, 0.0);
        assert_eq!(error, 1.0);
        assert_eq!(control, 2.0 + 0.5);
        let (control, _) = pid.step(1.0, 0.0);
        assert_eq!(control, 2.0 + 1.0);
    }

    #[test]
    fn pid_saturates() {
        let mut pid = PidGam {
            name: "p".into(),
            kp: 100.0,
            ki: 0.0,
            kd: 0.0,
            dt: 1.0,
            min: -1.0,
            max: 1.0,
            integral: 0.0,
            previous_error: 0.0,
        };
        assert_eq!(pid.step(5.0, 0.0).0, 1.0);
        assert_eq!(pid.step(-5.0, 0.0).0, -1.0);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let defs = GamDefinitions::new("p", ["s"]).with_class("PidGam");
        let table: toml::Table = toml::from_str("Dt = 0.0").unwrap();
        assert!(PidGam::create(&defs, &table).is_err());
        let table: toml::Table = toml::from_str("Kp = \"fast\"").unwrap();
        assert!(PidGam::create(&defs, &table).is_err());
        let table: toml::Table = toml::from_str("Step = -1").unwrap();
        assert!(CounterGam::create(&defs, &table).is_err());
    }
}
