//! Configuration access: the narrow tree interface the core reads, its TOML
//! implementation, and the typed application settings.

use crate::error::{Error, Result};
use crate::logger::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Read-only view of one node of a configuration tree.
///
/// Scalar values are returned in their textual form so that the data-flow
/// core decodes them itself against the signal type. Arrays are rendered in
/// brace syntax (`{1, 2}`).
pub trait StructuredData {
    /// Textual value of a leaf key.
    fn read(&self, key: &str) -> Option<String>;
    /// Values of a list key.
    fn read_list(&self, key: &str) -> Option<Vec<String>>;
    /// Child node by name.
    fn child(&self, name: &str) -> Option<&dyn StructuredData>;
    /// Names of the child nodes, in document order.
    fn child_names(&self) -> Vec<String>;
    /// Names of the leaf keys, in document order.
    fn value_names(&self) -> Vec<String>;
}

fn render(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(items) => {
            let parts: Option<Vec<String>> = items.iter().map(render).collect();
            parts.map(|p| format!("{{{}}}", p.join(", ")))
        }
        toml::Value::Table(_) => None,
    }
}

impl StructuredData for toml::Table {
    fn read(&self, key: &str) -> Option<String> {
        self.get(key).and_then(render)
    }

    fn read_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            toml::Value::Array(items) => items.iter().map(render).collect(),
            other => render(other).map(|v| vec![v]),
        }
    }

    fn child(&self, name: &str) -> Option<&dyn StructuredData> {
        match self.get(name) {
            Some(toml::Value::Table(t)) => Some(t as &dyn StructuredData),
            _ => None,
        }
    }

    fn child_names(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, v)| v.is_table())
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn value_names(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, v)| !v.is_table())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Settings of the `[Application]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationConfig {
    /// State entered by [`crate::app::Application::start`].
    pub first_state: String,
    /// Time allowed for a worker to leave its loop when a state is stopped.
    #[serde(default = "default_termination_timeout")]
    pub termination_timeout_ms: u64,
    /// Minimum cycle period; 0 runs the cycles back to back.
    #[serde(default)]
    pub cycle_period_us: u64,
}

fn default_termination_timeout() -> u64 {
    1000
}

/// A parsed application document.
#[derive(Debug, Clone)]
pub struct ApplicationDocument {
    /// The `[Application]` settings.
    pub application: ApplicationConfig,
    /// The `[Logging]` settings, when present.
    pub logging: Option<LoggerConfig>,
    /// The whole document, walked through [`StructuredData`].
    pub root: toml::Table,
}

impl ApplicationDocument {
    /// Parse a document from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let root: toml::Table = toml::from_str(text)?;
        let application: ApplicationConfig = root
            .get("Application")
            .cloned()
            .ok_or_else(|| Error::parameters("missing [Application] table"))?
            .try_into()?;
        let logging: Option<LoggerConfig> = match root.get("Logging") {
            Some(value) => Some(value.clone().try_into()?),
            None => None,
        };
        Ok(Self {
            application,
            logging,
            root,
        })
    }

    /// Read and parse a document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "loading application document");
        Self::from_toml_str(&text)
    }

    /// Named top-level section.
    pub fn section(&self, name: &str) -> Option<&dyn StructuredData> {
        self.root.child(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
        [Application]
        FirstState = "Idle"

        [Functions.A]
        Class = "CounterGam"
        States = ["Idle", "Run"]
        Gain = 2.5
        Vector = [1, 2]
        [Functions.A.Outputs]
        Direction = "Output"
    "#;

    #[test]
    fn toml_table_as_structured_data() {
        let doc = ApplicationDocument::from_toml_str(DOC).unwrap();
        assert_eq!(doc.application.first_state, "Idle");
        assert_eq!(doc.application.termination_timeout_ms, 1000);
        let functions = doc.section("Functions").unwrap();
        assert_eq!(functions.child_names(), vec!["A".to_string()]);
        let a = functions.child("A").unwrap();
        assert_eq!(a.read("Class").as_deref(), Some("CounterGam"));
        assert_eq!(a.read("Gain").as_deref(), Some("2.5"));
        assert_eq!(a.read("Vector").as_deref(), Some("{1, 2}"));
        assert_eq!(
            a.read_list("States").unwrap(),
            vec!["Idle".to_string(), "Run".to_string()]
        );
        assert_eq!(a.child_names(), vec!["Outputs".to_string()]);
        assert!(a.value_names().contains(&"Class".to_string()));
        assert!(a.read("Outputs").is_none());
    }

    #[test]
    fn missing_application_is_rejected() {
        let err = ApplicationDocument::from_toml_str("[Data]\nIsFinal = true\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parameters);
    }

    #[test]
    fn document_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(&path, DOC).unwrap();
        let doc = ApplicationDocument::from_path(&path).unwrap();
        assert!(doc.logging.is_none());
        assert!(ApplicationDocument::from_path(dir.path().join("absent.toml")).is_err());
    }
}
