//! Declarative manifest of desired Cores.
//!
//! ```yaml
//! cores:
//!   echo:
//!     command: demo-core
//!     args: ["--tool", "say"]
//!     namespace: echo
//!     policy:
//!       max_concurrency: 2
//! ```

pub mod watcher;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

/// Default per-Core concurrency bound.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Top-level manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Desired Cores keyed by name.
    #[serde(default)]
    pub cores: BTreeMap<String, CoreConfig>,
}

/// Launch configuration for one Core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherits the Hub's when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Environment overlay merged over the Hub's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Tool prefix; defaults to the Core name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub policy: CorePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CorePolicy {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for CorePolicy {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl CoreConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            namespace: None,
            policy: CorePolicy::default(),
        }
    }

    /// Effective namespace for a Core registered under `name`.
    pub fn namespace_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(name)
    }

    /// Concurrency bound, clamped to at least 1.
    pub fn max_concurrency(&self) -> usize {
        self.policy.max_concurrency.max(1)
    }

    /// Field-by-field launch equality. The working directory is ignored.
    pub fn same_launch(&self, other: &CoreConfig) -> bool {
        self.command == other.command
            && self.args == other.args
            && self.env == other.env
            && self.namespace == other.namespace
            && self.max_concurrency() == other.max_concurrency()
    }
}

impl Manifest {
    /// Read, parse and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::config(format!(
                "Manifest not found: {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate manifest text.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(Error::config("manifest is empty"));
        }
        let manifest: Manifest = serde_yaml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, core) in &self.cores {
            if core.command.trim().is_empty() {
                return Err(Error::config(format!("core '{}': command is empty", name)));
            }
            let ns = core.namespace_for(name);
            if ns.is_empty() || ns.contains('.') {
                return Err(Error::config(format!(
                    "core '{}': invalid namespace '{}'",
                    name, ns
                )));
            }
            if !seen.insert(ns) {
                return Err(Error::config(format!("Duplicate namespace: {}", ns)));
            }
        }
        Ok(())
    }

    /// JSON Schema describing the manifest document.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(Manifest);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
cores:
  echo:
    command: demo-core
    args: ["--tool", "say"]
    env:
      GREETING: hi
  tmpl:
    command: demo-core
    namespace: template
    policy:
      max_concurrency: 0
"#;

    #[test]
    fn parses_defaults_and_overrides() {
        let manifest = Manifest::from_yaml_str(SAMPLE).unwrap();
        let echo = &manifest.cores["echo"];
        assert_eq!(echo.namespace_for("echo"), "echo");
        assert_eq!(echo.max_concurrency(), 4);
        assert_eq!(echo.env["GREETING"], "hi");

        let tmpl = &manifest.cores["tmpl"];
        assert_eq!(tmpl.namespace_for("tmpl"), "template");
        assert_eq!(tmpl.max_concurrency(), 1);
    }

    #[test]
    fn duplicate_namespace_rejected() {
        let raw = r#"
cores:
  a: { command: x, namespace: shared }
  b: { command: y, namespace: shared }
"#;
        let err = Manifest::from_yaml_str(raw).unwrap_err();
        assert!(err.to_string().contains("Duplicate namespace: shared"));
    }

    #[test]
    fn implicit_namespace_collides_with_explicit() {
        let raw = r#"
cores:
  a: { command: x }
  b: { command: y, namespace: a }
"#;
        assert!(Manifest::from_yaml_str(raw).is_err());
    }

    #[test]
    fn dotted_namespace_rejected() {
        let raw = "cores:\n  a: { command: x, namespace: a.b }\n";
        assert!(matches!(Manifest::from_yaml_str(raw), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_fields_and_empty_files_rejected() {
        assert!(Manifest::from_yaml_str("cores:\n  a: { command: x, colour: red }\n").is_err());
        assert!(Manifest::from_yaml_str("   \n").is_err());
        assert!(Manifest::from_yaml_str("cores:\n  a: { command: '' }\n").is_err());
    }

    #[test]
    fn same_launch_ignores_cwd_only() {
        let mut a = CoreConfig::new("demo-core");
        let mut b = a.clone();
        a.cwd = Some(PathBuf::from("/tmp"));
        b.cwd = Some(PathBuf::from("/var"));
        assert!(a.same_launch(&b));

        b.namespace = Some("other".into());
        assert!(!a.same_launch(&b));

        let mut c = a.clone();
        c.env.insert("K".into(), "V".into());
        assert!(!a.same_launch(&c));
    }

    #[test]
    fn load_reports_missing_path() {
        let err = Manifest::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err
            .to_string()
            .contains("Manifest not found: /definitely/not/here.yaml"));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.cores.len(), 2);
    }

    #[test]
    fn schema_describes_cores() {
        let schema = Manifest::json_schema();
        assert!(schema["properties"]["cores"].is_object());
    }
}
