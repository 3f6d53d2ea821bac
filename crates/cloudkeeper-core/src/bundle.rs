// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow bundles: a root module plus everything needed to run it from a file.
//!
//! ```json
//! {
//!   "module": { "name": "root", "inPorts": [...], "outPorts": [...], "kind": {...} },
//!   "declarations": [ { "name": "add", "inPorts": [...], "outPorts": [...], "kind": { "type": "simple" } } ],
//!   "commands": { "add": ["python3", "add.py"] },
//!   "inputs": { "a": 1, "b": 2 }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use cloudkeeper_model::{Declaration, Module, Repository};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A runnable workflow as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBundle {
    /// The root module.
    pub module: Module,
    /// Declarations referenced by proxy modules.
    #[serde(default)]
    pub declarations: Vec<Declaration>,
    /// Command line (program and arguments) of each simple declaration.
    #[serde(default)]
    pub commands: HashMap<String, Vec<String>>,
    /// Values of the root in-ports, by port name.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

impl WorkflowBundle {
    /// Read and validate a bundle from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow bundle {}", path.display()))?;
        let bundle: WorkflowBundle = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow bundle {}", path.display()))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// The declarations as a repository.
    pub fn repository(&self) -> Repository {
        self.declarations
            .iter()
            .cloned()
            .fold(Repository::new(), Repository::with)
    }

    fn validate(&self) -> Result<()> {
        self.module.validate()?;
        self.repository().validate()?;
        if let Some(name) = self
            .inputs
            .keys()
            .find(|name| self.module.in_port_index(name).is_none())
        {
            anyhow::bail!(
                "input '{}' does not match any in-port of module '{}'",
                name,
                self.module.name
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudkeeper_model::{Body, Connection, Endpoint};
    use serde_json::json;
    use std::io::Write;

    fn bundle() -> WorkflowBundle {
        let add = Declaration::simple("add", &["a", "b"], &["sum"]);
        WorkflowBundle {
            module: Module::composite(
                "root",
                &["a", "b"],
                &["sum"],
                Body::new(
                    vec![Module::proxy("adder", &add)],
                    vec![
                        Connection::new(Endpoint::InPort(0), Endpoint::ChildIn { child: 0, port: 0 }),
                        Connection::new(Endpoint::InPort(1), Endpoint::ChildIn { child: 0, port: 1 }),
                        Connection::new(Endpoint::ChildOut { child: 0, port: 0 }, Endpoint::OutPort(0)),
                    ],
                ),
            ),
            declarations: vec![add],
            commands: HashMap::from([("add".to_string(), vec!["cat".to_string()])]),
            inputs: BTreeMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string_pretty(&bundle()).unwrap().as_bytes())
            .unwrap();

        let loaded = WorkflowBundle::from_path(file.path()).unwrap();
        assert_eq!(loaded, bundle());
        assert_eq!(loaded.repository().len(), 1);
    }

    #[test]
    fn test_unknown_input_is_rejected() {
        let mut invalid = bundle();
        invalid.inputs.insert("c".to_string(), json!(3));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&invalid).unwrap().as_bytes())
            .unwrap();

        let err = WorkflowBundle::from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("input 'c'"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkflowBundle::from_path(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read workflow bundle"));
    }
}
