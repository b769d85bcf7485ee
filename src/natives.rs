use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::descriptor::SigKey;

/// Side effects of one native method: classes it allocates and methods it
/// calls. The analysis consumes this as an opaque map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NativeStub {
    #[serde(default)]
    pub allocated_classes: Vec<String>,
    #[serde(default)]
    pub callees: Vec<NativeCallee>,
}

/// A callee named by a native stub.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NativeCallee {
    pub class_name: String,
    pub name: String,
    pub descriptor: String,
}

/// Stub table keyed by `class#name#descriptor`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NativeStubs {
    methods: BTreeMap<String, NativeStub>,
}

impl NativeStubs {
    pub fn insert(&mut self, class_name: &str, method: &SigKey, stub: NativeStub) {
        self.methods.insert(key(class_name, method), stub);
    }

    pub fn get(&self, class_name: &str, method: &SigKey) -> Option<&NativeStub> {
        self.methods.get(&key(class_name, method))
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Load a stub file, reporting the JSON path of any malformed element.
    pub fn load(path: &Path) -> Result<NativeStubs> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read native stubs {}", path.display()))?;
        let mut deserializer = serde_json::Deserializer::from_str(&data);
        let stubs = serde_path_to_error::deserialize(&mut deserializer)
            .with_context(|| format!("failed to parse native stubs {}", path.display()))?;
        Ok(stubs)
    }
}

fn key(class_name: &str, method: &SigKey) -> String {
    format!("{class_name}#{}#{}", method.0, method.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut stubs = NativeStubs::default();
        let method = ("arraycopy".to_string(), "(Ljava/lang/Object;ILjava/lang/Object;II)V".to_string());
        stubs.insert(
            "java/lang/System",
            &method,
            NativeStub {
                allocated_classes: vec!["java/lang/ArrayStoreException".to_string()],
                callees: Vec::new(),
            },
        );

        let json = serde_json::to_string(&stubs).expect("serialize");
        let reloaded: NativeStubs = serde_json::from_str(&json).expect("deserialize");

        let stub = reloaded
            .get("java/lang/System", &method)
            .expect("stub present");
        assert_eq!(stub.allocated_classes, vec!["java/lang/ArrayStoreException"]);
    }

    #[test]
    fn load_reports_the_failing_path() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("stubs.json");
        fs::write(&path, r#"{"methods": {"a#b#()V": {"allocated_classes": 3}}}"#)
            .expect("write stub file");

        let error = NativeStubs::load(&path).expect_err("malformed stubs");

        assert!(format!("{error:#}").contains("allocated_classes"));
    }
}
